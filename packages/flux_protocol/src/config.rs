//! Connection configurations for serial ports and SSH targets.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::ValidationError;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Baud rates offered by the port picker.
pub const BAUD_RATES: [u32; 12] = [
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Rtscts,
    Xonxoff,
}

/// Stop bits travel as a JSON number: `1`, `1.5` or `2`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl Serialize for StopBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StopBits::One => serializer.serialize_u8(1),
            StopBits::OnePointFive => serializer.serialize_f64(1.5),
            StopBits::Two => serializer.serialize_u8(2),
        }
    }
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if value == 1.0 {
            Ok(StopBits::One)
        } else if value == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if value == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid stop bits {value}, expected 1, 1.5 or 2"
            )))
        }
    }
}

/// Serial line settings sent with a `connect` control message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialConfig {
    /// 115200 8N1 without flow control on the given port.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port.trim().is_empty() {
            return Err(ValidationError::MissingPort);
        }
        if self.baud_rate == 0 {
            return Err(ValidationError::InvalidBaudRate);
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ValidationError::InvalidDataBits(self.data_bits));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Publickey,
}

/// SSH target posted to `/api/v1/ssh/connect`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl SshConfig {
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth_method: AuthMethod::Password,
            password: Some(password.into()),
            private_key: None,
            private_key_path: None,
            private_key_passphrase: None,
            cols: Some(80),
            rows: Some(24),
        }
    }

    pub fn with_private_key(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth_method: AuthMethod::Publickey,
            password: None,
            private_key: Some(private_key.into()),
            private_key_path: None,
            private_key_passphrase: passphrase.filter(|p| !p.is_empty()),
            cols: Some(80),
            rows: Some(24),
        }
    }

    /// Checked before any network call is made.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() || self.username.trim().is_empty() {
            return Err(ValidationError::MissingHostOrUsername);
        }
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match self.auth_method {
            AuthMethod::Password if !present(&self.password) => {
                Err(ValidationError::MissingPassword)
            }
            AuthMethod::Publickey if !present(&self.private_key) => {
                Err(ValidationError::MissingPrivateKey)
            }
            _ => Ok(()),
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

// Credentials stay out of logs.
impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("private_key_path", &self.private_key_path)
            .field("private_key_passphrase", &redact(&self.private_key_passphrase))
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Serial,
    Ssh,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Serial => write!(f, "serial"),
            ConnectionKind::Ssh => write!(f, "ssh"),
        }
    }
}

/// A connection target tagged by kind: `{"type": "serial", "config": {...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Serial(SerialConfig),
    Ssh(SshConfig),
}

impl ConnectionConfig {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionConfig::Serial(_) => ConnectionKind::Serial,
            ConnectionConfig::Ssh(_) => ConnectionKind::Ssh,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ConnectionConfig::Serial(cfg) => cfg.validate(),
            ConnectionConfig::Ssh(cfg) => cfg.validate(),
        }
    }

    /// Short human-readable label, e.g. `/dev/ttyUSB0 @ 115200` or `pi@host:22`.
    pub fn label(&self) -> String {
        match self {
            ConnectionConfig::Serial(cfg) => format!("{} @ {}", cfg.port, cfg.baud_rate),
            ConnectionConfig::Ssh(cfg) => cfg.target(),
        }
    }
}

impl From<SerialConfig> for ConnectionConfig {
    fn from(cfg: SerialConfig) -> Self {
        ConnectionConfig::Serial(cfg)
    }
}

impl From<SshConfig> for ConnectionConfig {
    fn from(cfg: SshConfig) -> Self {
        ConnectionConfig::Ssh(cfg)
    }
}
