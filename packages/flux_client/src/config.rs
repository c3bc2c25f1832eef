use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::session::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [gateway]
//                    ws_url = "ws://10.0.0.5:8080/ws"
//
//   env var:         FLUXTERM_GATEWAY__WS_URL=ws://10.0.0.5:8080/ws
//                    (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewayFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
}

/// Where the gateway lives (`[gateway]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Auto-reconnect backoff (`[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Terminal behaviour (`[terminal]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    /// Appended to every macro command.
    #[serde(default = "default_line_ending")]
    pub line_ending: String,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            line_ending: default_line_ending(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_api_base() -> String {
    "http://127.0.0.1:8080/api/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_line_ending() -> String {
    "\r\n".to_string()
}

/// Build a figment that layers: defaults → config.toml → FLUXTERM_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `FLUXTERM_RECONNECT__MAX_ATTEMPTS=3`  →  `reconnect.max_attempts = 3`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("FLUXTERM_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub ws_url: String,
    pub api_base: String,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub gateway: GatewayConfig,
    pub reconnect: ReconnectPolicy,
    pub line_ending: String,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            gateway: GatewayConfig {
                ws_url: fc.gateway.ws_url.clone(),
                api_base: fc.gateway.api_base.trim_end_matches('/').to_string(),
                request_timeout: Duration::from_secs(fc.gateway.request_timeout_secs),
            },
            reconnect: ReconnectPolicy {
                max_attempts: fc.reconnect.max_attempts,
                base_delay: Duration::from_millis(fc.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(fc.reconnect.max_delay_ms),
            },
            line_ending: fc.terminal.line_ending.clone(),
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientPaths {
    pub data_dir: PathBuf,
}

impl ClientPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".fluxterm"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn store_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }
}
