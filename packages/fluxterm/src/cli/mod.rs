pub mod attach;
pub mod macros;
pub mod ports;
pub mod profiles;
pub mod terminal;

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use flux_client::{ClientConfig, ClientPaths, FileConfig, load_config};
use flux_protocol::{FlowControl, Parity, SerialConfig, SshConfig, StopBits};
use tracing::debug;

pub use macros::MacroAction;
pub use ports::PortsArgs;
pub use profiles::ProfileAction;

use attach::{AttachOptions, AttachOutcome};

/// Resolved configuration and directory layout for one invocation.
pub struct Context {
    pub paths: ClientPaths,
    pub file: FileConfig,
    pub config: ClientConfig,
}

impl Context {
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let paths = ClientPaths::new(data_dir)?;
        let file: FileConfig = load_config(&paths.data_dir)
            .extract()
            .context("Failed to load configuration")?;
        let config = ClientConfig::from_file(&file);
        debug!(ws_url = %config.gateway.ws_url, api_base = %config.gateway.api_base, "configuration loaded");
        Ok(Self {
            paths,
            file,
            config,
        })
    }
}

/// Serial line settings shared by `serial` and `profile save-serial`.
#[derive(Args, Debug, Clone)]
pub struct LineArgs {
    /// Baud rate
    #[arg(short, long, default_value_t = flux_protocol::config::DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Data bits (5-8)
    #[arg(long, default_value_t = 8)]
    pub data_bits: u8,

    /// Stop bits: 1, 1.5 or 2
    #[arg(long, default_value = "1")]
    pub stop_bits: String,

    /// Parity: none, odd, even, mark or space
    #[arg(long, default_value = "none")]
    pub parity: String,

    /// Flow control: none, rtscts or xonxoff
    #[arg(long, default_value = "none")]
    pub flow_control: String,
}

impl LineArgs {
    pub fn to_config(&self, port: &str) -> Result<SerialConfig> {
        let mut config = SerialConfig::new(port);
        config.baud_rate = self.baud;
        config.data_bits = self.data_bits;
        config.stop_bits = parse_stop_bits(&self.stop_bits)?;
        config.parity = parse_keyword::<Parity>(&self.parity, "parity")?;
        config.flow_control = parse_keyword::<FlowControl>(&self.flow_control, "flow control")?;
        Ok(config)
    }
}

fn parse_stop_bits(raw: &str) -> Result<StopBits> {
    let value: f64 = raw
        .parse()
        .with_context(|| format!("invalid stop bits '{raw}'"))?;
    serde_json::from_value(serde_json::json!(value)).with_context(|| format!("invalid stop bits '{raw}'"))
}

/// Parse a lowercase keyword the same way it is read off the wire.
fn parse_keyword<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .with_context(|| format!("invalid {what} '{raw}'"))
}

/// Options that act on a session once it is connected.
#[derive(Args, Debug, Clone, Default)]
pub struct AfterConnectArgs {
    /// Run a saved macro (id or name) once connected
    #[arg(long)]
    pub run_macro: Option<String>,

    /// Send a local file over the serial line once connected
    #[arg(long)]
    pub send_file: Option<PathBuf>,

    /// File transfer protocol: xmodem, xmodem-crc, xmodem1k or ymodem
    #[arg(long, default_value = "xmodem-crc")]
    pub protocol: String,
}

#[derive(Args, Debug)]
pub struct SerialArgs {
    /// Serial port on the gateway host, e.g. /dev/ttyUSB0
    pub port: String,

    #[command(flatten)]
    pub line: LineArgs,

    /// Reconnect with backoff when the line drops
    #[arg(short, long)]
    pub auto_reconnect: bool,

    #[command(flatten)]
    pub after: AfterConnectArgs,
}

/// Where and how to log in; shared by `ssh` and `profile save-ssh`.
#[derive(Args, Debug, Clone)]
pub struct SshTargetArgs {
    /// Target as user@host
    pub target: String,

    /// SSH port
    #[arg(short, long, default_value_t = flux_protocol::config::DEFAULT_SSH_PORT)]
    pub port: u16,

    /// Password authentication
    #[arg(long, conflicts_with = "key")]
    pub password: Option<String>,

    /// Private key file for public-key authentication
    #[arg(short = 'i', long)]
    pub key: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long, requires = "key")]
    pub passphrase: Option<String>,
}

#[derive(Args, Debug)]
pub struct SshArgs {
    #[command(flatten)]
    pub login: SshTargetArgs,

    #[command(flatten)]
    pub after: AfterConnectArgs,
}

impl SshTargetArgs {
    pub fn to_config(&self) -> Result<SshConfig> {
        let (username, host) = split_target(&self.target)?;
        let mut config = match &self.key {
            Some(path) => {
                let key = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read private key {}", path.display()))?;
                SshConfig::with_private_key(host, username, key, self.passphrase.clone())
            }
            None => SshConfig::with_password(host, username, self.password.clone().unwrap_or_default()),
        };
        config.port = self.port;
        if let Some(path) = &self.key {
            config.private_key_path = Some(path.display().to_string());
        }
        Ok(config)
    }
}

fn split_target(target: &str) -> Result<(&str, &str)> {
    match target.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok((user, host)),
        _ => bail!("SSH target must look like user@host, got '{target}'"),
    }
}

pub async fn serial_command(ctx: &Context, args: SerialArgs) -> Result<()> {
    let config = args.line.to_config(&args.port)?;
    let opts = AttachOptions {
        config: config.into(),
        auto_reconnect: args.auto_reconnect,
        after: args.after,
    };
    report(attach::attach(ctx, opts).await?);
    Ok(())
}

pub async fn ssh_command(ctx: &Context, args: SshArgs) -> Result<()> {
    let config = args.login.to_config()?;
    let opts = AttachOptions {
        config: config.into(),
        auto_reconnect: false,
        after: args.after,
    };
    report(attach::attach(ctx, opts).await?);
    Ok(())
}

pub(crate) fn report(outcome: AttachOutcome) {
    match outcome {
        AttachOutcome::Detached => eprintln!("\r\n[fluxterm: detached]"),
        AttachOutcome::Closed(status) => eprintln!("\r\n[fluxterm: closed: {status}]"),
    }
}

pub fn config_command(ctx: &Context) -> Result<()> {
    let rendered = toml::to_string_pretty(&ctx.file).context("Failed to render configuration")?;
    println!("# data dir: {}", ctx.paths.data_dir.display());
    println!("# file:     {}", ctx.paths.config_toml_path().display());
    println!();
    print!("{rendered}");
    Ok(())
}
