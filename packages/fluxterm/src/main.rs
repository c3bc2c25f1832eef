use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

mod cli;

use cli::{MacroAction, PortsArgs, ProfileAction, SerialArgs, SshArgs};

#[derive(Parser)]
#[command(name = "fluxterm")]
#[command(about = "Serial and SSH terminal sessions through a FluxTerm gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.fluxterm)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports on the gateway, or toggle modem lines
    Ports(PortsArgs),

    /// Open a serial port and attach to it
    Serial(SerialArgs),

    /// Open an SSH session and attach to it
    Ssh(SshArgs),

    /// Manage saved connection profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Manage saved macros
    Macro {
        #[command(subcommand)]
        action: MacroAction,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stderr keeps terminal output clean while attached
    let default_directive = if cli.debug {
        "fluxterm=debug,flux_client=debug,info"
    } else {
        "fluxterm=info,flux_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let ctx = cli::Context::load(cli.data_dir)?;

    match cli.command {
        Commands::Ports(args) => cli::ports::ports_command(&ctx, args).await,
        Commands::Serial(args) => cli::serial_command(&ctx, args).await,
        Commands::Ssh(args) => cli::ssh_command(&ctx, args).await,
        Commands::Profile { action } => cli::profiles::profile_command(&ctx, action).await,
        Commands::Macro { action } => cli::macros::macro_command(&ctx, action),
        Commands::Config => cli::config_command(&ctx),
    }
}
