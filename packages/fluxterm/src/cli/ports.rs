use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use flux_client::{GatewayApi, PortInfo};

use super::Context;

#[derive(Args, Debug)]
pub struct PortsArgs {
    #[command(subcommand)]
    pub action: Option<PortsAction>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum PortsAction {
    /// Set the DTR line of a port
    Dtr { port: String, state: LineState },
    /// Set the RTS line of a port
    Rts { port: String, state: LineState },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    On,
    Off,
}

impl LineState {
    fn is_on(self) -> bool {
        self == LineState::On
    }
}

pub async fn ports_command(ctx: &Context, args: PortsArgs) -> Result<()> {
    let api = GatewayApi::new(&ctx.config.gateway)?;

    match args.action {
        None => {
            let ports = api
                .list_ports()
                .await
                .with_context(|| format!("Cannot list ports at {}", ctx.config.gateway.api_base))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&ports)?);
            } else {
                print_ports(&ports);
            }
        }
        Some(PortsAction::Dtr { port, state }) => {
            api.set_dtr(&port, state.is_on()).await?;
            println!("DTR {} on {port}", if state.is_on() { "set" } else { "cleared" });
        }
        Some(PortsAction::Rts { port, state }) => {
            api.set_rts(&port, state.is_on()).await?;
            println!("RTS {} on {port}", if state.is_on() { "set" } else { "cleared" });
        }
    }
    Ok(())
}

fn print_ports(ports: &[PortInfo]) {
    if ports.is_empty() {
        println!("No serial ports found.");
        return;
    }
    println!("{:<24} {:<5} {:<11} {}", "PORT", "USB", "VID:PID", "DESCRIPTION");
    println!("{}", "-".repeat(72));
    for port in ports {
        println!(
            "{:<24} {:<5} {:<11} {}",
            port.name,
            if port.is_usb { "yes" } else { "" },
            usb_ids(port),
            port.description
        );
    }
    println!("\n{} port(s)", ports.len());
}

fn usb_ids(port: &PortInfo) -> String {
    match (&port.vid, &port.pid) {
        (Some(vid), Some(pid)) => format!("{vid}:{pid}"),
        _ => String::new(),
    }
}
