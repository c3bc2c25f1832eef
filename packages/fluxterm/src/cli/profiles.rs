use anyhow::{Context as _, Result};
use clap::Subcommand;
use flux_client::store::PROFILES_KEY;
use flux_client::{ProfileStore, SessionProfile};
use flux_protocol::ConnectionConfig;

use super::attach::{self, AttachOptions};
use super::{AfterConnectArgs, Context, LineArgs, SshTargetArgs, report};

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    /// List saved profiles
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Save a serial profile
    SaveSerial {
        name: String,
        port: String,
        #[command(flatten)]
        line: LineArgs,
    },

    /// Save an SSH profile
    SaveSsh {
        name: String,
        #[command(flatten)]
        ssh: SshTargetArgs,
    },

    /// Delete a profile by id or name
    Delete { target: String },

    /// Connect using a saved profile (id or name)
    Connect {
        target: String,

        /// Reconnect with backoff when a serial line drops
        #[arg(short, long)]
        auto_reconnect: bool,

        #[command(flatten)]
        after: AfterConnectArgs,
    },
}

fn open_store(ctx: &Context) -> Result<ProfileStore> {
    let path = ctx.paths.store_path(PROFILES_KEY);
    ProfileStore::open(&path).with_context(|| format!("Failed to open profiles at {}", path.display()))
}

pub async fn profile_command(ctx: &Context, action: ProfileAction) -> Result<()> {
    let mut store = open_store(ctx)?;

    match action {
        ProfileAction::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(store.list())?);
            } else {
                print_profiles(store.list());
            }
        }
        ProfileAction::SaveSerial { name, port, line } => {
            let config: ConnectionConfig = line.to_config(&port)?.into();
            config.validate()?;
            let saved = store.save_profile(name, config)?;
            println!("Saved profile {} ({})", saved.name, saved.id);
        }
        ProfileAction::SaveSsh { name, ssh } => {
            let config: ConnectionConfig = ssh.to_config()?.into();
            config.validate()?;
            let saved = store.save_profile(name, config)?;
            println!("Saved profile {} ({})", saved.name, saved.id);
        }
        ProfileAction::Delete { target } => {
            let id = resolve(&store, &target)?.id.clone();
            store.delete_profile(&id)?;
            println!("Deleted profile {target}");
        }
        ProfileAction::Connect {
            target,
            auto_reconnect,
            after,
        } => {
            let profile = resolve(&store, &target)?.clone();
            store.touch(&profile.id)?;
            let opts = AttachOptions {
                config: profile.config,
                auto_reconnect,
                after,
            };
            report(attach::attach(ctx, opts).await?);
        }
    }
    Ok(())
}

fn resolve<'a>(store: &'a ProfileStore, target: &str) -> Result<&'a SessionProfile> {
    store
        .find(target)
        .with_context(|| format!("No profile named or with id '{target}'"))
}

fn print_profiles(profiles: &[SessionProfile]) {
    if profiles.is_empty() {
        println!("No saved profiles.");
        return;
    }
    println!("{:<15} {:<20} {:<7} {:<30} {}", "ID", "NAME", "TYPE", "TARGET", "LAST USED");
    println!("{}", "-".repeat(90));
    for p in profiles {
        let last_used = p
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<15} {:<20} {:<7} {:<30} {}",
            p.id,
            p.name,
            p.config.kind(),
            p.config.label(),
            last_used
        );
    }
    println!("\n{} profile(s)", profiles.len());
}
