use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use flux_client::store::MACROS_KEY;
use flux_client::{Macro, MacroStore, MacroUpdate};

use super::Context;

#[derive(Subcommand, Debug)]
pub enum MacroAction {
    /// List saved macros
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Save a macro; each trailing argument is one command line
    Add {
        name: String,

        /// Pause between commands in milliseconds
        #[arg(long, default_value_t = 0)]
        delay: u64,

        #[arg(long)]
        description: Option<String>,

        #[arg(required = true, last = true)]
        commands: Vec<String>,
    },

    /// Change the delay or description of a macro
    Edit {
        target: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        delay: Option<u64>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a macro by id or name
    Delete { target: String },
}

pub fn macro_command(ctx: &Context, action: MacroAction) -> Result<()> {
    let path = ctx.paths.store_path(MACROS_KEY);
    let mut store = MacroStore::open(&path)
        .with_context(|| format!("Failed to open macros at {}", path.display()))?;

    match action {
        MacroAction::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(store.list())?);
            } else {
                print_macros(store.list());
            }
        }
        MacroAction::Add {
            name,
            delay,
            description,
            commands,
        } => {
            if commands.iter().all(|c| c.trim().is_empty()) {
                bail!("A macro needs at least one command");
            }
            let saved = store.save_macro(name, commands, delay, description)?;
            println!(
                "Saved macro {} ({}, {} commands)",
                saved.name,
                saved.id,
                saved.commands.len()
            );
        }
        MacroAction::Edit {
            target,
            name,
            delay,
            description,
        } => {
            let id = resolve(&store, &target)?.id.clone();
            store.update_macro(
                &id,
                MacroUpdate {
                    name,
                    delay,
                    description: description.map(|d| Some(d).filter(|d| !d.is_empty())),
                    ..Default::default()
                },
            )?;
            println!("Updated macro {target}");
        }
        MacroAction::Delete { target } => {
            let id = resolve(&store, &target)?.id.clone();
            store.delete_macro(&id)?;
            println!("Deleted macro {target}");
        }
    }
    Ok(())
}

fn resolve<'a>(store: &'a MacroStore, target: &str) -> Result<&'a Macro> {
    store
        .find(target)
        .with_context(|| format!("No macro named or with id '{target}'"))
}

fn print_macros(macros: &[Macro]) {
    if macros.is_empty() {
        println!("No saved macros.");
        return;
    }
    println!("{:<15} {:<20} {:<6} {:<8} {}", "ID", "NAME", "CMDS", "DELAY", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for m in macros {
        println!(
            "{:<15} {:<20} {:<6} {:<8} {}",
            m.id,
            m.name,
            m.commands.len(),
            format!("{}ms", m.delay),
            m.description.as_deref().unwrap_or("")
        );
    }
    println!("\n{} macro(s)", macros.len());
}
