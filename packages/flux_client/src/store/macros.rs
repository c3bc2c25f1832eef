use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonStore, next_id};
use crate::error::StoreError;

/// A named sequence of lines typed into a connected session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Macro {
    pub id: String,
    pub name: String,
    pub commands: Vec<String>,
    /// Pause between commands, in milliseconds.
    #[serde(default)]
    pub delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct MacroUpdate {
    pub name: Option<String>,
    pub commands: Option<Vec<String>>,
    pub delay: Option<u64>,
    pub description: Option<Option<String>>,
}

pub struct MacroStore {
    store: JsonStore,
    macros: Vec<Macro>,
}

impl MacroStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = JsonStore::new(path);
        let macros = store.load()?;
        Ok(Self { store, macros })
    }

    pub fn list(&self) -> &[Macro] {
        &self.macros
    }

    pub fn get(&self, id: &str) -> Option<&Macro> {
        self.macros.iter().find(|m| m.id == id)
    }

    pub fn find(&self, id_or_name: &str) -> Option<&Macro> {
        self.get(id_or_name)
            .or_else(|| self.macros.iter().find(|m| m.name == id_or_name))
    }

    pub fn save_macro(
        &mut self,
        name: impl Into<String>,
        commands: Vec<String>,
        delay: u64,
        description: Option<String>,
    ) -> Result<Macro, StoreError> {
        let saved = Macro {
            id: next_id(self.macros.iter().map(|m| m.id.as_str())),
            name: name.into(),
            commands,
            delay,
            description: description.filter(|d| !d.is_empty()),
            created_at: Utc::now(),
            last_used: None,
        };
        self.store.commit(&mut self.macros, |all| {
            all.push(saved.clone());
            Ok(())
        })?;
        Ok(saved)
    }

    pub fn update_macro(&mut self, id: &str, update: MacroUpdate) -> Result<(), StoreError> {
        self.store.commit(&mut self.macros, |all| {
            let entry = find_mut(all, id)?;
            if let Some(name) = update.name {
                entry.name = name;
            }
            if let Some(commands) = update.commands {
                entry.commands = commands;
            }
            if let Some(delay) = update.delay {
                entry.delay = delay;
            }
            if let Some(description) = update.description {
                entry.description = description;
            }
            Ok(())
        })
    }

    pub fn delete_macro(&mut self, id: &str) -> Result<bool, StoreError> {
        if self.get(id).is_none() {
            return Ok(false);
        }
        self.store.commit(&mut self.macros, |all| {
            all.retain(|m| m.id != id);
            Ok(true)
        })
    }

    pub fn touch(&mut self, id: &str) -> Result<(), StoreError> {
        self.store.commit(&mut self.macros, |all| {
            find_mut(all, id)?.last_used = Some(Utc::now());
            Ok(())
        })
    }
}

fn find_mut<'a>(macros: &'a mut [Macro], id: &str) -> Result<&'a mut Macro, StoreError> {
    macros
        .iter_mut()
        .find(|m| m.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}
