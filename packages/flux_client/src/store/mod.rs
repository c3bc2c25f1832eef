//! Flat JSON stores for connection profiles and macros.
//!
//! Each store is one JSON array in `<data_dir>/<key>.json`, rewritten whole
//! on every change.

mod macros;
mod profiles;

pub use macros::{Macro, MacroStore, MacroUpdate};
pub use profiles::{ProfileStore, SessionProfile};

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

pub const PROFILES_KEY: &str = "fluxterm_session_profiles";
pub const MACROS_KEY: &str = "fluxterm_macros";

#[derive(Debug, Clone)]
struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty store.
    fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Write to a sibling temp file, then rename over the store.
    fn save<T: Serialize>(&self, items: &[T]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(items).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Apply `change` to `items` and write the result. If either step
    /// fails, `items` is put back so memory never runs ahead of disk.
    fn commit<T, R>(
        &self,
        items: &mut Vec<T>,
        change: impl FnOnce(&mut Vec<T>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError>
    where
        T: Serialize + Clone,
    {
        let before = items.clone();
        let result = match change(items) {
            Ok(out) => self.save(items).map(|()| out),
            Err(e) => Err(e),
        };
        if result.is_err() {
            *items = before;
        }
        result
    }
}

/// Millisecond timestamp id, bumped until it is unused.
fn next_id<'a>(existing: impl Iterator<Item = &'a str> + Clone) -> String {
    let mut candidate = chrono::Utc::now().timestamp_millis();
    while existing.clone().any(|id| id == candidate.to_string()) {
        candidate += 1;
    }
    candidate.to_string()
}
