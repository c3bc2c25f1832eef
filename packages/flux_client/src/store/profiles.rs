use std::path::PathBuf;

use chrono::{DateTime, Utc};
use flux_protocol::ConnectionConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{JsonStore, next_id};
use crate::error::StoreError;

/// A saved connection target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    pub id: String,
    pub name: String,
    pub config: ConnectionConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

pub struct ProfileStore {
    store: JsonStore,
    profiles: Vec<SessionProfile>,
}

impl ProfileStore {
    /// Load the store, upgrading entries saved before SSH support.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = JsonStore::new(path);
        let mut raw: Vec<Value> = store.load()?;
        let migrated = raw.iter_mut().map(migrate_legacy).filter(|m| *m).count();

        let profiles = raw
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<SessionProfile>, _>>()
            .map_err(|source| StoreError::Json {
                path: store.path().to_path_buf(),
                source,
            })?;

        let this = Self { store, profiles };
        if migrated > 0 {
            info!(count = migrated, "migrated legacy serial profiles");
            this.persist()?;
        }
        Ok(this)
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.store.save(&self.profiles)
    }

    pub fn list(&self) -> &[SessionProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&SessionProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Look a profile up by id, falling back to name.
    pub fn find(&self, id_or_name: &str) -> Option<&SessionProfile> {
        self.get(id_or_name)
            .or_else(|| self.profiles.iter().find(|p| p.name == id_or_name))
    }

    pub fn save_profile(
        &mut self,
        name: impl Into<String>,
        config: ConnectionConfig,
    ) -> Result<SessionProfile, StoreError> {
        let profile = SessionProfile {
            id: next_id(self.profiles.iter().map(|p| p.id.as_str())),
            name: name.into(),
            config,
            created_at: Utc::now(),
            last_used: None,
        };
        self.store.commit(&mut self.profiles, |all| {
            all.push(profile.clone());
            Ok(())
        })?;
        Ok(profile)
    }

    pub fn update_profile(
        &mut self,
        id: &str,
        name: impl Into<String>,
        config: ConnectionConfig,
    ) -> Result<(), StoreError> {
        let name = name.into();
        self.store.commit(&mut self.profiles, |all| {
            let profile = find_mut(all, id)?;
            profile.name = name;
            profile.config = config;
            Ok(())
        })
    }

    /// Returns `false` when no profile had that id.
    pub fn delete_profile(&mut self, id: &str) -> Result<bool, StoreError> {
        if self.get(id).is_none() {
            return Ok(false);
        }
        self.store.commit(&mut self.profiles, |all| {
            all.retain(|p| p.id != id);
            Ok(true)
        })
    }

    pub fn touch(&mut self, id: &str) -> Result<(), StoreError> {
        self.store.commit(&mut self.profiles, |all| {
            find_mut(all, id)?.last_used = Some(Utc::now());
            Ok(())
        })
    }
}

fn find_mut<'a>(
    profiles: &'a mut [SessionProfile],
    id: &str,
) -> Result<&'a mut SessionProfile, StoreError> {
    profiles
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

/// Old profiles stored a bare serial config; wrap it as `{type: "serial", config}`.
fn migrate_legacy(profile: &mut Value) -> bool {
    let Some(config) = profile.get_mut("config") else {
        return false;
    };
    if !config.is_object() || config.get("type").is_some() {
        return false;
    }
    let legacy = config.take();
    *config = serde_json::json!({ "type": "serial", "config": legacy });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_protocol::{SerialConfig, SshConfig};

    #[test]
    fn save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fluxterm_session_profiles.json");

        let mut store = ProfileStore::open(&path).unwrap();
        let serial = store
            .save_profile("bench board", SerialConfig::new("/dev/ttyUSB0").into())
            .unwrap();
        let ssh = store
            .save_profile(
                "pi",
                SshConfig::with_password("10.0.0.2", "pi", "raspberry").into(),
            )
            .unwrap();
        assert_ne!(serial.id, ssh.id);

        let reopened = ProfileStore::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 2);
        assert_eq!(reopened.find("pi").unwrap().id, ssh.id);
        assert_eq!(reopened.get(&serial.id).unwrap().name, "bench board");
    }

    #[test]
    fn legacy_profiles_are_wrapped_as_serial() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("profiles.json");
        std::fs::write(
            &path,
            r#"[{"id":"1700000000000","name":"old","createdAt":"2024-01-01T00:00:00.000Z",
                "config":{"port":"COM3","baud_rate":9600,"data_bits":8,"stop_bits":1,"parity":"none","flow_control":"none"}}]"#,
        )
        .unwrap();

        let store = ProfileStore::open(&path).unwrap();
        let profile = &store.list()[0];
        match &profile.config {
            ConnectionConfig::Serial(cfg) => {
                assert_eq!(cfg.port, "COM3");
                assert_eq!(cfg.baud_rate, 9600);
            }
            other => panic!("expected serial, got {:?}", other),
        }

        // the upgrade is written back
        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk[0]["config"]["type"], "serial");
        assert_eq!(on_disk[0]["config"]["config"]["port"], "COM3");
    }

    #[test]
    fn update_touch_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::open(tmp.path().join("p.json")).unwrap();
        let id = store
            .save_profile("a", SerialConfig::new("/dev/ttyS0").into())
            .unwrap()
            .id;

        store
            .update_profile(&id, "renamed", SerialConfig::new("/dev/ttyS1").into())
            .unwrap();
        store.touch(&id).unwrap();
        let profile = store.get(&id).unwrap();
        assert_eq!(profile.name, "renamed");
        assert!(profile.last_used.is_some());

        assert!(matches!(
            store.touch("missing"),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete_profile(&id).unwrap());
        assert!(!store.delete_profile(&id).unwrap());
        assert!(store.list().is_empty());
    }

    #[test]
    fn failed_write_leaves_profiles_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let mut store = ProfileStore::open(dir.join("p.json")).unwrap();
        let id = store
            .save_profile("a", SerialConfig::new("/dev/ttyS0").into())
            .unwrap()
            .id;
        let before = store.list().to_vec();

        // the data dir turns into a plain file, so every write fails
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "not a directory").unwrap();

        assert!(matches!(
            store.save_profile("b", SerialConfig::new("/dev/ttyS1").into()),
            Err(StoreError::Io { .. })
        ));
        assert!(store
            .update_profile(&id, "renamed", SerialConfig::new("/dev/ttyS1").into())
            .is_err());
        assert!(store.touch(&id).is_err());
        assert!(store.delete_profile(&id).is_err());
        assert_eq!(store.list(), before.as_slice());
    }

    #[test]
    fn serialized_shape_uses_camel_case() {
        let profile = SessionProfile {
            id: "1".to_string(),
            name: "x".to_string(),
            config: SerialConfig::new("/dev/ttyUSB0").into(),
            created_at: Utc::now(),
            last_used: None,
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastUsed").is_none());
        assert_eq!(json["config"]["type"], "serial");
    }
}
