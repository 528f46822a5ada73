//! On-disk persistence for enrollment credentials
//!
//! Enrollment hands the endpoint an id and a secret key that every later
//! session presents in its `Hello`. They are kept in a small JSON file,
//! ~/.fleetlink/credentials.json by default, so restarts and upgrades
//! reuse the same identity instead of re-enrolling.

use crate::ClientError;
use fleetlink_proto::Credentials;
use std::fs;
use std::path::{Path, PathBuf};

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at the conventional per-user location
    pub fn default_path() -> Result<Self, ClientError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ClientError::Credentials("Failed to get home directory".to_string()))?;
        Ok(Self::at(home.join(".fleetlink").join("credentials.json")))
    }

    /// Store at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved credentials; `None` when the endpoint was never enrolled
    pub fn load(&self) -> Result<Option<Credentials>, ClientError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path).map_err(|e| {
            ClientError::Credentials(format!("Failed to read {:?}: {}", self.path, e))
        })?;

        let credentials: Credentials = serde_json::from_str(&json).map_err(|e| {
            ClientError::Credentials(format!("Failed to parse {:?}: {}", self.path, e))
        })?;

        Ok(Some(credentials))
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ClientError::Credentials(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }

        let json = serde_json::to_string_pretty(credentials)
            .map_err(|e| ClientError::Credentials(format!("Failed to serialize: {}", e)))?;

        fs::write(&self.path, json).map_err(|e| {
            ClientError::Credentials(format!("Failed to write {:?}: {}", self.path, e))
        })?;

        Ok(())
    }

    /// Forget the stored identity, e.g. after the server deregisters it
    pub fn clear(&self) -> Result<(), ClientError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                ClientError::Credentials(format!("Failed to remove {:?}: {}", self.path, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_store(test_name: &str) -> CredentialStore {
        let dir = std::env::temp_dir().join(format!("fleetlink-credentials-{}", test_name));
        let _ = fs::remove_dir_all(&dir);
        CredentialStore::at(dir.join("credentials.json"))
    }

    #[test]
    fn load_before_enrollment_is_none() {
        let store = scratch_store("empty");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = scratch_store("round-trip");
        let credentials = Credentials {
            endpoint_id: 42,
            key: Uuid::new_v4(),
        };

        store.save(&credentials).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.endpoint_id, 42);
        assert_eq!(loaded.key, credentials.key);
    }

    #[test]
    fn clear_forgets_the_identity() {
        let store = scratch_store("clear");
        let credentials = Credentials {
            endpoint_id: 7,
            key: Uuid::new_v4(),
        };

        store.save(&credentials).unwrap();
        store.clear().unwrap();

        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_panic() {
        let store = scratch_store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not json").unwrap();

        assert!(matches!(store.load(), Err(ClientError::Credentials(_))));
    }
}
