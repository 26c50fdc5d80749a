use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ConduitError, Result};

/// Durable small-record store for data that must survive a restart but is
/// too small and infrequently written to justify a SQLite table — node
/// identity being the only such record in this substrate (spec.md §6;
/// Tasks, QuotaState, RequestTracker entries, and Session metadata are all
/// explicitly process-local and never go through this store).
///
/// Each key is one JSON file under `root`. Writes go to a temp file first
/// and are renamed into place, so a crash mid-write never leaves a
/// half-written record behind.
pub struct KeyValueStore {
    root: PathBuf,
}

impl KeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Returns `Ok(None)` if the key has never been written, or if the
    /// stored record is corrupt — in the latter case the bad file is moved
    /// aside with a timestamped `.bak` suffix so the caller can fall back
    /// to a fresh default without losing the evidence.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                let backup = self.quarantine(&path)?;
                Err(ConduitError::StoreCorrupted {
                    backup_path: backup.display().to_string(),
                })
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = self.root.join(format!("{key}.json.tmp"));
        let body = serde_json::to_vec_pretty(value)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let backup = path.with_extension(format!("json.bak.{now}"));
        std::fs::rename(path, &backup)?;
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Node {
        id: String,
        name: String,
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir();
        let store = KeyValueStore::new(dir.clone()).unwrap();
        let node = Node {
            id: "n1".into(),
            name: "worker-1".into(),
        };
        store.put("n1", &node).unwrap();
        let loaded: Option<Node> = store.get("n1").unwrap();
        assert_eq!(loaded, Some(node));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_key_returns_none() {
        let dir = tempdir();
        let store = KeyValueStore::new(dir.clone()).unwrap();
        let loaded: Option<Node> = store.get("missing").unwrap();
        assert_eq!(loaded, None);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn corrupt_record_is_quarantined_not_lost() {
        let dir = tempdir();
        let store = KeyValueStore::new(dir.clone()).unwrap();
        std::fs::write(dir.join("n1.json"), b"not json").unwrap();
        let result: Result<Option<Node>> = store.get("n1");
        assert!(result.is_err());
        assert!(!dir.join("n1.json").exists());
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("conduit-kv-test-{}", std::process::id()));
        p.push(crate::types::RequestId::new().to_string());
        p
    }
}
