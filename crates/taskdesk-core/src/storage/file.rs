use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

use super::KeyValueStore;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Stores every key in a single pretty-printed JSON object on disk.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        let entries = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(entries)
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove session file")?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        // A corrupt file is replaced rather than blocking every future write.
        let mut entries = self.read_all().unwrap_or_else(|e| {
            debug!(error = %e, "Discarding unreadable session file");
            BTreeMap::new()
        });
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read_all().unwrap_or_default();
        if entries.remove(key).is_some() || entries.is_empty() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert_eq!(store.get("auth_token").unwrap(), None);

        store.set("auth_token", "abc").unwrap();
        store.set("auth_user", "{\"id\":1}").unwrap();
        assert_eq!(store.get("auth_token").unwrap().as_deref(), Some("abc"));
        assert!(store.path().exists());

        store.remove("auth_token").unwrap();
        assert_eq!(store.get("auth_token").unwrap(), None);
        assert_eq!(store.get("auth_user").unwrap().as_deref(), Some("{\"id\":1}"));

        // Last key gone removes the file entirely
        store.remove("auth_user").unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_values_survive_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path().to_path_buf())
            .set("auth_token", "persisted")
            .unwrap();

        let reopened = FileStore::new(dir.path().to_path_buf());
        assert_eq!(reopened.get("auth_token").unwrap().as_deref(), Some("persisted"));
    }

    #[test]
    fn test_corrupt_file_is_error_on_read_but_replaced_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        std::fs::write(store.path(), "not json").unwrap();

        assert!(store.get("auth_token").is_err());

        store.set("auth_token", "fresh").unwrap();
        assert_eq!(store.get("auth_token").unwrap().as_deref(), Some("fresh"));
    }
}
