//! Password-hash persistence
//!
//! The room password hash is the only durable field the server keeps. The
//! store contract is a minimal KV: read, and write-if-absent. Write-if-absent
//! runs under one lock so two racing `set-password` calls can never both
//! succeed, which is what makes the once-set-immutable invariant hold.

use log::warn;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Minimal KV contract for room password hashes.
pub trait PasswordStore: Send + Sync {
    /// Stored hash for a room, if any.
    fn get(&self, room: &str) -> Option<String>;

    /// Store the hash unless one exists. Returns true when this call won.
    fn put_if_absent(&self, room: &str, hash: &str) -> bool;
}

/// In-memory store; hashes live as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordStore for MemoryStore {
    fn get(&self, room: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .cloned()
    }

    fn put_if_absent(&self, room: &str, hash: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(room) {
            return false;
        }
        entries.insert(room.to_string(), hash.to_string());
        true
    }
}

/// JSON-file store; hashes survive restarts.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store, loading any existing file. A corrupt file is treated
    /// as empty and overwritten on the next write.
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring corrupt password store {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        match serde_json::to_string(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("Failed to persist password store {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("Failed to serialize password store: {}", e),
        }
    }
}

impl PasswordStore for FileStore {
    fn get(&self, room: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .cloned()
    }

    fn put_if_absent(&self, room: &str, hash: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(room) {
            return false;
        }
        entries.insert(room.to_string(), hash.to_string());
        self.persist(&entries);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn memory_put_once() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("ABCD", "hash1"));
        assert!(!store.put_if_absent("ABCD", "hash2"));
        assert_eq!(store.get("ABCD").as_deref(), Some("hash1"));
        assert_eq!(store.get("EFGH"), None);
    }

    #[test]
    fn concurrent_puts_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.put_if_absent("ROOM", &format!("hash-{}", i))
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        // the stored hash is one of the attempted values
        let stored = store.get("ROOM").unwrap();
        assert!(stored.starts_with("hash-"));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwords.json");

        let store = FileStore::open(path.clone());
        assert!(store.put_if_absent("ABCD", "deadbeef"));
        drop(store);

        let reopened = FileStore::open(path);
        assert_eq!(reopened.get("ABCD").as_deref(), Some("deadbeef"));
        assert!(!reopened.put_if_absent("ABCD", "other"));
    }

    #[test]
    fn file_store_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwords.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(path);
        assert_eq!(store.get("ABCD"), None);
        assert!(store.put_if_absent("ABCD", "h"));
    }
}
