//! Trusted-device store
//!
//! Remembers senders the user chose to trust so their file requests skip the
//! confirmation prompt. Keyed by the device fingerprint; persisted as a JSON
//! file next to the rest of the client's local state. Trust is a convenience
//! for the accept prompt, not an authentication mechanism.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One remembered device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedDevice {
    pub name: String,
    pub device_type: String,
    pub browser_info: String,
    pub trusted_at: u64,
}

/// Fingerprint-keyed trust records.
pub struct TrustStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, TrustedDevice>>,
}

impl TrustStore {
    /// Open a persistent store, loading any existing file.
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring corrupt trust store {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(fingerprint)
    }

    /// Remember a device. Overwrites an existing record for the same
    /// fingerprint.
    pub fn trust(&self, fingerprint: &str, name: &str, device_type: &str, browser_info: &str) {
        let trusted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            fingerprint.to_string(),
            TrustedDevice {
                name: name.to_string(),
                device_type: device_type.to_string(),
                browser_info: browser_info.to_string(),
                trusted_at,
            },
        );
        self.persist(&entries);
    }

    /// Forget a device. Returns true when a record was removed.
    pub fn untrust(&self, fingerprint: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(fingerprint).is_some();
        if removed {
            self.persist(&entries);
        }
        removed
    }

    pub fn all(&self) -> HashMap<String, TrustedDevice> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn persist(&self, entries: &HashMap<String, TrustedDevice>) {
        let Some(path) = &self.path else { return };
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("Failed to persist trust store {:?}: {}", path, e);
                }
            }
            Err(e) => warn!("Failed to serialize trust store: {}", e),
        }
    }
}
