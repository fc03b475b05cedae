//! Durable per-device lifecycle records. The backing document is a single
//! JSON object keyed by device name; presence of a key means the device has
//! booted to the home screen at least once, and `authorized: true` means an
//! operator completed authentication on it. Every operation is a guarded
//! read-modify-write cycle so concurrent workers never interleave mutations.

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceRecord {
    pub authorized: bool,
}

type Document = BTreeMap<String, DeviceRecord>;

pub struct DeviceStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeviceStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceStateStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> PathBuf {
        fleetcheck_util::state_file_path("devices.json")
    }

    /// Whether the device has ever reached the home screen.
    pub fn was_booted(&self, device: &str) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load().contains_key(device)
    }

    /// Records the first successful boot. Idempotent: re-marking an already
    /// booted device leaves its record untouched.
    pub fn mark_booted(&self, device: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load();
        doc.entry(device.to_string()).or_default();
        self.save(&doc);
    }

    pub fn is_authenticated(&self, device: &str) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load()
            .get(device)
            .map(|record| record.authorized)
            .unwrap_or(false)
    }

    pub fn mark_authenticated(&self, device: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load();
        doc.insert(device.to_string(), DeviceRecord { authorized: true });
        self.save(&doc);
    }

    /// Drops the authenticated flag while keeping the booted record. A
    /// device unknown to the store is a no-op, not an error.
    pub fn reset_authentication(&self, device: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load();
        if let Some(record) = doc.get_mut(device) {
            record.authorized = false;
            self.save(&doc);
        }
    }

    pub fn reset_all_authentication(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load();
        for record in doc.values_mut() {
            record.authorized = false;
        }
        self.save(&doc);
    }

    /// Removes the device record entirely; the next run treats the device
    /// as never booted.
    pub fn clear(&self, device: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load();
        if doc.remove(device).is_some() {
            self.save(&doc);
        }
    }

    /// Read-only copy of the whole document, for status reporting.
    pub fn snapshot(&self) -> BTreeMap<String, DeviceRecord> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load()
    }

    fn load(&self) -> Document {
        let data = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Document::new(),
            Err(e) => {
                warn!(
                    "failed to read device state {}: {}",
                    self.path.display(),
                    e
                );
                return Document::new();
            }
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Document::new();
        }
        match serde_json::from_slice(&data) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "failed to parse device state {}: {}; starting from an empty document",
                    self.path.display(),
                    e
                );
                Document::new()
            }
        }
    }

    fn save(&self, doc: &Document) {
        if let Err(e) = fleetcheck_util::write_json_atomic(&self.path, doc) {
            warn!(
                "failed to persist device state {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
