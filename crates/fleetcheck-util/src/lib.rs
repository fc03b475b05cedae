use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

/// Root directory for durable fleetcheck data (state documents, server logs).
pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/fleetcheck")
    } else {
        PathBuf::from("/tmp/fleetcheck")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

/// Directory for per-port automation-server log files. Created on first
/// use; callers open files inside it directly.
pub fn server_log_dir() -> PathBuf {
    let dir = data_dir().join("logs");
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Writes `value` as pretty JSON through a temp file and rename, so readers
/// never observe a half-written document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_env_trimmed(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn expand_user_passes_plain_paths_through() {
        assert_eq!(expand_user("/opt/sdk"), PathBuf::from("/opt/sdk"));
        assert_eq!(expand_user("relative/dir"), PathBuf::from("relative/dir"));
    }

    #[test]
    fn expand_user_resolves_tilde_prefix() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_user("~/.android/avd"),
                PathBuf::from(home).join(".android/avd")
            );
        }
    }

    #[test]
    fn write_json_atomic_creates_parents_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/doc.json");
        let mut doc = BTreeMap::new();
        doc.insert("worker".to_string(), 3u32);
        write_json_atomic(&path, &doc).unwrap();

        let raw = fs::read(&path).unwrap();
        let parsed: BTreeMap<String, u32> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, doc);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
