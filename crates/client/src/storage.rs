//! Persistent client storage.
//!
//! Values are JSON files in the platform config directory:
//!   - Linux: `~/.config/storetalk/`
//!   - macOS: `~/Library/Application Support/storetalk/`
//!   - Windows: `%APPDATA%\storetalk\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

/// Storage key holding the bearer token used for the broker handshake.
pub const TOKEN_KEY: &str = "access_token";

/// Key/value store backed by one JSON file per key.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Storage rooted at an explicit directory
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage in the platform config directory
    pub fn platform() -> Option<Self> {
        let dir = dirs::config_dir()?.join("storetalk");
        Some(Self { dir })
    }

    /// Save a value. Returns `true` if the write succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(_) => false,
        }
    }

    /// Load a value. `None` if the key is missing or fails to deserialize.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.load_raw(key)?;
        serde_json::from_str(&json).ok()
    }

    pub fn remove(&self, key: &str) {
        if let Some(path) = self.file_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.load_raw(key).is_some()
    }

    /// Stored bearer token, if any. Blank tokens count as absent.
    pub fn token(&self) -> Option<String> {
        self.load::<String>(TOKEN_KEY)
            .filter(|t| !t.trim().is_empty())
    }

    pub fn set_token(&self, token: &str) -> bool {
        self.save(TOKEN_KEY, &token)
    }

    fn ensure_dir(&self) -> Option<&Path> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).ok()?;
        }
        Some(&self.dir)
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        let dir = self.ensure_dir()?;
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        Some(dir.join(format!("{}.json", safe_key)))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return false;
        };
        std::fs::write(path, value).is_ok()
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at(dir.path().join("nested"));

        assert_eq!(storage.token(), None);
        assert!(storage.set_token("abc.def"));
        assert_eq!(storage.token().as_deref(), Some("abc.def"));

        storage.remove(TOKEN_KEY);
        assert!(!storage.exists(TOKEN_KEY));
    }

    #[test]
    fn blank_token_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at(dir.path());
        storage.set_token("   ");
        assert_eq!(storage.token(), None);
    }

    #[test]
    fn keys_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at(dir.path());
        assert!(storage.save("a/b:c", &1u32));
        assert!(dir.path().join("a_b_c.json").exists());
        assert_eq!(storage.load::<u32>("a/b:c"), Some(1));
    }
}
