//! Persisted configuration and sync state.
//!
//! A single JSON file holds both the user's settings (API key, disk
//! privileges) and the sync state (fingerprints already uploaded, ids of the
//! remote resources). It is loaded once at startup and rewritten in full on
//! every mutation.
//!
//! ```json
//! {
//!   "assistant_id": "asst_...",
//!   "vector_store_id": "vs_...",
//!   "thread_id": null,
//!   "embedded_notes": ["3f2a...", "..."],
//!   "openai_api_key": "sk-...",
//!   "disk_privileges": false
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{NotesError, Result};

pub const CONFIG_FILE_NAME: &str = "chat_apple_notes_config.json";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub vector_store_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Fingerprints of notes already present in the vector store. Only grows.
    #[serde(default)]
    pub embedded_notes: BTreeSet<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    /// `None` until the user has been asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_privileges: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// Loaded configuration bound to the file it persists to.
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    settings: Settings,
}

/// `~/chat_apple_notes_config.json`, or the working directory when no home
/// directory can be determined.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

/// Load the configuration at `path`.
///
/// Never fails: a missing file yields defaults, and an unreadable or
/// malformed file is reported with a warning and replaced by defaults on the
/// next write.
pub fn load_config(path: &Path) -> Config {
    let settings = match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "Error decoding the config file {}: {}. Loading default configuration.",
                    path.display(),
                    e
                );
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no config file at {}, using defaults", path.display());
            Settings::default()
        }
        Err(e) => {
            warn!(
                "Could not read config file {}: {}. Loading default configuration.",
                path.display(),
                e
            );
            Settings::default()
        }
    };

    Config {
        path: path.to_path_buf(),
        settings,
    }
}

impl Config {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn assistant_id(&self) -> Option<&str> {
        self.settings.assistant_id.as_deref()
    }

    pub fn vector_store_id(&self) -> Option<&str> {
        self.settings.vector_store_id.as_deref()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.settings.thread_id.as_deref()
    }

    pub fn embedded_notes(&self) -> &BTreeSet<String> {
        &self.settings.embedded_notes
    }

    /// Configured key, falling back to `OPENAI_API_KEY`.
    pub fn openai_api_key(&self) -> Option<String> {
        self.settings
            .openai_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    pub fn has_stored_api_key(&self) -> bool {
        self.settings
            .openai_api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }

    /// Whether the identity resolver may read the note store directly.
    pub fn disk_privileges(&self) -> bool {
        self.settings.disk_privileges.unwrap_or(false)
    }

    pub fn disk_privileges_configured(&self) -> bool {
        self.settings.disk_privileges.is_some()
    }

    pub fn model(&self) -> &str {
        self.settings.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_base(&self) -> &str {
        self.settings.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)
    }

    pub fn set_api_key(&mut self, key: &str) -> Result<()> {
        self.settings.openai_api_key = Some(key.trim().to_string());
        self.save()
    }

    pub fn set_disk_privileges(&mut self, enabled: bool) -> Result<()> {
        self.settings.disk_privileges = Some(enabled);
        self.save()
    }

    pub fn set_remote_ids(&mut self, assistant_id: &str, vector_store_id: &str) -> Result<()> {
        self.settings.assistant_id = Some(assistant_id.to_string());
        self.settings.vector_store_id = Some(vector_store_id.to_string());
        self.save()
    }

    pub fn set_thread_id(&mut self, thread_id: &str) -> Result<()> {
        self.settings.thread_id = Some(thread_id.to_string());
        self.save()
    }

    /// Merge uploaded fingerprints into the embedded set and persist.
    ///
    /// Call only after the corresponding documents are confirmed uploaded.
    pub fn add_embedded<I, S>(&mut self, fingerprints: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.settings.embedded_notes.len();
        self.settings
            .embedded_notes
            .extend(fingerprints.into_iter().map(Into::into));
        if self.settings.embedded_notes.len() == before {
            return Ok(());
        }
        self.save()
    }

    /// Write the whole file synchronously (temp file + rename).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    NotesError::Configuration(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| NotesError::Configuration(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, json).map_err(|e| {
            NotesError::Configuration(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            NotesError::Configuration(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&tmp.path().join("absent.json"));
        assert_eq!(cfg.settings(), &Settings::default());
        assert!(cfg.assistant_id().is_none());
        assert!(cfg.embedded_notes().is_empty());
        assert!(!cfg.disk_privileges());
        assert!(!cfg.disk_privileges_configured());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cfg = load_config(&path);
        assert_eq!(cfg.settings(), &Settings::default());
        // Content is discarded, not repaired, until the next write.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn reads_the_python_era_shape() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"assistant_id": "asst_1", "vector_store_id": "vs_1", "thread_id": null,
                "embedded_notes": ["b", "a"], "openai_api_key": "sk-test",
                "disk_privileges": true}"#,
        )
        .unwrap();

        let cfg = load_config(&path);
        assert_eq!(cfg.assistant_id(), Some("asst_1"));
        assert_eq!(cfg.vector_store_id(), Some("vs_1"));
        assert_eq!(cfg.thread_id(), None);
        assert!(cfg.embedded_notes().contains("a"));
        assert!(cfg.embedded_notes().contains("b"));
        assert_eq!(cfg.openai_api_key().as_deref(), Some("sk-test"));
        assert!(cfg.disk_privileges());
        assert_eq!(cfg.model(), DEFAULT_MODEL);
    }

    #[test]
    fn every_mutation_is_persisted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("cfg.json");

        let mut cfg = load_config(&path);
        cfg.set_api_key("  sk-abc  ").unwrap();
        assert_eq!(load_config(&path).openai_api_key().as_deref(), Some("sk-abc"));

        cfg.set_disk_privileges(true).unwrap();
        assert!(load_config(&path).disk_privileges());

        cfg.set_remote_ids("asst_9", "vs_9").unwrap();
        cfg.set_thread_id("thread_9").unwrap();
        let reloaded = load_config(&path);
        assert_eq!(reloaded.assistant_id(), Some("asst_9"));
        assert_eq!(reloaded.vector_store_id(), Some("vs_9"));
        assert_eq!(reloaded.thread_id(), Some("thread_9"));
    }

    #[test]
    fn embedded_set_only_grows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");

        let mut cfg = load_config(&path);
        cfg.add_embedded(["h1", "h2"]).unwrap();
        cfg.add_embedded(vec!["h2".to_string(), "h3".to_string()])
            .unwrap();

        let reloaded = load_config(&path);
        let got: Vec<&str> = reloaded.embedded_notes().iter().map(|s| s.as_str()).collect();
        assert_eq!(got, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn unasked_privileges_are_not_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");

        let mut cfg = load_config(&path);
        cfg.set_api_key("sk").unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("disk_privileges"));
        assert!(raw.contains("\"embedded_notes\""));
    }
}
