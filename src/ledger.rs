//! The sent-posts ledger: the only state that survives between runs.
//!
//! On disk it is a small JSON document, `{"sentGuids": [...]}`, rewritten
//! wholesale at the end of a run. Files written by the earlier script used the
//! key `sentPosts`; those load transparently and are upgraded on save.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access ledger '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Refusing to continue: an unreadable ledger would re-send old posts.
    #[error("Ledger '{path}' is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Set of guids already delivered, kept in delivery order.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(alias = "sentPosts", default)]
    sent_guids: Vec<String>,
    #[serde(skip)]
    index: HashSet<String>,
}

impl PartialEq for Ledger {
    fn eq(&self, other: &Self) -> bool {
        self.sent_guids == other.sent_guids
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ledger from guids, dropping duplicates but keeping first-seen order.
    pub fn from_guids<I, S>(guids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ledger = Self::new();
        for guid in guids {
            ledger.record(guid);
        }
        ledger
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.index.contains(guid)
    }

    /// Adds a guid. Returns `false` if it was already present.
    pub fn record(&mut self, guid: impl Into<String>) -> bool {
        let guid = guid.into();
        if self.index.contains(&guid) {
            return false;
        }
        self.index.insert(guid.clone());
        self.sent_guids.push(guid);
        true
    }

    pub fn len(&self) -> usize {
        self.sent_guids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent_guids.is_empty()
    }

    pub fn guids(&self) -> &[String] {
        &self.sent_guids
    }

    /// Reads the ledger at `path`.
    ///
    /// - Missing file → empty ledger
    /// - Empty file → empty ledger
    /// - Invalid JSON → `Err(LedgerError::Corrupt)`
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No ledger file found, starting fresh");
                return Ok(Self::new());
            }
            Err(e) => return Err(LedgerError::io(path, e)),
        };

        if content.trim().is_empty() {
            return Ok(Self::new());
        }

        let raw: Ledger =
            serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        // Rebuilds the lookup index and collapses any duplicates in the file.
        let ledger = Self::from_guids(raw.sent_guids);
        tracing::debug!(path = %path.display(), guids = ledger.len(), "Loaded ledger");
        Ok(ledger)
    }

    /// Replaces the ledger file with the current contents.
    ///
    /// Writes to a temporary sibling, syncs it, then renames over `path`, so a
    /// crash leaves either the old file or the new one, never a partial write.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }

        atomic_write(path, json.as_bytes())?;
        tracing::debug!(path = %path.display(), guids = self.len(), "Saved ledger");
        Ok(())
    }
}

fn atomic_write(dst: &Path, content: &[u8]) -> Result<(), LedgerError> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true) // Fails if the path exists (prevents symlink race)
            .open(&temp_path)?;
        temp_file.write_all(content)?;
        temp_file.write_all(b"\n")?;
        temp_file.sync_all()?;
        drop(temp_file);

        // On Windows, rename fails if destination exists, so remove it first
        #[cfg(windows)]
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }

        std::fs::rename(&temp_path, dst)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        LedgerError::io(dst, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_rejects_duplicates() {
        let mut ledger = Ledger::new();
        assert!(ledger.record("a"));
        assert!(ledger.record("b"));
        assert!(!ledger.record("a"));
        assert_eq!(ledger.guids(), &["a".to_string(), "b".to_string()]);
        assert!(ledger.contains("b"));
        assert!(!ledger.contains("c"));
    }

    #[test]
    fn test_missing_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(&dir.path().join("sent-posts.json")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_empty_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent-posts.json");
        std::fs::write(&path, "  \n").unwrap();
        assert!(Ledger::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sent-posts.json");

        let ledger = Ledger::from_guids(["one", "two"]);
        ledger.save(&path).unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("\"sentGuids\""));

        let loaded = Ledger::load(&path).unwrap();
        assert_eq!(loaded, ledger);
        assert!(loaded.contains("two"));
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent-posts.json");

        Ledger::from_guids(["old"]).save(&path).unwrap();
        Ledger::from_guids(["old", "new"]).save(&path).unwrap();

        let loaded = Ledger::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_legacy_sent_posts_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent-posts.json");
        std::fs::write(&path, r#"{ "sentPosts": ["https://blog.example.com/a", "https://blog.example.com/a"] }"#)
            .unwrap();

        let ledger = Ledger::load(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains("https://blog.example.com/a"));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent-posts.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Ledger::load(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }), "got {err:?}");
    }
}
