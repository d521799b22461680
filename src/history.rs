//! Capped log of completed downloads, persisted as a JSON array (oldest first).
//!
//! History is best effort: read and write failures are logged and never reach
//! the download that triggered them.

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    pub format_id: String,
    pub save_path: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl HistoryEntry {
    pub fn now(url: &str, title: &str, format_id: &str, save_path: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            format_id: format_id.to_string(),
            save_path: save_path.to_string(),
            timestamp: now_ms(),
        }
    }
}

/// Single owner of the history file. Every mutation holds the lock across the
/// in-memory update and the file rewrite, so concurrent appends cannot lose entries.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_entries_best_effort(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the persisted list. Any failure yields an empty list.
    pub fn load(&self) -> Vec<HistoryEntry> {
        let mut guard = self.lock();
        *guard = read_entries_best_effort(&self.path);
        guard.clone()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    pub fn append(&self, entry: HistoryEntry) {
        let mut guard = self.lock();
        guard.push(entry);
        evict_oldest(&mut guard);
        if let Err(err) = write_entries(&self.path, &guard) {
            error!(error = %err, "failed to persist download history");
        }
    }

    pub fn clear(&self) {
        let mut guard = self.lock();
        guard.clear();
        if let Err(err) = write_entries(&self.path, &guard) {
            error!(error = %err, "failed to persist cleared download history");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("history lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

fn evict_oldest(entries: &mut Vec<HistoryEntry>) {
    if entries.len() > HISTORY_CAPACITY {
        let overflow = entries.len() - HISTORY_CAPACITY;
        entries.drain(0..overflow);
    }
}

fn read_entries_best_effort(path: &Path) -> Vec<HistoryEntry> {
    if !path.exists() {
        return Vec::new();
    }
    match read_entries(path) {
        Ok(mut entries) => {
            evict_oldest(&mut entries);
            entries
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "download history unreadable; starting empty");
            Vec::new()
        }
    }
}

fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_entries(path: &Path, entries: &[HistoryEntry]) -> Result<()> {
    let persistence = |reason: String| EngineError::HistoryPersistence {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| persistence(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(entries).map_err(|e| persistence(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, format!("{json}\n")).map_err(|e| persistence(e.to_string()))?;
    if std::fs::rename(&tmp_path, path).is_err() {
        std::fs::copy(&tmp_path, path).map_err(|e| persistence(e.to_string()))?;
        let _ = std::fs::remove_file(&tmp_path);
    }
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(i: usize) -> HistoryEntry {
        HistoryEntry {
            url: format!("https://example.com/v{i}"),
            title: format!("video {i}"),
            format_id: "best".to_string(),
            save_path: "/tmp/out".to_string(),
            timestamp: i as i64,
        }
    }

    #[test]
    fn append_evicts_oldest_beyond_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(dir.path().join("history.json"));
        for i in 0..HISTORY_CAPACITY {
            store.append(entry(i));
        }
        assert_eq!(store.entries().len(), HISTORY_CAPACITY);

        store.append(entry(HISTORY_CAPACITY));
        let entries = store.entries();
        assert_eq!(entries.len(), HISTORY_CAPACITY);
        assert_eq!(entries.first(), Some(&entry(1)));
        assert_eq!(entries.last(), Some(&entry(HISTORY_CAPACITY)));

        let reloaded = HistoryStore::open(store.path()).entries();
        assert_eq!(reloaded, entries);
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "[{\"url\": tru").expect("write");

        let store = HistoryStore::open(&path);
        assert!(store.entries().is_empty());
        assert!(store.load().is_empty());

        std::fs::write(&path, "{\"not\":\"a list\"}").expect("write");
        assert!(store.load().is_empty());
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(dir.path().join("nested").join("history.json"));
        assert!(store.load().is_empty());
        store.append(entry(1));
        assert_eq!(store.load(), vec![entry(1)]);
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(HistoryStore::open(dir.path().join("history.json")));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.append(entry(t * 10 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        let persisted = store.load();
        assert_eq!(persisted.len(), 80);
        for i in 0..80 {
            assert!(persisted.contains(&entry(i)), "missing entry {i}");
        }
    }

    #[test]
    fn load_during_appends_keeps_every_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(HistoryStore::open(dir.path().join("history.json")));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..90 {
                    store.append(entry(i));
                }
            })
        };
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                while !writer.is_finished() {
                    let seen = store.load();
                    assert!(seen.len() <= 90);
                }
                writer.join().expect("join writer");
            })
        };
        reader.join().expect("join reader");

        let persisted = HistoryStore::open(store.path()).entries();
        assert_eq!(persisted.len(), 90);
        for i in 0..90 {
            assert!(persisted.contains(&entry(i)), "missing entry {i}");
        }
    }

    #[test]
    fn clear_empties_memory_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open(dir.path().join("history.json"));
        store.append(entry(1));
        store.append(entry(2));
        store.clear();
        assert!(store.entries().is_empty());
        assert!(store.load().is_empty());
        assert!(store.path().is_file());
    }

    #[test]
    fn persistence_failure_is_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes every write fail.
        let path = dir.path().join("history.json");
        std::fs::create_dir_all(&path).expect("mkdir");
        let store = HistoryStore::open(&path);
        store.append(entry(1));
        assert_eq!(store.entries(), vec![entry(1)]);
    }
}
