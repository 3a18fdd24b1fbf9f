//! The on-disk JSON archive: the system of record for the public API.
//!
//! One `works/<id>.json` file per work under the archive root, plus
//! `watermark.json` tracking the last successfully indexed sync point and
//! a `.sync.lock` file enforcing one sync run at a time.
//!
//! Writes are atomic (write to a temp file in the same directory, then
//! rename), so HTTP readers never observe a half-written entry. The sync
//! orchestrator is the sole writer.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::models::Work;

/// Partition of incoming records against the persisted archive.
///
/// The three sets are disjoint and their union is the incoming set.
/// Unchanged works are skipped by asset relocation and search indexing.
#[derive(Debug, Default, PartialEq)]
pub struct Diff {
    pub created: Vec<i64>,
    pub updated: Vec<i64>,
    pub unchanged: Vec<i64>,
}

/// The last successfully synced point, persisted beside the archive.
///
/// `last_synced` is the maximum upstream `date_modified` of the most
/// recent fully indexed page; it never overtakes data that is not yet
/// durable in both the archive and the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub last_synced: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Per-work JSON archive rooted at a directory.
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("works"))
            .with_context(|| format!("Failed to create archive root: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn work_path(&self, id: i64) -> PathBuf {
        self.root.join("works").join(format!("{}.json", id))
    }

    /// Read one archive entry. Tombstones are returned as-is; callers
    /// that serve the public API filter on `unpublished`.
    pub fn read(&self, id: i64) -> Result<Option<Work>> {
        let path = self.work_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let work: Work = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt archive entry: {}", path.display()))?;
        Ok(Some(work))
    }

    /// Write one archive entry atomically (temp file + rename).
    pub fn write(&self, work: &Work) -> Result<(), SyncError> {
        let path = self.work_path(work.id);
        let json = serde_json::to_string(work).map_err(|e| SyncError::ArchiveWriteFailed {
            id: work.id,
            reason: e.to_string(),
        })?;
        write_atomic(&path, json.as_bytes()).map_err(|e| SyncError::ArchiveWriteFailed {
            id: work.id,
            reason: e.to_string(),
        })
    }

    /// Rewrite an entry as a tombstone. The file is never deleted.
    pub fn write_tombstone(&self, id: i64, date_modified: DateTime<Utc>) -> Result<(), SyncError> {
        self.write(&Work::tombstone(id, date_modified))
    }

    /// Partition incoming `(id, date_modified)` pairs into created,
    /// updated, and unchanged, by comparing against the persisted entry's
    /// upstream timestamp. A tombstoned entry counts as updated so a
    /// re-published work is restored.
    pub fn diff(&self, incoming: &[(i64, DateTime<Utc>)]) -> Result<Diff> {
        let mut diff = Diff::default();
        for &(id, modified) in incoming {
            match self.read(id)? {
                None => diff.created.push(id),
                Some(existing) if existing.unpublished => diff.updated.push(id),
                Some(existing) if modified > existing.date_modified => diff.updated.push(id),
                Some(_) => diff.unchanged.push(id),
            }
        }
        Ok(diff)
    }

    /// All archived identifiers, ascending, tombstones included.
    pub fn list_ids(&self) -> Result<Vec<i64>> {
        let works_dir = self.root.join("works");
        let mut ids = Vec::new();
        for entry in WalkDir::new(&works_dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = stem.parse::<i64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// All published works, ascending by id. Tombstones are excluded.
    pub fn list_published(&self) -> Result<Vec<Work>> {
        let mut works = Vec::new();
        for id in self.list_ids()? {
            if let Some(work) = self.read(id)? {
                if !work.unpublished {
                    works.push(work);
                }
            }
        }
        Ok(works)
    }

    /// Load the persisted watermark, if any run has completed.
    pub fn load_watermark(&self) -> Result<Option<Watermark>> {
        let path = self.root.join("watermark.json");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Persist the watermark atomically.
    pub fn store_watermark(&self, watermark: &Watermark) -> Result<()> {
        let path = self.root.join("watermark.json");
        write_atomic(&path, serde_json::to_string(watermark)?.as_bytes())
    }

    /// Acquire the exclusive run lock for this archive.
    pub fn lock(&self) -> Result<RunLock, SyncError> {
        RunLock::acquire(&self.root.join(".sync.lock"))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// Exclusive lock file preventing concurrent syncs against one archive.
///
/// Released on drop. A stale lock (crashed run) must be removed by the
/// operator; the error message names the file.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(path: &Path) -> Result<Self, SyncError> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SyncError::Locked(path.display().to_string()))
            }
            Err(e) => Err(SyncError::Locked(format!("{}: {}", path.display(), e))),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn work(id: i64, modified: DateTime<Utc>) -> Work {
        Work {
            id,
            title: format!("Work {}", id),
            description: String::new(),
            record_type: "film".to_string(),
            creators: Vec::new(),
            production_dates: Vec::new(),
            assets: Vec::new(),
            source: None,
            source_identifier: None,
            date_modified: modified,
            unpublished: false,
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path()).unwrap();

        let w = work(7, ts(1));
        store.write(&w).unwrap();
        assert_eq!(store.read(7).unwrap().unwrap(), w);
        assert!(store.read(8).unwrap().is_none());

        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("works"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn diff_partitions_incoming() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path()).unwrap();

        store.write(&work(1, ts(1))).unwrap();
        store.write(&work(2, ts(1))).unwrap();

        let incoming = vec![(1, ts(1)), (2, ts(2)), (3, ts(2))];
        let diff = store.diff(&incoming).unwrap();

        assert_eq!(diff.created, vec![3]);
        assert_eq!(diff.updated, vec![2]);
        assert_eq!(diff.unchanged, vec![1]);

        // Disjoint partition covering the whole incoming set.
        let mut all: Vec<i64> = diff
            .created
            .iter()
            .chain(&diff.updated)
            .chain(&diff.unchanged)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn tombstoned_entry_counts_as_updated() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path()).unwrap();

        store.write_tombstone(5, ts(3)).unwrap();
        assert!(store.read(5).unwrap().unwrap().unpublished);
        assert!(store.list_published().unwrap().is_empty());
        assert_eq!(store.list_ids().unwrap(), vec![5]);

        let diff = store.diff(&[(5, ts(1))]).unwrap();
        assert_eq!(diff.updated, vec![5]);
    }

    #[test]
    fn watermark_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path()).unwrap();

        assert!(store.load_watermark().unwrap().is_none());
        let wm = Watermark {
            last_synced: ts(9),
            completed_at: ts(10),
        };
        store.store_watermark(&wm).unwrap();
        let loaded = store.load_watermark().unwrap().unwrap();
        assert_eq!(loaded.last_synced, wm.last_synced);
    }

    #[test]
    fn run_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path()).unwrap();

        let lock = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(SyncError::Locked(_))));
        drop(lock);
        assert!(store.lock().is_ok());
    }
}
