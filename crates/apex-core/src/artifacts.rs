//! Content-addressed artifact store with git-style 2-char sharding.
//!
//! Layout: `<root>/blobs/<first 2 hex chars>/<remaining hex chars>`, with a
//! JSON index at `<root>/index.json` referencing every put (no dedup at the
//! index level; blobs themselves are deduplicated by content hash).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{ApexError, Result};

/// Index file name inside the artifacts root.
pub const INDEX_FILE: &str = "index.json";

/// One index row per `put`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Hex SHA-256 of the blob.
    pub hash: String,
    /// Display name, e.g. `task_1.stdout`.
    pub name: String,
    pub run_id: String,
    pub node_id: String,
    /// Blob size in bytes.
    pub size: u64,
}

/// Report from a GC pass.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Index entries whose run is outside retention or unknown.
    pub candidates: Vec<ArtifactRecord>,
    /// Blob hashes actually unlinked (empty on dry runs).
    pub deleted_blobs: Vec<String>,
    pub dry_run: bool,
}

/// Filesystem-backed artifact store.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root`. Creates `root/blobs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs"))?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("blobs").join(&hash[..2]).join(&hash[2..])
    }

    /// Store a blob and append an index record. Idempotent on the blob.
    pub fn put(&self, data: &[u8], name: &str, run_id: &str, node_id: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = hex::encode(hasher.finalize());

        let path = self.blob_path(&hash);
        if !path.exists() {
            let shard_dir = path.parent().expect("blob path always has parent");
            fs::create_dir_all(shard_dir)?;

            // Atomic write: temp file in the same directory, then rename.
            let mut tmp = NamedTempFile::new_in(shard_dir)?;
            tmp.write_all(data)?;
            tmp.persist(&path).map_err(|e| ApexError::Io(e.error))?;
        }

        let mut index = self.index()?;
        index.push(ArtifactRecord {
            hash: hash.clone(),
            name: name.to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            size: data.len() as u64,
        });
        self.write_index(&index)?;

        Ok(hash)
    }

    /// Read a blob back.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ApexError::ArtifactNotFound(hash.to_string())
            } else {
                ApexError::Io(e)
            }
        })
    }

    /// Index records for a hash, newest last.
    pub fn info(&self, hash: &str) -> Result<Vec<ArtifactRecord>> {
        let records: Vec<ArtifactRecord> = self
            .index()?
            .into_iter()
            .filter(|r| r.hash == hash)
            .collect();
        if records.is_empty() {
            return Err(ApexError::ArtifactNotFound(hash.to_string()));
        }
        Ok(records)
    }

    /// The full index.
    pub fn index(&self) -> Result<Vec<ArtifactRecord>> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_index(&self, index: &[ArtifactRecord]) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer_pretty(&mut tmp, index)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path).map_err(|e| ApexError::Io(e.error))?;
        Ok(())
    }

    /// Collect (and without `dry_run`, delete) artifacts whose run is not
    /// in `retained`. A blob is unlinked only when no surviving index entry
    /// references it.
    pub fn gc(&self, retained: &HashSet<String>, dry_run: bool) -> Result<GcReport> {
        let index = self.index()?;
        let (candidates, survivors): (Vec<_>, Vec<_>) = index
            .into_iter()
            .partition(|r| !retained.contains(&r.run_id));

        let mut report = GcReport {
            candidates: candidates.clone(),
            deleted_blobs: Vec::new(),
            dry_run,
        };
        if dry_run || candidates.is_empty() {
            return Ok(report);
        }

        let mut survivor_refs: HashMap<&str, usize> = HashMap::new();
        for record in &survivors {
            *survivor_refs.entry(record.hash.as_str()).or_default() += 1;
        }

        let mut seen = HashSet::new();
        for record in &candidates {
            if !seen.insert(record.hash.as_str()) {
                continue;
            }
            if !survivor_refs.contains_key(record.hash.as_str()) {
                let path = self.blob_path(&record.hash);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                report.deleted_blobs.push(record.hash.clone());
            }
        }

        self.write_index(&survivors)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = make_store();
        let hash = store.put(b"hello world", "out.txt", "run-1", "task_1").unwrap();
        assert_eq!(store.get(&hash).unwrap(), b"hello world");
    }

    #[test]
    fn put_is_idempotent_on_the_blob_but_appends_index() {
        let (_dir, store) = make_store();
        let h1 = store.put(b"same", "a.txt", "run-1", "task_1").unwrap();
        let h2 = store.put(b"same", "b.txt", "run-2", "task_1").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.index().unwrap().len(), 2);
        assert_eq!(store.info(&h1).unwrap().len(), 2);
    }

    #[test]
    fn info_unknown_hash_is_not_found() {
        let (_dir, store) = make_store();
        match store.info(&"0".repeat(64)) {
            Err(ApexError::ArtifactNotFound(_)) => {}
            other => panic!("expected ArtifactNotFound, got {other:?}"),
        }
    }

    #[test]
    fn gc_dry_run_reports_without_deleting() {
        let (_dir, store) = make_store();
        let hash = store.put(b"old", "old.txt", "run-old", "task_1").unwrap();

        let retained: HashSet<String> = ["run-new".to_string()].into_iter().collect();
        let report = store.gc(&retained, true).unwrap();

        assert_eq!(report.candidates.len(), 1);
        assert!(report.deleted_blobs.is_empty());
        assert!(store.get(&hash).is_ok());
        assert_eq!(store.index().unwrap().len(), 1);
    }

    #[test]
    fn gc_unlinks_zero_ref_blobs() {
        let (_dir, store) = make_store();
        let hash = store.put(b"old", "old.txt", "run-old", "task_1").unwrap();

        let retained: HashSet<String> = HashSet::new();
        let report = store.gc(&retained, false).unwrap();

        assert_eq!(report.deleted_blobs, vec![hash.clone()]);
        assert!(store.get(&hash).is_err());
        assert!(store.index().unwrap().is_empty());
    }

    #[test]
    fn gc_keeps_blobs_still_referenced_by_retained_runs() {
        let (_dir, store) = make_store();
        let hash = store.put(b"shared", "a.txt", "run-old", "task_1").unwrap();
        store.put(b"shared", "b.txt", "run-new", "task_2").unwrap();

        let retained: HashSet<String> = ["run-new".to_string()].into_iter().collect();
        let report = store.gc(&retained, false).unwrap();

        // The old index entry is dropped, the shared blob survives.
        assert_eq!(report.candidates.len(), 1);
        assert!(report.deleted_blobs.is_empty());
        assert!(store.get(&hash).is_ok());
        assert_eq!(store.index().unwrap().len(), 1);
    }

    #[test]
    fn empty_blob_roundtrip() {
        let (_dir, store) = make_store();
        let hash = store.put(b"", "empty", "run-1", "task_1").unwrap();
        assert_eq!(store.get(&hash).unwrap(), b"");
    }
}
