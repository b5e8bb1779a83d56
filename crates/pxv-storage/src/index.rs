//! Per-key media index: one record per encrypted item, persisted as JSON.
//!
//! Loaded entirely into memory and flushed atomically (temp file, fsync,
//! rename) so a crash mid-write never leaves a half-written index.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use pxv_core::{EncryptedMedia, MaterializationState};

pub struct MediaIndex {
    path: PathBuf,
    /// `{type dir}/{media id}` → record
    entries: BTreeMap<String, EncryptedMedia>,
    dirty: bool,
}

impl MediaIndex {
    /// Load or create an index at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading media index: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing media index: {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(MediaIndex {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    pub fn get(&self, key: &str) -> Option<&EncryptedMedia> {
        self.entries.get(key)
    }

    /// Insert or replace a record, returning the one it replaced.
    pub fn insert(&mut self, record: EncryptedMedia) -> Option<EncryptedMedia> {
        self.dirty = true;
        self.entries.insert(record.index_key(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<EncryptedMedia> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Record the last observed materialization state. Returns false for unknown keys.
    pub fn set_state(&mut self, key: &str, state: MaterializationState) -> bool {
        match self.entries.get_mut(key) {
            Some(record) if record.state != state => {
                record.state = state;
                self.dirty = true;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &EncryptedMedia> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything without writing; used when the whole scope is deleted.
    pub fn discard(&mut self) {
        self.entries.clear();
        self.dirty = false;
    }

    /// Flush dirty changes to disk using an atomic write (write, fsync, rename).
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index dir: {}", parent.display()))?;
        }

        let json = serde_json::to_vec_pretty(&self.entries).context("serializing media index")?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("creating index temp: {}", tmp_path.display()))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.sync_all())
            .with_context(|| format!("writing index temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming media index: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for MediaIndex {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush media index on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxv_core::{MediaId, MediaType};

    fn record(id: &str) -> EncryptedMedia {
        EncryptedMedia {
            id: MediaId::new(id),
            media_type: MediaType::Photo,
            key_id: "k1".into(),
            location: format!("k1/photos/{id}.pxv"),
            state: MaterializationState::Resident,
            captured_at: Some(1_700_000_000),
            file_name: Some(format!("{id}.heic")),
            ciphertext_len: 1234,
            stored_at: 1_700_000_100,
        }
    }

    #[test]
    fn test_open_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let index = MediaIndex::open(&dir.path().join("index.json")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1/index.json");

        {
            let mut index = MediaIndex::open(&path).unwrap();
            index.insert(record("a"));
            index.insert(record("b"));
            index.flush().unwrap();
        }

        let index = MediaIndex::open(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("photos/a").unwrap().ciphertext_len, 1234);
        assert!(!dir.path().join("k1/index.tmp").exists());
    }

    #[test]
    fn test_set_state_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = MediaIndex::open(&path).unwrap();
        index.insert(record("a"));
        assert!(index.set_state("photos/a", MaterializationState::RemoteOnly));
        assert!(!index.set_state("photos/missing", MaterializationState::RemoteOnly));
        index.flush().unwrap();

        let reloaded = MediaIndex::open(&path).unwrap();
        assert_eq!(
            reloaded.get("photos/a").unwrap().state,
            MaterializationState::RemoteOnly
        );
    }

    #[test]
    fn test_drop_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut index = MediaIndex::open(&path).unwrap();
            index.insert(record("a"));
        }
        assert_eq!(MediaIndex::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_discard_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut index = MediaIndex::open(&path).unwrap();
            index.insert(record("a"));
            index.discard();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(MediaIndex::open(&path).is_err());
    }
}
