//! On-disk naming of encrypted blobs, previews, indexes, and scratch files.

use std::io;
use std::path::{Path, PathBuf};

use pxv_core::{MediaId, MediaType};

pub const BLOB_EXT: &str = "pxv";
pub const PREVIEW_EXT: &str = "pxp";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const BACKUP_SUFFIX: &str = ".prev";
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Encrypted media tree, possibly cloud-backed
    pub root: PathBuf,
    /// Encrypted previews, always local
    pub preview_dir: PathBuf,
    /// Cleartext staging for saves and full loads
    pub scratch_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(root: PathBuf, preview_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            root,
            preview_dir,
            scratch_dir,
        }
    }

    /// `media/`, `previews/` and `scratch/` under one base directory.
    pub fn under(base: &Path) -> Self {
        Self::new(
            base.join("media"),
            base.join("previews"),
            base.join("scratch"),
        )
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.preview_dir)?;
        std::fs::create_dir_all(&self.scratch_dir)
    }

    pub fn scope_dir(&self, key_id: &str) -> PathBuf {
        self.root.join(key_id)
    }

    pub fn index_path(&self, key_id: &str) -> PathBuf {
        self.scope_dir(key_id).join(INDEX_FILE)
    }

    /// Location of a blob relative to `root`, as stored in records.
    pub fn blob_location(key_id: &str, media_type: MediaType, id: &MediaId) -> String {
        format!("{key_id}/{}/{id}.{BLOB_EXT}", media_type.dir_name())
    }

    pub fn blob_path(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }

    pub fn preview_scope(&self, key_id: &str) -> PathBuf {
        self.preview_dir.join(key_id)
    }

    pub fn preview_path(&self, key_id: &str, id: &MediaId) -> PathBuf {
        self.preview_scope(key_id).join(format!("{id}.{PREVIEW_EXT}"))
    }

    /// Fresh scratch path for cleartext produced by a load.
    pub fn scratch_output(&self, id: &MediaId, file_name: Option<&str>) -> PathBuf {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let name = file_name
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        self.scratch_dir.join(format!("{}-{name}", &tag[..12]))
    }
}

/// Sibling path an in-progress write goes to before it is renamed into place.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Sibling path a replaced file is kept at until the replacement is committed.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// Whether a key id can name a storage scope directory.
pub fn is_scope_name(key_id: &str) -> bool {
    MediaId::new(key_id).is_path_safe()
}

/// Clean up after interrupted writes below `dir`: `.partial` files are
/// removed and `.prev` backups are moved back over the file they shadow, since
/// a surviving backup means its replacement was never committed.
/// Returns how many files were touched.
pub fn sweep_partials(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut swept = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            swept += sweep_partials(&path)?;
            continue;
        }
        let name = path.to_string_lossy();
        if name.ends_with(PARTIAL_SUFFIX) {
            std::fs::remove_file(&path)?;
            swept += 1;
        } else if let Some(original) = name.strip_suffix(BACKUP_SUFFIX) {
            std::fs::rename(&path, original)?;
            swept += 1;
        }
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_location_is_key_scoped() {
        let loc = StorageLayout::blob_location("k1", MediaType::Video, &MediaId::new("abc"));
        assert_eq!(loc, "k1/videos/abc.pxv");
        let live =
            StorageLayout::blob_location("k1", MediaType::LivePhotoComponent, &MediaId::new("abc"));
        assert_ne!(loc, live);
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        let p = partial_path(Path::new("/a/b/abc.pxv"));
        assert_eq!(p, PathBuf::from("/a/b/abc.pxv.partial"));
    }

    #[test]
    fn test_sweep_restores_uncommitted_backups() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("k1/photos/a.pxv");
        std::fs::create_dir_all(blob.parent().unwrap()).unwrap();
        std::fs::write(&blob, b"new").unwrap();
        std::fs::write(backup_path(&blob), b"old").unwrap();
        let lone = dir.path().join("k1/photos/b.pxv");
        std::fs::write(backup_path(&lone), b"only").unwrap();

        assert_eq!(sweep_partials(dir.path()).unwrap(), 2);
        assert_eq!(std::fs::read(&blob).unwrap(), b"old");
        assert_eq!(std::fs::read(&lone).unwrap(), b"only");
        assert!(!backup_path(&blob).exists());
    }

    #[test]
    fn test_scratch_output_strips_directories() {
        let layout = StorageLayout::under(Path::new("/base"));
        let p = layout.scratch_output(&MediaId::new("id"), Some("../../etc/IMG_1.HEIC"));
        assert_eq!(p.parent().unwrap(), Path::new("/base/scratch"));
        assert!(p.file_name().unwrap().to_string_lossy().ends_with("-IMG_1.HEIC"));
    }

    #[test]
    fn test_sweep_partials_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("k1/photos");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.pxv.partial"), b"x").unwrap();
        std::fs::write(nested.join("b.pxv"), b"x").unwrap();
        std::fs::write(dir.path().join("c.partial"), b"x").unwrap();

        assert_eq!(sweep_partials(dir.path()).unwrap(), 2);
        assert!(nested.join("b.pxv").exists());
        assert_eq!(sweep_partials(&dir.path().join("missing")).unwrap(), 0);
    }
}
