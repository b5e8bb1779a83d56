//! External media library: where originals come from, and optionally go away.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use pxv_core::config::ImportConfig;
use pxv_core::{CleartextMedia, MediaId, MediaType};
use tracing::{debug, warn};

use crate::error::ImportError;
use crate::task::ImportItem;

/// An original in an external library, ready to be fetched into scratch.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryAsset {
    pub external_ref: String,
    pub media_id: MediaId,
    pub media_type: MediaType,
}

pub trait MediaLibrary: Send + Sync {
    /// Copy an asset's bytes into the scratch area as an import input.
    fn fetch(&self, asset: &LibraryAsset)
        -> impl Future<Output = Result<ImportItem, ImportError>> + Send;

    fn delete(&self, external_ref: &str) -> impl Future<Output = Result<(), ImportError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe face of a [`MediaLibrary`], so the engine can fetch lazily
/// without another type parameter.
pub trait AssetFetcher: Send + Sync {
    fn fetch_asset<'a>(
        &'a self,
        asset: &'a LibraryAsset,
    ) -> BoxFuture<'a, Result<ImportItem, ImportError>>;
}

impl<L: MediaLibrary> AssetFetcher for L {
    fn fetch_asset<'a>(
        &'a self,
        asset: &'a LibraryAsset,
    ) -> BoxFuture<'a, Result<ImportItem, ImportError>> {
        Box::pin(self.fetch(asset))
    }
}

/// A plain directory tree as the library; external refs are file paths.
pub struct FsLibrary {
    scratch_dir: PathBuf,
}

impl FsLibrary {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }
}

impl MediaLibrary for FsLibrary {
    async fn fetch(&self, asset: &LibraryAsset) -> Result<ImportItem, ImportError> {
        let src = Path::new(&asset.external_ref);
        let meta = tokio::fs::metadata(src)
            .await
            .map_err(|e| ImportError::Library(format!("{}: {e}", src.display())))?;
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| asset.media_id.to_string());

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let scratch = self.scratch_dir.join(format!("{}-{file_name}", &tag[..12]));
        tokio::fs::copy(src, &scratch)
            .await
            .map_err(|e| ImportError::Library(format!("copying {}: {e}", src.display())))?;
        debug!(src = %src.display(), scratch = %scratch.display(), "staged original");

        let mut media = CleartextMedia::from_scratch(asset.media_id.clone(), asset.media_type, scratch)
            .with_file_name(file_name);
        if let Some(mtime) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        {
            media = media.with_captured_at(mtime.as_secs());
        }
        Ok(ImportItem::new(media).with_side_resource(asset.external_ref.clone()))
    }

    async fn delete(&self, external_ref: &str) -> Result<(), ImportError> {
        match tokio::fs::remove_file(external_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImportError::Library(format!("{external_ref}: {e}"))),
        }
    }
}

/// Which files [`collect_media`] picks up.
#[derive(Debug, Clone, Default)]
pub struct CollectConfig {
    /// Glob patterns matched against file and directory names
    pub exclude_patterns: Vec<String>,
    pub include_hidden: bool,
}

impl From<&ImportConfig> for CollectConfig {
    fn from(config: &ImportConfig) -> Self {
        Self {
            exclude_patterns: config.exclude_patterns.clone(),
            include_hidden: config.include_hidden,
        }
    }
}

/// Walk `roots` (files or directories) for photos and videos.
///
/// A photo and a video with the same stem in the same directory form a live
/// photo: they share one MediaId and the video becomes the motion component.
/// Output is sorted by path, with each still directly before its motion clip.
pub fn collect_media(roots: &[PathBuf], config: &CollectConfig) -> Result<Vec<LibraryAsset>> {
    let excludes: Vec<glob::Pattern> = config
        .exclude_patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                None
            }
        })
        .collect();

    let mut files = Vec::new();
    for root in roots {
        let meta = std::fs::metadata(root).with_context(|| format!("stat: {}", root.display()))?;
        if meta.is_dir() {
            collect_inner(root, &mut files, config, &excludes)?;
        } else {
            files.push(root.clone());
        }
    }
    files.sort();
    files.dedup();

    // Group by (directory, lowercase stem) to find live photo pairs.
    let mut groups: BTreeMap<(PathBuf, String), Vec<(PathBuf, MediaType)>> = BTreeMap::new();
    for path in files {
        let Some(media_type) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(MediaType::from_extension)
        else {
            continue;
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        groups.entry((dir, stem)).or_default().push((path, media_type));
    }

    let mut assets = Vec::new();
    for (_, members) in groups {
        let photos = members.iter().filter(|(_, t)| *t == MediaType::Photo).count();
        let videos = members.iter().filter(|(_, t)| *t == MediaType::Video).count();

        if photos == 1 && videos == 1 {
            let id = MediaId::generate();
            let mut pair: Vec<_> = members
                .into_iter()
                .map(|(path, t)| {
                    let t = if t == MediaType::Video {
                        MediaType::LivePhotoComponent
                    } else {
                        t
                    };
                    (path, t)
                })
                .collect();
            pair.sort_by_key(|(_, t)| *t == MediaType::LivePhotoComponent);
            for (path, media_type) in pair {
                assets.push(LibraryAsset {
                    external_ref: path.to_string_lossy().into_owned(),
                    media_id: id.clone(),
                    media_type,
                });
            }
        } else {
            for (path, media_type) in members {
                assets.push(LibraryAsset {
                    external_ref: path.to_string_lossy().into_owned(),
                    media_id: MediaId::generate(),
                    media_type,
                });
            }
        }
    }
    Ok(assets)
}

fn collect_inner(
    dir: &Path,
    out: &mut Vec<PathBuf>,
    config: &CollectConfig,
    excludes: &[glob::Pattern],
) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading dir: {}", dir.display()))? {
        let entry = entry.context("reading dir entry")?;
        let path = entry.path();
        let meta = entry.metadata().context("stat dir entry")?;

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if excludes.iter().any(|p| p.matches(name)) {
            continue;
        }
        if name.starts_with('.') && !config.include_hidden {
            continue;
        }

        if meta.is_dir() {
            collect_inner(&path, out, config, excludes)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
