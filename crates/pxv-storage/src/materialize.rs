//! Cloud materialization: making remote-only bytes locally present.
//!
//! The storage backend never performs the fetch itself. It asks a
//! [`Materializer`] to start one and polls its status until the bytes are
//! resident, the fetch fails, or the wait times out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use opendal::Operator;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::layout::partial_path;

/// Bytes fetched per remote read while hydrating.
const FETCH_SEGMENT: u64 = 1024 * 1024;

/// What the materialization capability reports for one location.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    Resident,
    RemoteOnly,
    Materializing(f64),
    Failed(String),
}

/// External capability that fetches remote-only bytes into the local tree.
///
/// Locations are paths relative to the storage root.
pub trait Materializer: Send + Sync {
    /// Ask for `location` to be made resident. Returns once the fetch is scheduled.
    fn trigger_fetch(&self, location: &str) -> Result<(), String>;

    fn status(&self, location: &str) -> RemoteStatus;
}

/// For purely local storage: whatever is on disk is resident, nothing else can be fetched.
pub struct LocalOnly {
    root: PathBuf,
}

impl LocalOnly {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Materializer for LocalOnly {
    fn trigger_fetch(&self, location: &str) -> Result<(), String> {
        Err(format!("{location} is not on this device and no remote store is configured"))
    }

    fn status(&self, location: &str) -> RemoteStatus {
        if self.root.join(location).exists() {
            RemoteStatus::Resident
        } else {
            RemoteStatus::RemoteOnly
        }
    }
}

/// Hydrates remote-only items from an OpenDAL operator (S3 and friends).
///
/// Each fetch runs as a background tokio task that streams the object into a
/// `.partial` sibling of the local path and renames it into place.
pub struct OperatorMaterializer {
    op: Operator,
    root: PathBuf,
    jobs: Arc<Mutex<HashMap<String, RemoteStatus>>>,
}

impl OperatorMaterializer {
    pub fn new(op: Operator, root: impl Into<PathBuf>) -> Self {
        Self {
            op,
            root: root.into(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn set_job(jobs: &Mutex<HashMap<String, RemoteStatus>>, location: &str, status: RemoteStatus) {
    jobs.lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(location.to_string(), status);
}

impl Materializer for OperatorMaterializer {
    fn trigger_fetch(&self, location: &str) -> Result<(), String> {
        {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(RemoteStatus::Materializing(_)) = jobs.get(location) {
                return Ok(());
            }
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| "no async runtime available to run the fetch".to_string())?;

        set_job(&self.jobs, location, RemoteStatus::Materializing(0.0));

        let op = self.op.clone();
        let dest = self.root.join(location);
        let jobs = Arc::clone(&self.jobs);
        let location = location.to_string();
        handle.spawn(async move {
            let status = match hydrate(&op, &location, &dest, &jobs).await {
                Ok(bytes) => {
                    debug!(location = %location, bytes, "materialized");
                    RemoteStatus::Resident
                }
                Err(e) => {
                    warn!(location = %location, "materialization failed: {e:#}");
                    RemoteStatus::Failed(format!("{e:#}"))
                }
            };
            set_job(&jobs, &location, status);
        });
        Ok(())
    }

    fn status(&self, location: &str) -> RemoteStatus {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(location)
            .cloned();
        match job {
            Some(RemoteStatus::Materializing(p)) => RemoteStatus::Materializing(p),
            Some(RemoteStatus::Failed(reason)) => RemoteStatus::Failed(reason),
            _ if self.root.join(location).exists() => RemoteStatus::Resident,
            _ => RemoteStatus::RemoteOnly,
        }
    }
}

/// Stream one object from the operator into `dest`, reporting progress into `jobs`.
async fn hydrate(
    op: &Operator,
    location: &str,
    dest: &Path,
    jobs: &Mutex<HashMap<String, RemoteStatus>>,
) -> anyhow::Result<u64> {
    use anyhow::Context;

    let meta = op
        .stat(location)
        .await
        .with_context(|| format!("stat remote object: {location}"))?;
    let total = meta.content_length();

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let partial = partial_path(dest);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("creating {}", partial.display()))?;

    let result = async {
        let reader = op
            .reader(location)
            .await
            .with_context(|| format!("opening remote object: {location}"))?;
        let mut offset = 0u64;
        while offset < total {
            let end = (offset + FETCH_SEGMENT).min(total);
            let segment = reader
                .read(offset..end)
                .await
                .with_context(|| format!("reading {location} [{offset}..{end})"))?;
            file.write_all(&segment.to_vec()).await?;
            offset = end;
            set_job(jobs, location, RemoteStatus::Materializing(offset as f64 / total as f64));
        }
        file.sync_all().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("renaming into place: {}", dest.display()))?;
    Ok(total)
}
