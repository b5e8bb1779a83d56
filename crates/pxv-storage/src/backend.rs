//! Storage backend: save, load, delete and enumerate encrypted media.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pxv_core::config::PxvConfig;
use pxv_core::types::{index_key, unix_now};
use pxv_core::{
    CleartextMedia, EncryptedMedia, LoadPhase, MaterializationEvent, MaterializationState,
    MediaId, MediaSource, MediaType,
};
use pxv_crypto::{
    decrypt_stream, decrypt_to_vec, encrypt_stream, plaintext_len, FormatVersion, KeyManager,
    MediaKey,
};
use pxv_crypto::stream::HEADER_SIZE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::index::MediaIndex;
use crate::layout::{backup_path, is_scope_name, partial_path, sweep_partials, StorageLayout};
use crate::materialize::{Materializer, RemoteStatus};
use crate::preview::{NoPreview, Preview, PreviewModel, PreviewRenderer, PreviewSource};
use crate::progress::LoadProgress;

/// Fractional (0.0..=1.0) progress of one save.
pub type SaveProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Format new saves are sealed with
    pub format: FormatVersion,
    pub materialize_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            format: FormatVersion::default(),
            materialize_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl StorageOptions {
    pub fn from_config(config: &PxvConfig) -> Self {
        Self {
            format: FormatVersion::from_u8(config.crypto.format_version).unwrap_or_default(),
            materialize_timeout: config.storage.materialize_timeout(),
            poll_interval: config.storage.materialize_poll(),
        }
    }
}

pub struct StorageBackend {
    layout: StorageLayout,
    keys: Arc<dyn KeyManager>,
    materializer: Arc<dyn Materializer>,
    previews: Arc<dyn PreviewRenderer>,
    options: StorageOptions,
    /// One index per key scope, opened lazily
    indexes: Mutex<HashMap<String, Arc<Mutex<MediaIndex>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

/// Failure transition out of `state`, for states the event does not apply to as well.
fn fail(state: &MaterializationState, reason: String) -> MaterializationState {
    state
        .on_event(&MaterializationEvent::Failed(reason.clone()))
        .unwrap_or(MaterializationState::MaterializationFailed { reason })
}

impl StorageBackend {
    /// Open the store, creating its directories and sweeping leftovers of
    /// interrupted writes.
    pub fn open(
        layout: StorageLayout,
        keys: Arc<dyn KeyManager>,
        materializer: Arc<dyn Materializer>,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        layout.ensure_dirs().map_err(|e| {
            StorageError::LocationUnavailable(format!("{}: {e}", layout.root.display()))
        })?;

        let mut swept = 0;
        for dir in [&layout.root, &layout.preview_dir, &layout.scratch_dir] {
            swept += sweep_partials(dir).map_err(|e| {
                StorageError::LocationUnavailable(format!("{}: {e}", dir.display()))
            })?;
        }
        if swept > 0 {
            info!(count = swept, "removed partial files from interrupted writes");
        }

        Ok(Self {
            layout,
            keys,
            materializer,
            previews: Arc::new(NoPreview),
            options,
            indexes: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_previews(mut self, renderer: Arc<dyn PreviewRenderer>) -> Self {
        self.previews = renderer;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn index_for(&self, key_id: &str) -> Result<Arc<Mutex<MediaIndex>>, StorageError> {
        if !is_scope_name(key_id) {
            return Err(StorageError::LocationUnavailable(format!(
                "key id '{key_id}' cannot name a storage scope"
            )));
        }
        let mut indexes = lock(&self.indexes);
        if let Some(index) = indexes.get(key_id) {
            return Ok(Arc::clone(index));
        }
        let path = self.layout.index_path(key_id);
        let index = MediaIndex::open(&path)
            .map_err(|e| StorageError::LocationUnavailable(format!("{e:#}")))?;
        let index = Arc::new(Mutex::new(index));
        indexes.insert(key_id.to_string(), Arc::clone(&index));
        Ok(index)
    }

    fn update_index<T>(
        &self,
        key_id: &str,
        f: impl FnOnce(&mut MediaIndex) -> T,
    ) -> Result<T, StorageError> {
        let index = self.index_for(key_id)?;
        let mut index = lock(&index);
        let out = f(&mut index);
        index.flush().map_err(StorageError::from_index)?;
        Ok(out)
    }

    /// Insert `record` and flush. On failure the in-memory index goes back to
    /// what it held before, including any record this one replaced.
    fn commit_record(&self, record: &EncryptedMedia) -> Result<(), StorageError> {
        let index = self.index_for(&record.key_id)?;
        let mut index = lock(&index);
        let prior = index.insert(record.clone());
        if let Err(e) = index.flush() {
            match prior {
                Some(prior) => index.insert(prior),
                None => index.remove(&record.index_key()),
            };
            return Err(StorageError::from_index(e));
        }
        Ok(())
    }

    /// Best-effort record of the last observed materialization state.
    fn persist_state(&self, media: &EncryptedMedia, state: &MaterializationState) {
        let key = media.index_key();
        if let Err(e) = self.update_index(&media.key_id, |index| {
            index.set_state(&key, state.clone());
        }) {
            warn!(media = %media.id, "failed to record materialization state: {e}");
        }
    }

    /// Encrypt and store `media` under `key`.
    pub async fn save(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
    ) -> Result<EncryptedMedia, StorageError> {
        self.save_with_progress(media, key, None).await
    }

    /// Like [`save`](Self::save), reporting fractional progress as chunks are sealed.
    ///
    /// A scratch cleartext file is deleted when the attempt ends, whether it
    /// succeeded or not. A failed save leaves the store as it was: no trace
    /// of a new item, or the previous blob and record of a replaced one.
    pub async fn save_with_progress(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
        progress: Option<SaveProgressFn>,
    ) -> Result<EncryptedMedia, StorageError> {
        let scratch = match &media.source {
            MediaSource::Scratch(path) => Some(path.clone()),
            MediaSource::Memory(_) => None,
        };

        let result = self.save_inner(media, key, progress).await;

        if let Some(path) = scratch {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "scratch cleartext removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to remove scratch cleartext: {e}"),
            }
        }
        result
    }

    async fn save_inner(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
        progress: Option<SaveProgressFn>,
    ) -> Result<EncryptedMedia, StorageError> {
        if !media.id.is_path_safe() {
            return Err(StorageError::InvalidMediaId(media.id.to_string()));
        }
        // Opening the index first rejects unusable key ids before any bytes are written.
        self.index_for(key.id())?;

        let CleartextMedia {
            id,
            media_type,
            source,
            captured_at,
            file_name,
        } = media;

        let location = StorageLayout::blob_location(key.id(), media_type, &id);
        let dest = self.layout.blob_path(&location);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::LocationUnavailable(format!("{}: {e}", parent.display()))
            })?;
        }

        let total = match &source {
            MediaSource::Memory(bytes) => bytes.len() as u64,
            MediaSource::Scratch(path) => tokio::fs::metadata(path)
                .await
                .map_err(|e| {
                    StorageError::NotFound(format!("cleartext {}: {e}", path.display()))
                })?
                .len(),
        };

        let job = SealJob {
            source,
            dest,
            preview_dest: (media_type != MediaType::LivePhotoComponent)
                .then(|| self.layout.preview_path(key.id(), &id)),
            media_type,
            key: key.clone(),
            format: self.options.format,
            total,
            progress,
            renderer: Arc::clone(&self.previews),
        };
        let sealed = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| StorageError::WriteFailed(format!("save task failed: {e}")))??;

        let record = EncryptedMedia {
            id,
            media_type,
            key_id: key.id().to_string(),
            location,
            state: MaterializationState::Resident,
            captured_at,
            file_name,
            ciphertext_len: sealed.len,
            stored_at: unix_now(),
        };

        if let Err(e) = self.commit_record(&record) {
            sealed.roll_back();
            return Err(e);
        }
        sealed.commit();

        info!(
            media = %record.id,
            media_type = %record.media_type,
            key = %record.key_id,
            bytes = record.ciphertext_len,
            "saved"
        );
        Ok(record)
    }

    /// Live materialization state of an item.
    pub fn status(&self, media: &EncryptedMedia) -> MaterializationState {
        if self.layout.blob_path(&media.location).exists() {
            return MaterializationState::Resident;
        }
        match self.materializer.status(&media.location) {
            RemoteStatus::Materializing(progress) => MaterializationState::Materializing { progress },
            RemoteStatus::Failed(reason) => MaterializationState::MaterializationFailed { reason },
            // Resident without a local file means the copy is not visible to us yet.
            RemoteStatus::Resident | RemoteStatus::RemoteOnly => MaterializationState::RemoteOnly,
        }
    }

    /// Small preview of an item; never waits on materialization.
    pub async fn load_preview(&self, media: &EncryptedMedia) -> Result<PreviewModel, StorageError> {
        let path = self.layout.preview_path(&media.key_id, &media.id);
        let sealed = match tokio::fs::read(&path).await {
            Ok(sealed) => Some(sealed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::Io(e)),
        };

        match sealed {
            Some(sealed) => {
                let key = self
                    .keys
                    .key(&media.key_id)
                    .ok_or_else(|| StorageError::KeyUnavailable(media.key_id.clone()))?;
                let bytes = decrypt_to_vec(&sealed, &key)?;
                Ok(PreviewModel::Ready(Preview {
                    media_type: media.media_type,
                    bytes,
                }))
            }
            None => match self.status(media) {
                MaterializationState::Resident => Ok(PreviewModel::Unavailable),
                pending => Ok(PreviewModel::Pending(pending)),
            },
        }
    }

    /// Decrypt an item into the scratch area, materializing it first if needed.
    ///
    /// The returned cleartext is a scratch file owned by the caller.
    pub async fn load_full(
        &self,
        media: &EncryptedMedia,
        progress: &LoadProgress,
    ) -> Result<CleartextMedia, StorageError> {
        self.load_full_with_cancel(media, progress, &CancellationToken::new())
            .await
    }

    pub async fn load_full_with_cancel(
        &self,
        media: &EncryptedMedia,
        progress: &LoadProgress,
        cancel: &CancellationToken,
    ) -> Result<CleartextMedia, StorageError> {
        let key = self
            .keys
            .key(&media.key_id)
            .ok_or_else(|| StorageError::KeyUnavailable(media.key_id.clone()))?;

        self.ensure_resident(media, progress, cancel).await?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let src = self.layout.blob_path(&media.location);
        let dest = self
            .layout
            .scratch_output(&media.id, media.file_name.as_deref());
        progress.report(LoadPhase::Decrypting { progress: 0.0 });

        let reporter = progress.clone();
        let out = dest.clone();
        let plaintext_bytes = tokio::task::spawn_blocking(move || {
            let report = |done: u64, total: u64| {
                reporter.report(LoadPhase::Decrypting {
                    progress: fraction(done, total),
                });
            };
            open_to_file(&src, &out, &key, &report)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("load task failed: {e}"))))??;

        progress.report(LoadPhase::Loaded);
        debug!(media = %media.id, bytes = plaintext_bytes, "loaded");

        let mut cleartext = CleartextMedia::from_scratch(media.id.clone(), media.media_type, dest);
        cleartext.captured_at = media.captured_at;
        cleartext.file_name = media.file_name.clone();
        Ok(cleartext)
    }

    /// Drive a non-resident item through materialization, bounded by the configured timeout.
    async fn ensure_resident(
        &self,
        media: &EncryptedMedia,
        progress: &LoadProgress,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let path = self.layout.blob_path(&media.location);
        let mut state = self.status(media);
        if state.is_resident() {
            return Ok(());
        }

        if let Err(reason) = self.materializer.trigger_fetch(&media.location) {
            self.persist_state(media, &MaterializationState::RemoteOnly);
            return Err(StorageError::CloudFileNotDownloaded(reason));
        }
        state = state
            .on_event(&MaterializationEvent::FetchTriggered)
            .unwrap_or(MaterializationState::Materializing { progress: 0.0 });
        self.persist_state(media, &state);
        progress.report(LoadPhase::Downloading { progress: 0.0 });
        info!(media = %media.id, location = %media.location, "materializing");

        let poll = self.options.poll_interval;
        let wait = async {
            loop {
                match self.materializer.status(&media.location) {
                    RemoteStatus::Resident if path.exists() => return Ok(()),
                    RemoteStatus::Materializing(p) => {
                        progress.report(LoadPhase::Downloading { progress: p });
                        if let Some(next) = state.on_event(&MaterializationEvent::Progress(p)) {
                            state = next;
                        }
                    }
                    RemoteStatus::Failed(reason) => {
                        return Err(StorageError::CloudDownloadFailed(reason))
                    }
                    RemoteStatus::Resident | RemoteStatus::RemoteOnly => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };

        let outcome = tokio::time::timeout(self.options.materialize_timeout, wait).await;
        match outcome {
            Ok(Ok(())) => {
                let done = state
                    .on_event(&MaterializationEvent::Succeeded)
                    .unwrap_or(MaterializationState::Resident);
                self.persist_state(media, &done);
                progress.report(LoadPhase::Downloading { progress: 1.0 });
                info!(media = %media.id, "materialized");
                Ok(())
            }
            Ok(Err(StorageError::CloudDownloadFailed(reason))) => {
                warn!(media = %media.id, "materialization failed: {reason}");
                self.persist_state(media, &fail(&state, reason.clone()));
                Err(StorageError::CloudDownloadFailed(reason))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let waited_secs = self.options.materialize_timeout.as_secs();
                warn!(media = %media.id, waited_secs, "materialization timed out");
                let reason = format!("timed out after {waited_secs}s");
                self.persist_state(media, &fail(&state, reason));
                Err(StorageError::CloudDownloadTimeout { waited_secs })
            }
        }
    }

    /// Remove an item's blob, record and preview, in that order.
    ///
    /// A blob that cannot be removed fails the call with the record intact,
    /// so the item stays listed and the delete can be retried.
    pub async fn delete(&self, media: &EncryptedMedia) -> Result<(), StorageError> {
        let key = media.index_key();
        let index = self.index_for(&media.key_id)?;
        let known = lock(&index).get(&key).is_some();

        let blob_removed = match tokio::fs::remove_file(self.layout.blob_path(&media.location)).await
        {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::Io(e)),
        };
        if !known && !blob_removed {
            return Err(StorageError::NotFound(media.id.to_string()));
        }

        {
            let mut index = lock(&index);
            if let Some(removed) = index.remove(&key) {
                if let Err(e) = index.flush() {
                    index.insert(removed);
                    return Err(StorageError::from_index(e));
                }
            }
        }

        if media.media_type != MediaType::LivePhotoComponent {
            let preview = self.layout.preview_path(&media.key_id, &media.id);
            match tokio::fs::remove_file(&preview).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %preview.display(), "failed to remove preview: {e}"),
            }
        }
        info!(media = %media.id, key = %media.key_id, "deleted");
        Ok(())
    }

    /// Every item stored under `key_id`, with live materialization state.
    ///
    /// Items whose bytes are remote-only are listed, not treated as errors.
    pub async fn enumerate(&self, key_id: &str) -> Result<Vec<EncryptedMedia>, StorageError> {
        let index = self.index_for(key_id)?;
        let mut records: Vec<EncryptedMedia> = lock(&index).records().cloned().collect();
        for record in &mut records {
            record.state = self.status(record);
        }
        records.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.media_type.dir_name().cmp(b.media_type.dir_name()))
        });
        Ok(records)
    }

    /// Look up one record without touching its bytes.
    pub fn record(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> Result<Option<EncryptedMedia>, StorageError> {
        let index = self.index_for(key_id)?;
        let record = lock(&index).get(&index_key(id, media_type)).cloned();
        Ok(record.map(|mut r| {
            r.state = self.status(&r);
            r
        }))
    }

    pub fn contains(&self, key_id: &str, id: &MediaId, media_type: MediaType) -> bool {
        matches!(self.record(key_id, id, media_type), Ok(Some(_)))
    }

    /// Register an item that exists only in the remote store (placed there by
    /// another device), so it is enumerated as remote-only.
    pub async fn adopt_remote(
        &self,
        key_id: &str,
        id: MediaId,
        media_type: MediaType,
        ciphertext_len: u64,
        captured_at: Option<u64>,
    ) -> Result<EncryptedMedia, StorageError> {
        if !id.is_path_safe() {
            return Err(StorageError::InvalidMediaId(id.to_string()));
        }
        let mut record = EncryptedMedia {
            location: StorageLayout::blob_location(key_id, media_type, &id),
            id,
            media_type,
            key_id: key_id.to_string(),
            state: MaterializationState::RemoteOnly,
            captured_at,
            file_name: None,
            ciphertext_len,
            stored_at: unix_now(),
        };
        record.state = self.status(&record);

        self.commit_record(&record)?;
        debug!(media = %record.id, key = %key_id, state = %record.state, "adopted remote item");
        Ok(record)
    }

    /// Delete everything stored under a key. Returns how many records were dropped.
    pub async fn delete_all_for_key(&self, key_id: &str) -> Result<usize, StorageError> {
        let index = self.index_for(key_id)?;
        let count = {
            let mut index = lock(&index);
            let count = index.len();
            index.discard();
            count
        };
        lock(&self.indexes).remove(key_id);

        for dir in [self.layout.scope_dir(key_id), self.layout.preview_scope(key_id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        info!(key = %key_id, count, "deleted all media for key");
        Ok(count)
    }
}

/// Everything a blocking save needs, moved onto the blocking pool.
struct SealJob {
    source: MediaSource,
    dest: PathBuf,
    preview_dest: Option<PathBuf>,
    media_type: MediaType,
    key: MediaKey,
    format: FormatVersion,
    total: u64,
    progress: Option<SaveProgressFn>,
    renderer: Arc<dyn PreviewRenderer>,
}

/// Blob and preview of one save, installed but not yet committed.
struct Sealed {
    len: u64,
    blob: Installed,
    preview: Option<Installed>,
}

impl Sealed {
    fn commit(self) {
        self.blob.commit();
        if let Some(preview) = self.preview {
            preview.commit();
        }
    }

    fn roll_back(self) {
        self.blob.roll_back();
        if let Some(preview) = self.preview {
            preview.roll_back();
        }
    }
}

impl SealJob {
    fn run(self) -> Result<Sealed, StorageError> {
        let total = self.total;
        let report = self
            .progress
            .as_ref()
            .map(|p| move |n: u64| p(fraction(n, total)));
        let on_bytes = report.as_ref().map(|f| f as &dyn Fn(u64));

        let (len, blob) = seal_to_file(&self.source, &self.dest, &self.key, self.format, on_bytes)?;

        let mut preview = None;
        if let Some(preview_dest) = &self.preview_dest {
            let rendered = match &self.source {
                MediaSource::Memory(bytes) => {
                    self.renderer.render(self.media_type, PreviewSource::Bytes(bytes))
                }
                MediaSource::Scratch(path) => {
                    self.renderer.render(self.media_type, PreviewSource::File(path))
                }
            };
            if let Some(bytes) = rendered {
                let source = MediaSource::Memory(bytes);
                if let Some(parent) = preview_dest.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match seal_to_file(&source, preview_dest, &self.key, self.format, None) {
                    Ok((_, installed)) => preview = Some(installed),
                    Err(e) => warn!(path = %preview_dest.display(), "failed to store preview: {e}"),
                }
            }
        }
        Ok(Sealed { len, blob, preview })
    }
}

/// A file renamed into place. Whatever it replaced is kept at a `.prev`
/// sibling until [`commit`](Self::commit) or [`roll_back`](Self::roll_back).
struct Installed {
    dest: PathBuf,
    backup: Option<PathBuf>,
}

impl Installed {
    fn commit(self) {
        if let Some(backup) = &self.backup {
            if let Err(e) = std::fs::remove_file(backup) {
                warn!(path = %backup.display(), "failed to remove replaced file: {e}");
            }
        }
    }

    fn roll_back(self) {
        let restored = match &self.backup {
            Some(backup) => std::fs::rename(backup, &self.dest),
            None => std::fs::remove_file(&self.dest),
        };
        if let Err(e) = restored {
            warn!(path = %self.dest.display(), "failed to roll back write: {e}");
        }
    }
}

/// Move `partial` to `dest`, setting aside any file already there.
fn install(partial: &Path, dest: &Path) -> Result<Installed, StorageError> {
    let backup = backup_path(dest);
    let backup = match std::fs::rename(dest, &backup) {
        Ok(()) => Some(backup),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            let _ = std::fs::remove_file(partial);
            return Err(StorageError::from_write(e, dest));
        }
    };
    if let Err(e) = std::fs::rename(partial, dest) {
        let _ = std::fs::remove_file(partial);
        if let Some(backup) = &backup {
            let _ = std::fs::rename(backup, dest);
        }
        return Err(StorageError::from_write(e, dest));
    }
    Ok(Installed {
        dest: dest.to_path_buf(),
        backup,
    })
}

/// Seal `source` into a `.partial` sibling of `dest`, then install it.
/// Nothing is left behind on failure.
fn seal_to_file(
    source: &MediaSource,
    dest: &Path,
    key: &MediaKey,
    format: FormatVersion,
    on_bytes: Option<&dyn Fn(u64)>,
) -> Result<(u64, Installed), StorageError> {
    let partial = partial_path(dest);
    let len = match seal_partial(source, &partial, key, format, on_bytes) {
        Ok(len) => len,
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
    };
    Ok((len, install(&partial, dest)?))
}

fn seal_partial(
    source: &MediaSource,
    partial: &Path,
    key: &MediaKey,
    format: FormatVersion,
    on_bytes: Option<&dyn Fn(u64)>,
) -> Result<u64, StorageError> {
    let file = File::create(partial).map_err(|e| StorageError::from_write(e, partial))?;
    let mut out = BufWriter::new(file);

    let sealed = match source {
        MediaSource::Memory(bytes) => encrypt_stream(&bytes[..], &mut out, key, format, on_bytes),
        MediaSource::Scratch(path) => {
            let input = File::open(path).map_err(|e| {
                StorageError::NotFound(format!("cleartext {}: {e}", path.display()))
            })?;
            encrypt_stream(BufReader::new(input), &mut out, key, format, on_bytes)
        }
    };
    sealed.map_err(StorageError::from_cipher_write)?;

    let file = out
        .into_inner()
        .map_err(|e| StorageError::from_write(e.into_error(), partial))?;
    file.sync_all()
        .map_err(|e| StorageError::from_write(e, partial))?;
    let len = file
        .metadata()
        .map_err(|e| StorageError::from_write(e, partial))?
        .len();
    Ok(len)
}

/// Decrypt `src` into `dest` via a `.partial` sibling, publishing only verified output.
///
/// `on_progress` receives plaintext bytes written and the plaintext total.
fn open_to_file(
    src: &Path,
    dest: &Path,
    key: &MediaKey,
    on_progress: &dyn Fn(u64, u64),
) -> Result<u64, StorageError> {
    let partial = partial_path(dest);
    match open_partial(src, &partial, key, on_progress) {
        Ok(bytes) => {
            std::fs::rename(&partial, dest).map_err(|e| StorageError::from_write(e, dest))?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn open_partial(
    src: &Path,
    partial: &Path,
    key: &MediaKey,
    on_progress: &dyn Fn(u64, u64),
) -> Result<u64, StorageError> {
    let input = File::open(src).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::CloudFileNotDownloaded(src.display().to_string())
        } else {
            StorageError::Io(e)
        }
    })?;
    let stream_len = input.metadata().map_err(StorageError::Io)?.len();
    let mut input = BufReader::new(input);

    // The header names the chunk size, which fixes how much of the stream is overhead.
    let head = input.fill_buf().map_err(StorageError::Io)?;
    let total = if head.len() >= HEADER_SIZE {
        FormatVersion::from_u8(head[4]).and_then(|v| plaintext_len(stream_len, v))
    } else {
        None
    }
    .unwrap_or(stream_len);

    if let Some(parent) = partial.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::from_write(e, parent))?;
    }
    let file = File::create(partial).map_err(|e| StorageError::from_write(e, partial))?;
    let mut out = BufWriter::new(file);
    let report: &dyn Fn(u64) = &|n| on_progress(n, total);
    let stats = decrypt_stream(input, &mut out, key, Some(report))?;
    out.flush()
        .map_err(|e| StorageError::from_write(e, partial))?;
    Ok(stats.plaintext_bytes)
}
