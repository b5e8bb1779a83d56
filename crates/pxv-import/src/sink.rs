//! Destination of imported media.

use std::future::Future;

use pxv_core::{CleartextMedia, EncryptedMedia, MediaId, MediaType};
use pxv_crypto::MediaKey;
use pxv_storage::{LoadProgress, SaveProgressFn, StorageBackend, StorageError};
use tracing::warn;

/// Where the engine saves items. [`StorageBackend`] is the real one; tests
/// wrap it to inject delays and failures.
pub trait MediaSink: Send + Sync + 'static {
    fn save(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
        progress: SaveProgressFn,
    ) -> impl Future<Output = Result<EncryptedMedia, StorageError>> + Send;

    /// Location of an already stored item, if any.
    fn stored_location(&self, key_id: &str, id: &MediaId, media_type: MediaType) -> Option<String>;

    /// Remove a stored item; used to undo half-saved live photos.
    fn discard(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> impl Future<Output = ()> + Send;

    /// Decrypt a stored item into scratch. The caller owns the cleartext.
    fn load_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> impl Future<Output = Result<CleartextMedia, StorageError>> + Send;

    /// Delete a stored item. An item that is already gone counts as removed.
    fn remove_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

impl MediaSink for StorageBackend {
    async fn save(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
        progress: SaveProgressFn,
    ) -> Result<EncryptedMedia, StorageError> {
        self.save_with_progress(media, key, Some(progress)).await
    }

    fn stored_location(&self, key_id: &str, id: &MediaId, media_type: MediaType) -> Option<String> {
        match self.record(key_id, id, media_type) {
            Ok(record) => record.map(|r| r.location),
            Err(e) => {
                warn!(media = %id, "index lookup failed: {e}");
                None
            }
        }
    }

    async fn discard(&self, key_id: &str, id: &MediaId, media_type: MediaType) {
        let record = match self.record(key_id, id, media_type) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(media = %id, "index lookup failed: {e}");
                return;
            }
        };
        if let Err(e) = self.delete(&record).await {
            warn!(media = %id, media_type = %media_type, "failed to discard partial item: {e}");
        }
    }

    async fn load_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> Result<CleartextMedia, StorageError> {
        let record = self.record(key_id, id, media_type)?.ok_or_else(|| {
            StorageError::NotFound(format!("{id} ({media_type}) under key '{key_id}'"))
        })?;
        self.load_full(&record, &LoadProgress::detached()).await
    }

    async fn remove_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> Result<(), StorageError> {
        match self.record(key_id, id, media_type)? {
            Some(record) => self.delete(&record).await,
            None => Ok(()),
        }
    }
}
