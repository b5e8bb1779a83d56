#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pxv_core::{CleartextMedia, EncryptedMedia, MediaId, MediaSource, MediaType};
use pxv_crypto::{FormatVersion, MediaKey, StaticKeyManager};
use pxv_import::{
    EngineOptions, ImportEngine, ImportError, ImportItem, ImportTask, LibraryAsset, MediaLibrary,
    MediaSink, MemoryTaskStore, TaskId, TaskStore,
};
use pxv_storage::{
    LoadProgress, LocalOnly, SaveProgressFn, StorageBackend, StorageError, StorageLayout,
    StorageOptions,
};
use tokio::sync::{watch, Notify, Semaphore};

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub storage: Arc<StorageBackend>,
    pub keys: Arc<StaticKeyManager>,
    pub key: MediaKey,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let key = MediaKey::generate("k1");
    let keys = Arc::new(StaticKeyManager::with_key(key.clone()));
    let layout = StorageLayout::under(dir.path());
    let storage = StorageBackend::open(
        layout.clone(),
        keys.clone(),
        Arc::new(LocalOnly::new(layout.root.clone())),
        StorageOptions {
            format: FormatVersion::V1,
            ..Default::default()
        },
    )
    .unwrap();
    Harness {
        dir,
        storage: Arc::new(storage),
        keys,
        key,
    }
}

impl Harness {
    pub fn scratch_dir(&self) -> PathBuf {
        self.storage.layout().scratch_dir.clone()
    }

    pub fn payload(id: &str) -> Vec<u8> {
        id.bytes().cycle().take(3000).collect()
    }

    /// A photo staged in scratch, named `{id}.jpg`.
    pub fn item(&self, id: &str) -> ImportItem {
        self.item_of(id, MediaType::Photo, &format!("{id}.jpg"))
    }

    pub fn item_of(&self, id: &str, media_type: MediaType, file_name: &str) -> ImportItem {
        let path = self.scratch_dir().join(format!("staged-{file_name}"));
        std::fs::write(&path, Self::payload(file_name)).unwrap();
        ImportItem::new(
            CleartextMedia::from_scratch(MediaId::new(id), media_type, path).with_file_name(file_name),
        )
    }

    pub fn items(&self, ids: &[&str]) -> Vec<ImportItem> {
        ids.iter().map(|id| self.item(id)).collect()
    }

    pub fn sink(&self) -> Arc<GatedSink> {
        Arc::new(GatedSink::new(self.storage.clone()))
    }

    pub fn engine(&self, sink: Arc<GatedSink>) -> ImportEngine<GatedSink> {
        self.engine_with(sink, Arc::new(MemoryTaskStore::new()), 1)
    }

    pub fn engine_with(
        &self,
        sink: Arc<GatedSink>,
        store: Arc<dyn TaskStore>,
        concurrency: usize,
    ) -> ImportEngine<GatedSink> {
        ImportEngine::open(
            sink,
            self.keys.clone(),
            store,
            EngineOptions::new(self.scratch_dir()).with_concurrency(concurrency),
        )
        .unwrap()
    }

    pub fn engine_with_library(
        &self,
        sink: Arc<GatedSink>,
        store: Arc<dyn TaskStore>,
        library: Arc<TestLibrary>,
    ) -> ImportEngine<GatedSink> {
        ImportEngine::open(
            sink,
            self.keys.clone(),
            store,
            EngineOptions::new(self.scratch_dir()).with_library(library),
        )
        .unwrap()
    }

    pub async fn stored(&self) -> Vec<EncryptedMedia> {
        self.stored_under(self.key.id()).await
    }

    pub async fn stored_under(&self, key_id: &str) -> Vec<EncryptedMedia> {
        self.storage.enumerate(key_id).await.unwrap()
    }

    pub async fn read_back(&self, record: &EncryptedMedia) -> Vec<u8> {
        let loaded = self
            .storage
            .load_full(record, &LoadProgress::detached())
            .await
            .unwrap();
        match loaded.source {
            MediaSource::Scratch(path) => std::fs::read(path).unwrap(),
            MediaSource::Memory(bytes) => bytes,
        }
    }
}

/// Storage sink that can hold one save open and inject failures by file name.
pub struct GatedSink {
    inner: Arc<StorageBackend>,
    gate_at: Mutex<Option<usize>>,
    pub entered: Notify,
    release: Semaphore,
    calls: AtomicUsize,
    fail_names: Mutex<HashSet<String>>,
    exhaust_names: Mutex<HashSet<String>>,
    keep_sources: AtomicBool,
}

impl GatedSink {
    pub fn new(inner: Arc<StorageBackend>) -> Self {
        Self {
            inner,
            gate_at: Mutex::new(None),
            entered: Notify::new(),
            release: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            fail_names: Mutex::new(HashSet::new()),
            exhaust_names: Mutex::new(HashSet::new()),
            keep_sources: AtomicBool::new(false),
        }
    }

    /// Block the `n`th save (0-based) until [`release`](Self::release).
    pub fn gate_at(self: &Arc<Self>, n: usize) -> Arc<Self> {
        *self.gate_at.lock().unwrap() = Some(n);
        self.clone()
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn fail(&self, file_name: &str) {
        self.fail_names.lock().unwrap().insert(file_name.to_string());
    }

    pub fn exhaust(&self, file_name: &str) {
        self.exhaust_names.lock().unwrap().insert(file_name.to_string());
    }

    /// Make every removal of a moved source fail.
    pub fn keep_sources(&self) {
        self.keep_sources.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaSink for GatedSink {
    async fn save(
        &self,
        media: CleartextMedia,
        key: &MediaKey,
        progress: SaveProgressFn,
    ) -> Result<EncryptedMedia, StorageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = *self.gate_at.lock().unwrap();
        if gate == Some(n) {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
        }

        let name = media.display_name();
        let injected = if self.exhaust_names.lock().unwrap().contains(&name) {
            Some(StorageError::StorageExhausted)
        } else if self.fail_names.lock().unwrap().contains(&name) {
            Some(StorageError::WriteFailed(format!("{name}: injected failure")))
        } else {
            None
        };
        if let Some(e) = injected {
            if let MediaSource::Scratch(path) = &media.source {
                let _ = std::fs::remove_file(path);
            }
            return Err(e);
        }
        self.inner.save_with_progress(media, key, Some(progress)).await
    }

    fn stored_location(&self, key_id: &str, id: &MediaId, media_type: MediaType) -> Option<String> {
        self.inner.stored_location(key_id, id, media_type)
    }

    async fn discard(&self, key_id: &str, id: &MediaId, media_type: MediaType) {
        self.inner.discard(key_id, id, media_type).await
    }

    async fn load_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> Result<CleartextMedia, StorageError> {
        self.inner.load_stored(key_id, id, media_type).await
    }

    async fn remove_stored(
        &self,
        key_id: &str,
        id: &MediaId,
        media_type: MediaType,
    ) -> Result<(), StorageError> {
        if self.keep_sources.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed(format!("{id}: injected removal failure")));
        }
        self.inner.remove_stored(key_id, id, media_type).await
    }
}

/// Library whose originals are generated on fetch; records what was fetched.
pub struct TestLibrary {
    scratch_dir: PathBuf,
    fetched: Mutex<Vec<String>>,
}

impl TestLibrary {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    /// Assets named `{id}.jpg`, one per id.
    pub fn assets(ids: &[&str]) -> Vec<LibraryAsset> {
        ids.iter()
            .map(|id| LibraryAsset {
                external_ref: format!("{id}.jpg"),
                media_id: MediaId::new(*id),
                media_type: MediaType::Photo,
            })
            .collect()
    }
}

impl MediaLibrary for TestLibrary {
    async fn fetch(&self, asset: &LibraryAsset) -> Result<ImportItem, ImportError> {
        self.fetched.lock().unwrap().push(asset.external_ref.clone());
        let path = self.scratch_dir.join(format!("fetched-{}", asset.external_ref));
        std::fs::write(&path, Harness::payload(&asset.external_ref))?;
        let media = CleartextMedia::from_scratch(asset.media_id.clone(), asset.media_type, path)
            .with_file_name(asset.external_ref.clone());
        Ok(ImportItem::new(media).with_side_resource(asset.external_ref.clone()))
    }

    async fn delete(&self, _external_ref: &str) -> Result<(), ImportError> {
        Ok(())
    }
}

/// Task store whose writes can be held back, to observe the engine mid-commit.
pub struct HeldStore {
    inner: MemoryTaskStore,
    pub hold: Mutex<()>,
    attempts: AtomicUsize,
}

impl HeldStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            hold: Mutex::new(()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TaskStore for HeldStore {
    fn load(&self) -> anyhow::Result<Vec<ImportTask>> {
        self.inner.load()
    }

    fn save(&self, tasks: &[ImportTask]) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _held = self.hold.lock().unwrap();
        self.inner.save(tasks)
    }
}

/// Wait (bounded) until the task snapshot satisfies `pred`.
pub async fn wait_until(
    rx: &mut watch::Receiver<ImportTask>,
    pred: impl FnMut(&ImportTask) -> bool,
) -> ImportTask {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("timed out waiting for task state")
        .expect("engine dropped the task")
        .clone()
}

pub async fn wait_terminal(engine: &ImportEngine<GatedSink>, id: TaskId) -> ImportTask {
    let mut rx = engine.subscribe(id).unwrap();
    wait_until(&mut rx, |t| t.is_terminal()).await
}
