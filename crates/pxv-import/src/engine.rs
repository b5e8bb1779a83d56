//! Import task engine.
//!
//! Every task is owned by the engine. Callers read snapshots (or subscribe to
//! them) and request transitions; the engine alone mutates task records.
//! A mutation is a commit: apply it to a copy, persist the full task list,
//! then publish the copy. A commit whose write fails is not published.
//! Commits are serialized, and the list is written outside the task lock so
//! readers and progress updates never wait on the disk.
//!
//! Each running task has one runner. It claims pending units in submission
//! order, keeps up to `concurrency` units in flight, and checks for pause
//! and cancel requests before claiming the next unit. Units already in
//! flight always finish before the task parks.
//!
//! A unit's cleartext comes from scratch (staged at submission), from the
//! media library (fetched when the unit runs), or from the store itself
//! under another key (a move).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use pxv_core::config::MAX_CONCURRENT_SAVES;
use pxv_core::types::unix_now;
use pxv_core::{CleartextMedia, EncryptedMedia, MediaId, MediaSource};
use pxv_crypto::{KeyManager, MediaKey};
use pxv_storage::{SaveProgressFn, StorageError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ImportError;
use crate::eta::EtaEstimator;
use crate::library::{AssetFetcher, LibraryAsset, MediaLibrary};
use crate::sink::MediaSink;
use crate::store::TaskStore;
use crate::task::{
    ImportItem, ImportTask, ImportUnit, Provenance, ResourceOrigin, ResourceRecord, TaskId,
    TaskKind, TaskState, UnitStatus,
};

/// Overall progress of an unfinished task stays below this.
const RUNNING_PROGRESS_CAP: f64 = 0.999;

#[derive(Clone)]
pub struct EngineOptions {
    /// Simultaneous units per task
    pub concurrency: usize,
    /// Where in-memory inputs are spilled so they can be persisted
    pub scratch_dir: PathBuf,
    /// Library that library-backed units fetch from
    pub library: Option<Arc<dyn AssetFetcher>>,
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("concurrency", &self.concurrency)
            .field("scratch_dir", &self.scratch_dir)
            .field("library", &self.library.is_some())
            .finish()
    }
}

impl EngineOptions {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: 1,
            scratch_dir: scratch_dir.into(),
            library: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENT_SAVES);
        self
    }

    pub fn with_library<L: MediaLibrary + 'static>(mut self, library: Arc<L>) -> Self {
        self.library = Some(library);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

struct TaskEntry {
    snapshot: watch::Sender<ImportTask>,
    control: Control,
    runner_active: bool,
    /// Claimed units and their fractional progress
    inflight: HashMap<usize, f64>,
    eta: EtaEstimator,
}

impl TaskEntry {
    fn new(task: ImportTask) -> Self {
        let (snapshot, _) = watch::channel(task);
        Self {
            snapshot,
            control: Control::Run,
            runner_active: false,
            inflight: HashMap::new(),
            eta: EtaEstimator::new(),
        }
    }

    fn state(&self) -> TaskState {
        self.snapshot.borrow().state.clone()
    }

    /// Republish progress without persisting it.
    fn publish_progress(&mut self) {
        let TaskEntry {
            snapshot,
            inflight,
            eta,
            ..
        } = self;
        snapshot.send_modify(|task| refresh_progress(task, inflight, eta));
    }
}

type Tasks = HashMap<TaskId, TaskEntry>;

/// Proof that the caller holds the commit lock.
type CommitGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

enum Claim {
    Unit {
        index: usize,
        unit: ImportUnit,
        key_id: String,
    },
    Stop,
}

struct UnitOutcome {
    status: UnitStatus,
    locations: Vec<Option<String>>,
    /// Set when the failure makes further units pointless
    fatal: Option<String>,
}

struct Inner<S> {
    sink: Arc<S>,
    keys: Arc<dyn KeyManager>,
    store: Arc<dyn TaskStore>,
    options: EngineOptions,
    tasks: Mutex<Tasks>,
    commits: tokio::sync::Mutex<()>,
}

/// Handle to the engine; clones share the same tasks.
pub struct ImportEngine<S: MediaSink> {
    inner: Arc<Inner<S>>,
}

impl<S: MediaSink> Clone for ImportEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn refresh_progress(task: &mut ImportTask, inflight: &HashMap<usize, f64>, eta: &mut EtaEstimator) {
    let total = task.units.len();
    let finished = total - task.pending_count();
    let index = task.completed_prefix();
    let partial: f64 = inflight
        .iter()
        .filter(|(i, _)| task.units.get(**i).is_some_and(ImportUnit::is_pending))
        .map(|(_, p)| *p)
        .sum();

    let progress = &mut task.progress;
    progress.total_files = total;
    progress.current_file_index = index;

    if task.state == TaskState::Completed {
        progress.overall_progress = 1.0;
        progress.current_file_progress = 0.0;
        progress.current_file_name = None;
        progress.estimated_time_remaining_secs = None;
        return;
    }

    progress.current_file_progress = inflight.get(&index).copied().unwrap_or(0.0);
    progress.current_file_name = task.units.get(index).map(ImportUnit::display_name);
    let raw = if total == 0 {
        0.0
    } else {
        (finished as f64 + partial) / total as f64
    };
    progress.overall_progress = raw.min(RUNNING_PROGRESS_CAP).max(progress.overall_progress);
    progress.estimated_time_remaining_secs = if task.state == TaskState::Running {
        eta.observe(Instant::now(), progress.overall_progress)
    } else {
        None
    };
}

/// Where a runner with nothing in flight leaves its task. `None` keeps it running.
fn next_state(control: Control, task: &ImportTask, fatal: Option<String>) -> Option<TaskState> {
    if let Some(reason) = fatal {
        return Some(TaskState::Failed { reason });
    }
    let total = task.units.len();
    if task.pending_count() == 0 {
        return Some(if total > 0 && task.failed_count() == total {
            TaskState::Failed {
                reason: format!("all {total} items failed to import"),
            }
        } else {
            TaskState::Completed
        });
    }
    match control {
        Control::Run => None,
        Control::Pause => Some(TaskState::Paused),
        Control::Cancel => Some(TaskState::Cancelled),
    }
}

fn sorted_snapshots(tasks: &Tasks) -> Vec<ImportTask> {
    let mut all: Vec<ImportTask> = tasks.values().map(|e| e.snapshot.borrow().clone()).collect();
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    all
}

/// Delete staged cleartext of units that will never be attempted.
fn remove_pending_sources(task: &ImportTask) {
    let staged = task
        .units
        .iter()
        .filter(|u| u.is_pending())
        .flat_map(|u| u.resources.iter())
        .filter_map(|r| r.origin.scratch_path());
    for path in staged {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "failed to remove staged cleartext: {e}"),
        }
    }
}

/// Add a resource to the unit of its MediaId, opening the unit on first sight.
fn push_resource(units: &mut Vec<ImportUnit>, media_id: MediaId, record: ResourceRecord) {
    match units.iter_mut().find(|u| u.media_id == media_id) {
        Some(unit) => unit.resources.push(record),
        None => units.push(ImportUnit {
            media_id,
            resources: vec![record],
            status: UnitStatus::Pending,
        }),
    }
}

impl<S: MediaSink> ImportEngine<S> {
    /// Load persisted tasks. Any task that was running when the process
    /// stopped comes back paused; nothing resumes without being asked.
    pub fn open(
        sink: Arc<S>,
        keys: Arc<dyn KeyManager>,
        store: Arc<dyn TaskStore>,
        options: EngineOptions,
    ) -> Result<Self, ImportError> {
        let stored = store.load().map_err(ImportError::persistence)?;

        let mut tasks = Tasks::new();
        let mut recovered = 0;
        for mut task in stored {
            if matches!(task.state, TaskState::Running | TaskState::Idle) {
                info!(
                    task = %task.id,
                    pending = task.pending_count(),
                    "recovered interrupted task as paused"
                );
                task.state = TaskState::Paused;
                recovered += 1;
            }
            task.progress.estimated_time_remaining_secs = None;
            tasks.insert(task.id, TaskEntry::new(task));
        }

        if recovered > 0 {
            store
                .save(&sorted_snapshots(&tasks))
                .map_err(ImportError::persistence)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sink,
                keys,
                store,
                options,
                tasks: Mutex::new(tasks),
                commits: tokio::sync::Mutex::new(()),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the whole task list on the blocking pool.
    async fn persist(&self, tasks: Vec<ImportTask>) -> Result<(), ImportError> {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || store.save(&tasks))
            .await
            .map_err(|e| ImportError::Persistence(format!("task list write aborted: {e}")))?
            .map_err(ImportError::persistence)
    }

    /// Apply `f` to the task's entry and a copy of its record, persist the
    /// whole list, then publish the copy. A commit that leaves the record
    /// unchanged writes nothing.
    async fn commit<T>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskEntry, &mut ImportTask) -> Result<T, ImportError>,
    ) -> Result<T, ImportError> {
        let serial = self.inner.commits.lock().await;
        self.commit_serialized(&serial, id, f).await
    }

    async fn commit_serialized<T>(
        &self,
        _serial: &CommitGuard<'_>,
        id: TaskId,
        f: impl FnOnce(&mut TaskEntry, &mut ImportTask) -> Result<T, ImportError>,
    ) -> Result<T, ImportError> {
        let (task, all, out) = {
            let mut tasks = self.lock();
            let entry = tasks.get_mut(&id).ok_or(ImportError::TaskNotFound(id))?;
            let mut task = entry.snapshot.borrow().clone();
            let out = f(entry, &mut task)?;
            if task == *entry.snapshot.borrow() {
                return Ok(out);
            }
            refresh_progress(&mut task, &entry.inflight, &mut entry.eta);

            let mut all = sorted_snapshots(&tasks);
            if let Some(slot) = all.iter_mut().find(|t| t.id == id) {
                *slot = task.clone();
            }
            (task, all, out)
        };

        self.persist(all).await?;

        let mut tasks = self.lock();
        if let Some(entry) = tasks.get_mut(&id) {
            let mut task = task;
            // Ticks may have moved progress on while the list was written.
            let published = entry.snapshot.borrow().progress.overall_progress;
            task.progress.overall_progress = task.progress.overall_progress.max(published);
            refresh_progress(&mut task, &entry.inflight, &mut entry.eta);
            entry.snapshot.send_replace(task);
        }
        Ok(out)
    }

    /// Copy in-memory cleartext into scratch; scratch inputs are used in place.
    async fn stage(&self, media: &mut CleartextMedia) -> Result<(PathBuf, bool), ImportError> {
        let bytes = match &mut media.source {
            MediaSource::Scratch(path) => return Ok((path.clone(), false)),
            MediaSource::Memory(bytes) => std::mem::take(bytes),
        };
        let name = media
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| media.id.to_string());
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let path = self.inner.options.scratch_dir.join(format!("{}-{name}", &tag[..12]));

        tokio::fs::create_dir_all(&self.inner.options.scratch_dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        media.source = MediaSource::Scratch(path.clone());
        Ok((path, true))
    }

    /// Register a task, move it to running and start its runner.
    async fn start(
        &self,
        kind: TaskKind,
        provenance: Provenance,
        key_id: String,
        units: Vec<ImportUnit>,
    ) -> Result<TaskId, ImportError> {
        let id = TaskId::generate();
        let count = units.len();
        let task = ImportTask {
            id,
            created_at: unix_now(),
            kind,
            provenance: provenance.clone(),
            key_id: key_id.clone(),
            state: TaskState::Idle,
            progress: Default::default(),
            units,
            side_resources_removed: false,
        };

        let serial = self.inner.commits.lock().await;
        self.lock().insert(id, TaskEntry::new(task));
        let started = self
            .commit_serialized(&serial, id, |entry, task| {
                task.state = TaskState::Running;
                entry.runner_active = true;
                Ok(())
            })
            .await;
        if let Err(e) = started {
            self.lock().remove(&id);
            return Err(e);
        }
        drop(serial);

        info!(
            task = %id,
            kind = %kind,
            items = count,
            key = %key_id,
            provenance = %provenance,
            "task started"
        );
        tokio::spawn(self.clone().run(id));
        Ok(id)
    }

    /// Create a task for `items` and start it. Items sharing a MediaId are
    /// grouped into one unit; units are processed in submission order.
    pub async fn submit(
        &self,
        items: Vec<ImportItem>,
        provenance: Provenance,
    ) -> Result<TaskId, ImportError> {
        let key = self
            .inner
            .keys
            .current_key()
            .ok_or(ImportError::NoCurrentKey)?;

        let mut units: Vec<ImportUnit> = Vec::new();
        let mut spilled = Vec::new();
        let mut staged = Ok(());
        for item in items {
            let ImportItem {
                mut media,
                side_resource,
            } = item;
            let scratch_path = match self.stage(&mut media).await {
                Ok((path, was_spilled)) => {
                    if was_spilled {
                        spilled.push(path.clone());
                    }
                    path
                }
                Err(e) => {
                    staged = Err(e);
                    break;
                }
            };
            let record = ResourceRecord {
                media_type: media.media_type,
                origin: ResourceOrigin::Staged { scratch_path },
                captured_at: media.captured_at,
                file_name: media.file_name,
                side_resource,
                location: None,
            };
            push_resource(&mut units, media.id, record);
        }

        let started = match staged {
            Ok(()) => {
                self.start(TaskKind::Import, provenance, key.id().to_string(), units)
                    .await
            }
            Err(e) => Err(e),
        };
        if started.is_err() {
            for path in &spilled {
                let _ = std::fs::remove_file(path);
            }
        }
        started
    }

    /// Create a task whose units fetch their originals from the engine's
    /// library only when they run. Scratch then holds about one unit at a
    /// time, and assets behind a pause or cancel are never fetched.
    pub async fn submit_from_library(
        &self,
        assets: Vec<LibraryAsset>,
        provenance: Provenance,
    ) -> Result<TaskId, ImportError> {
        if self.inner.options.library.is_none() {
            return Err(ImportError::NoLibrary);
        }
        let key = self
            .inner
            .keys
            .current_key()
            .ok_or(ImportError::NoCurrentKey)?;

        let mut units: Vec<ImportUnit> = Vec::new();
        for asset in assets {
            let file_name = Path::new(&asset.external_ref)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            let record = ResourceRecord {
                media_type: asset.media_type,
                origin: ResourceOrigin::Library {
                    external_ref: asset.external_ref.clone(),
                },
                captured_at: None,
                file_name,
                side_resource: Some(asset.external_ref),
                location: None,
            };
            push_resource(&mut units, asset.media_id, record);
        }
        self.start(TaskKind::Import, provenance, key.id().to_string(), units)
            .await
    }

    /// Create a task that re-seals stored items under `target_key_id`.
    ///
    /// A unit's sources are deleted only once every one of its copies is
    /// stored, so a still and its motion clip move together.
    pub async fn submit_move(
        &self,
        records: Vec<EncryptedMedia>,
        target_key_id: &str,
    ) -> Result<TaskId, ImportError> {
        if self.inner.keys.key(target_key_id).is_none() {
            return Err(ImportError::KeyUnavailable(target_key_id.to_string()));
        }
        if records.iter().any(|r| r.key_id == target_key_id) {
            return Err(ImportError::AlreadyUnderKey(target_key_id.to_string()));
        }

        let mut units: Vec<ImportUnit> = Vec::new();
        for record in records {
            let resource = ResourceRecord {
                media_type: record.media_type,
                origin: ResourceOrigin::Stored {
                    key_id: record.key_id,
                },
                captured_at: record.captured_at,
                file_name: record.file_name,
                side_resource: None,
                location: None,
            };
            push_resource(&mut units, record.id, resource);
        }
        self.start(
            TaskKind::Move,
            Provenance::Store,
            target_key_id.to_string(),
            units,
        )
        .await
    }

    pub fn list_tasks(&self) -> Vec<ImportTask> {
        sorted_snapshots(&self.lock())
    }

    pub fn task(&self, id: TaskId) -> Option<ImportTask> {
        self.lock().get(&id).map(|e| e.snapshot.borrow().clone())
    }

    /// Follow a task's snapshots as the engine publishes them.
    pub fn subscribe(&self, id: TaskId) -> Option<watch::Receiver<ImportTask>> {
        self.lock().get(&id).map(|e| e.snapshot.subscribe())
    }

    /// Ask a running task to park once its in-flight units finish.
    pub async fn pause(&self, id: TaskId) -> Result<(), ImportError> {
        self.commit(id, |entry, task| match task.state.clone() {
            TaskState::Running => {
                if entry.control == Control::Run {
                    entry.control = Control::Pause;
                    info!(task = %id, "pause requested");
                }
                Ok(())
            }
            TaskState::Paused => Ok(()),
            TaskState::Idle => {
                task.state = TaskState::Paused;
                Ok(())
            }
            other => Err(ImportError::InvalidTransition {
                id,
                state: other.to_string(),
                action: "pause",
            }),
        })
        .await
    }

    /// Continue a paused task from its first unfinished unit.
    ///
    /// On a running task this is a no-op apart from withdrawing a pause
    /// request that has not taken effect yet.
    pub async fn resume(&self, id: TaskId) -> Result<(), ImportError> {
        let started = self
            .commit(id, |entry, task| match task.state.clone() {
                TaskState::Running => {
                    if entry.control == Control::Pause {
                        entry.control = Control::Run;
                        debug!(task = %id, "pending pause withdrawn");
                    }
                    Ok(false)
                }
                TaskState::Paused => {
                    entry.control = Control::Run;
                    entry.eta.reset();
                    entry.runner_active = true;
                    task.state = TaskState::Running;
                    Ok(true)
                }
                other => Err(ImportError::NotPaused {
                    id,
                    state: other.to_string(),
                }),
            })
            .await;

        match started {
            Ok(true) => {
                info!(task = %id, "task resumed");
                tokio::spawn(self.clone().run(id));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                if let Some(entry) = self.lock().get_mut(&id) {
                    if entry.state() == TaskState::Paused {
                        entry.runner_active = false;
                    }
                }
                Err(e)
            }
        }
    }

    /// Stop a task. Units already stored stay stored.
    pub async fn cancel(&self, id: TaskId) -> Result<(), ImportError> {
        let cancelled = self
            .commit(id, |entry, task| match task.state.clone() {
                TaskState::Running if entry.runner_active => {
                    entry.control = Control::Cancel;
                    info!(task = %id, "cancel requested");
                    Ok(None)
                }
                TaskState::Running | TaskState::Paused | TaskState::Idle => {
                    task.state = TaskState::Cancelled;
                    Ok(Some(task.clone()))
                }
                other => Err(ImportError::InvalidTransition {
                    id,
                    state: other.to_string(),
                    action: "cancel",
                }),
            })
            .await?;

        if let Some(task) = cancelled {
            info!(task = %id, "task cancelled");
            remove_pending_sources(&task);
        }
        Ok(())
    }

    /// Forget a finished task.
    pub async fn remove_task(&self, id: TaskId) -> Result<(), ImportError> {
        let _serial = self.inner.commits.lock().await;
        let remaining: Vec<ImportTask> = {
            let tasks = self.lock();
            let entry = tasks.get(&id).ok_or(ImportError::TaskNotFound(id))?;
            if !entry.state().is_terminal() {
                return Err(ImportError::NotTerminal(id));
            }
            sorted_snapshots(&tasks)
                .into_iter()
                .filter(|t| t.id != id)
                .collect()
        };
        self.persist(remaining).await?;
        self.lock().remove(&id);
        debug!(task = %id, "task removed");
        Ok(())
    }

    /// Forget every finished task. Returns how many were removed.
    pub async fn clear_finished(&self) -> Result<usize, ImportError> {
        let _serial = self.inner.commits.lock().await;
        let (finished, remaining): (Vec<ImportTask>, Vec<ImportTask>) =
            sorted_snapshots(&self.lock())
                .into_iter()
                .partition(ImportTask::is_terminal);
        if finished.is_empty() {
            return Ok(0);
        }
        self.persist(remaining).await?;
        {
            let mut tasks = self.lock();
            for task in &finished {
                tasks.remove(&task.id);
            }
        }
        info!(count = finished.len(), "finished tasks cleared");
        Ok(finished.len())
    }

    /// Mean overall progress of running and paused tasks.
    pub fn aggregate_progress(&self) -> Option<f64> {
        let tasks = self.lock();
        let active: Vec<f64> = tasks
            .values()
            .map(|e| e.snapshot.borrow())
            .filter(|t| t.state.is_active())
            .map(|t| t.progress.overall_progress)
            .collect();
        if active.is_empty() {
            None
        } else {
            Some(active.iter().sum::<f64>() / active.len() as f64)
        }
    }

    /// Delete the library originals of a finished task's saved items.
    ///
    /// Only for completed or cancelled tasks, and only once. Originals of
    /// items that failed to import are never touched.
    pub async fn remove_side_resources<L: MediaLibrary>(
        &self,
        id: TaskId,
        library: &L,
    ) -> Result<usize, ImportError> {
        let task = self.task(id).ok_or(ImportError::TaskNotFound(id))?;
        if !matches!(task.state, TaskState::Completed | TaskState::Cancelled) {
            return Err(ImportError::InvalidTransition {
                id,
                state: task.state.to_string(),
                action: "remove originals of",
            });
        }
        if task.side_resources_removed {
            return Err(ImportError::SideResourcesRemoved(id));
        }

        let refs = task.saved_side_resources();
        let mut failures = Vec::new();
        for external_ref in &refs {
            if let Err(e) = library.delete(external_ref).await {
                warn!(task = %id, external_ref = %external_ref, "failed to remove original: {e}");
                failures.push(e.to_string());
            }
        }
        if !failures.is_empty() {
            return Err(ImportError::Library(format!(
                "{} of {} originals could not be removed: {}",
                failures.len(),
                refs.len(),
                failures.join("; ")
            )));
        }

        self.commit(id, |_, t| {
            t.side_resources_removed = true;
            Ok(())
        })
        .await?;
        info!(task = %id, count = refs.len(), "originals removed");
        Ok(refs.len())
    }

    async fn run(self, id: TaskId) {
        let concurrency = self.inner.options.concurrency.max(1);
        let mut inflight: JoinSet<(usize, UnitOutcome)> = JoinSet::new();
        let mut fatal: Option<String> = None;

        loop {
            while fatal.is_none() && inflight.len() < concurrency {
                let Claim::Unit {
                    index,
                    unit,
                    key_id,
                } = self.claim_next(id)
                else {
                    break;
                };
                let Some(key) = self.inner.keys.key(&key_id) else {
                    fatal = Some(ImportError::KeyUnavailable(key_id).to_string());
                    break;
                };
                let job = UnitJob {
                    sink: Arc::clone(&self.inner.sink),
                    library: self.inner.options.library.clone(),
                    key,
                    unit,
                    progress: self.unit_progress(id, index),
                };
                inflight.spawn(async move { (index, job.run().await) });
            }

            if inflight.is_empty() {
                if self.settle(id, fatal.take()).await {
                    return;
                }
                continue;
            }

            match inflight.join_next().await {
                Some(Ok((index, outcome))) => {
                    if let Err(reason) = self.record_unit(id, index, outcome).await {
                        fatal.get_or_insert(reason);
                    }
                }
                Some(Err(e)) => {
                    error!(task = %id, "unit task aborted: {e}");
                    fatal.get_or_insert(format!("internal error: {e}"));
                }
                None => {}
            }
        }
    }

    fn claim_next(&self, id: TaskId) -> Claim {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return Claim::Stop;
        };
        if entry.control != Control::Run {
            return Claim::Stop;
        }

        let claimed = {
            let task = entry.snapshot.borrow();
            (0..task.units.len())
                .find(|i| task.units[*i].is_pending() && !entry.inflight.contains_key(i))
                .map(|i| (i, task.units[i].clone(), task.key_id.clone()))
        };
        let Some((index, unit, key_id)) = claimed else {
            return Claim::Stop;
        };
        entry.inflight.insert(index, 0.0);
        entry.publish_progress();
        debug!(task = %id, index, media = %unit.media_id, "unit claimed");
        Claim::Unit {
            index,
            unit,
            key_id,
        }
    }

    fn unit_progress(&self, id: TaskId, index: usize) -> SaveProgressFn {
        let engine = self.clone();
        Arc::new(move |fraction: f64| engine.tick(id, index, fraction))
    }

    fn tick(&self, id: TaskId, index: usize, fraction: f64) {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        let Some(current) = entry.inflight.get_mut(&index) else {
            return;
        };
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > *current {
            *current = fraction;
            entry.publish_progress();
        }
    }

    /// Commit a finished unit. `Err` carries a reason to fail the task with.
    async fn record_unit(
        &self,
        id: TaskId,
        index: usize,
        outcome: UnitOutcome,
    ) -> Result<(), String> {
        let UnitOutcome {
            status,
            locations,
            fatal,
        } = outcome;
        let committed = self
            .commit(id, move |entry, task| {
                entry.inflight.remove(&index);
                if let Some(unit) = task.units.get_mut(index) {
                    for (resource, location) in unit.resources.iter_mut().zip(locations) {
                        resource.location = location;
                    }
                    unit.status = status;
                }
                Ok(())
            })
            .await;
        match (committed, fatal) {
            (Err(ImportError::TaskNotFound(_)), _) => Ok(()),
            (Err(e), _) => {
                error!(task = %id, "failed to record unit result: {e}");
                Err(e.to_string())
            }
            (Ok(()), Some(reason)) => Err(reason),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Called with nothing in flight. Returns true when the runner should exit.
    async fn settle(&self, id: TaskId, fatal: Option<String>) -> bool {
        let mut planned = None;
        let committed = self
            .commit(id, |entry, task| {
                entry.inflight.clear();
                if let Some(next) = next_state(entry.control, task, fatal) {
                    entry.runner_active = false;
                    entry.control = Control::Run;
                    task.state = next.clone();
                    planned = Some(next);
                }
                Ok(())
            })
            .await;
        let Some(next) = planned else {
            return committed.is_err();
        };

        if let Err(e) = committed {
            error!(task = %id, "failed to record task state {next}: {e}");
            if let Some(entry) = self.lock().get(&id) {
                entry.snapshot.send_if_modified(|t| {
                    let running = t.state == TaskState::Running;
                    if running {
                        t.state = next.clone();
                    }
                    running
                });
            }
        }

        if let Some(task) = self.task(id) {
            match &task.state {
                TaskState::Failed { reason } => {
                    warn!(task = %id, saved = task.saved_count(), "task failed: {reason}");
                }
                state => info!(
                    task = %id,
                    kind = %task.kind,
                    saved = task.saved_count(),
                    failed = task.failed_count(),
                    "task {state}"
                ),
            }
            if matches!(task.state, TaskState::Cancelled | TaskState::Failed { .. }) {
                remove_pending_sources(&task);
            }
        }
        true
    }
}

/// Failures after which no later unit of the task can succeed.
fn is_fatal(e: &ImportError) -> bool {
    match e {
        ImportError::Storage(e) => e.is_unrecoverable(),
        ImportError::NoLibrary => true,
        _ => false,
    }
}

/// One unit's work, detached from the engine while it runs.
struct UnitJob<S> {
    sink: Arc<S>,
    library: Option<Arc<dyn AssetFetcher>>,
    /// Key the unit is stored under
    key: MediaKey,
    unit: ImportUnit,
    progress: SaveProgressFn,
}

impl<S: MediaSink> UnitJob<S> {
    /// Store every resource of the unit, undoing the stored ones if any
    /// fails. Moved units delete their sources once every copy is stored.
    async fn run(self) -> UnitOutcome {
        let unit = &self.unit;
        let count = unit.resources.len().max(1) as f64;
        let mut locations: Vec<Option<String>> = vec![None; unit.resources.len()];

        for (i, resource) in unit.resources.iter().enumerate() {
            let report = Arc::clone(&self.progress);
            let base = i as f64;
            let scaled: SaveProgressFn = Arc::new(move |f: f64| report((base + f) / count));

            match self.store(resource, scaled).await {
                Ok(location) => {
                    locations[i] = Some(location);
                    (self.progress)((i + 1) as f64 / count);
                }
                Err(e) => {
                    warn!(media = %unit.media_id, "unit {} failed: {e}", unit.display_name());
                    for (j, other) in unit.resources.iter().enumerate() {
                        if locations[j].take().is_some() {
                            self.sink
                                .discard(self.key.id(), &unit.media_id, other.media_type)
                                .await;
                        } else if j > i {
                            if let Some(path) = other.origin.scratch_path() {
                                let _ = tokio::fs::remove_file(path).await;
                            }
                        }
                    }
                    return UnitOutcome {
                        status: UnitStatus::Failed {
                            reason: e.to_string(),
                        },
                        locations,
                        fatal: is_fatal(&e).then(|| e.to_string()),
                    };
                }
            }
        }

        let mut leftovers = Vec::new();
        for resource in &unit.resources {
            let ResourceOrigin::Stored { key_id } = &resource.origin else {
                continue;
            };
            if let Err(e) = self
                .sink
                .remove_stored(key_id, &unit.media_id, resource.media_type)
                .await
            {
                warn!(media = %unit.media_id, key = %key_id, "failed to remove moved source: {e}");
                leftovers.push(format!("{}: {e}", resource.media_type));
            }
        }
        if !leftovers.is_empty() {
            return UnitOutcome {
                status: UnitStatus::Failed {
                    reason: format!(
                        "copied, but the source could not be removed ({})",
                        leftovers.join("; ")
                    ),
                },
                locations,
                fatal: None,
            };
        }

        UnitOutcome {
            status: UnitStatus::Saved,
            locations,
            fatal: None,
        }
    }

    /// Store one resource under the unit key and return its location. A
    /// resource a previous run already stored is not stored again.
    async fn store(
        &self,
        resource: &ResourceRecord,
        progress: SaveProgressFn,
    ) -> Result<String, ImportError> {
        let unit = &self.unit;
        let already = || {
            let location =
                self.sink
                    .stored_location(self.key.id(), &unit.media_id, resource.media_type);
            if location.is_some() {
                debug!(media = %unit.media_id, "already stored, not storing again");
            }
            location
        };

        let media = match &resource.origin {
            ResourceOrigin::Staged { scratch_path } => {
                if scratch_path.exists() {
                    let mut media = CleartextMedia::from_scratch(
                        unit.media_id.clone(),
                        resource.media_type,
                        scratch_path.clone(),
                    );
                    media.captured_at = resource.captured_at;
                    media.file_name = resource.file_name.clone();
                    media
                } else if let Some(location) = already() {
                    return Ok(location);
                } else {
                    return Err(StorageError::NotFound(format!(
                        "cleartext for {} is gone",
                        unit.display_name()
                    ))
                    .into());
                }
            }
            ResourceOrigin::Library { external_ref } => {
                if let Some(location) = already() {
                    return Ok(location);
                }
                let library = self.library.as_ref().ok_or(ImportError::NoLibrary)?;
                let asset = LibraryAsset {
                    external_ref: external_ref.clone(),
                    media_id: unit.media_id.clone(),
                    media_type: resource.media_type,
                };
                library.fetch_asset(&asset).await?.media
            }
            ResourceOrigin::Stored { key_id } => {
                if let Some(location) = already() {
                    return Ok(location);
                }
                self.sink
                    .load_stored(key_id, &unit.media_id, resource.media_type)
                    .await?
            }
        };

        let saved = self.sink.save(media, &self.key, progress).await?;
        Ok(saved.location)
    }
}
