//! Import task records: what the engine persists and publishes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use pxv_core::{CleartextMedia, MediaId, MediaType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// ```text
/// idle ──▶ running ──▶ completed | failed
///            │  ▲
///      pause │  │ resume
///            ▼  │
///           paused ──cancel──▶ cancelled ◀──cancel── running
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed { reason: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed { .. }
        )
    }

    /// Running or paused: work remains and the task counts toward aggregate progress.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Paused)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => f.write_str("idle"),
            TaskState::Running => f.write_str("running"),
            TaskState::Paused => f.write_str("paused"),
            TaskState::Completed => f.write_str("completed"),
            TaskState::Cancelled => f.write_str("cancelled"),
            TaskState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Where a batch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    PhotoLibrary,
    Files,
    ShareExtension,
    Camera,
    /// Items already in the store, moved to another key
    Store,
    Other(String),
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::PhotoLibrary => f.write_str("photo library"),
            Provenance::Files => f.write_str("files"),
            Provenance::ShareExtension => f.write_str("share extension"),
            Provenance::Camera => f.write_str("camera"),
            Provenance::Store => f.write_str("store"),
            Provenance::Other(tag) => f.write_str(tag),
        }
    }
}

/// Progress snapshot. Only the engine writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    /// Number of leading items that are finished (saved or failed)
    pub current_file_index: usize,
    pub total_files: usize,
    pub current_file_progress: f64,
    /// Never decreases; 1.0 exactly when the task completes
    pub overall_progress: f64,
    #[serde(skip)]
    pub estimated_time_remaining_secs: Option<f64>,
    pub current_file_name: Option<String>,
}

/// One input handed to [`submit`](crate::ImportEngine::submit).
#[derive(Debug)]
pub struct ImportItem {
    pub media: CleartextMedia,
    /// Reference to the original in an external library
    pub side_resource: Option<String>,
}

impl ImportItem {
    pub fn new(media: CleartextMedia) -> Self {
        Self {
            media,
            side_resource: None,
        }
    }

    pub fn with_side_resource(mut self, external_ref: impl Into<String>) -> Self {
        self.side_resource = Some(external_ref.into());
        self
    }
}

/// What a task does with each unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Encrypt new media into the store
    #[default]
    Import,
    /// Re-seal stored media under another key, then delete the source
    Move,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Import => f.pad("import"),
            TaskKind::Move => f.pad("move"),
        }
    }
}

/// Where a resource's cleartext comes from when its unit runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ResourceOrigin {
    /// Staged in the scratch area at submission
    Staged { scratch_path: PathBuf },
    /// An original in the media library, fetched only when the unit runs
    Library { external_ref: String },
    /// Already in the store, sealed under `key_id`
    Stored { key_id: String },
}

impl ResourceOrigin {
    pub fn scratch_path(&self) -> Option<&PathBuf> {
        match self {
            ResourceOrigin::Staged { scratch_path } => Some(scratch_path),
            _ => None,
        }
    }
}

/// One physical resource of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub media_type: MediaType,
    pub origin: ResourceOrigin,
    pub captured_at: Option<u64>,
    pub file_name: Option<String>,
    pub side_resource: Option<String>,
    /// Storage location once saved
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Saved,
    Failed { reason: String },
}

/// Resources sharing one MediaId (a still and its motion clip), saved all or nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportUnit {
    pub media_id: MediaId,
    pub resources: Vec<ResourceRecord>,
    pub status: UnitStatus,
}

impl ImportUnit {
    pub fn is_pending(&self) -> bool {
        self.status == UnitStatus::Pending
    }

    pub fn display_name(&self) -> String {
        self.resources
            .iter()
            .find_map(|r| r.file_name.clone())
            .unwrap_or_else(|| self.media_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub id: TaskId,
    /// Unix seconds
    pub created_at: u64,
    #[serde(default)]
    pub kind: TaskKind,
    pub provenance: Provenance,
    /// Key every item of the task is sealed under
    pub key_id: String,
    pub state: TaskState,
    pub progress: ImportProgress,
    /// In submission order
    pub units: Vec<ImportUnit>,
    #[serde(default)]
    pub side_resources_removed: bool,
}

impl ImportTask {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn saved_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Saved)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.status, UnitStatus::Failed { .. }))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.units.iter().filter(|u| u.is_pending()).count()
    }

    /// Number of leading units that are no longer pending.
    pub fn completed_prefix(&self) -> usize {
        self.units.iter().take_while(|u| !u.is_pending()).count()
    }

    /// Per-item failures, for surfacing to the user.
    pub fn failures(&self) -> impl Iterator<Item = (&MediaId, &str)> {
        self.units.iter().filter_map(|u| match &u.status {
            UnitStatus::Failed { reason } => Some((&u.media_id, reason.as_str())),
            _ => None,
        })
    }

    /// External references of successfully saved resources.
    pub fn saved_side_resources(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Saved)
            .flat_map(|u| u.resources.iter().filter_map(|r| r.side_resource.clone()))
            .collect()
    }
}
