//! Media data model shared by the codec, storage, and import layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier of one logical media item.
///
/// Shared by the cleartext and encrypted forms of an item and by every
/// physical resource that belongs to it (a still and its motion clip).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for producers that have none of their own.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can be used verbatim as a file name component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    /// Motion component of a live photo; shares its MediaId with the still.
    LivePhotoComponent,
}

impl MediaType {
    /// Directory (under a key scope) holding items of this type
    pub fn dir_name(&self) -> &'static str {
        match self {
            MediaType::Photo => "photos",
            MediaType::Video => "videos",
            MediaType::LivePhotoComponent => "live",
        }
    }

    /// Classify a file extension. Unknown extensions are not media.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "heic" | "heif" | "gif" | "webp" | "tif" | "tiff"
            | "dng" => Some(MediaType::Photo),
            "mov" | "mp4" | "m4v" | "avi" | "mkv" | "3gp" => Some(MediaType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::LivePhotoComponent => "live_photo_component",
        })
    }
}

/// Where the cleartext bytes of a [`CleartextMedia`] live.
pub enum MediaSource {
    Memory(Vec<u8>),
    /// A file in the scratch area, removed once a save attempt finishes
    Scratch(PathBuf),
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            MediaSource::Scratch(path) => write!(f, "Scratch({})", path.display()),
        }
    }
}

/// Decrypted payload on its way into (or out of) the encrypted store.
#[derive(Debug)]
pub struct CleartextMedia {
    pub id: MediaId,
    pub media_type: MediaType,
    pub source: MediaSource,
    /// Unix seconds
    pub captured_at: Option<u64>,
    pub file_name: Option<String>,
}

impl CleartextMedia {
    pub fn from_bytes(id: MediaId, media_type: MediaType, bytes: Vec<u8>) -> Self {
        Self {
            id,
            media_type,
            source: MediaSource::Memory(bytes),
            captured_at: None,
            file_name: None,
        }
    }

    pub fn from_scratch(id: MediaId, media_type: MediaType, path: PathBuf) -> Self {
        Self {
            id,
            media_type,
            source: MediaSource::Scratch(path),
            captured_at: None,
            file_name: None,
        }
    }

    pub fn with_captured_at(mut self, captured_at: u64) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Name shown in progress reports: the original file name, else the id.
    pub fn display_name(&self) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Local presence of an encrypted item's bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MaterializationState {
    Resident,
    RemoteOnly,
    Materializing { progress: f64 },
    MaterializationFailed { reason: String },
}

/// Input to the materialization state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializationEvent {
    FetchTriggered,
    Progress(f64),
    Succeeded,
    Failed(String),
}

impl MaterializationState {
    pub fn is_resident(&self) -> bool {
        matches!(self, MaterializationState::Resident)
    }

    /// Apply an event. Returns `None` when the transition is not allowed.
    ///
    /// ```text
    /// remote_only ──fetch──▶ materializing ──ok──▶ resident
    ///                             │
    ///                             └──fail──▶ materialization_failed ──fetch──▶ materializing
    /// ```
    pub fn on_event(&self, event: &MaterializationEvent) -> Option<MaterializationState> {
        use MaterializationEvent as E;
        use MaterializationState as S;

        match (self, event) {
            (S::RemoteOnly | S::MaterializationFailed { .. }, E::FetchTriggered) => {
                Some(S::Materializing { progress: 0.0 })
            }
            (S::Materializing { progress }, E::FetchTriggered) => Some(S::Materializing {
                progress: *progress,
            }),
            (S::Materializing { progress }, E::Progress(p)) => Some(S::Materializing {
                progress: progress.max(p.clamp(0.0, 1.0)),
            }),
            (S::Materializing { .. }, E::Succeeded) => Some(S::Resident),
            (S::Materializing { .. }, E::Failed(reason)) => Some(S::MaterializationFailed {
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for MaterializationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializationState::Resident => f.write_str("resident"),
            MaterializationState::RemoteOnly => f.write_str("remote-only"),
            MaterializationState::Materializing { progress } => {
                write!(f, "materializing ({:.0}%)", progress * 100.0)
            }
            MaterializationState::MaterializationFailed { reason } => {
                write!(f, "materialization failed: {reason}")
            }
        }
    }
}

/// Handle to an encrypted item owned by the storage backend.
///
/// Holding one says nothing about whether the bytes are resident; check
/// `state` or let the backend drive materialization on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedMedia {
    pub id: MediaId,
    pub media_type: MediaType,
    pub key_id: String,
    /// Path relative to the storage root
    pub location: String,
    pub state: MaterializationState,
    /// Unix seconds
    pub captured_at: Option<u64>,
    pub file_name: Option<String>,
    pub ciphertext_len: u64,
    /// Unix seconds
    pub stored_at: u64,
}

impl EncryptedMedia {
    /// Key under which the record is kept in its scope's index
    pub fn index_key(&self) -> String {
        index_key(&self.id, self.media_type)
    }
}

pub fn index_key(id: &MediaId, media_type: MediaType) -> String {
    format!("{}/{}", media_type.dir_name(), id)
}

/// Phase of a full load, reported in this order and never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LoadPhase {
    NotLoaded,
    Downloading { progress: f64 },
    Decrypting { progress: f64 },
    Loaded,
}

impl LoadPhase {
    pub fn rank(&self) -> u8 {
        match self {
            LoadPhase::NotLoaded => 0,
            LoadPhase::Downloading { .. } => 1,
            LoadPhase::Decrypting { .. } => 2,
            LoadPhase::Loaded => 3,
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            LoadPhase::NotLoaded => 0.0,
            LoadPhase::Downloading { progress } | LoadPhase::Decrypting { progress } => *progress,
            LoadPhase::Loaded => 1.0,
        }
    }
}

/// Current time as Unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
