//! pxv-import: batch import of media into the encrypted store
//!
//! An [`ImportEngine`] turns each submitted batch into an [`ImportTask`] that
//! saves its items through a [`MediaSink`] (normally the storage backend),
//! publishes progress snapshots, and can be paused, resumed, or cancelled.
//! Tasks are persisted through a [`TaskStore`] before every state change, so
//! a restarted process finds interrupted tasks parked as paused.

pub mod engine;
pub mod error;
pub mod eta;
pub mod library;
pub mod sink;
pub mod store;
pub mod task;

pub use engine::{EngineOptions, ImportEngine};
pub use error::ImportError;
pub use eta::EtaEstimator;
pub use library::{
    collect_media, AssetFetcher, CollectConfig, FsLibrary, LibraryAsset, MediaLibrary,
};
pub use sink::MediaSink;
pub use store::{JsonTaskStore, MemoryTaskStore, TaskStore};
pub use task::{
    ImportItem, ImportProgress, ImportTask, ImportUnit, Provenance, ResourceOrigin,
    ResourceRecord, TaskId, TaskKind, TaskState, UnitStatus,
};
