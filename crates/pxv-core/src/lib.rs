pub mod config;
pub mod error;
pub mod types;

pub use error::{PxvError, PxvResult};
pub use types::{
    CleartextMedia, EncryptedMedia, LoadPhase, MaterializationEvent, MaterializationState,
    MediaId, MediaSource, MediaType,
};
