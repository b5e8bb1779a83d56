//! pxv-storage: key-scoped encrypted media store
//!
//! Every item lives under the scope of the key that sealed it:
//! ```text
//! {root}/{key_id}/index.json
//! {root}/{key_id}/{photos|videos|live}/{media_id}.pxv
//! {preview_dir}/{key_id}/{media_id}.pxp
//! ```
//! The tree under `root` may be backed by a cloud store, so an item can be
//! known (indexed) without its bytes being present. Reads drive such items
//! through materialization before decrypting.

pub mod backend;
pub mod error;
pub mod index;
pub mod layout;
pub mod materialize;
pub mod preview;
pub mod progress;
pub mod remote;

pub use backend::{SaveProgressFn, StorageBackend, StorageOptions};
pub use error::StorageError;
pub use layout::StorageLayout;
pub use materialize::{LocalOnly, Materializer, OperatorMaterializer, RemoteStatus};
pub use preview::{NoPreview, Preview, PreviewModel, PreviewRenderer, PreviewSource};
pub use progress::LoadProgress;
pub use remote::{build_operator, check_health};
