use std::io;

use pxv_storage::StorageError;
use thiserror::Error;

use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import task {0} not found")]
    TaskNotFound(TaskId),

    #[error("import task {id} is {state}, not paused")]
    NotPaused { id: TaskId, state: String },

    #[error("import task {0} is still in progress")]
    NotTerminal(TaskId),

    #[error("cannot {action} import task {id}: it is {state}")]
    InvalidTransition {
        id: TaskId,
        state: String,
        action: &'static str,
    },

    #[error("originals of import task {0} were already removed")]
    SideResourcesRemoved(TaskId),

    #[error("encryption key '{0}' is no longer available")]
    KeyUnavailable(String),

    #[error("no encryption key is selected")]
    NoCurrentKey,

    #[error("media is already stored under key '{0}'")]
    AlreadyUnderKey(String),

    #[error("no media library is attached to the import engine")]
    NoLibrary,

    #[error("failed to record import state: {0}")]
    Persistence(String),

    #[error("media library error: {0}")]
    Library(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ImportError {
    pub(crate) fn persistence(e: anyhow::Error) -> Self {
        ImportError::Persistence(format!("{e:#}"))
    }
}
