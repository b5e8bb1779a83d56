use thiserror::Error;

pub type PxvResult<T> = Result<T, PxvError>;

#[derive(Debug, Error)]
pub enum PxvError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
