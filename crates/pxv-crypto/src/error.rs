use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    /// The stream was sealed under a different key.
    #[error("the key does not match the key this media was encrypted with")]
    KeyMismatch,

    #[error("encrypted stream is corrupt: {0}")]
    CorruptStream(String),

    /// Input ended before a chunk carrying the final marker.
    #[error("encrypted stream is truncated: final chunk missing")]
    TruncatedStream,

    /// Caller handed the encryptor a chunk that breaks the framing rules.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("I/O error in cipher stream: {0}")]
    Io(#[from] std::io::Error),
}

impl CipherError {
    /// True for failures caused by the stream contents rather than I/O or misuse.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CipherError::KeyMismatch | CipherError::CorruptStream(_) | CipherError::TruncatedStream
        )
    }
}
