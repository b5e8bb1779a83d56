//! pxv-crypto: at-rest encryption for pixvault media
//!
//! Media is encrypted as a stream of independently authenticated chunks so
//! that multi-gigabyte video never has to sit in memory:
//!
//! ```text
//! Media Key (256-bit, owned by the external key manager)
//!   ├── Key check   (HKDF, info="pxv key check v1", stored in every header)
//!   └── Stream key  (HKDF, salt=stream nonce, info="pxv stream v1")
//!       └── Chunk AEAD: XChaCha20-Poly1305 (nonce=stream_nonce||seq, AAD=header||seq||final)
//! ```

pub mod error;
pub mod keys;
pub mod stream;

pub use error::CipherError;
pub use keys::{KeyManager, MediaKey, StaticKeyManager};
pub use stream::{
    ciphertext_len, decrypt_stream, decrypt_to_vec, encrypt_stream, encrypt_to_vec,
    plaintext_len, FormatVersion, StreamDecryptor, StreamEncryptor, StreamStats,
};

/// Size of a media key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
