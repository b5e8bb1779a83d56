//! Media keys and the key manager interface.
//!
//! Key material is owned by an external key manager. This crate only reads
//! keys through [`KeyManager`]; it never persists or deletes them.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::Zeroize;

use crate::error::CipherError;
use crate::KEY_SIZE;

/// A named 256-bit media key. Zeroized on drop.
#[derive(Clone)]
pub struct MediaKey {
    id: String,
    bytes: [u8; KEY_SIZE],
}

impl MediaKey {
    pub fn new(id: impl Into<String>, bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            id: id.into(),
            bytes,
        }
    }

    /// Build a key from raw material of unchecked length.
    pub fn from_slice(id: impl Into<String>, bytes: &[u8]) -> Result<Self, CipherError> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CipherError::KeyDerivation(format!(
                "key material must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(id, bytes))
    }

    /// Random key, for tests and tooling that stand in for a key manager.
    pub fn generate(id: impl Into<String>) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(id, bytes)
    }

    /// Stable identifier; also names the storage scope of everything sealed under it.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MediaKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaKey")
            .field("id", &self.id)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Read-only view of the external key manager.
pub trait KeyManager: Send + Sync {
    /// The key new media should be sealed under, if one is active.
    fn current_key(&self) -> Option<MediaKey>;

    /// Look up a key by identifier.
    fn key(&self, id: &str) -> Option<MediaKey>;
}

/// In-memory key manager holding a fixed set of keys.
#[derive(Default)]
pub struct StaticKeyManager {
    keys: RwLock<HashMap<String, MediaKey>>,
    current: RwLock<Option<String>>,
}

impl StaticKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager whose current key is `key`.
    pub fn with_key(key: MediaKey) -> Self {
        let manager = Self::new();
        let id = key.id().to_string();
        manager.insert(key);
        manager.set_current(&id);
        manager
    }

    pub fn insert(&self, key: MediaKey) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(key.id().to_string(), key);
    }

    /// Select the current key. Returns false if no such key is held.
    pub fn set_current(&self, id: &str) -> bool {
        let known = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id);
        if known {
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        }
        known
    }

    /// Forget a key, as if it had been deleted from the underlying keystore.
    pub fn revoke(&self, id: &str) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(id) {
            *current = None;
        }
    }
}

impl KeyManager for StaticKeyManager {
    fn current_key(&self) -> Option<MediaKey> {
        let current = self
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        self.key(&current)
    }

    fn key(&self, id: &str) -> Option<MediaKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(
    ikm: &[u8; KEY_SIZE],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<[u8; KEY_SIZE], CipherError> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CipherError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
