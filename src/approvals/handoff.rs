//! Ephemeral encrypted handoff buffers.
//!
//! Approval/auth handoffs briefly carry sensitive material between the
//! gate and a channel callback.  Each handoff gets its own AES-256-GCM
//! key; plaintext is wiped on consume, and keys and ciphertexts live only
//! in process memory until `cleanup` or shutdown drops them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("handoff not found or already consumed: {0}")]
    NotFound(String),

    #[error("handoff decryption failed")]
    Decrypt,

    #[error("handoff encryption failed")]
    Encrypt,
}

// ─── HandoffVault ────────────────────────────────────────────────────────────

struct SealedEntry {
    key: [u8; 32],
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

impl Drop for SealedEntry {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
        self.ciphertext.zeroize();
    }
}

/// In-memory vault of single-use encrypted payloads.
#[derive(Clone, Default)]
pub struct HandoffVault {
    entries: Arc<Mutex<HashMap<String, SealedEntry>>>,
}

impl HandoffVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt `plaintext` under a fresh per-handoff key and return the
    /// handoff id.  The caller's buffer is wiped before returning.
    pub fn seal(&self, mut plaintext: Vec<u8>) -> Result<String, HandoffError> {
        let mut key_bytes = [0u8; 32];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| HandoffError::Encrypt)?;
        plaintext.zeroize();

        let id = Uuid::new_v4().to_string();
        self.lock().insert(
            id.clone(),
            SealedEntry {
                key: key_bytes,
                nonce: nonce_bytes,
                ciphertext,
            },
        );
        Ok(id)
    }

    /// Decrypt and remove a handoff.  A second consume of the same id
    /// fails: entries are strictly single-use.
    pub fn consume(&self, id: &str) -> Result<Vec<u8>, HandoffError> {
        let entry = self
            .lock()
            .remove(id)
            .ok_or_else(|| HandoffError::NotFound(id.to_string()))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&entry.key));
        cipher
            .decrypt(Nonce::from_slice(&entry.nonce), entry.ciphertext.as_slice())
            .map_err(|_| HandoffError::Decrypt)
        // `entry` drops here, zeroizing key and ciphertext.
    }

    /// Drop all outstanding handoffs (shutdown path).
    pub fn cleanup(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SealedEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
