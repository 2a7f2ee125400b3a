use std::fmt;

use aes_gcm::aead::KeyInit;
use aes_gcm::{Aes256Gcm, Key};
use once_cell::sync::OnceCell;
use sha2::Sha256;

use crate::{DEFAULT_KDF_ITERATIONS, DEFAULT_SALT, DEFAULT_SECRET, KEY_LEN};

/// Shared-secret key material for sealing payloads.
///
/// The symmetric key is stretched from the secret with PBKDF2-HMAC-SHA256 the
/// first time it is needed and kept for as long as the context lives.
/// Concurrent first uses block on a single derivation.
#[derive(Clone)]
pub struct CryptoContext {
    secret: String,
    salt: Vec<u8>,
    iterations: u32,
    key: OnceCell<[u8; KEY_LEN]>,
}

impl CryptoContext {
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_params(secret, DEFAULT_SALT, DEFAULT_KDF_ITERATIONS)
    }

    pub fn with_params(secret: impl Into<String>, salt: &[u8], iterations: u32) -> Self {
        Self {
            secret: secret.into(),
            salt: salt.to_vec(),
            iterations: iterations.max(1),
            key: OnceCell::new(),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Runs the key derivation now instead of on the first seal/open.
    pub fn warm(&self) {
        let _ = self.key();
    }

    pub fn is_warm(&self) -> bool {
        self.key.get().is_some()
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key()))
    }

    fn key(&self) -> &[u8; KEY_LEN] {
        self.key.get_or_init(|| {
            tracing::debug!(
                target = "payload_codec",
                iterations = self.iterations,
                "deriving payload key"
            );
            let mut key = [0u8; KEY_LEN];
            pbkdf2::pbkdf2_hmac::<Sha256>(
                self.secret.as_bytes(),
                &self.salt,
                self.iterations,
                &mut key,
            );
            key
        })
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("iterations", &self.iterations)
            .field("warm", &self.is_warm())
            .finish_non_exhaustive()
    }
}
