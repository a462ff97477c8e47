use bitcoin::hashes::{sha256, Hash, HashEngine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Symmetric key for sealing secret material.
///
/// Callers hand the vault passphrase-derived bytes of any length; they are
/// normalised to a 256-bit key with SHA-256. The empty input is the default
/// key used for material no passphrase was ever set on.
#[derive(Clone)]
pub(crate) struct SealingKey(Zeroizing<[u8; 32]>);

impl SealingKey {
    pub fn from_passphrase(passphrase_key: &[u8]) -> Self {
        let mut engine = sha256::HashEngine::default();
        engine.input(b"coinvault/seal");
        engine.input(passphrase_key);
        Self(Zeroizing::new(
            sha256::Hash::from_engine(engine).to_byte_array(),
        ))
    }

    pub fn default_key() -> Self {
        Self::from_passphrase(&[])
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SealingKey").field(&"[REDACTED]").finish()
    }
}

/// ChaCha20-Poly1305 ciphertext with its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Sealed {
    #[serde(with = "hex")]
    nonce: Vec<u8>,
    #[serde(with = "hex")]
    ciphertext: Vec<u8>,
}

impl Sealed {
    pub fn seal(key: &SealingKey, plaintext: &[u8], aad: &[u8]) -> Result<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = key
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::IntegrityViolation("encryption failed".to_string()))?;

        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypts and authenticates; a wrong key or foreign `aad` is reported
    /// as [`Error::InvalidPassphrase`].
    pub fn open(&self, key: &SealingKey, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if self.nonce.len() != NONCE_LEN {
            return Err(Error::IntegrityViolation(format!(
                "sealed nonce has {} bytes",
                self.nonce.len()
            )));
        }

        key.cipher()
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| Error::InvalidPassphrase)
    }
}
