//! Keychain manager.
//!
//! A keychain is a named BIP32 extended key. Its chain code is sealed under a
//! vault-wide key and its private key, when present, under a per-keychain
//! passphrase key. Unlocked material only lives in the [`Session`].

mod keychain;
mod manager;
mod session;

pub use keychain::Keychain;
pub(crate) use manager::{export_private, export_public, load, KeychainManager, KeychainRecord};
pub(crate) use session::Session;

use bitcoin::{bip32::Fingerprint, secp256k1::PublicKey};
use serde::{Deserialize, Serialize};

/// Read-only projection of a stored keychain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeychainInfo {
    pub id: u64,
    pub name: String,
    pub depth: u32,
    pub parent_fp: Fingerprint,
    pub child_num: u32,
    pub pubkey: PublicKey,
    #[serde(with = "hex")]
    pub hash: Vec<u8>,
    pub status: EncryptionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionStatus {
    /// The keychain holds private key material at all.
    pub is_private: bool,
    /// Private material is not available in memory.
    pub is_locked: bool,
    /// Private material is sealed under a caller passphrase rather than the
    /// default key.
    pub is_encrypted: bool,
}
