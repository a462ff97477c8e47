//! Crypto primitives shared by the managers.
//!
//! Extended-key derivation itself is `bitcoin::bip32`; this module adds
//! content hashing and authenticated encryption of secret material at rest.

mod seal;

pub(crate) use seal::{Sealed, SealingKey};

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::PublicKey,
};
use zeroize::Zeroizing;

/// 32 bytes of secret material wiped on drop.
pub(crate) type SecretBytes = Zeroizing<[u8; 32]>;

/// Content identity of a keychain: SHA-256 of its compressed public key.
pub(crate) fn keychain_hash(pubkey: &PublicKey) -> [u8; 32] {
    sha256::Hash::hash(&pubkey.serialize()).to_byte_array()
}

pub(crate) fn secret_bytes(slice: &[u8]) -> Option<SecretBytes> {
    let array: [u8; 32] = slice.try_into().ok()?;
    Some(Zeroizing::new(array))
}
