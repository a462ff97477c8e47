use std::collections::HashMap;

use crate::{
    crypto::{SealingKey, SecretBytes},
    error::{Error, Result},
    store::VaultRecords,
};

/// Unlocked key material of an open vault.
///
/// Never persisted. Dropping the session (on close) wipes every key it holds.
#[derive(Clone, Default)]
pub(crate) struct Session {
    chain_code_key: Option<SealingKey>,
    private_keys: HashMap<u64, SecretBytes>,
}

impl Session {
    pub fn chain_code_key(&self) -> Result<&SealingKey> {
        self.chain_code_key.as_ref().ok_or(Error::ChainCodesLocked)
    }

    pub fn chain_codes_unlocked(&self) -> bool {
        self.chain_code_key.is_some()
    }

    pub fn unlock_chain_codes(&mut self, records: &VaultRecords, key: &[u8]) -> Result<()> {
        let key = SealingKey::from_passphrase(key);
        records.check_chain_code_key(&key)?;
        self.chain_code_key = Some(key);
        Ok(())
    }

    pub fn set_chain_code_key(&mut self, key: SealingKey) {
        self.chain_code_key = Some(key);
    }

    pub fn lock_chain_codes(&mut self) {
        self.chain_code_key = None;
    }

    pub fn private_key(&self, keychain_id: u64) -> Option<&SecretBytes> {
        self.private_keys.get(&keychain_id)
    }

    pub fn is_unlocked(&self, keychain_id: u64) -> bool {
        self.private_keys.contains_key(&keychain_id)
    }

    pub fn insert_private_key(&mut self, keychain_id: u64, secret: SecretBytes) {
        self.private_keys.insert(keychain_id, secret);
    }

    /// Returns whether the keychain was unlocked.
    pub fn remove_private_key(&mut self, keychain_id: u64) -> bool {
        self.private_keys.remove(&keychain_id).is_some()
    }

    /// Drops every private key; returns the ids that were unlocked.
    pub fn lock_all(&mut self) -> Vec<u64> {
        let mut locked: Vec<u64> = self.private_keys.drain().map(|(id, _)| id).collect();
        locked.sort_unstable();
        locked
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chain_codes_unlocked", &self.chain_codes_unlocked())
            .field("unlocked_keychains", &self.private_keys.len())
            .finish()
    }
}
