use std::collections::BTreeMap;

use bitcoin::{Network, OutPoint, Script};
use serde::{Deserialize, Serialize};

use crate::{
    account::AccountRecord,
    constants::STORE_FORMAT_VERSION,
    crypto::{Sealed, SealingKey},
    error::{Error, Result},
    keychain::KeychainRecord,
    ledger::{SigningScriptRecord, TxOut},
    tx::Transaction,
};

const CHAIN_CODE_CHECK: &[u8] = b"coinvault chain codes";
const CHAIN_CODE_CHECK_AAD: &[u8] = b"chain-code-check";

/// Every entity of a vault, keyed by id.
///
/// Ids come from one monotonic counter shared by all tables and are never
/// reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRecords {
    version: u32,
    network: Network,
    next_id: u64,
    pub(crate) best_height: u32,
    chain_code_check: Sealed,
    pub(crate) keychains: BTreeMap<u64, KeychainRecord>,
    pub(crate) accounts: BTreeMap<u64, AccountRecord>,
    pub(crate) scripts: BTreeMap<u64, SigningScriptRecord>,
    pub(crate) txouts: BTreeMap<u64, TxOut>,
    pub(crate) txs: BTreeMap<u64, Transaction>,
}

impl VaultRecords {
    /// Empty records whose chain codes are sealed under the default key.
    pub(crate) fn new(network: Network) -> Result<Self> {
        Ok(Self {
            version: STORE_FORMAT_VERSION,
            network,
            next_id: 1,
            best_height: 0,
            chain_code_check: Sealed::seal(
                &SealingKey::default_key(),
                CHAIN_CODE_CHECK,
                CHAIN_CODE_CHECK_AAD,
            )?,
            keychains: BTreeMap::new(),
            accounts: BTreeMap::new(),
            scripts: BTreeMap::new(),
            txouts: BTreeMap::new(),
            txs: BTreeMap::new(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn best_height(&self) -> u32 {
        self.best_height
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn check_chain_code_key(&self, key: &SealingKey) -> Result<()> {
        let plain = self.chain_code_check.open(key, CHAIN_CODE_CHECK_AAD)?;
        if plain.as_slice() != CHAIN_CODE_CHECK {
            return Err(Error::IntegrityViolation(
                "chain code check value is corrupt".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn reseal_chain_code_check(&mut self, key: &SealingKey) -> Result<()> {
        self.chain_code_check = Sealed::seal(key, CHAIN_CODE_CHECK, CHAIN_CODE_CHECK_AAD)?;
        Ok(())
    }

    pub(crate) fn keychain_id(&self, name: &str) -> Result<u64> {
        self.keychains
            .values()
            .find(|k| k.name == name)
            .map(|k| k.id)
            .ok_or_else(|| Error::UnknownKeychain(name.to_string()))
    }

    pub(crate) fn keychain(&self, id: u64) -> Result<&KeychainRecord> {
        self.keychains
            .get(&id)
            .ok_or_else(|| dangling("keychain", id))
    }

    pub(crate) fn keychain_mut(&mut self, id: u64) -> Result<&mut KeychainRecord> {
        self.keychains
            .get_mut(&id)
            .ok_or_else(|| dangling("keychain", id))
    }

    pub(crate) fn keychain_by_hash(&self, hash: &[u8]) -> Option<&KeychainRecord> {
        self.keychains.values().find(|k| k.hash == hash)
    }

    pub(crate) fn account_id(&self, name: &str) -> Result<u64> {
        self.accounts
            .values()
            .find(|a| a.name == name)
            .map(|a| a.id)
            .ok_or_else(|| Error::UnknownAccount(name.to_string()))
    }

    pub(crate) fn account(&self, id: u64) -> Result<&AccountRecord> {
        self.accounts.get(&id).ok_or_else(|| dangling("account", id))
    }

    pub(crate) fn account_mut(&mut self, id: u64) -> Result<&mut AccountRecord> {
        self.accounts
            .get_mut(&id)
            .ok_or_else(|| dangling("account", id))
    }

    pub(crate) fn script(&self, id: u64) -> Result<&SigningScriptRecord> {
        self.scripts.get(&id).ok_or_else(|| dangling("script", id))
    }

    pub(crate) fn script_mut(&mut self, id: u64) -> Result<&mut SigningScriptRecord> {
        self.scripts
            .get_mut(&id)
            .ok_or_else(|| dangling("script", id))
    }

    pub(crate) fn script_by_pubkey(&self, script_pubkey: &Script) -> Option<&SigningScriptRecord> {
        self.scripts
            .values()
            .find(|s| s.script_pubkey.as_script() == script_pubkey)
    }

    pub(crate) fn txout(&self, id: u64) -> Result<&TxOut> {
        self.txouts.get(&id).ok_or(Error::UnknownOutput(id))
    }

    pub(crate) fn txout_mut(&mut self, id: u64) -> Result<&mut TxOut> {
        self.txouts.get_mut(&id).ok_or(Error::UnknownOutput(id))
    }

    pub(crate) fn txout_by_outpoint(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txouts
            .values()
            .find(|o| o.outpoint.as_ref() == Some(outpoint))
    }

    pub(crate) fn tx(&self, id: u64) -> Result<&Transaction> {
        self.txs.get(&id).ok_or(Error::UnknownTx(id))
    }

    pub(crate) fn tx_mut(&mut self, id: u64) -> Result<&mut Transaction> {
        self.txs.get_mut(&id).ok_or(Error::UnknownTx(id))
    }
}

fn dangling(table: &str, id: u64) -> Error {
    Error::IntegrityViolation(format!("dangling {table} reference {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut records = VaultRecords::new(Network::Regtest).unwrap();
        let a = records.allocate_id();
        let b = records.allocate_id();
        assert!(b > a);

        let restored: VaultRecords =
            serde_json::from_str(&serde_json::to_string(&records).unwrap()).unwrap();
        let mut restored = restored;
        assert!(restored.allocate_id() > b);
    }

    #[test]
    fn chain_code_check_follows_reseal() {
        let mut records = VaultRecords::new(Network::Regtest).unwrap();
        records.check_chain_code_key(&SealingKey::default_key()).unwrap();

        let key = SealingKey::from_passphrase(b"1234");
        records.reseal_chain_code_check(&key).unwrap();
        records.check_chain_code_key(&key).unwrap();
        assert!(matches!(
            records.check_chain_code_key(&SealingKey::default_key()),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn unknown_names_map_to_typed_errors() {
        let records = VaultRecords::new(Network::Regtest).unwrap();
        assert!(matches!(records.keychain_id("k"), Err(Error::UnknownKeychain(_))));
        assert!(matches!(records.account_id("a"), Err(Error::UnknownAccount(_))));
        assert!(matches!(records.txout(5), Err(Error::UnknownOutput(5))));
        assert!(matches!(records.tx(6), Err(Error::UnknownTx(6))));
        assert!(matches!(records.keychain(7), Err(Error::IntegrityViolation(_))));
    }
}
