//! Account manager.
//!
//! An account is an m-of-n policy over an ordered list of keychains. Its
//! address space is split into bins; every bin derives along
//! `keychain / bin index / script index` and keeps a pool of pre-derived
//! unused scripts.

mod manager;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub(crate) use manager::{AccountManager, DerivedScript};

use crate::{
    error::{Error, Result},
    store::VaultRecords,
};

/// How bin and script children are derived from the account keychains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationMode {
    /// Needs every keychain unlocked to extend the pool.
    #[default]
    Hardened,
    /// Derivable from public keys and chain codes alone (watch-only).
    Normal,
}

impl DerivationMode {
    pub fn is_hardened(self) -> bool {
        self == DerivationMode::Hardened
    }
}

/// Optional settings for a new account. Unset fields fall back to the vault
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountOptions {
    pub derivation: Option<DerivationMode>,
    pub unused_pool_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AccountRecord {
    pub id: u64,
    pub name: String,
    pub minsigs: u32,
    /// Order fixes the key order of every redeem script.
    pub keychain_ids: Vec<u64>,
    pub derivation: DerivationMode,
    pub unused_pool_size: u32,
    pub time_created: u64,
    pub bins: Vec<BinRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BinRecord {
    pub id: u64,
    pub name: String,
    pub index: u32,
    /// Next script index to derive. Only ever grows.
    pub next_script_index: u32,
    /// Derived, never issued scripts, oldest first.
    pub unused: VecDeque<u64>,
}

impl AccountRecord {
    pub fn bin(&self, id: u64) -> Result<&BinRecord> {
        self.bins.iter().find(|b| b.id == id).ok_or_else(|| {
            Error::IntegrityViolation(format!("account {:?} has no bin {id}", self.name))
        })
    }

    pub fn bin_mut(&mut self, id: u64) -> Result<&mut BinRecord> {
        let name = self.name.clone();
        self.bins
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| Error::IntegrityViolation(format!("account {name:?} has no bin {id}")))
    }

    pub fn bin_by_name(&self, name: &str) -> Result<&BinRecord> {
        self.bins
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::UnknownBin {
                account: self.name.clone(),
                bin: name.to_string(),
            })
    }

    pub fn info(&self, records: &VaultRecords) -> Result<AccountInfo> {
        let keychain_names = self
            .keychain_ids
            .iter()
            .map(|id| Ok(records.keychain(*id)?.name.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(AccountInfo {
            id: self.id,
            name: self.name.clone(),
            minsigs: self.minsigs,
            keychain_names,
            bin_names: self.bins.iter().map(|b| b.name.clone()).collect(),
            unused_pool_size: self.unused_pool_size,
            time_created: self.time_created,
            derivation: self.derivation,
        })
    }
}

impl BinRecord {
    pub fn info(&self, account_id: u64) -> BinInfo {
        BinInfo {
            id: self.id,
            account_id,
            name: self.name.clone(),
            index: self.index,
            next_script_index: self.next_script_index,
            unused_scripts: self.unused.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: u64,
    pub name: String,
    pub minsigs: u32,
    pub keychain_names: Vec<String>,
    pub bin_names: Vec<String>,
    pub unused_pool_size: u32,
    /// Seconds since the Unix epoch.
    pub time_created: u64,
    pub derivation: DerivationMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinInfo {
    pub id: u64,
    pub account_id: u64,
    pub name: String,
    pub index: u32,
    pub next_script_index: u32,
    pub unused_scripts: usize,
}

pub(crate) fn account_info(records: &VaultRecords, name: &str) -> Result<AccountInfo> {
    records.account(records.account_id(name)?)?.info(records)
}

pub(crate) fn bin_info(records: &VaultRecords, account: &str, bin: &str) -> Result<BinInfo> {
    let record = records.account(records.account_id(account)?)?;
    Ok(record.bin_by_name(bin)?.info(record.id))
}

pub(crate) fn list_accounts(records: &VaultRecords) -> Result<Vec<AccountInfo>> {
    records.accounts.values().map(|a| a.info(records)).collect()
}
