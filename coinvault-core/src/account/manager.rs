use std::{
    collections::{HashSet, VecDeque},
    ops::Range,
    time::{SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    secp256k1::{All, Secp256k1},
    ScriptBuf,
};

use super::{AccountInfo, AccountOptions, AccountRecord, BinInfo, BinRecord};
use crate::{
    constants::{CHANGE_BIN_INDEX, CHANGE_BIN_NAME, DEFAULT_BIN_INDEX, DEFAULT_BIN_NAME},
    error::{Error, Result},
    keychain::{self, Keychain},
    ledger::{LedgerManager, TxOut},
    script::{check_policy, multisig_redeem_script, p2sh_script_pubkey},
    vault::{VaultEvent, WorkingSet},
};

/// First index that would set the BIP32 hardened bit.
const INDEX_LIMIT: u32 = 1 << 31;

pub(crate) struct DerivedScript {
    pub index: u32,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: ScriptBuf,
}

/// Derives the multisig scripts of `indices` in one bin.
///
/// `keychains` are the bin-level children of the account keychains, in
/// account order.
fn derive_scripts(
    secp: &Secp256k1<All>,
    keychains: &[Keychain],
    minsigs: u32,
    hardened: bool,
    indices: Range<u32>,
) -> Result<Vec<DerivedScript>> {
    let derive = |index: u32| -> Result<DerivedScript> {
        let pubkeys = keychains
            .iter()
            .map(|k| Ok(k.derive_child(secp, index, hardened)?.pubkey()))
            .collect::<Result<Vec<_>>>()?;
        let redeem_script = multisig_redeem_script(minsigs, &pubkeys)?;
        Ok(DerivedScript {
            index,
            script_pubkey: p2sh_script_pubkey(&redeem_script),
            redeem_script,
        })
    };

    #[cfg(all(not(target_arch = "wasm32"), feature = "parallel"))]
    let derived = {
        use rayon::prelude::*;
        indices.into_par_iter().map(derive).collect()
    };

    #[cfg(not(all(not(target_arch = "wasm32"), feature = "parallel")))]
    let derived = indices.map(derive).collect();

    derived
}

pub(crate) struct AccountManager<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> AccountManager<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    pub fn create(
        &mut self,
        name: &str,
        minsigs: u32,
        keychain_names: &[&str],
        options: AccountOptions,
    ) -> Result<AccountInfo> {
        if self.ws.records.account_id(name).is_ok() {
            return Err(Error::DuplicateName(name.to_string()));
        }
        check_policy(minsigs, keychain_names.len())?;

        let keychain_ids = keychain_names
            .iter()
            .map(|k| self.ws.records.keychain_id(k))
            .collect::<Result<Vec<_>>>()?;
        let distinct: HashSet<_> = keychain_ids.iter().collect();
        if distinct.len() != keychain_ids.len() {
            return Err(Error::InvalidPolicy {
                minsigs,
                keychains: distinct.len(),
            });
        }

        let id = self.ws.records.allocate_id();
        let bins = vec![
            self.new_bin(CHANGE_BIN_NAME, CHANGE_BIN_INDEX),
            self.new_bin(DEFAULT_BIN_NAME, DEFAULT_BIN_INDEX),
        ];
        let bin_ids: Vec<u64> = bins.iter().map(|b| b.id).collect();
        let time_created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        self.ws.records.accounts.insert(
            id,
            AccountRecord {
                id,
                name: name.to_string(),
                minsigs,
                keychain_ids,
                derivation: options
                    .derivation
                    .unwrap_or(self.ws.config.default_derivation),
                unused_pool_size: options
                    .unused_pool_size
                    .unwrap_or(self.ws.config.unused_pool_size),
                time_created,
                bins,
            },
        );
        for bin_id in bin_ids {
            self.refill_best_effort(id, bin_id)?;
        }

        self.ws.events.push(VaultEvent::AccountInserted {
            name: name.to_string(),
        });
        log::info!(
            "created {minsigs}-of-{} account {name:?}",
            keychain_names.len()
        );
        self.ws.records.account(id)?.info(&self.ws.records)
    }

    pub fn add_bin(&mut self, account: &str, bin_name: &str) -> Result<BinInfo> {
        let account_id = self.ws.records.account_id(account)?;
        let record = self.ws.records.account(account_id)?;
        if record.bin_by_name(bin_name).is_ok() {
            return Err(Error::DuplicateBinName {
                account: account.to_string(),
                bin: bin_name.to_string(),
            });
        }
        let index = record
            .bins
            .iter()
            .map(|b| b.index)
            .max()
            .unwrap_or(DEFAULT_BIN_INDEX)
            + 1;

        let bin = self.new_bin(bin_name, index);
        let bin_id = bin.id;
        self.ws.records.account_mut(account_id)?.bins.push(bin);
        self.refill_best_effort(account_id, bin_id)?;

        log::info!("added bin {bin_name:?} (index {index}) to account {account:?}");
        Ok(self.ws.records.account(account_id)?.bin(bin_id)?.info(account_id))
    }

    /// Hands out the oldest unused script of a bin as a new pending output.
    pub fn issue_output(
        &mut self,
        account: &str,
        bin: &str,
        label: &str,
        value: u64,
    ) -> Result<TxOut> {
        let account_id = self.ws.records.account_id(account)?;
        let bin_id = self.ws.records.account(account_id)?.bin_by_name(bin)?.id;
        self.issue_to_bin(account_id, bin_id, label, value)
    }

    pub fn issue_to_bin(
        &mut self,
        account_id: u64,
        bin_id: u64,
        label: &str,
        value: u64,
    ) -> Result<TxOut> {
        if self.ws.records.account(account_id)?.bin(bin_id)?.unused.is_empty() {
            self.fill(account_id, bin_id, 1)?;
        }
        let script_id = self
            .ws
            .records
            .account_mut(account_id)?
            .bin_mut(bin_id)?
            .unused
            .pop_front()
            .ok_or_else(|| Error::IntegrityViolation("unused pool is empty".to_string()))?;

        let txout = LedgerManager::new(self.ws).issue(script_id, label, value)?;
        self.refill_best_effort(account_id, bin_id)?;
        log::debug!(
            "issued output {} at index {} of account {account_id}",
            txout.id,
            txout.index
        );
        Ok(txout)
    }

    /// Tops up the pool of a bin to its target, skipping quietly when the
    /// keys needed for derivation are locked.
    pub fn refill_best_effort(&mut self, account_id: u64, bin_id: u64) -> Result<()> {
        let target = self.ws.records.account(account_id)?.unused_pool_size;
        match self.fill(account_id, bin_id, target) {
            Ok(0) => Ok(()),
            Ok(added) => {
                log::debug!("derived {added} unused scripts for bin {bin_id}");
                Ok(())
            }
            Err(Error::KeychainLocked(name)) => {
                log::debug!("pool refill of bin {bin_id} deferred: keychain {name:?} is locked");
                Ok(())
            }
            Err(Error::ChainCodesLocked) => {
                log::debug!("pool refill of bin {bin_id} deferred: chain codes are locked");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Derives scripts until the bin holds `target` unused ones. Returns how
    /// many were added. Nothing is stored unless every derivation succeeds.
    pub fn fill(&mut self, account_id: u64, bin_id: u64, target: u32) -> Result<usize> {
        let account = self.ws.records.account(account_id)?;
        let bin = account.bin(bin_id)?;
        let missing = (target as usize).saturating_sub(bin.unused.len()) as u32;
        if missing == 0 {
            return Ok(0);
        }

        let start = bin.next_script_index;
        let end = start
            .checked_add(missing)
            .filter(|end| *end <= INDEX_LIMIT)
            .ok_or_else(|| {
                Error::IntegrityViolation(format!(
                    "bin {:?} of account {:?} ran out of derivation indices",
                    bin.name, account.name
                ))
            })?;

        let hardened = account.derivation.is_hardened();
        let bin_keychains = account
            .keychain_ids
            .iter()
            .map(|id| {
                keychain::load(&self.ws.records, &self.ws.session, *id)?.derive_child(
                    self.ws.secp,
                    bin.index,
                    hardened,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let derived = derive_scripts(
            self.ws.secp,
            &bin_keychains,
            account.minsigs,
            hardened,
            start..end,
        )?;

        let mut ids = VecDeque::with_capacity(derived.len());
        for script in derived {
            ids.push_back(LedgerManager::new(self.ws).insert_script(account_id, bin_id, script)?);
        }
        let added = ids.len();
        let bin = self.ws.records.account_mut(account_id)?.bin_mut(bin_id)?;
        bin.unused.extend(ids);
        bin.next_script_index = end;
        Ok(added)
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let id = self.ws.records.account_id(old_name)?;
        if old_name == new_name {
            return Ok(());
        }
        if self.ws.records.account_id(new_name).is_ok() {
            return Err(Error::DuplicateName(new_name.to_string()));
        }
        self.ws.records.account_mut(id)?.name = new_name.to_string();
        log::info!("renamed account {old_name:?} to {new_name:?}");
        Ok(())
    }

    pub fn delete(&mut self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("account deletion"))
    }

    fn new_bin(&mut self, name: &str, index: u32) -> BinRecord {
        BinRecord {
            id: self.ws.records.allocate_id(),
            name: name.to_string(),
            index,
            next_script_index: 0,
            unused: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::DerivationMode, config::VaultConfig, keychain::KeychainManager,
        ledger::OutputStatus,
    };

    fn setup<T>(pool: u32, f: impl FnOnce(&mut WorkingSet<'_>) -> T) -> T {
        let secp = Secp256k1::<All>::new();
        let config = VaultConfig {
            unused_pool_size: pool,
            ..Default::default()
        };
        let mut ws = WorkingSet::fresh(&secp, &config).unwrap();
        let mut keychains = KeychainManager::new(&mut ws);
        for (i, name) in ["k1", "k2", "k3"].iter().enumerate() {
            keychains.create_root(name, &[i as u8 + 1; 32]).unwrap();
        }
        f(&mut ws)
    }

    #[test]
    fn create_validates_policy_and_names() {
        setup(2, |ws| {
            let mut accounts = AccountManager::new(ws);
            let opts = AccountOptions::default;
            assert!(matches!(
                accounts.create("A", 0, &["k1"], opts()),
                Err(Error::InvalidPolicy { .. })
            ));
            assert!(matches!(
                accounts.create("A", 3, &["k1", "k2"], opts()),
                Err(Error::InvalidPolicy { .. })
            ));
            assert!(matches!(
                accounts.create("A", 1, &["k1", "nope"], opts()),
                Err(Error::UnknownKeychain(name)) if name == "nope"
            ));
            assert!(matches!(
                accounts.create("A", 1, &["k1", "k1"], opts()),
                Err(Error::InvalidPolicy { .. })
            ));

            let info = accounts.create("A", 2, &["k1", "k2", "k3"], opts()).unwrap();
            assert_eq!(info.keychain_names, vec!["k1", "k2", "k3"]);
            assert_eq!(info.bin_names, vec![CHANGE_BIN_NAME, DEFAULT_BIN_NAME]);
            assert_eq!(info.derivation, DerivationMode::Hardened);
            assert!(matches!(
                accounts.create("A", 1, &["k1"], opts()),
                Err(Error::DuplicateName(_))
            ));
        });
    }

    #[test]
    fn issued_scripts_are_distinct_and_monotonic() {
        setup(2, |ws| {
            let mut accounts = AccountManager::new(ws);
            accounts
                .create("A", 2, &["k1", "k2", "k3"], AccountOptions::default())
                .unwrap();
            let a = accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0).unwrap();
            let b = accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0).unwrap();
            assert_eq!(a.status, OutputStatus::Pending);
            assert!(b.index > a.index);
            assert_ne!(a.script, b.script);
            assert!(a.script.is_p2sh());

            let change = accounts.issue_output("A", CHANGE_BIN_NAME, "", 0).unwrap();
            assert_eq!(change.index, 0);
            assert_ne!(change.script, a.script);
        });
    }

    #[test]
    fn locked_keychains_drain_the_pool_then_fail() {
        setup(2, |ws| {
            AccountManager::new(ws)
                .create("A", 1, &["k1", "k2"], AccountOptions::default())
                .unwrap();
            KeychainManager::new(ws).lock("k2").unwrap();

            let mut accounts = AccountManager::new(ws);
            accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0).unwrap();
            accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0).unwrap();
            assert!(matches!(
                accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0),
                Err(Error::KeychainLocked(name)) if name == "k2"
            ));

            KeychainManager::new(ws).unlock("k2", b"").unwrap();
            let next = AccountManager::new(ws)
                .issue_output("A", DEFAULT_BIN_NAME, "", 0)
                .unwrap();
            assert_eq!(next.index, 2);
        });
    }

    #[test]
    fn normal_derivation_works_while_locked() {
        setup(1, |ws| {
            let options = AccountOptions {
                derivation: Some(DerivationMode::Normal),
                unused_pool_size: Some(1),
            };
            AccountManager::new(ws)
                .create("W", 2, &["k1", "k2"], options)
                .unwrap();
            KeychainManager::new(ws).lock_all();

            let mut accounts = AccountManager::new(ws);
            for expected in 0..3 {
                let out = accounts.issue_output("W", DEFAULT_BIN_NAME, "", 0).unwrap();
                assert_eq!(out.index, expected);
            }
        });
    }

    #[test]
    fn bins_get_their_own_index_space() {
        setup(1, |ws| {
            let mut accounts = AccountManager::new(ws);
            accounts
                .create("A", 1, &["k1"], AccountOptions::default())
                .unwrap();
            let bin = accounts.add_bin("A", "savings").unwrap();
            assert_eq!(bin.index, DEFAULT_BIN_INDEX + 1);
            assert_eq!(bin.unused_scripts, 1);
            assert!(matches!(
                accounts.add_bin("A", "savings"),
                Err(Error::DuplicateBinName { .. })
            ));

            let a = accounts.issue_output("A", "savings", "", 0).unwrap();
            let b = accounts.issue_output("A", DEFAULT_BIN_NAME, "", 0).unwrap();
            assert_eq!(a.index, b.index);
            assert_ne!(a.script, b.script);
            assert!(matches!(
                accounts.issue_output("A", "missing", "", 0),
                Err(Error::UnknownBin { .. })
            ));
        });
    }

    #[test]
    fn rename_and_delete() {
        setup(0, |ws| {
            let mut accounts = AccountManager::new(ws);
            accounts
                .create("A", 1, &["k1"], AccountOptions::default())
                .unwrap();
            accounts
                .create("B", 1, &["k2"], AccountOptions::default())
                .unwrap();
            assert!(matches!(
                accounts.rename("A", "B"),
                Err(Error::DuplicateName(_))
            ));
            accounts.rename("A", "C").unwrap();
            assert!(matches!(
                accounts.delete("C"),
                Err(Error::Unsupported(_))
            ));
            assert!(ws.records.account_id("C").is_ok());
            assert!(ws.records.account_id("A").is_err());
        });
    }
}
