use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use bitcoin::{
    psbt::Psbt,
    secp256k1::{All, Secp256k1},
    OutPoint, Script, Txid,
};
use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use super::{
    events::Observers,
    lock::WriterLock,
    working::WorkingSet,
    SubscriptionId, VaultEvent,
};
use crate::{
    account::{self, AccountInfo, AccountManager, AccountOptions, BinInfo},
    config::VaultConfig,
    error::{Error, Result},
    export::{self, ExportFile, ExportKind},
    keychain::{self, EncryptionStatus, Keychain, KeychainInfo, KeychainManager, Session},
    ledger::{self, LedgerManager, ScriptOwner, TxOut},
    store::{FileStore, VaultRecords, VaultStore},
    tx::{self, Transaction, TxBuilder, TxExchange, TxRequest, TxSigner},
    updater::FoundOutput,
};

struct OpenVault {
    /// Only written under the writer lock; the mutex lets a commit run
    /// behind a shared state guard.
    store: Mutex<Box<dyn VaultStore>>,
    records: VaultRecords,
    session: Session,
}

/// A multisig HD vault.
///
/// Safe to share between threads. Mutating calls are serialized by a
/// single-writer lock; read-only queries never wait for it.
pub struct Vault {
    config: VaultConfig,
    secp: Secp256k1<All>,
    writer: WriterLock,
    state: RwLock<Option<OpenVault>>,
    observers: Observers,
}

impl Default for Vault {
    fn default() -> Self {
        Self::new(VaultConfig::default())
    }
}

impl Vault {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            writer: WriterLock::new(config.lock_retry.clone()),
            config,
            secp: Secp256k1::new(),
            state: RwLock::new(None),
            observers: Observers::default(),
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Opens the vault file at `path`, creating it if allowed. An already
    /// open vault is closed first.
    pub fn open(&self, path: impl AsRef<Path>, create_if_missing: bool) -> Result<()> {
        self.open_store(FileStore::open(path, create_if_missing)?)
    }

    pub fn open_store(&self, store: impl VaultStore + 'static) -> Result<()> {
        let _writer = self.writer.acquire()?;
        let mut store: Box<dyn VaultStore> = Box::new(store);

        let records = match store.load()? {
            Some(records) => records,
            None => {
                let records = VaultRecords::new(self.config.network)?;
                store
                    .commit(&records)
                    .map_err(|e| Error::StoreOpenError(e.to_string()))?;
                records
            }
        };
        if records.network() != self.config.network {
            log::warn!(
                "vault was created for {}, configuration says {}",
                records.network(),
                self.config.network
            );
        }

        let mut session = Session::default();
        if let Err(e) = session.unlock_chain_codes(&records, &[]) {
            log::info!("chain codes stay locked until a passphrase is given: {e}");
        }

        let location = store.location().map(Path::to_path_buf);
        let replaced = self
            .state
            .write()
            .replace(OpenVault {
                store: Mutex::new(store),
                records,
                session,
            })
            .is_some();

        let mut events = Vec::with_capacity(2);
        if replaced {
            events.push(VaultEvent::VaultClosed);
        }
        log::info!("opened vault {:?}", location);
        events.push(VaultEvent::VaultOpened { location });
        self.observers.notify(&events);
        Ok(())
    }

    /// Closes the vault, wiping every unlocked key.
    pub fn close(&self) -> Result<()> {
        let _writer = self.writer.acquire()?;
        let closed = self.state.write().take();
        if closed.is_none() {
            return Err(Error::VaultNotOpen);
        }
        drop(closed);
        log::info!("closed vault");
        self.observers.notify(&[VaultEvent::VaultClosed]);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn location(&self) -> Option<PathBuf> {
        self.state
            .read()
            .as_ref()
            .and_then(|open| open.store.lock().location().map(Path::to_path_buf))
    }

    /// Registers a callback for committed changes.
    ///
    /// Callbacks run on the mutating thread while it still holds the writer
    /// lock. Read-only calls are fine from inside a callback; mutating calls
    /// fail with [`Error::VaultBusy`].
    pub fn subscribe(
        &self,
        callback: impl Fn(&VaultEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn subscribe_channel(&self) -> std::sync::mpsc::Receiver<VaultEvent> {
        self.observers.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Runs `op` as one transaction: check open, take the writer lock,
    /// re-check, work on a copy, commit, swap in, notify. Only the swap
    /// holds the state write guard.
    fn mutate<T>(&self, op: impl FnOnce(&mut WorkingSet<'_>) -> Result<T>) -> Result<T> {
        if !self.is_open() {
            return Err(Error::VaultNotOpen);
        }
        let _writer = self.writer.acquire()?;

        let (records, session) = {
            let slot = self.state.read();
            let open = slot.as_ref().ok_or(Error::VaultNotOpen)?;
            (open.records.clone(), open.session.clone())
        };
        let mut ws = WorkingSet {
            records,
            session,
            events: Vec::new(),
            secp: &self.secp,
            config: &self.config,
        };

        let value = op(&mut ws).inspect_err(|e| log::debug!("vault operation rolled back: {e}"))?;

        let WorkingSet {
            records,
            session,
            events,
            ..
        } = ws;
        {
            // readers keep going while the store writes to disk
            let slot = self.state.read();
            let open = slot.as_ref().ok_or(Error::VaultNotOpen)?;
            open.store.lock().commit(&records)?;
        }
        {
            let mut slot = self.state.write();
            let open = slot.as_mut().ok_or(Error::VaultNotOpen)?;
            open.records = records;
            open.session = session;
        }
        self.observers.notify(&events);
        Ok(value)
    }

    fn read<T>(&self, query: impl FnOnce(&VaultRecords, &Session) -> Result<T>) -> Result<T> {
        let slot = self.state.read();
        let open = slot.as_ref().ok_or(Error::VaultNotOpen)?;
        query(&open.records, &open.session)
    }

    // Keychains

    pub fn keychain_exists(&self, name: &str) -> Result<bool> {
        self.read(|records, _| Ok(records.keychain_id(name).is_ok()))
    }

    pub fn new_keychain(&self, name: &str, entropy: &[u8]) -> Result<KeychainInfo> {
        self.mutate(|ws| KeychainManager::new(ws).create_root(name, entropy))
    }

    /// Stores a keychain from its BIP32 `xprv` or `xpub` encoding.
    pub fn import_keychain(&self, name: &str, extended_key: &str) -> Result<KeychainInfo> {
        self.mutate(|ws| KeychainManager::new(ws).import_extended(name, extended_key))
    }

    pub fn derive_keychain(
        &self,
        parent: &str,
        child_name: &str,
        index: u32,
        hardened: bool,
    ) -> Result<KeychainInfo> {
        self.mutate(|ws| KeychainManager::new(ws).derive(parent, child_name, index, hardened))
    }

    /// Working copy of a stored keychain, with its private key if unlocked.
    pub fn keychain(&self, name: &str) -> Result<Keychain> {
        self.read(|records, session| keychain::load(records, session, records.keychain_id(name)?))
    }

    /// Derives a child of a stored keychain without storing it.
    pub fn derive_child(&self, name: &str, index: u32, hardened: bool) -> Result<Keychain> {
        self.keychain(name)?.derive_child(&self.secp, index, hardened)
    }

    pub fn rename_keychain(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).rename(old_name, new_name))
    }

    pub fn keychain_info(&self, name: &str) -> Result<KeychainInfo> {
        self.read(|records, session| {
            Ok(records.keychain(records.keychain_id(name)?)?.info(session))
        })
    }

    pub fn list_keychains(&self) -> Result<Vec<KeychainInfo>> {
        self.read(|records, session| {
            Ok(records.keychains.values().map(|k| k.info(session)).collect())
        })
    }

    pub fn encryption_status(&self, name: &str) -> Result<EncryptionStatus> {
        Ok(self.keychain_info(name)?.status)
    }

    pub fn lock_keychain(&self, name: &str) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).lock(name))
    }

    pub fn lock_all_keychains(&self) -> Result<()> {
        self.mutate(|ws| {
            KeychainManager::new(ws).lock_all();
            Ok(())
        })
    }

    pub fn unlock_keychain(&self, name: &str, passphrase_key: &[u8]) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).unlock(name, passphrase_key))
    }

    pub fn set_keychain_passphrase(&self, name: &str, passphrase_key: &[u8]) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).set_passphrase(name, passphrase_key))
    }

    pub fn export_public_keychain(&self, name: &str) -> Result<String> {
        self.read(|records, session| keychain::export_public(records, session, name))
    }

    pub fn export_private_keychain(&self, name: &str) -> Result<Zeroizing<String>> {
        self.read(|records, session| keychain::export_private(records, session, name))
    }

    pub fn erase_keychain(&self, name: &str) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).erase(name))
    }

    /// Unlocks chain codes (public derivation) without unlocking any signing
    /// key.
    pub fn unlock_chain_codes(&self, passphrase_key: &[u8]) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).unlock_chain_codes(passphrase_key))
    }

    pub fn lock_chain_codes(&self) -> Result<()> {
        self.mutate(|ws| {
            KeychainManager::new(ws).lock_chain_codes();
            Ok(())
        })
    }

    pub fn set_chain_code_passphrase(&self, passphrase_key: &[u8]) -> Result<()> {
        self.mutate(|ws| KeychainManager::new(ws).set_chain_code_passphrase(passphrase_key))
    }

    // Accounts

    pub fn account_exists(&self, name: &str) -> Result<bool> {
        self.read(|records, _| Ok(records.account_id(name).is_ok()))
    }

    pub fn new_account(&self, name: &str, minsigs: u32, keychains: &[&str]) -> Result<AccountInfo> {
        self.new_account_with(name, minsigs, keychains, AccountOptions::default())
    }

    pub fn new_account_with(
        &self,
        name: &str,
        minsigs: u32,
        keychains: &[&str],
        options: AccountOptions,
    ) -> Result<AccountInfo> {
        self.mutate(|ws| AccountManager::new(ws).create(name, minsigs, keychains, options))
    }

    pub fn rename_account(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.mutate(|ws| AccountManager::new(ws).rename(old_name, new_name))
    }

    pub fn account_info(&self, name: &str) -> Result<AccountInfo> {
        self.read(|records, _| account::account_info(records, name))
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountInfo>> {
        self.read(|records, _| account::list_accounts(records))
    }

    pub fn delete_account(&self, name: &str) -> Result<()> {
        self.mutate(|ws| AccountManager::new(ws).delete(name))
    }

    pub fn new_account_bin(&self, account: &str, bin: &str) -> Result<BinInfo> {
        self.mutate(|ws| AccountManager::new(ws).add_bin(account, bin))
    }

    pub fn bin_info(&self, account: &str, bin: &str) -> Result<BinInfo> {
        self.read(|records, _| account::bin_info(records, account, bin))
    }

    /// Issues the next unused script of a bin as a pending output.
    pub fn issue_output(&self, account: &str, bin: &str, label: &str, value: u64) -> Result<TxOut> {
        self.mutate(|ws| AccountManager::new(ws).issue_output(account, bin, label, value))
    }

    // Ledger

    pub fn outputs_for_account(&self, account: &str, include_spent: bool) -> Result<Vec<TxOut>> {
        self.read(|records, _| ledger::outputs_for_account(records, account, include_spent))
    }

    pub fn balance(&self, account: &str) -> Result<u64> {
        self.read(|records, _| ledger::balance(records, account))
    }

    pub fn resolve_script(&self, script: &Script) -> Result<Option<ScriptOwner>> {
        self.read(|records, _| ledger::resolve_script(records, script))
    }

    pub fn record_observed_output(
        &self,
        script: &Script,
        value: u64,
        outpoint: OutPoint,
        height: Option<u32>,
    ) -> Result<Option<TxOut>> {
        self.mutate(|ws| {
            LedgerManager::new(ws).record_observed_output(script, value, outpoint, height)
        })
    }

    pub fn mark_spent(&self, output_id: u64, spending_txid: Txid) -> Result<TxOut> {
        self.mutate(|ws| LedgerManager::new(ws).mark_spent(output_id, spending_txid))
    }

    pub fn best_height(&self) -> Result<u32> {
        self.read(|records, _| Ok(records.best_height()))
    }

    pub fn set_best_height(&self, height: u32) -> Result<()> {
        self.mutate(|ws| {
            LedgerManager::new(ws).set_best_height(height);
            Ok(())
        })
    }

    /// Applies the outputs of one block. Returns how many belong to the
    /// vault.
    pub fn record_block_outputs(
        &self,
        height: u32,
        outputs: &[(OutPoint, FoundOutput)],
    ) -> Result<usize> {
        self.mutate(|ws| {
            let mut ledger = LedgerManager::new(ws);
            let mut owned = 0;
            for (outpoint, found) in outputs {
                if ledger
                    .record_observed_output(
                        &found.script_pubkey,
                        found.value.to_sat(),
                        *outpoint,
                        Some(height),
                    )?
                    .is_some()
                {
                    owned += 1;
                }
            }
            Ok(owned)
        })
    }

    /// Applies the spent outpoints of one block. Returns how many belonged
    /// to the vault.
    pub fn record_block_inputs(&self, inputs: &[(OutPoint, Txid)]) -> Result<usize> {
        self.mutate(|ws| {
            let mut ledger = LedgerManager::new(ws);
            let mut spent = 0;
            for (outpoint, txid) in inputs {
                if ledger.mark_outpoint_spent(outpoint, *txid)?.is_some() {
                    spent += 1;
                }
            }
            Ok(spent)
        })
    }

    // Transactions

    pub fn create_tx(&self, account: &str, request: TxRequest) -> Result<Transaction> {
        self.mutate(|ws| TxBuilder::new(ws).create(account, request))
    }

    /// Adds signatures from unlocked keychains. `restrict_to` limits signing
    /// to the named keychains.
    pub fn sign_tx(
        &self,
        tx_id: u64,
        restrict_to: Option<&[&str]>,
        allow_partial: bool,
    ) -> Result<Transaction> {
        self.mutate(|ws| TxSigner::new(ws).sign(tx_id, restrict_to, allow_partial))
    }

    /// The fully signed network transaction.
    pub fn signed_transaction(&self, tx_id: u64) -> Result<bitcoin::Transaction> {
        self.read(|records, _| tx::signed_transaction(records, tx_id))
    }

    pub fn mark_broadcast(&self, tx_id: u64) -> Result<Transaction> {
        self.mutate(|ws| TxSigner::new(ws).mark_broadcast(tx_id))
    }

    pub fn discard_tx(&self, tx_id: u64) -> Result<()> {
        self.mutate(|ws| TxSigner::new(ws).discard(tx_id))
    }

    /// Base64 PSBT of a transaction, with its redeem scripts, spent outputs
    /// and signatures, for co-signers running their own vault.
    pub fn export_tx(&self, tx_id: u64) -> Result<String> {
        let psbt = self.read(|records, _| tx::export_psbt(records, tx_id))?;
        Ok(psbt.to_string())
    }

    /// Merges the signatures of a co-signer's PSBT into the matching stored
    /// transaction, or stores it as a new one if it spends outputs of this
    /// vault.
    pub fn import_tx(&self, psbt: &str) -> Result<Transaction> {
        let psbt = Psbt::from_str(psbt.trim())
            .map_err(|e| Error::InvalidExport(format!("psbt: {e}")))?;
        self.mutate(|ws| TxExchange::new(ws).import(psbt))
    }

    pub fn tx(&self, tx_id: u64) -> Result<Transaction> {
        self.read(|records, _| records.tx(tx_id).cloned())
    }

    pub fn txs_for_account(&self, account: &str) -> Result<Vec<Transaction>> {
        self.read(|records, _| {
            let account_id = records.account_id(account)?;
            Ok(records
                .txs
                .values()
                .filter(|tx| tx.account_id == account_id)
                .cloned()
                .collect())
        })
    }

    // Export and import

    /// Writes every keychain and account to `path`. Private keys, still
    /// sealed, are written only if `include_private_keys` is set.
    pub fn export_vault(&self, path: impl AsRef<Path>, include_private_keys: bool) -> Result<()> {
        let file =
            self.read(|records, session| export::export_vault(records, session, include_private_keys))?;
        file.write(path.as_ref())?;
        log::info!(
            "exported vault to {} ({} private keys)",
            path.as_ref().display(),
            if include_private_keys { "with" } else { "without" }
        );
        Ok(())
    }

    pub fn import_vault(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = ExportFile::read(path.as_ref())?;
        self.import_file(file, ExportKind::Vault, None)
    }

    pub fn export_keychain(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        include_private_key: bool,
    ) -> Result<()> {
        let file = self.read(|records, session| {
            export::export_keychain(records, session, name, include_private_key)
        })?;
        file.write(path.as_ref())
    }

    /// Imports a keychain export, optionally under another name.
    pub fn import_keychain_file(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<()> {
        let file = ExportFile::read(path.as_ref())?;
        self.import_file(file, ExportKind::Keychain, name)
    }

    /// Exports an account with its keychains. A `shared` export, meant for
    /// co-signers, never carries private keys.
    pub fn export_account(&self, name: &str, path: impl AsRef<Path>, shared: bool) -> Result<()> {
        let file =
            self.read(|records, session| export::export_account(records, session, name, shared))?;
        file.write(path.as_ref())
    }

    pub fn import_account(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<()> {
        let file = ExportFile::read(path.as_ref())?;
        self.import_file(file, ExportKind::Account, name)
    }

    fn import_file(&self, file: ExportFile, expected: ExportKind, rename: Option<&str>) -> Result<()> {
        if file.kind() != expected {
            return Err(Error::InvalidExport(format!(
                "expected a {expected:?} export, found {:?}",
                file.kind()
            )));
        }
        self.mutate(|ws| export::import(ws, file, rename))
    }
}
