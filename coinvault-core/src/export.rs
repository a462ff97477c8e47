//! Portable export containers.
//!
//! One JSON document format covers a single keychain, a single account with
//! its keychains, or a whole vault. Chain codes travel in the clear so a
//! public-only importer can derive; private keys only travel when asked for,
//! still sealed under their keychain passphrase.

use std::{collections::HashMap, fs, path::Path};

use bitcoin::{
    bip32::{ChainCode, Fingerprint},
    secp256k1::PublicKey,
    Network, NetworkKind, ScriptBuf,
};
use serde::{Deserialize, Serialize};

use crate::{
    account::{AccountRecord, BinRecord, DerivationMode, DerivedScript},
    constants::EXPORT_FORMAT_VERSION,
    crypto::Sealed,
    error::{Error, Result},
    keychain::{self, Keychain, KeychainManager, KeychainRecord, Session},
    ledger::{LedgerManager, ScriptStatus},
    script::{check_policy, multisig_redeem_script, p2sh_script_pubkey, redeem_script_pubkeys},
    store::VaultRecords,
    vault::{VaultEvent, WorkingSet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ExportKind {
    Vault,
    Keychain,
    Account,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeychainExport {
    name: String,
    depth: u32,
    parent_fp: Fingerprint,
    child_num: u32,
    pubkey: PublicKey,
    #[serde(with = "hex")]
    chain_code: Vec<u8>,
    private_key: Option<Sealed>,
    encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScriptExport {
    bin_index: u32,
    index: u32,
    script_pubkey: ScriptBuf,
    redeem_script: ScriptBuf,
    status: ScriptStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BinExport {
    name: String,
    index: u32,
    next_script_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AccountExport {
    name: String,
    minsigs: u32,
    /// Keychain content hashes in account order.
    keychains: Vec<String>,
    derivation: DerivationMode,
    unused_pool_size: u32,
    time_created: u64,
    bins: Vec<BinExport>,
    scripts: Vec<ScriptExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExportFile {
    version: u32,
    kind: ExportKind,
    network: Network,
    keychains: Vec<KeychainExport>,
    accounts: Vec<AccountExport>,
}

impl ExportFile {
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        let file: ExportFile = serde_json::from_slice(&content)
            .map_err(|e| Error::InvalidExport(format!("{}: {e}", path.display())))?;
        if file.version != EXPORT_FORMAT_VERSION {
            return Err(Error::InvalidExport(format!(
                "unsupported export version {}",
                file.version
            )));
        }
        Ok(file)
    }

    pub fn kind(&self) -> ExportKind {
        self.kind
    }
}

fn export_keychain_record(
    records: &VaultRecords,
    session: &Session,
    record: &KeychainRecord,
    include_private: bool,
) -> Result<KeychainExport> {
    let keychain = keychain::load(records, session, record.id)?;
    Ok(KeychainExport {
        name: record.name.clone(),
        depth: record.depth,
        parent_fp: record.parent_fp,
        child_num: record.child_num,
        pubkey: record.pubkey,
        chain_code: keychain.chain_code().to_bytes().to_vec(),
        private_key: record.private_key.clone().filter(|_| include_private),
        encrypted: include_private && record.encrypted,
    })
}

fn export_account_record(records: &VaultRecords, account: &AccountRecord) -> Result<AccountExport> {
    let keychains = account
        .keychain_ids
        .iter()
        .map(|id| Ok(hex::encode(&records.keychain(*id)?.hash)))
        .collect::<Result<Vec<_>>>()?;
    let bin_index: HashMap<u64, u32> = account.bins.iter().map(|b| (b.id, b.index)).collect();
    let scripts = records
        .scripts
        .values()
        .filter(|s| s.account_id == account.id)
        .map(|s| ScriptExport {
            bin_index: bin_index.get(&s.bin_id).copied().unwrap_or_default(),
            index: s.index,
            script_pubkey: s.script_pubkey.clone(),
            redeem_script: s.redeem_script.clone(),
            status: s.status,
        })
        .collect();

    Ok(AccountExport {
        name: account.name.clone(),
        minsigs: account.minsigs,
        keychains,
        derivation: account.derivation,
        unused_pool_size: account.unused_pool_size,
        time_created: account.time_created,
        bins: account
            .bins
            .iter()
            .map(|b| BinExport {
                name: b.name.clone(),
                index: b.index,
                next_script_index: b.next_script_index,
            })
            .collect(),
        scripts,
    })
}

pub(crate) fn export_vault(
    records: &VaultRecords,
    session: &Session,
    include_private: bool,
) -> Result<ExportFile> {
    Ok(ExportFile {
        version: EXPORT_FORMAT_VERSION,
        kind: ExportKind::Vault,
        network: records.network(),
        keychains: records
            .keychains
            .values()
            .map(|k| export_keychain_record(records, session, k, include_private))
            .collect::<Result<_>>()?,
        accounts: records
            .accounts
            .values()
            .map(|a| export_account_record(records, a))
            .collect::<Result<_>>()?,
    })
}

pub(crate) fn export_keychain(
    records: &VaultRecords,
    session: &Session,
    name: &str,
    include_private: bool,
) -> Result<ExportFile> {
    let record = records.keychain(records.keychain_id(name)?)?;
    if include_private && record.private_key.is_none() {
        return Err(Error::NoPrivateKey(name.to_string()));
    }
    Ok(ExportFile {
        version: EXPORT_FORMAT_VERSION,
        kind: ExportKind::Keychain,
        network: records.network(),
        keychains: vec![export_keychain_record(records, session, record, include_private)?],
        accounts: Vec::new(),
    })
}

/// Exports an account with the public half of its keychains. Unless
/// `shared`, sealed private keys are included too.
pub(crate) fn export_account(
    records: &VaultRecords,
    session: &Session,
    name: &str,
    shared: bool,
) -> Result<ExportFile> {
    let account = records.account(records.account_id(name)?)?;
    let keychains = account
        .keychain_ids
        .iter()
        .map(|id| export_keychain_record(records, session, records.keychain(*id)?, !shared))
        .collect::<Result<Vec<_>>>()?;
    Ok(ExportFile {
        version: EXPORT_FORMAT_VERSION,
        kind: ExportKind::Account,
        network: records.network(),
        keychains,
        accounts: vec![export_account_record(records, account)?],
    })
}

/// Brings the content of `file` into the working set.
///
/// Keychains already present (same content) are reused, and gain the private
/// key if only the import has one. `rename` replaces the name of the single
/// keychain or account of a keychain or account export.
pub(crate) fn import(ws: &mut WorkingSet<'_>, file: ExportFile, rename: Option<&str>) -> Result<()> {
    if file.network != ws.records.network() {
        return Err(Error::InvalidExport(format!(
            "export is for {}, vault is on {}",
            file.network,
            ws.records.network()
        )));
    }
    let kind = file.kind;

    let mut by_hash = HashMap::new();
    for mut export in file.keychains {
        if kind == ExportKind::Keychain {
            if let Some(name) = rename {
                export.name = name.to_string();
            }
        }
        let (hash, id) = import_keychain(ws, export)?;
        by_hash.insert(hash, id);
    }

    for mut export in file.accounts {
        if kind == ExportKind::Account {
            if let Some(name) = rename {
                export.name = name.to_string();
            }
        }
        import_account(ws, export, &by_hash)?;
    }
    Ok(())
}

fn import_keychain(ws: &mut WorkingSet<'_>, export: KeychainExport) -> Result<(String, u64)> {
    let chain_code: [u8; 32] = export
        .chain_code
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidExport(format!("bad chain code for {:?}", export.name)))?;
    let keychain = Keychain::from_parts(
        &export.name,
        NetworkKind::from(ws.records.network()),
        export.depth,
        export.parent_fp,
        export.child_num,
        ChainCode::from(chain_code),
        export.pubkey,
        None,
    );
    let hash = keychain.hash();
    let hash_hex = hex::encode(hash);

    if let Some(existing) = ws.records.keychain_by_hash(&hash).map(|k| k.id) {
        let record = ws.records.keychain_mut(existing)?;
        if record.private_key.is_none() && export.private_key.is_some() {
            record.private_key = export.private_key;
            record.encrypted = export.encrypted;
            log::info!("imported private key into keychain {:?}", record.name);
        }
        return Ok((hash_hex, existing));
    }

    if ws.records.keychain_id(&export.name).is_ok() {
        return Err(Error::DuplicateName(export.name));
    }
    let sealed = export.private_key.map(|sealed| (sealed, export.encrypted));
    let id = KeychainManager::new(ws).insert(&keychain, sealed)?;
    log::info!("imported keychain {:?}", export.name);
    Ok((hash_hex, id))
}

fn import_account(
    ws: &mut WorkingSet<'_>,
    export: AccountExport,
    keychains: &HashMap<String, u64>,
) -> Result<()> {
    if ws.records.account_id(&export.name).is_ok() {
        return Err(Error::DuplicateName(export.name));
    }
    check_policy(export.minsigs, export.keychains.len())?;
    let keychain_ids = export
        .keychains
        .iter()
        .map(|hash| {
            keychains.get(hash).copied().ok_or_else(|| {
                Error::InvalidExport(format!("account {:?} references unknown keychain", export.name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let account_id = ws.records.allocate_id();
    let mut bins = Vec::with_capacity(export.bins.len());
    for bin in &export.bins {
        bins.push(BinRecord {
            id: ws.records.allocate_id(),
            name: bin.name.clone(),
            index: bin.index,
            next_script_index: bin.next_script_index,
            unused: Default::default(),
        });
    }
    let bin_ids: HashMap<u32, u64> = bins.iter().map(|b| (b.index, b.id)).collect();

    ws.records.accounts.insert(
        account_id,
        AccountRecord {
            id: account_id,
            name: export.name.clone(),
            minsigs: export.minsigs,
            keychain_ids,
            derivation: export.derivation,
            unused_pool_size: export.unused_pool_size,
            time_created: export.time_created,
            bins,
        },
    );

    let mut scripts = export.scripts;
    scripts.sort_by_key(|s| (s.bin_index, s.index));
    for script in scripts {
        let bin_id = *bin_ids.get(&script.bin_index).ok_or_else(|| {
            Error::InvalidExport(format!("script in unknown bin {}", script.bin_index))
        })?;
        verify_script(ws, ws.records.account(account_id)?, &script)?;
        let status = script.status;
        let id = LedgerManager::new(ws).insert_script(
            account_id,
            bin_id,
            DerivedScript {
                index: script.index,
                script_pubkey: script.script_pubkey,
                redeem_script: script.redeem_script,
            },
        )?;
        ws.records.script_mut(id)?.status = status;
        if status == ScriptStatus::Unused {
            ws.records
                .account_mut(account_id)?
                .bin_mut(bin_id)?
                .unused
                .push_back(id);
        }
    }

    ws.events.push(VaultEvent::AccountInserted {
        name: export.name.clone(),
    });
    log::info!("imported account {:?}", export.name);
    Ok(())
}

/// Checks an imported script against the account it is filed under. Keys are
/// re-derived from every keychain whose material is at hand; the others are
/// trusted as far as the script shape goes.
fn verify_script(ws: &WorkingSet<'_>, account: &AccountRecord, script: &ScriptExport) -> Result<()> {
    let invalid = |what: &str| {
        Error::InvalidExport(format!(
            "script {}/{} of account {:?} {what}",
            script.bin_index, script.index, account.name
        ))
    };

    let bin = account
        .bins
        .iter()
        .find(|b| b.index == script.bin_index)
        .ok_or_else(|| invalid("is in an unknown bin"))?;
    if script.index >= bin.next_script_index {
        return Err(invalid("is beyond the derived range"));
    }
    if p2sh_script_pubkey(&script.redeem_script) != script.script_pubkey {
        return Err(invalid("does not hash to its redeem script"));
    }
    let pubkeys = redeem_script_pubkeys(&script.redeem_script)
        .map_err(|_| invalid("has a malformed redeem script"))?;
    if pubkeys.len() != account.keychain_ids.len()
        || multisig_redeem_script(account.minsigs, &pubkeys)? != script.redeem_script
    {
        return Err(invalid("does not follow the account policy"));
    }

    let hardened = account.derivation.is_hardened();
    for (keychain_id, pubkey) in account.keychain_ids.iter().zip(&pubkeys) {
        let derived = keychain::load(&ws.records, &ws.session, *keychain_id)
            .and_then(|k| k.derive_child(ws.secp, script.bin_index, hardened))
            .and_then(|k| k.derive_child(ws.secp, script.index, hardened));
        match derived {
            Ok(key) if key.pubkey() != *pubkey => {
                return Err(invalid("has a key its keychain does not derive"))
            }
            Ok(_) | Err(Error::KeychainLocked(_)) | Err(Error::ChainCodesLocked) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
