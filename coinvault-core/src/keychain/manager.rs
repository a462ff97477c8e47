use std::str::FromStr;

use bitcoin::{
    bip32::{ChainCode, Fingerprint, Xpriv, Xpub},
    secp256k1::{PublicKey, SecretKey},
    NetworkKind,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{EncryptionStatus, Keychain, KeychainInfo, Session};
use crate::{
    crypto::{self, Sealed, SealingKey},
    error::{Error, Result},
    store::VaultRecords,
    vault::{VaultEvent, WorkingSet},
};

/// Persisted form of a keychain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeychainRecord {
    pub id: u64,
    pub name: String,
    #[serde(with = "hex")]
    pub hash: Vec<u8>,
    pub depth: u32,
    pub parent_fp: Fingerprint,
    pub child_num: u32,
    pub pubkey: PublicKey,
    pub chain_code: Sealed,
    pub private_key: Option<Sealed>,
    /// Private key is sealed under a caller passphrase.
    pub encrypted: bool,
}

impl KeychainRecord {
    pub fn status(&self, session: &Session) -> EncryptionStatus {
        let is_private = self.private_key.is_some();
        EncryptionStatus {
            is_private,
            is_locked: !session.is_unlocked(self.id),
            is_encrypted: is_private && self.encrypted,
        }
    }

    pub fn info(&self, session: &Session) -> KeychainInfo {
        KeychainInfo {
            id: self.id,
            name: self.name.clone(),
            depth: self.depth,
            parent_fp: self.parent_fp,
            child_num: self.child_num,
            pubkey: self.pubkey,
            hash: self.hash.clone(),
            status: self.status(session),
        }
    }
}

pub(crate) fn chain_code_aad(hash: &[u8]) -> Vec<u8> {
    let mut aad = b"chain-code:".to_vec();
    aad.extend_from_slice(hash);
    aad
}

/// Rebuilds the in-memory keychain of record `id`, with its private key if
/// the session holds it.
pub(crate) fn load(records: &VaultRecords, session: &Session, id: u64) -> Result<Keychain> {
    let record = records.keychain(id)?;
    let plain = record
        .chain_code
        .open(session.chain_code_key()?, &chain_code_aad(&record.hash))?;
    let chain_code: [u8; 32] = plain.as_slice().try_into().map_err(|_| {
        Error::IntegrityViolation(format!("chain code of {:?} is malformed", record.name))
    })?;

    Ok(Keychain::from_parts(
        &record.name,
        NetworkKind::from(records.network()),
        record.depth,
        record.parent_fp,
        record.child_num,
        ChainCode::from(chain_code),
        record.pubkey,
        session.private_key(id).cloned(),
    ))
}

pub(crate) fn export_public(records: &VaultRecords, session: &Session, name: &str) -> Result<String> {
    let id = records.keychain_id(name)?;
    Ok(load(records, session, id)?.xpub()?.to_string())
}

pub(crate) fn export_private(
    records: &VaultRecords,
    session: &Session,
    name: &str,
) -> Result<Zeroizing<String>> {
    let id = records.keychain_id(name)?;
    let record = records.keychain(id)?;
    if record.private_key.is_none() {
        return Err(Error::NoPrivateKey(name.to_string()));
    }
    if !session.is_unlocked(id) {
        return Err(Error::KeychainLocked(name.to_string()));
    }
    let xpriv = load(records, session, id)?.xpriv()?;
    Ok(Zeroizing::new(xpriv.to_string()))
}

/// Mutating keychain operations over one working set.
pub(crate) struct KeychainManager<'w, 'c> {
    ws: &'w mut WorkingSet<'c>,
}

impl<'w, 'c> KeychainManager<'w, 'c> {
    pub fn new(ws: &'w mut WorkingSet<'c>) -> Self {
        Self { ws }
    }

    pub fn create_root(&mut self, name: &str, entropy: &[u8]) -> Result<KeychainInfo> {
        self.ensure_name_free(name)?;
        let keychain =
            Keychain::from_entropy(name, entropy, self.ws.records.network(), self.ws.secp)?;
        let id = self.insert(&keychain, None)?;
        log::info!("created root keychain {name:?}");
        self.info(id)
    }

    /// Stores a keychain given as a BIP32 `xprv`/`xpub` string.
    pub fn import_extended(&mut self, name: &str, encoded: &str) -> Result<KeychainInfo> {
        self.ensure_name_free(name)?;
        let keychain = match Xpriv::from_str(encoded) {
            Ok(xpriv) => Keychain::from_xpriv(name, &xpriv, self.ws.secp),
            Err(_) => Keychain::from_xpub(name, &Xpub::from_str(encoded)?),
        };
        let id = self.insert(&keychain, None)?;
        log::info!(
            "imported {} keychain {name:?} at depth {}",
            if keychain.is_private() { "private" } else { "public" },
            keychain.depth()
        );
        self.info(id)
    }

    pub fn derive(
        &mut self,
        parent: &str,
        child_name: &str,
        index: u32,
        hardened: bool,
    ) -> Result<KeychainInfo> {
        self.ensure_name_free(child_name)?;
        let parent_id = self.ws.records.keychain_id(parent)?;
        let child = load(&self.ws.records, &self.ws.session, parent_id)?
            .derive_child(self.ws.secp, index, hardened)?
            .with_name(child_name);
        let id = self.insert(&child, None)?;
        log::info!("derived keychain {child_name:?} from {parent:?}");
        self.info(id)
    }

    /// Persists `keychain` under a fresh id.
    ///
    /// `sealed_private` carries private material that is already sealed, as
    /// found in export containers; otherwise the in-memory secret is sealed
    /// under the default key and left unlocked.
    pub fn insert(
        &mut self,
        keychain: &Keychain,
        sealed_private: Option<(Sealed, bool)>,
    ) -> Result<u64> {
        let hash = keychain.hash();
        if let Some(existing) = self.ws.records.keychain_by_hash(&hash) {
            return Err(Error::DuplicateKeychain(existing.name.clone()));
        }

        let chain_code = Sealed::seal(
            self.ws.session.chain_code_key()?,
            &keychain.chain_code().to_bytes(),
            &chain_code_aad(&hash),
        )?;
        let (private_key, encrypted) = match (sealed_private, keychain.secret()) {
            (Some((sealed, encrypted)), _) => (Some(sealed), encrypted),
            (None, Some(secret)) => (
                Some(Sealed::seal(&SealingKey::default_key(), &secret[..], &hash)?),
                false,
            ),
            (None, None) => (None, false),
        };

        let id = self.ws.records.allocate_id();
        self.ws.records.keychains.insert(
            id,
            KeychainRecord {
                id,
                name: keychain.name().to_string(),
                hash: hash.to_vec(),
                depth: keychain.depth(),
                parent_fp: keychain.parent_fp(),
                child_num: keychain.child_num(),
                pubkey: keychain.pubkey(),
                chain_code,
                private_key,
                encrypted,
            },
        );
        if let Some(secret) = keychain.secret() {
            self.ws.session.insert_private_key(id, secret.clone());
        }
        self.ws.events.push(VaultEvent::KeychainInserted {
            name: keychain.name().to_string(),
        });
        Ok(id)
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let id = self.ws.records.keychain_id(old_name)?;
        if old_name == new_name {
            return Ok(());
        }
        self.ensure_name_free(new_name)?;
        self.ws.records.keychain_mut(id)?.name = new_name.to_string();
        log::info!("renamed keychain {old_name:?} to {new_name:?}");
        Ok(())
    }

    pub fn lock(&mut self, name: &str) -> Result<()> {
        let id = self.ws.records.keychain_id(name)?;
        if self.ws.session.remove_private_key(id) {
            self.ws.events.push(VaultEvent::KeychainLocked {
                name: name.to_string(),
            });
            log::debug!("locked keychain {name:?}");
        }
        Ok(())
    }

    pub fn lock_all(&mut self) {
        for id in self.ws.session.lock_all() {
            if let Ok(record) = self.ws.records.keychain(id) {
                self.ws.events.push(VaultEvent::KeychainLocked {
                    name: record.name.clone(),
                });
            }
        }
    }

    pub fn unlock(&mut self, name: &str, passphrase_key: &[u8]) -> Result<()> {
        let id = self.ws.records.keychain_id(name)?;
        let record = self.ws.records.keychain(id)?;
        let sealed = record
            .private_key
            .as_ref()
            .ok_or_else(|| Error::NoPrivateKey(name.to_string()))?;
        let key = if record.encrypted {
            SealingKey::from_passphrase(passphrase_key)
        } else {
            SealingKey::default_key()
        };

        let plain = sealed.open(&key, &record.hash)?;
        let secret = crypto::secret_bytes(&plain).ok_or_else(|| {
            Error::IntegrityViolation(format!("private key of {name:?} is malformed"))
        })?;
        let pubkey = SecretKey::from_slice(&secret[..])?.public_key(self.ws.secp);
        if pubkey != record.pubkey {
            return Err(Error::IntegrityViolation(format!(
                "private key of {name:?} does not match its public key"
            )));
        }

        let was_unlocked = self.ws.session.is_unlocked(id);
        self.ws.session.insert_private_key(id, secret);
        if !was_unlocked {
            self.ws.events.push(VaultEvent::KeychainUnlocked {
                name: name.to_string(),
            });
            log::debug!("unlocked keychain {name:?}");
        }
        Ok(())
    }

    /// Re-seals the private key of an unlocked keychain. The empty key
    /// reverts to the default key.
    pub fn set_passphrase(&mut self, name: &str, passphrase_key: &[u8]) -> Result<()> {
        let id = self.ws.records.keychain_id(name)?;
        if self.ws.records.keychain(id)?.private_key.is_none() {
            return Err(Error::NoPrivateKey(name.to_string()));
        }
        let secret = self
            .ws
            .session
            .private_key(id)
            .cloned()
            .ok_or_else(|| Error::KeychainLocked(name.to_string()))?;

        let encrypted = !passphrase_key.is_empty();
        let key = SealingKey::from_passphrase(passphrase_key);
        let record = self.ws.records.keychain_mut(id)?;
        record.private_key = Some(Sealed::seal(&key, &secret[..], &record.hash)?);
        record.encrypted = encrypted;
        log::info!(
            "{} passphrase on keychain {name:?}",
            if encrypted { "set" } else { "cleared" }
        );
        Ok(())
    }

    pub fn unlock_chain_codes(&mut self, passphrase_key: &[u8]) -> Result<()> {
        self.ws
            .session
            .unlock_chain_codes(&self.ws.records, passphrase_key)
    }

    pub fn lock_chain_codes(&mut self) {
        self.ws.session.lock_chain_codes();
    }

    /// Re-seals every chain code under a new vault-wide key.
    pub fn set_chain_code_passphrase(&mut self, passphrase_key: &[u8]) -> Result<()> {
        let old_key = self.ws.session.chain_code_key()?.clone();
        let new_key = SealingKey::from_passphrase(passphrase_key);

        for record in self.ws.records.keychains.values_mut() {
            let aad = chain_code_aad(&record.hash);
            let plain = record.chain_code.open(&old_key, &aad)?;
            record.chain_code = Sealed::seal(&new_key, &plain, &aad)?;
        }
        self.ws.records.reseal_chain_code_check(&new_key)?;
        self.ws.session.set_chain_code_key(new_key);
        log::info!("re-sealed chain codes of {} keychains", self.ws.records.keychains.len());
        Ok(())
    }

    pub fn erase(&mut self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("keychain deletion"))
    }

    fn info(&self, id: u64) -> Result<KeychainInfo> {
        Ok(self.ws.records.keychain(id)?.info(&self.ws.session))
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if self.ws.records.keychain_id(name).is_ok() {
            return Err(Error::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}
