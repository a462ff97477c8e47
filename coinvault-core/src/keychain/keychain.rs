use bitcoin::{
    bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub},
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
    Network, NetworkKind,
};
use zeroize::Zeroizing;

use crate::{
    constants::ENTROPY_LEN,
    crypto::{self, SecretBytes},
    error::{Error, Result},
};

const HARDENED_BIT: u32 = 1 << 31;

/// An extended key with its derivation metadata.
///
/// Values are working copies handed out for the duration of one operation;
/// the private half is wiped when the value is dropped or locked.
#[derive(Clone)]
pub struct Keychain {
    name: String,
    network: NetworkKind,
    depth: u32,
    parent_fp: Fingerprint,
    child_num: u32,
    chain_code: ChainCode,
    pubkey: PublicKey,
    secret: Option<SecretBytes>,
}

impl Keychain {
    /// Standard BIP32 master key from 32 bytes of caller supplied entropy.
    pub fn from_entropy(
        name: &str,
        entropy: &[u8],
        network: Network,
        secp: &Secp256k1<All>,
    ) -> Result<Self> {
        if entropy.len() != ENTROPY_LEN {
            return Err(Error::InvalidEntropy(entropy.len()));
        }
        let master = Xpriv::new_master(network, entropy)?;
        Ok(Self::from_xpriv(name, &master, secp))
    }

    pub fn from_xpriv(name: &str, xpriv: &Xpriv, secp: &Secp256k1<All>) -> Self {
        let xpub = Xpub::from_priv(secp, xpriv);
        let mut keychain = Self::from_xpub(name, &xpub);
        keychain.secret = Some(Zeroizing::new(xpriv.private_key.secret_bytes()));
        keychain
    }

    pub fn from_xpub(name: &str, xpub: &Xpub) -> Self {
        Self {
            name: name.to_string(),
            network: xpub.network,
            depth: u32::from(xpub.depth),
            parent_fp: xpub.parent_fingerprint,
            child_num: u32::from(xpub.child_number),
            chain_code: xpub.chain_code,
            pubkey: xpub.public_key,
            secret: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: &str,
        network: NetworkKind,
        depth: u32,
        parent_fp: Fingerprint,
        child_num: u32,
        chain_code: ChainCode,
        pubkey: PublicKey,
        secret: Option<SecretBytes>,
    ) -> Self {
        Self {
            name: name.to_string(),
            network,
            depth,
            parent_fp,
            child_num,
            chain_code,
            pubkey,
            secret,
        }
    }

    /// Derives child `index` of this keychain.
    ///
    /// Hardened children need the private key. Non-hardened children of a
    /// public-only keychain are derived from the public key and chain code.
    /// The parent is left untouched.
    pub fn derive_child(
        &self,
        secp: &Secp256k1<All>,
        index: u32,
        hardened: bool,
    ) -> Result<Keychain> {
        let child_number = if hardened {
            ChildNumber::from_hardened_idx(index)?
        } else {
            ChildNumber::from_normal_idx(index)?
        };
        let child_name = format!(
            "{}/{}{}",
            self.name,
            index,
            if hardened { "'" } else { "" }
        );

        match (&self.secret, hardened) {
            (None, true) => Err(Error::KeychainLocked(self.name.clone())),
            (Some(_), _) => {
                let child = self.xpriv()?.derive_priv(secp, &[child_number])?;
                Ok(Self::from_xpriv(&child_name, &child, secp))
            }
            (None, false) => {
                let child = self.xpub()?.ckd_pub(secp, child_number)?;
                Ok(Self::from_xpub(&child_name, &child))
            }
        }
    }

    /// Same key material under another name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent_fp(&self) -> Fingerprint {
        self.parent_fp
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    pub fn is_hardened(&self) -> bool {
        self.child_num & HARDENED_BIT != 0
    }

    pub fn chain_code(&self) -> ChainCode {
        self.chain_code
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    pub fn hash(&self) -> [u8; 32] {
        crypto::keychain_hash(&self.pubkey)
    }

    pub fn is_private(&self) -> bool {
        self.secret.is_some()
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    pub(crate) fn secret(&self) -> Option<&SecretBytes> {
        self.secret.as_ref()
    }

    pub fn secret_key(&self) -> Result<SecretKey> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| Error::KeychainLocked(self.name.clone()))?;
        Ok(SecretKey::from_slice(&secret[..])?)
    }

    /// Drops the private key from this value.
    pub fn lock(&mut self) {
        self.secret = None;
    }

    pub fn xpub(&self) -> Result<Xpub> {
        Ok(Xpub {
            network: self.network,
            depth: self.bip32_depth()?,
            parent_fingerprint: self.parent_fp,
            child_number: ChildNumber::from(self.child_num),
            public_key: self.pubkey,
            chain_code: self.chain_code,
        })
    }

    pub fn xpriv(&self) -> Result<Xpriv> {
        Ok(Xpriv {
            network: self.network,
            depth: self.bip32_depth()?,
            parent_fingerprint: self.parent_fp,
            child_number: ChildNumber::from(self.child_num),
            private_key: self.secret_key()?,
            chain_code: self.chain_code,
        })
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(self.xpub()?.fingerprint())
    }

    fn bip32_depth(&self) -> Result<u8> {
        u8::try_from(self.depth).map_err(|_| {
            Error::IntegrityViolation(format!(
                "keychain {:?} is deeper than BIP32 allows",
                self.name
            ))
        })
    }
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("parent_fp", &self.parent_fp)
            .field("child_num", &self.child_num)
            .field("pubkey", &self.pubkey)
            .field("private", &self.secret.is_some())
            .finish()
    }
}
