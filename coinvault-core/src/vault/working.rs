use bitcoin::secp256k1::{All, Secp256k1};

use super::VaultEvent;
use crate::{config::VaultConfig, keychain::Session, store::VaultRecords};

/// Private copy of the vault state a single mutation runs against.
///
/// The coordinator swaps it in only after the store accepted the records, so
/// an operation that fails halfway leaves nothing behind.
pub(crate) struct WorkingSet<'c> {
    pub records: VaultRecords,
    pub session: Session,
    pub events: Vec<VaultEvent>,
    pub secp: &'c Secp256k1<All>,
    pub config: &'c VaultConfig,
}

impl<'c> WorkingSet<'c> {
    /// Empty vault with chain codes unlocked under the default key.
    #[cfg(test)]
    pub fn fresh(secp: &'c Secp256k1<All>, config: &'c VaultConfig) -> crate::error::Result<Self> {
        let records = VaultRecords::new(config.network)?;
        let mut session = Session::default();
        session.unlock_chain_codes(&records, &[])?;
        Ok(Self {
            records,
            session,
            events: Vec::new(),
            secp,
            config,
        })
    }

    /// Independent copy of the records and session, as another vault would
    /// hold them.
    #[cfg(test)]
    pub fn fork(&self) -> Self {
        Self {
            records: self.records.clone(),
            session: self.session.clone(),
            events: Vec::new(),
            secp: self.secp,
            config: self.config,
        }
    }
}
