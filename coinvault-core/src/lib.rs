//! Multisig hierarchical-deterministic vault engine.
//!
//! The [`Vault`] coordinator owns the persistent store and serializes every
//! mutation behind a single-writer lock. Keychains, accounts, the output
//! ledger and the transaction builder/signer are reached through it.

mod account;
pub mod config;
pub mod constants;
mod crypto;
pub mod error;
mod export;
mod keychain;
mod ledger;
pub mod script;
mod store;
mod tx;
mod updater;
mod vault;

pub use account::{AccountInfo, AccountOptions, BinInfo, DerivationMode};
pub use config::{LockRetryConfig, VaultConfig};
pub use error::{Error, Result};
pub use keychain::{EncryptionStatus, Keychain, KeychainInfo};
pub use ledger::{OutputStatus, ScriptOwner, TxOut};
pub use script::{classify_script, payee_address, Payee};
pub use store::{FileStore, MemoryStore, VaultRecords, VaultStore};
pub use tx::{ChangeOutput, InputSignature, OutputSpec, Transaction, TxInput, TxRequest, TxStatus};
pub use updater::{FoundOutput, Updater, VaultUpdater};
pub use vault::{SubscriptionId, Vault, VaultEvent};

pub use bitcoin;
