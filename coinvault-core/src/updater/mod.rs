//! Chain synchronization hooks.
//!
//! A block scanner reports what it finds through the [`Updater`] trait.
//! [`VaultUpdater`] applies those reports to a shared [`Vault`](crate::Vault):
//! every call is one exclusive-lock mutation, committed before it returns.

mod structs;
mod updater;
mod vault_updater;

pub use structs::FoundOutput;
pub use updater::Updater;
pub use vault_updater::VaultUpdater;
