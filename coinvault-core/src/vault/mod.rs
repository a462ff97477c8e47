//! Vault coordinator.
//!
//! [`Vault`] owns the store and the unlocked session. Every mutation takes
//! the single-writer lock, runs against a private [`WorkingSet`], is
//! committed to the store, and only then becomes visible. Observers hear
//! about committed changes through [`VaultEvent`]s.

mod events;
mod lock;
mod vault;
mod working;

pub use events::{SubscriptionId, VaultEvent};
pub use vault::Vault;
pub(crate) use working::WorkingSet;
