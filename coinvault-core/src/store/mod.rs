//! Persistent storage of vault records.
//!
//! The coordinator keeps the committed [`VaultRecords`] in memory and hands a
//! full copy to the store after every successful mutation. A store either
//! takes the whole copy or fails, so a failed commit leaves the previous
//! state in place.

mod file;
mod memory;
mod records;

use std::path::Path;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::VaultRecords;

use crate::error::Result;

pub trait VaultStore: Send + Sync {
    /// Loads the last committed records, or `None` if nothing was ever
    /// committed.
    fn load(&mut self) -> Result<Option<VaultRecords>>;

    fn commit(&mut self, records: &VaultRecords) -> Result<()>;

    fn location(&self) -> Option<&Path> {
        None
    }
}
