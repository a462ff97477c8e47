use std::sync::Arc;

use parking_lot::Mutex;

use super::{VaultRecords, VaultStore};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    committed: Option<VaultRecords>,
    commits: usize,
    fail_commits: bool,
}

/// In-memory [`VaultStore`].
///
/// Clones share the same backing state, so a caller can keep a handle after
/// giving the store to a vault and inspect what was committed.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<VaultRecords> {
        self.inner.lock().committed.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    /// Makes every following commit fail with an I/O error.
    pub fn set_fail_commits(&self, fail: bool) {
        self.inner.lock().fail_commits = fail;
    }
}

impl VaultStore for MemoryStore {
    fn load(&mut self) -> Result<Option<VaultRecords>> {
        Ok(self.inner.lock().committed.clone())
    }

    fn commit(&mut self, records: &VaultRecords) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_commits {
            return Err(Error::Io(std::io::Error::other("memory store rejects commits")));
        }
        inner.committed = Some(records.clone());
        inner.commits += 1;
        Ok(())
    }
}
