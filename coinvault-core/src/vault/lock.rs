use backon::{BlockingRetryable, ExponentialBuilder};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::LockRetryConfig,
    error::{Error, Result},
};

/// The vault-wide single-writer lock.
///
/// Acquisition polls with bounded exponential backoff and gives up with
/// [`Error::VaultBusy`], so a caller re-entering from inside a mutation fails
/// instead of deadlocking.
pub(crate) struct WriterLock {
    mutex: Mutex<()>,
    retry: LockRetryConfig,
}

impl WriterLock {
    pub fn new(retry: LockRetryConfig) -> Self {
        Self {
            mutex: Mutex::new(()),
            retry,
        }
    }

    pub fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        if let Some(guard) = self.mutex.try_lock() {
            return Ok(guard);
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry.min_delay())
            .with_max_delay(self.retry.max_delay())
            .with_max_times(self.retry.max_retries);

        (|| self.mutex.try_lock().ok_or(Error::VaultBusy))
            .retry(backoff)
            .sleep(std::thread::sleep)
            .notify(|_, delay| log::debug!("vault is busy, retrying in {delay:?}"))
            .call()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_lock_reports_busy() {
        let lock = WriterLock::new(LockRetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 2,
            max_retries: 3,
        });
        let guard = lock.acquire().unwrap();
        assert!(matches!(lock.acquire(), Err(Error::VaultBusy)));
        drop(guard);
        assert!(lock.acquire().is_ok());
    }
}
