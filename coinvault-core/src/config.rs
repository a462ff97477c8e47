//! Vault configuration.
//!
//! [`VaultConfig`] is plain serde data so front-ends can keep it next to
//! their own settings. Every field has a default.

use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::{account::DerivationMode, constants::DEFAULT_UNUSED_POOL_SIZE, error::Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Network kind recorded in exported extended keys.
    pub network: Network,
    /// Number of pre-derived unused scripts kept per bin for new accounts.
    pub unused_pool_size: u32,
    /// Derivation mode given to accounts created without an explicit one.
    pub default_derivation: DerivationMode,
    pub lock_retry: LockRetryConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            unused_pool_size: DEFAULT_UNUSED_POOL_SIZE,
            default_derivation: DerivationMode::Hardened,
            lock_retry: LockRetryConfig::default(),
        }
    }
}

impl VaultConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Backoff applied while waiting for the single-writer lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: usize,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2,
            max_delay_ms: 100,
            max_retries: 40,
        }
    }
}

impl LockRetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
