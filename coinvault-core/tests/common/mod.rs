#![allow(dead_code)]

use std::{path::PathBuf, str::FromStr};

use coinvault_core::{
    bitcoin::{Network, OutPoint, ScriptBuf, Txid},
    LockRetryConfig, TxOut, Vault, VaultConfig,
};
use tempfile::TempDir;

pub const FUNDING_TXID: &str = "e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468";

pub fn config() -> VaultConfig {
    VaultConfig {
        network: Network::Regtest,
        unused_pool_size: 3,
        lock_retry: LockRetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_retries: 3,
        },
        ..Default::default()
    }
}

pub fn vault_path(dir: &TempDir) -> PathBuf {
    dir.path().join("vault.json")
}

pub fn open_vault(dir: &TempDir) -> Vault {
    let vault = Vault::new(config());
    vault.open(vault_path(dir), true).unwrap();
    vault
}

pub fn entropy(seed: u8) -> [u8; 32] {
    [seed; 32]
}

/// Vault with root keychains k1, k2, k3 and a 2-of-3 account "A".
pub fn two_of_three(vault: &Vault) {
    for (i, name) in ["k1", "k2", "k3"].iter().enumerate() {
        vault.new_keychain(name, &entropy(i as u8 + 1)).unwrap();
    }
    vault.new_account("A", 2, &["k1", "k2", "k3"]).unwrap();
}

/// Issues one output per value into `@default` of `account` and reports it
/// confirmed at height 100.
pub fn fund(vault: &Vault, account: &str, values: &[u64]) -> Vec<TxOut> {
    let txid = Txid::from_str(FUNDING_TXID).unwrap();
    let first_vout = vault
        .outputs_for_account(account, true)
        .unwrap()
        .iter()
        .filter(|o| o.outpoint.is_some())
        .count() as u32;
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let issued = vault.issue_output(account, "@default", "", *value).unwrap();
            vault
                .record_observed_output(
                    &issued.script,
                    *value,
                    OutPoint::new(txid, first_vout + i as u32),
                    Some(100),
                )
                .unwrap()
                .unwrap()
        })
        .collect()
}

pub fn foreign_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x51])
}
