mod common;

use std::{collections::HashMap, str::FromStr, sync::Arc, thread};

use coinvault_core::{
    bitcoin::{absolute::Height, hashes::Hash, Amount, BlockHash, OutPoint, Txid},
    FoundOutput, LockRetryConfig, OutputStatus, Updater, Vault, VaultConfig, VaultUpdater,
};

use common::*;

fn patient_config() -> VaultConfig {
    VaultConfig {
        lock_retry: LockRetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 10,
            max_retries: 2000,
        },
        ..config()
    }
}

#[test]
fn writers_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(Vault::new(patient_config()));
    vault.open(vault_path(&dir), true).unwrap();

    let writers: Vec<_> = (0..8u8)
        .map(|i| {
            let vault = Arc::clone(&vault);
            thread::spawn(move || {
                vault
                    .new_keychain(&format!("k{i}"), &entropy(i + 1))
                    .unwrap();
            })
        })
        .collect();
    let reader = {
        let vault = Arc::clone(&vault);
        thread::spawn(move || {
            for _ in 0..50 {
                let count = vault.list_keychains().unwrap().len();
                assert!(count <= 8);
            }
        })
    };
    for handle in writers {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    let keychains = vault.list_keychains().unwrap();
    assert_eq!(keychains.len(), 8);

    // accounts built concurrently on the same keychains
    let accounts: Vec<_> = (0..4)
        .map(|i| {
            let vault = Arc::clone(&vault);
            thread::spawn(move || {
                vault
                    .new_account(&format!("acct{i}"), 2, &["k0", "k1", "k2"])
                    .unwrap()
            })
        })
        .collect();
    let mut ids: Vec<u64> = accounts.into_iter().map(|h| h.join().unwrap().id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    // everything survives a reopen
    vault.close().unwrap();
    vault.open(vault_path(&dir), false).unwrap();
    assert_eq!(vault.list_accounts().unwrap().len(), 4);
}

#[test]
fn account_and_keychain_writers_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(Vault::new(patient_config()));
    vault.open(vault_path(&dir), true).unwrap();
    for i in 0..3u8 {
        vault.new_keychain(&format!("k{i}"), &entropy(i + 1)).unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let accounts = Arc::clone(&vault);
        handles.push(thread::spawn(move || {
            accounts
                .new_account(&format!("acct{i}"), 2, &["k0", "k1", "k2"])
                .unwrap();
        }));
        let keychains = Arc::clone(&vault);
        handles.push(thread::spawn(move || {
            keychains
                .new_keychain(&format!("extra{i}"), &entropy(i + 10))
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let check = |vault: &Vault| {
        for i in 0..4 {
            assert!(vault.account_exists(&format!("acct{i}")).unwrap());
            assert!(vault.keychain_exists(&format!("extra{i}")).unwrap());
            assert_eq!(vault.bin_info(&format!("acct{i}"), "@default").unwrap().unused_scripts, 3);
        }
        assert_eq!(vault.list_keychains().unwrap().len(), 7);
        assert_eq!(vault.list_accounts().unwrap().len(), 4);
    };
    check(&vault);
    vault.close().unwrap();
    vault.open(vault_path(&dir), false).unwrap();
    check(&vault);
}

#[test]
fn updater_applies_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(Vault::new(patient_config()));
    vault.open(vault_path(&dir), true).unwrap();
    two_of_three(&vault);
    let issued = vault.issue_output("A", "@default", "invoice 7", 0).unwrap();
    let pooled = vault.bin_info("A", "@default").unwrap();

    let mut updater = VaultUpdater::new(Arc::clone(&vault));
    let funding = Txid::from_str(FUNDING_TXID).unwrap();
    let blkhash = BlockHash::all_zeros();
    let height = Height::from_consensus(150).unwrap();

    let mut found = HashMap::new();
    found.insert(
        OutPoint::new(funding, 0),
        FoundOutput {
            script_pubkey: issued.script.clone(),
            value: Amount::from_sat(40_000),
        },
    );
    found.insert(
        OutPoint::new(funding, 1),
        FoundOutput {
            script_pubkey: foreign_script(),
            value: Amount::from_sat(1_000),
        },
    );
    updater.record_block_outputs(height, blkhash, found).unwrap();
    updater
        .record_scan_progress(Height::from_consensus(100).unwrap(), height, height)
        .unwrap();
    updater.save_to_persistent_storage().unwrap();

    assert_eq!(vault.best_height().unwrap(), 150);
    assert_eq!(vault.balance("A").unwrap(), 40_000);
    let outputs = vault.outputs_for_account("A", false).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].label, "invoice 7");
    assert_eq!(outputs[0].height, Some(150));
    assert_eq!(outputs[0].status, OutputStatus::Unspent);

    // the issued script had already left the pool
    let next = vault.bin_info("A", "@default").unwrap();
    assert_eq!(next.unused_scripts, pooled.unused_scripts);

    let spender = Txid::from_byte_array([7; 32]);
    let mut spent = HashMap::new();
    spent.insert(OutPoint::new(funding, 0), spender);
    spent.insert(OutPoint::new(funding, 1), spender);
    updater
        .record_block_inputs(Height::from_consensus(151).unwrap(), blkhash, spent)
        .unwrap();

    assert_eq!(vault.balance("A").unwrap(), 0);
    let all = vault.outputs_for_account("A", true).unwrap();
    assert_eq!(all[0].status, OutputStatus::Spent);
    assert_eq!(all[0].spending_txid, Some(spender));
}
