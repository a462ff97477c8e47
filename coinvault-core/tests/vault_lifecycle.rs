mod common;

use std::{
    sync::{mpsc, Arc, Mutex, Weak},
    thread,
};

use coinvault_core::{Error, MemoryStore, Vault, VaultEvent, VaultRecords, VaultStore};

use common::*;

#[test]
fn reopen_restores_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    two_of_three(&vault);
    let issued = vault.issue_output("A", "@default", "invoice 7", 1_000).unwrap();
    vault.close().unwrap();

    let vault = Vault::new(config());
    vault.open(vault_path(&dir), false).unwrap();
    assert!(vault.keychain_exists("k1").unwrap());
    assert!(vault.account_exists("A").unwrap());
    let outputs = vault.outputs_for_account("A", false).unwrap();
    assert_eq!(outputs, vec![issued]);

    // unlocked material does not survive a close
    let status = vault.encryption_status("k1").unwrap();
    assert!(status.is_private && status.is_locked && !status.is_encrypted);
}

#[test]
fn closed_vault_rejects_calls() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    two_of_three(&vault);
    vault.close().unwrap();

    assert!(matches!(vault.account_info("A"), Err(Error::VaultNotOpen)));
    assert!(matches!(
        vault.new_keychain("k4", &entropy(4)),
        Err(Error::VaultNotOpen)
    ));
    assert!(matches!(vault.close(), Err(Error::VaultNotOpen)));
}

#[test]
fn open_errors() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::new(config());
    assert!(matches!(
        vault.open(vault_path(&dir), false),
        Err(Error::StoreOpenError(_))
    ));

    std::fs::write(vault_path(&dir), b"garbage").unwrap();
    assert!(matches!(
        vault.open(vault_path(&dir), true),
        Err(Error::StoreOpenError(_))
    ));
    assert!(!vault.is_open());
}

#[test]
fn failed_commit_leaves_no_trace() {
    let store = MemoryStore::new();
    let vault = Vault::new(config());
    vault.open_store(store.clone()).unwrap();
    vault.new_keychain("k1", &entropy(1)).unwrap();
    let commits = store.commit_count();

    store.set_fail_commits(true);
    assert!(matches!(
        vault.new_account("A", 1, &["k1"]),
        Err(Error::Io(_))
    ));
    assert!(!vault.account_exists("A").unwrap());
    assert_eq!(store.commit_count(), commits);

    store.set_fail_commits(false);
    vault.new_account("A", 1, &["k1"]).unwrap();
    assert_eq!(store.commit_count(), commits + 1);
    assert!(store.snapshot().is_some());
    assert!(vault.account_exists("A").unwrap());
}

#[test]
fn failed_operation_rolls_back_partial_work() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    vault.new_keychain("k1", &entropy(1)).unwrap();
    vault.new_account("A", 1, &["k1"]).unwrap();
    vault.lock_keychain("k1").unwrap();

    // drain the pool; the next issue needs k1
    for _ in 0..3 {
        vault.issue_output("A", "@default", "", 0).unwrap();
    }
    let before = vault.bin_info("A", "@default").unwrap();
    assert!(matches!(
        vault.issue_output("A", "@default", "", 0),
        Err(Error::KeychainLocked(_))
    ));
    assert_eq!(vault.bin_info("A", "@default").unwrap(), before);
    assert_eq!(vault.outputs_for_account("A", true).unwrap().len(), 3);
}

#[test]
fn events_follow_commits() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::new(config());
    let events = vault.subscribe_channel();
    vault.open(vault_path(&dir), true).unwrap();
    vault.new_keychain("k1", &entropy(1)).unwrap();
    vault.new_account("A", 1, &["k1"]).unwrap();
    let issued = vault.issue_output("A", "@default", "", 5).unwrap();
    vault.set_best_height(42).unwrap();
    vault.set_best_height(42).unwrap();
    vault.close().unwrap();

    let seen: Vec<VaultEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            VaultEvent::VaultOpened {
                location: Some(vault_path(&dir))
            },
            VaultEvent::KeychainInserted {
                name: "k1".to_string()
            },
            VaultEvent::AccountInserted {
                name: "A".to_string()
            },
            VaultEvent::OutputInserted(issued),
            VaultEvent::BestHeightChanged(42),
            VaultEvent::VaultClosed,
        ]
    );
}

#[test]
fn locking_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    vault.new_keychain("k1", &entropy(1)).unwrap();
    vault.set_keychain_passphrase("k1", b"pw").unwrap();
    let events = vault.subscribe_channel();

    vault.lock_keychain("k1").unwrap();
    assert!(vault.unlock_keychain("k1", b"wrong").is_err());
    vault.unlock_keychain("k1", b"pw").unwrap();
    vault.lock_all_keychains().unwrap();

    let seen: Vec<VaultEvent> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![
            VaultEvent::KeychainLocked {
                name: "k1".to_string()
            },
            VaultEvent::KeychainUnlocked {
                name: "k1".to_string()
            },
            VaultEvent::KeychainLocked {
                name: "k1".to_string()
            },
        ]
    );
}

#[test]
fn reentrant_mutation_from_callback_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(open_vault(&dir));
    let outcome = Arc::new(Mutex::new(Vec::new()));

    let weak: Weak<Vault> = Arc::downgrade(&vault);
    let sink = Arc::clone(&outcome);
    vault.subscribe(move |event| {
        if let (VaultEvent::KeychainInserted { .. }, Some(vault)) = (event, weak.upgrade()) {
            // reads work, writes are refused
            let exists = vault.keychain_exists("k1");
            let write = vault.new_keychain("k2", &entropy(2));
            sink.lock().unwrap().push((exists.ok(), write.err()));
        }
    });

    vault.new_keychain("k1", &entropy(1)).unwrap();
    let outcome = outcome.lock().unwrap();
    assert_eq!(outcome.len(), 1);
    assert_eq!(outcome[0].0, Some(true));
    assert!(matches!(outcome[0].1, Some(Error::VaultBusy)));
    assert!(!vault.keychain_exists("k2").unwrap());
}

#[test]
fn chain_code_passphrase_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    vault.new_keychain("k1", &entropy(1)).unwrap();
    vault.set_chain_code_passphrase(b"1234").unwrap();
    vault.close().unwrap();

    let vault = Vault::new(config());
    vault.open(vault_path(&dir), false).unwrap();
    assert!(matches!(
        vault.export_public_keychain("k1"),
        Err(Error::ChainCodesLocked)
    ));
    assert!(matches!(
        vault.unlock_chain_codes(b"4321"),
        Err(Error::InvalidPassphrase)
    ));
    vault.unlock_chain_codes(b"1234").unwrap();
    assert!(vault.export_public_keychain("k1").unwrap().starts_with("tpub"));
}

#[test]
fn deletion_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let vault = open_vault(&dir);
    vault.new_keychain("k1", &entropy(1)).unwrap();
    vault.new_account("A", 1, &["k1"]).unwrap();
    assert!(matches!(vault.erase_keychain("k1"), Err(Error::Unsupported(_))));
    assert!(matches!(vault.delete_account("A"), Err(Error::Unsupported(_))));
    assert!(vault.keychain_exists("k1").unwrap());
}

/// Store whose commits after the first wait to be released.
struct GatedStore {
    commits: usize,
    entered: mpsc::SyncSender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl VaultStore for GatedStore {
    fn load(&mut self) -> coinvault_core::Result<Option<VaultRecords>> {
        Ok(None)
    }

    fn commit(&mut self, _records: &VaultRecords) -> coinvault_core::Result<()> {
        self.commits += 1;
        if self.commits > 1 {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(())
    }
}

#[test]
fn queries_do_not_wait_for_commits() {
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::channel();
    let vault = Arc::new(Vault::new(config()));
    vault
        .open_store(GatedStore {
            commits: 0,
            entered: entered_tx,
            release: Mutex::new(release_rx),
        })
        .unwrap();

    let writer = {
        let vault = Arc::clone(&vault);
        thread::spawn(move || vault.new_keychain("k1", &entropy(1)).map(|info| info.name))
    };
    entered_rx.recv().unwrap();

    // the commit is in flight: queries see the previous state
    assert!(vault.is_open());
    assert!(!vault.keychain_exists("k1").unwrap());
    assert!(vault.list_keychains().unwrap().is_empty());
    assert!(matches!(
        vault.new_keychain("k2", &entropy(2)),
        Err(Error::VaultBusy)
    ));

    release_tx.send(()).unwrap();
    assert_eq!(writer.join().unwrap().unwrap(), "k1");
    assert!(vault.keychain_exists("k1").unwrap());
}
