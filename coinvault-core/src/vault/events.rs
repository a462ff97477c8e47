use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
};

use parking_lot::Mutex;

use crate::{ledger::TxOut, tx::TxStatus};

/// Notifications published after a mutation was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    VaultOpened { location: Option<PathBuf> },
    VaultClosed,
    KeychainInserted { name: String },
    /// A keychain's private key left the session.
    KeychainLocked { name: String },
    KeychainUnlocked { name: String },
    AccountInserted { name: String },
    OutputInserted(TxOut),
    OutputUpdated(TxOut),
    TxInserted { id: u64, status: TxStatus },
    TxUpdated { id: u64, status: TxStatus },
    TxDiscarded { id: u64 },
    BestHeightChanged(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&VaultEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl Observers {
    pub fn subscribe(&self, callback: impl Fn(&VaultEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn subscribe_channel(&self) -> mpsc::Receiver<VaultEvent> {
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        self.subscribe(move |event| {
            // receiver gone: nothing left to deliver to
            let _ = sender.lock().send(event.clone());
        });
        receiver
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Runs every callback on every event, in order. The registry is not
    /// locked while callbacks run, so they may subscribe or unsubscribe.
    pub fn notify(&self, events: &[VaultEvent]) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for event in events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_notify_unsubscribe() {
        let observers = Observers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = observers.subscribe(move |e| sink.lock().push(e.clone()));
        let channel = observers.subscribe_channel();

        observers.notify(&[VaultEvent::BestHeightChanged(7), VaultEvent::VaultClosed]);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(channel.try_recv().unwrap(), VaultEvent::BestHeightChanged(7));

        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&[VaultEvent::VaultClosed]);
        assert_eq!(seen.lock().len(), 2);
    }
}
