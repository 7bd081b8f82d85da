use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::DocumentSnapshot;

pub type SubscriptionId = u64;

/// Cancel switches of live subscriptions, keyed by id. Shared between the
/// registry and every handle so either side can end a subscription.
#[derive(Clone, Default)]
pub(crate) struct SubscriberTable {
    inner: Arc<Mutex<HashMap<SubscriptionId, watch::Sender<bool>>>>,
}

impl SubscriberTable {
    pub(crate) fn insert(&self, id: SubscriptionId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner.lock().insert(id, tx);
        rx
    }

    /// Flip the cancel switch and forget the entry. Returns false if it was already gone.
    pub(crate) fn cancel(&self, id: SubscriptionId) -> bool {
        let Some(tx) = self.inner.lock().remove(&id) else { return false; };
        tx.send_replace(true);
        true
    }

    pub(crate) fn len(&self) -> usize { self.inner.lock().len() }
}

/// Live view of the registry.
///
/// `next` yields the current snapshot on the first call, then each newer
/// version as it is published. Intermediate versions may be skipped when the
/// consumer is slower than the writers; snapshots are never partial. After
/// `unsubscribe` (here or on the registry) `next` returns `None`.
pub struct DocumentSubscription {
    id: SubscriptionId,
    snapshots: watch::Receiver<Arc<DocumentSnapshot>>,
    cancel: watch::Receiver<bool>,
    table: SubscriberTable,
    primed: bool,
}

impl DocumentSubscription {
    pub(crate) fn new(id: SubscriptionId, snapshots: watch::Receiver<Arc<DocumentSnapshot>>, table: SubscriberTable) -> Self {
        let cancel = table.insert(id);
        Self { id, snapshots, cancel, table, primed: false }
    }

    pub fn id(&self) -> SubscriptionId { self.id }

    pub fn is_active(&self) -> bool { !*self.cancel.borrow() }

    pub async fn next(&mut self) -> Option<Arc<DocumentSnapshot>> {
        if !self.is_active() { return None; }
        if !self.primed {
            self.primed = true;
            return Some(self.snapshots.borrow_and_update().clone());
        }
        tokio::select! {
            changed = self.snapshots.changed() => {
                if changed.is_err() { return None; }
            }
            cancelled = self.cancel.changed() => {
                if cancelled.is_err() { return None; }
            }
        }
        if !self.is_active() { return None; }
        Some(self.snapshots.borrow_and_update().clone())
    }

    /// Stop delivery. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        self.table.cancel(self.id);
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) { self.table.cancel(self.id); }
}
