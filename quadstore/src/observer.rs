//! Store listeners.
//!
//! Listeners are registered on a store and called synchronously, on the
//! connection's thread, as statements are added or removed and as
//! transactions end. Additions and removals are reported when the
//! connection performs them, before the transaction commits.

use std::sync::{Arc, RwLock};

use crate::types::Statement;

/// Callbacks for store events. Every method defaults to doing nothing.
pub trait StoreListener: Send + Sync {
    fn statement_added(&self, _statement: &Statement) {}

    fn statement_removed(&self, _statement: &Statement) {}

    /// A transaction with this id committed.
    fn transaction_committed(&self, _txn: u64) {}

    /// A transaction with this id rolled back.
    fn transaction_rolled_back(&self, _txn: u64) {}
}

/// The listeners registered on one store.
#[derive(Default)]
pub struct Listeners {
    list: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn StoreListener>) {
        let mut list = match self.list.write() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };
        list.push(listener);
    }

    /// Unregister `listener`. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn StoreListener>) -> bool {
        let mut list = match self.list.write() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = list.len();
        list.retain(|registered| !Arc::ptr_eq(registered, listener));
        list.len() != before
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn StoreListener>> {
        match self.list.read() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Call `event` on every listener.
    ///
    /// Runs on a copy of the list, so listeners may register or remove
    /// listeners from inside a callback.
    pub fn notify(&self, event: impl Fn(&dyn StoreListener)) {
        for listener in self.snapshot() {
            event(listener.as_ref());
        }
    }
}
