use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::record::{KvRecord, LoadedValue};
use crate::token::AsyncToken;

/// Callback invoked with the key of a deleted record.
pub type DeleteListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`StorageWorker::subscribe_deletes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Capability boundary between the cache and the remote store.
///
/// Every operation returns a token so implementations are free to resolve it
/// inline or from a background task. Implementations must broadcast the key
/// of every successful [`delete`](StorageWorker::delete) to the delete
/// subscribers, whoever issued the delete.
pub trait StorageWorker: Send + Sync {
    /// Enumerate every record owned by the current principal.
    fn get_all(&self) -> AsyncToken<Vec<KvRecord>>;

    /// Allocate a new record holding `value`. The store assigns key, tags and
    /// version.
    fn create(&self, value: serde_json::Value) -> AsyncToken<KvRecord>;

    /// Fetch and decode the current value of `key`.
    fn load(&self, key: &str) -> AsyncToken<LoadedValue>;

    /// Write `value` under `key`, tagged `tags`, at `version`.
    fn save(&self, key: &str, value: serde_json::Value, tags: &str, version: u64)
        -> AsyncToken<()>;

    /// Delete `key`.
    fn delete(&self, key: &str) -> AsyncToken<()>;

    /// Register a listener for successful deletes.
    fn subscribe_deletes(&self, listener: DeleteListener) -> SubscriptionId;

    /// Remove a listener. Returns `false` if it was not registered.
    fn unsubscribe_deletes(&self, id: SubscriptionId) -> bool;
}

/// Subscription registry for delete notifications.
///
/// Workers embed one and forward `subscribe_deletes`/`unsubscribe_deletes`
/// to it, then call [`notify`](DeleteNotifier::notify) after a delete has
/// been acknowledged by the store.
#[derive(Default)]
pub struct DeleteNotifier {
    next_id: AtomicU64,
    listeners: DashMap<SubscriptionId, DeleteListener>,
}

impl fmt::Debug for DeleteNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl DeleteNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: DeleteListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Broadcast a deleted key to every listener.
    pub fn notify(&self, key: &str) {
        // Listeners may unsubscribe while running; never call them with a
        // shard guard held.
        let listeners: Vec<DeleteListener> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        debug!("Notifying {} listener(s) of delete {}", listeners.len(), key);
        for listener in listeners {
            listener(key);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
