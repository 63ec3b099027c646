use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::record::{KvRecord, LoadedValue};
use crate::token::AsyncToken;
use crate::worker::{DeleteListener, DeleteNotifier, StorageWorker, SubscriptionId};

/// Number of calls made to each worker operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_all: usize,
    pub create: usize,
    pub load: usize,
    pub save: usize,
    pub delete: usize,
}

#[derive(Debug, Default)]
struct Counters {
    get_all: AtomicUsize,
    create: AtomicUsize,
    load: AtomicUsize,
    save: AtomicUsize,
    delete: AtomicUsize,
}

/// In-process worker.
///
/// Behaves like the remote store: keys are assigned on create (`kv-{n}`),
/// records start at version 0, and a save must name exactly the next version
/// of the record. Every token it returns is already resolved.
#[derive(Debug)]
pub struct MemoryStorageWorker {
    owner: String,
    /// Records in creation order
    records: Mutex<Vec<KvRecord>>,
    next_key: AtomicU64,
    notifier: DeleteNotifier,
    counters: Counters,
}

impl Default for MemoryStorageWorker {
    fn default() -> Self {
        Self::new("local")
    }
}

impl MemoryStorageWorker {
    /// Create an empty store owned by `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            records: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(0),
            notifier: DeleteNotifier::new(),
            counters: Counters::default(),
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<KvRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a record, as another client writing to the store
    /// would. Does not count as a call.
    pub fn upsert_record(&self, record: KvRecord) {
        let mut records = self.records();
        match records.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Snapshot of the stored records.
    pub fn snapshot(&self) -> Vec<KvRecord> {
        self.records().clone()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            get_all: self.counters.get_all.load(Ordering::SeqCst),
            create: self.counters.create.load(Ordering::SeqCst),
            load: self.counters.load.load(Ordering::SeqCst),
            save: self.counters.save.load(Ordering::SeqCst),
            delete: self.counters.delete.load(Ordering::SeqCst),
        }
    }

    fn not_found(key: &str) -> StorageError {
        StorageError::Transport(format!("kv not found: {}", key))
    }

    fn encode(value: &serde_json::Value) -> Result<String, StorageError> {
        serde_json::to_string(value).map_err(StorageError::from)
    }
}

impl StorageWorker for MemoryStorageWorker {
    #[instrument(skip(self), level = "debug")]
    fn get_all(&self) -> AsyncToken<Vec<KvRecord>> {
        self.counters.get_all.fetch_add(1, Ordering::SeqCst);
        let records = self.snapshot();
        debug!("Listed {} records", records.len());
        AsyncToken::succeeded(records)
    }

    #[instrument(skip(self, value), level = "debug")]
    fn create(&self, value: serde_json::Value) -> AsyncToken<KvRecord> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        let encoded = match Self::encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => return AsyncToken::failed(e),
        };

        let record = KvRecord {
            key: format!("kv-{}", self.next_key.fetch_add(1, Ordering::SeqCst)),
            value: encoded,
            owner: self.owner.clone(),
            tags: String::new(),
            version: 0,
        };
        self.records().push(record.clone());
        debug!("Created {}", record.key);
        AsyncToken::succeeded(record)
    }

    #[instrument(skip(self), level = "debug")]
    fn load(&self, key: &str) -> AsyncToken<LoadedValue> {
        self.counters.load.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .records()
            .iter()
            .find(|r| r.key == key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
            .and_then(|record| {
                let value = serde_json::from_str(&record.value)?;
                Ok(LoadedValue {
                    value,
                    version: record.version,
                })
            });
        AsyncToken::from_result(outcome)
    }

    #[instrument(skip(self, value), level = "debug")]
    fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        tags: &str,
        version: u64,
    ) -> AsyncToken<()> {
        self.counters.save.fetch_add(1, Ordering::SeqCst);
        let encoded = match Self::encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => return AsyncToken::failed(e),
        };

        let mut records = self.records();
        let Some(record) = records.iter_mut().find(|r| r.key == key) else {
            return AsyncToken::failed(Self::not_found(key));
        };

        if version != record.version + 1 {
            debug!(
                "Rejecting save of {} at version {} (current {})",
                key, version, record.version
            );
            return AsyncToken::failed(StorageError::transport("version conflict"));
        }

        record.value = encoded;
        record.tags = tags.to_string();
        record.version = version;
        AsyncToken::succeeded(())
    }

    #[instrument(skip(self), level = "debug")]
    fn delete(&self, key: &str) -> AsyncToken<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        let removed = {
            let mut records = self.records();
            records
                .iter()
                .position(|r| r.key == key)
                .map(|index| records.remove(index))
        };

        match removed {
            Some(_) => {
                self.notifier.notify(key);
                AsyncToken::succeeded(())
            }
            None => AsyncToken::failed(Self::not_found(key)),
        }
    }

    fn subscribe_deletes(&self, listener: DeleteListener) -> SubscriptionId {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe_deletes(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}
