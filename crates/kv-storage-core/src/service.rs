use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bucket::StorageBucket;
use crate::record::KvRecord;
use crate::token::AsyncToken;
use crate::worker::{StorageWorker, SubscriptionId};

struct ServiceInner {
    worker: Arc<dyn StorageWorker>,
    /// Buckets in discovery order, unique by key
    buckets: Mutex<Vec<StorageBucket>>,
    /// Outstanding refresh, joined by overlapping callers
    refresh: Mutex<Option<AsyncToken<StorageService>>>,
    subscription: SubscriptionId,
}

impl ServiceInner {
    fn buckets(&self) -> MutexGuard<'_, Vec<StorageBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_slot(&self) -> MutexGuard<'_, Option<AsyncToken<StorageService>>> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delete notification handler. The only path that removes buckets.
    fn remove_bucket(&self, key: &str) {
        let mut buckets = self.buckets();
        if let Some(index) = buckets.iter().position(|b| b.key() == key) {
            buckets.remove(index);
            debug!("Removed bucket {} ({} left)", key, buckets.len());
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.worker.unsubscribe_deletes(self.subscription);
    }
}

/// Manifest of every bucket owned by the current principal.
///
/// Buckets are added by [`refresh`](Self::refresh) and
/// [`create`](Self::create) and removed only when the worker reports that
/// their key was deleted. Clones are handles to the same manifest; the delete
/// subscription is released when the last handle is dropped.
#[derive(Clone)]
pub struct StorageService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for StorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageService")
            .field("buckets", &self.inner.buckets().len())
            .field("refreshing", &self.inner.refresh_slot().is_some())
            .finish()
    }
}

impl StorageService {
    /// Create an empty manifest and subscribe to the worker's deletes.
    pub fn new(worker: Arc<dyn StorageWorker>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ServiceInner>| {
            let weak = weak.clone();
            let subscription = worker.subscribe_deletes(Arc::new(move |key: &str| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_bucket(key);
                }
            }));

            ServiceInner {
                worker,
                buckets: Mutex::new(Vec::new()),
                refresh: Mutex::new(None),
                subscription,
            }
        });

        Self { inner }
    }

    /// Reconcile the manifest against the remote listing.
    ///
    /// While a refresh is outstanding every call returns the same token, so
    /// the worker is asked for the listing once per burst. Resolves with the
    /// service itself.
    pub fn refresh(&self) -> AsyncToken<StorageService> {
        let token = {
            let mut slot = self.inner.refresh_slot();
            if let Some(in_flight) = slot.as_ref() {
                debug!("Joining in-flight refresh");
                return in_flight.clone();
            }
            let token = AsyncToken::new();
            *slot = Some(token.clone());
            token
        };

        debug!("Refreshing manifest");
        let service = self.clone();
        let resolver = token.clone();
        self.inner.worker.get_all().on_complete(move |outcome| {
            service.inner.refresh_slot().take();

            match outcome {
                Ok(records) => {
                    service.fold(records);
                    resolver.succeed(service.clone());
                }
                Err(e) => {
                    warn!("Manifest refresh failed: {}", e);
                    resolver.fail(e);
                }
            }
        });

        token
    }

    fn fold(&self, records: Vec<KvRecord>) {
        let mut buckets = self.inner.buckets();
        let mut discovered = 0usize;

        for record in records {
            let bucket = match buckets.iter().find(|b| b.key() == record.key) {
                Some(bucket) => bucket.clone(),
                None => {
                    let bucket = StorageBucket::new(
                        Arc::clone(&self.inner.worker),
                        record.key,
                        record.tags,
                        record.version,
                    );
                    buckets.push(bucket.clone());
                    discovered += 1;
                    bucket
                }
            };

            bucket.version_update(record.version);
        }

        info!(
            "Manifest refreshed: {} buckets ({} new)",
            buckets.len(),
            discovered
        );
    }

    /// Allocate a new record for `value` and add its bucket to the manifest.
    pub fn create(&self, value: serde_json::Value) -> AsyncToken<StorageBucket> {
        let service = self.clone();
        self.inner.worker.create(value).map(move |record| service.adopt(record))
    }

    /// Serialize `value` and [`create`](Self::create) a record for it.
    pub fn create_as<T: Serialize>(&self, value: &T) -> AsyncToken<StorageBucket> {
        match serde_json::to_value(value) {
            Ok(value) => self.create(value),
            Err(e) => AsyncToken::failed(e.into()),
        }
    }

    fn adopt(&self, record: KvRecord) -> StorageBucket {
        let mut buckets = self.inner.buckets();

        // A refresh may have discovered the record before the create returned.
        if let Some(existing) = buckets.iter().find(|b| b.key() == record.key) {
            existing.version_update(record.version);
            return existing.clone();
        }

        let bucket = StorageBucket::new(
            Arc::clone(&self.inner.worker),
            record.key,
            record.tags,
            record.version,
        );
        buckets.push(bucket.clone());
        debug!("Created bucket {}", bucket.key());
        bucket
    }

    /// Every bucket, in manifest order.
    pub fn all(&self) -> Vec<StorageBucket> {
        self.inner.buckets().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.buckets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buckets().is_empty()
    }

    /// Bucket with exactly this key.
    pub fn get(&self, key: &str) -> Option<StorageBucket> {
        self.inner
            .buckets()
            .iter()
            .find(|b| b.key() == key)
            .cloned()
    }

    /// First bucket whose tags contain `tag` as a substring.
    pub fn find_one(&self, tag: &str) -> Option<StorageBucket> {
        self.inner
            .buckets()
            .iter()
            .find(|b| b.has_tag(tag))
            .cloned()
    }

    /// Every bucket whose tags contain `tag` as a substring, in manifest
    /// order.
    pub fn find_all(&self, tag: &str) -> Vec<StorageBucket> {
        self.inner
            .buckets()
            .iter()
            .filter(|b| b.has_tag(tag))
            .cloned()
            .collect()
    }
}
