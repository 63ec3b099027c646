//! Versioned cache entry for one remote key.
//!
//! A bucket tracks two versions: the one its cached value reflects
//! (`observed`) and the latest one the manifest has learned about
//! (`manifest`). It is clean when they are equal and stale otherwise.
//! Saves and deletes are only issued from a clean bucket; a stale bucket
//! rejects them locally without calling the worker.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::record::LoadedValue;
use crate::token::{AsyncToken, Outcome};
use crate::worker::StorageWorker;

/// What a bucket currently holds for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// Nothing loaded yet, or cleared by a delete.
    Unloaded,
    /// Value matching the observed version, which is the latest known one.
    Loaded(serde_json::Value),
    /// Last loaded value; a newer version is known and must be reloaded.
    Invalidated(serde_json::Value),
}

impl CachedValue {
    /// The held value regardless of freshness.
    pub fn last_known(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Unloaded => None,
            Self::Loaded(value) | Self::Invalidated(value) => Some(value),
        }
    }
}

struct BucketState {
    tags: String,
    observed_version: u64,
    manifest_version: u64,
    cached: CachedValue,
    /// Outstanding load shared by concurrent `value()` calls.
    load: Option<AsyncToken<serde_json::Value>>,
}

impl BucketState {
    fn is_clean(&self) -> bool {
        self.observed_version == self.manifest_version
    }

    fn check_fresh(&self, key: &str) -> Result<(), StorageError> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(StorageError::StaleVersion {
                key: key.to_string(),
                observed: self.observed_version,
                manifest: self.manifest_version,
            })
        }
    }

    /// Record `value` as observed at `version`, keeping
    /// `observed_version <= manifest_version`.
    fn observe(&mut self, value: serde_json::Value, version: u64) {
        self.observed_version = version;
        self.manifest_version = self.manifest_version.max(version);
        self.cached = if self.is_clean() {
            CachedValue::Loaded(value)
        } else {
            CachedValue::Invalidated(value)
        };
    }
}

struct BucketInner {
    key: String,
    worker: Arc<dyn StorageWorker>,
    state: Mutex<BucketState>,
}

/// Cache entry for one key. Clones are handles to the same entry.
#[derive(Clone)]
pub struct StorageBucket {
    inner: Arc<BucketInner>,
}

impl fmt::Debug for StorageBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("StorageBucket")
            .field("key", &self.inner.key)
            .field("tags", &state.tags)
            .field("observed_version", &state.observed_version)
            .field("manifest_version", &state.manifest_version)
            .finish()
    }
}

impl StorageBucket {
    /// Create a clean, unloaded bucket at `version`.
    pub fn new(
        worker: Arc<dyn StorageWorker>,
        key: impl Into<String>,
        tags: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            inner: Arc::new(BucketInner {
                key: key.into(),
                worker,
                state: Mutex::new(BucketState {
                    tags: tags.into(),
                    observed_version: version,
                    manifest_version: version,
                    cached: CachedValue::Unloaded,
                    load: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn tags(&self) -> String {
        self.lock().tags.clone()
    }

    /// Replace the tags sent with the next save. Does not change versions.
    pub fn set_tags(&self, tags: impl Into<String>) {
        self.lock().tags = tags.into();
    }

    pub(crate) fn has_tag(&self, tag: &str) -> bool {
        self.lock().tags.contains(tag)
    }

    pub fn observed_version(&self) -> u64 {
        self.lock().observed_version
    }

    pub fn manifest_version(&self) -> u64 {
        self.lock().manifest_version
    }

    pub fn is_stale(&self) -> bool {
        !self.lock().is_clean()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().load.is_some()
    }

    /// Snapshot of the cached value.
    pub fn cached(&self) -> CachedValue {
        self.lock().cached.clone()
    }

    /// Whether both handles refer to the same entry.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current value of the key.
    ///
    /// Resolves inline from the cache when the bucket is clean and loaded.
    /// Otherwise loads through the worker; calls made while a load is
    /// outstanding share it.
    pub fn value(&self) -> AsyncToken<serde_json::Value> {
        let token = {
            let mut state = self.lock();
            if let (true, CachedValue::Loaded(value)) = (state.is_clean(), &state.cached) {
                return AsyncToken::succeeded(value.clone());
            }
            if let Some(in_flight) = &state.load {
                debug!("Joining in-flight load of {}", self.inner.key);
                return in_flight.clone();
            }
            let token = AsyncToken::new();
            state.load = Some(token.clone());
            token
        };

        debug!("Loading {}", self.inner.key);
        let bucket = self.clone();
        let resolver = token.clone();
        self.inner
            .worker
            .load(&self.inner.key)
            .on_complete(move |outcome| {
                let outcome = bucket.finish_load(outcome);
                resolver.resolve(outcome);
            });

        token
    }

    /// Current value decoded into `T`.
    pub fn value_as<T>(&self) -> AsyncToken<T>
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        self.value()
            .and_then(|value| serde_json::from_value(value).map_err(StorageError::from))
    }

    fn finish_load(&self, outcome: Outcome<LoadedValue>) -> Outcome<serde_json::Value> {
        let mut state = self.lock();
        state.load = None;

        match outcome {
            Ok(loaded) if loaded.version < state.observed_version => {
                // A save finished while this load was in flight.
                debug!(
                    "Ignoring load of {} at version {} (observed {})",
                    self.inner.key, loaded.version, state.observed_version
                );
                Ok(state.cached.last_known().cloned().unwrap_or(loaded.value))
            }
            Ok(loaded) => {
                state.observe(loaded.value.clone(), loaded.version);
                debug!("Loaded {} at version {}", self.inner.key, loaded.version);
                Ok(loaded.value)
            }
            Err(e) => {
                warn!("Failed to load {}: {}", self.inner.key, e);
                Err(e)
            }
        }
    }

    /// Write a new value at `observed_version + 1`.
    ///
    /// Fails with [`StorageError::StaleVersion`] without calling the worker if
    /// the bucket is stale. Resolves with the new version.
    pub fn save(&self, value: serde_json::Value) -> AsyncToken<u64> {
        let (tags, next_version) = {
            let state = self.lock();
            if let Err(e) = state.check_fresh(&self.inner.key) {
                debug!("Rejecting save: {}", e);
                return AsyncToken::failed(e);
            }
            (state.tags.clone(), state.observed_version + 1)
        };

        debug!("Saving {} at version {}", self.inner.key, next_version);
        let saved = self
            .inner
            .worker
            .save(&self.inner.key, value.clone(), &tags, next_version);

        let key = self.inner.key.clone();
        saved.on_failure(move |e| warn!("Failed to save {}: {}", key, e));

        let bucket = self.clone();
        saved.map(move |()| {
            bucket.lock().observe(value, next_version);
            next_version
        })
    }

    /// Serialize `value` and [`save`](Self::save) it.
    pub fn save_as<T: Serialize>(&self, value: &T) -> AsyncToken<u64> {
        match serde_json::to_value(value) {
            Ok(value) => self.save(value),
            Err(e) => AsyncToken::failed(e.into()),
        }
    }

    /// Delete the key remotely and clear the cache.
    ///
    /// Same staleness guard as [`save`](Self::save). Membership in a
    /// [`StorageService`](crate::StorageService) is left alone; the service
    /// drops the bucket when the worker reports the delete.
    pub fn delete(&self) -> AsyncToken<()> {
        if let Err(e) = self.lock().check_fresh(&self.inner.key) {
            debug!("Rejecting delete: {}", e);
            return AsyncToken::failed(e);
        }

        debug!("Deleting {}", self.inner.key);
        let deleted = self.inner.worker.delete(&self.inner.key);

        let key = self.inner.key.clone();
        deleted.on_failure(move |e| warn!("Failed to delete {}: {}", key, e));

        let bucket = self.clone();
        deleted.map(move |()| {
            bucket.lock().cached = CachedValue::Unloaded;
        })
    }

    /// Raise the manifest version to `manifest_version`.
    ///
    /// Never lowers it. A loaded value older than the new manifest version is
    /// marked invalidated.
    pub fn version_update(&self, manifest_version: u64) {
        let mut state = self.lock();
        if manifest_version <= state.manifest_version {
            return;
        }

        debug!(
            "Manifest version of {}: {} -> {}",
            self.inner.key, state.manifest_version, manifest_version
        );
        state.manifest_version = manifest_version;

        if let CachedValue::Loaded(value) =
            std::mem::replace(&mut state.cached, CachedValue::Unloaded)
        {
            state.cached = CachedValue::Invalidated(value);
        }
    }
}
