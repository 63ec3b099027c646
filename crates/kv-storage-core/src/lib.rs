//! Client-side cache of remote key-value records with optimistic concurrency.
//!
//! This crate defines the pieces shared by every transport:
//! - `AsyncToken`: Single-resolution result shared by concurrent callers
//! - `StorageWorker`: Capability boundary to the remote store, with delete notifications
//! - `StorageBucket`: Versioned cache entry for one key
//! - `StorageService`: Manifest of all buckets for the current principal
//! - `MemoryStorageWorker`: In-process store for embedding and tests

mod bucket;
mod error;
mod memory;
mod record;
mod service;
mod token;
mod worker;

#[cfg(test)]
mod testing;

pub use bucket::{CachedValue, StorageBucket};
pub use error::{ErrorKind, StorageError};
pub use memory::{CallCounts, MemoryStorageWorker};
pub use record::{KvRecord, LoadedValue};
pub use service::StorageService;
pub use token::{AsyncToken, Outcome};
pub use worker::{DeleteListener, DeleteNotifier, StorageWorker, SubscriptionId};
