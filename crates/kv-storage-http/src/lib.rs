//! HTTP transport for the kv-storage cache.
//!
//! - `KvClient`: REST client with rate-limit retry
//! - `HttpStorageWorker`: `StorageWorker` that runs client calls on a tokio runtime
//! - `Config`: connection settings, usable as flattened clap arguments

mod client;
mod config;
mod messages;
mod worker;

pub use client::KvClient;
pub use config::Config;
pub use messages::{CreateKvRequest, KvResponse, UpdateKvRequest};
pub use worker::HttpStorageWorker;
