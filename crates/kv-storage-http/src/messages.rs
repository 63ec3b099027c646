//! Request and response bodies of the key-value REST API.

use kv_storage_core::StorageError;
use serde::{Deserialize, Serialize};

/// Envelope wrapping every response.
#[derive(Debug, Deserialize)]
pub struct KvResponse<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub body: Option<T>,
}

impl<T> KvResponse<T> {
    /// Body of a successful response; the server's error text otherwise.
    pub fn into_body(self) -> Result<Option<T>, StorageError> {
        if !self.success {
            return Err(StorageError::Transport(
                self.error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "Unknown KV error".to_string()),
            ));
        }
        Ok(self.body)
    }
}

/// Body of a create request.
#[derive(Debug, Serialize)]
pub struct CreateKvRequest<'a> {
    pub value: &'a serde_json::Value,
}

/// Body of an update request.
#[derive(Debug, Serialize)]
pub struct UpdateKvRequest<'a> {
    pub value: &'a serde_json::Value,
    pub tags: &'a str,
    pub version: u64,
}
