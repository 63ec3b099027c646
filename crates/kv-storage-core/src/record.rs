use serde::{Deserialize, Serialize};

/// A key-value record as the remote store describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    /// Stable identity, assigned by the store on create
    pub key: String,
    /// Opaque serialized payload
    #[serde(default)]
    pub value: String,
    /// Principal owning the record
    #[serde(default)]
    pub owner: String,
    /// Free-form tags, matched by substring
    #[serde(default)]
    pub tags: String,
    /// Version assigned by the store
    #[serde(default)]
    pub version: u64,
}

/// Result of loading a single record's value.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedValue {
    /// Decoded payload
    pub value: serde_json::Value,
    /// Version of the record the payload was read from
    pub version: u64,
}
