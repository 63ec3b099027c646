use std::time::Duration;

use clap::Args;

/// Connection settings for the key-value REST API.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Base URL of the key-value API
    #[arg(long, default_value = "http://localhost:9999", env = "KV_BASE_URL")]
    pub base_url: String,

    /// Principal whose records are managed
    #[arg(long, env = "KV_USER_ID")]
    pub user_id: String,

    /// Bearer token sent with every request
    #[arg(long, env = "KV_API_TOKEN")]
    pub api_token: Option<String>,

    /// Request timeout (seconds)
    #[arg(long, default_value = "30", env = "KV_TIMEOUT_SECS")]
    pub timeout_secs: u64,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Collection endpoint for the configured principal.
    pub fn collection_url(&self) -> String {
        format!(
            "{}/user/{}/kv",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.user_id)
        )
    }

    /// Endpoint for a single record.
    pub fn record_url(&self, key: &str) -> String {
        format!("{}/{}", self.collection_url(), urlencoding::encode(key))
    }
}
