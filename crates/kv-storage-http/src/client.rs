use std::time::Duration;

use kv_storage_core::{KvRecord, StorageError};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::messages::{CreateKvRequest, KvResponse, UpdateKvRequest};

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;

/// Key-value REST API client.
///
/// Endpoints are templated by principal: the collection endpoint enumerates
/// and creates, the key-suffixed endpoint loads, saves and deletes.
/// All requests use exponential backoff retry on 429 (rate limit).
#[derive(Debug, Clone)]
pub struct KvClient {
    http_client: HttpClient,
    config: Config,
}

impl KvClient {
    /// Create a new client.
    pub fn new(config: Config) -> Result<Self, StorageError> {
        let http_client = HttpClient::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StorageError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request with exponential backoff retry on 429.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response, StorageError> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);

        for attempt in 0..=MAX_RETRIES {
            let response = self
                .authorize(build_request())
                .send()
                .await
                .map_err(|e| StorageError::Transport(format!("KV request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt == MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                return Err(StorageError::Transport(format!(
                    "KV rate limited after {} retries: {}",
                    MAX_RETRIES, text
                )));
            }

            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "KV rate limited (429), retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        unreachable!()
    }

    /// Unwrap the response envelope.
    ///
    /// A parseable envelope wins over the HTTP status so the server's own
    /// error text reaches the caller.
    async fn read_envelope<T: DeserializeOwned>(
        op: &str,
        response: Response,
    ) -> Result<Option<T>, StorageError> {
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            StorageError::Transport(format!("Failed to read KV {} response: {}", op, e))
        })?;

        match serde_json::from_str::<KvResponse<T>>(&text) {
            Ok(envelope) => envelope.into_body(),
            Err(e) if status.is_success() => Err(StorageError::Transport(format!(
                "Invalid KV {} response: {}",
                op, e
            ))),
            Err(_) => Err(StorageError::Transport(format!(
                "KV {} failed with status {}: {}",
                op, status, text
            ))),
        }
    }

    fn require_body<T>(op: &str, body: Option<T>) -> Result<T, StorageError> {
        body.ok_or_else(|| StorageError::Transport(format!("KV {} response has no body", op)))
    }

    /// List every record of the principal.
    #[instrument(skip(self), level = "debug")]
    pub async fn list(&self) -> Result<Vec<KvRecord>, StorageError> {
        let url = self.config.collection_url();

        let response = self
            .send_with_retry(|| self.http_client.get(&url))
            .await?;

        let records: Vec<KvRecord> =
            Self::require_body("LIST", Self::read_envelope("LIST", response).await?)?;

        debug!("KV LIST ({} records)", records.len());
        Ok(records)
    }

    /// Create a record holding `value`.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn create(&self, value: &serde_json::Value) -> Result<KvRecord, StorageError> {
        let url = self.config.collection_url();
        let request = CreateKvRequest { value };

        let response = self
            .send_with_retry(|| self.http_client.post(&url).json(&request))
            .await?;

        let record: KvRecord =
            Self::require_body("CREATE", Self::read_envelope("CREATE", response).await?)?;

        debug!("KV CREATE {} (version {})", record.key, record.version);
        Ok(record)
    }

    /// Fetch a single record.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<KvRecord, StorageError> {
        let url = self.config.record_url(key);

        let response = self
            .send_with_retry(|| self.http_client.get(&url))
            .await?;

        let record: KvRecord =
            Self::require_body("GET", Self::read_envelope("GET", response).await?)?;

        debug!("KV GET {} ({} bytes)", key, record.value.len());
        Ok(record)
    }

    /// Write a record at `version`.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        tags: &str,
        version: u64,
    ) -> Result<(), StorageError> {
        let url = self.config.record_url(key);
        let request = UpdateKvRequest {
            value,
            tags,
            version,
        };

        let response = self
            .send_with_retry(|| self.http_client.put(&url).json(&request))
            .await?;

        Self::read_envelope::<serde_json::Value>("PUT", response).await?;

        debug!("KV PUT {} (version {})", key, version);
        Ok(())
    }

    /// Delete a record.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let url = self.config.record_url(key);

        let response = self
            .send_with_retry(|| self.http_client.delete(&url))
            .await?;

        Self::read_envelope::<serde_json::Value>("DELETE", response).await?;

        debug!("KV DELETE {}", key);
        Ok(())
    }
}
