use std::future::Future;
use std::sync::Arc;

use kv_storage_core::{
    AsyncToken, DeleteListener, DeleteNotifier, KvRecord, LoadedValue, StorageError,
    StorageWorker, SubscriptionId,
};
use tokio::runtime::Handle;
use tracing::debug;

use crate::client::KvClient;
use crate::config::Config;

/// [`StorageWorker`] backed by the key-value REST API.
///
/// Each call is spawned on the tokio runtime the worker was created with and
/// the returned token resolves from that task.
pub struct HttpStorageWorker {
    client: Arc<KvClient>,
    runtime: Handle,
    notifier: Arc<DeleteNotifier>,
}

impl HttpStorageWorker {
    pub fn new(client: KvClient, runtime: Handle) -> Self {
        Self {
            client: Arc::new(client),
            runtime,
            notifier: Arc::new(DeleteNotifier::new()),
        }
    }

    /// Build a client from `config` and bind to the current tokio runtime.
    pub fn from_config(config: Config) -> Result<Self, StorageError> {
        let runtime = Handle::try_current()
            .map_err(|e| StorageError::Transport(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::new(KvClient::new(config)?, runtime))
    }

    pub fn client(&self) -> &KvClient {
        &self.client
    }

    fn spawn<T, F>(&self, request: F) -> AsyncToken<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, StorageError>> + Send + 'static,
    {
        let token = AsyncToken::new();
        let resolver = token.clone();
        self.runtime.spawn(async move {
            resolver.resolve(request.await);
        });
        token
    }
}

impl StorageWorker for HttpStorageWorker {
    fn get_all(&self) -> AsyncToken<Vec<KvRecord>> {
        let client = Arc::clone(&self.client);
        self.spawn(async move { client.list().await })
    }

    fn create(&self, value: serde_json::Value) -> AsyncToken<KvRecord> {
        let client = Arc::clone(&self.client);
        self.spawn(async move { client.create(&value).await })
    }

    fn load(&self, key: &str) -> AsyncToken<LoadedValue> {
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        self.spawn(async move {
            let record = client.get(&key).await?;
            let value = serde_json::from_str(&record.value)?;
            Ok(LoadedValue {
                value,
                version: record.version,
            })
        })
    }

    fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        tags: &str,
        version: u64,
    ) -> AsyncToken<()> {
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        let tags = tags.to_string();
        self.spawn(async move { client.put(&key, &value, &tags, version).await })
    }

    fn delete(&self, key: &str) -> AsyncToken<()> {
        let client = Arc::clone(&self.client);
        let notifier = Arc::clone(&self.notifier);
        let key = key.to_string();
        self.spawn(async move {
            client.delete(&key).await?;
            debug!("Broadcasting delete of {}", key);
            notifier.notify(&key);
            Ok(())
        })
    }

    fn subscribe_deletes(&self, listener: DeleteListener) -> SubscriptionId {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe_deletes(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use kv_storage_core::{ErrorKind, StorageService};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, api_token: Option<&str>) -> Config {
        Config {
            base_url: server.uri(),
            user_id: "u1".to_string(),
            api_token: api_token.map(str::to_string),
            timeout_secs: 5,
        }
    }

    fn worker(server: &MockServer) -> HttpStorageWorker {
        HttpStorageWorker::from_config(config(server, None)).unwrap()
    }

    fn record_json(key: &str, value: &str, tags: &str, version: u64) -> serde_json::Value {
        json!({
            "key": key,
            "value": value,
            "owner": "u1",
            "tags": tags,
            "version": version
        })
    }

    #[tokio::test]
    async fn test_get_all() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "error": null,
                "body": [
                    record_json("a", "1", "x", 3),
                    record_json("b", "2", "y", 0)
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let records = worker(&server).get_all().wait().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "a");
        assert_eq!(records[0].version, 3);
        assert_eq!(records[1].tags, "y");
    }

    #[tokio::test]
    async fn test_unsuccessful_envelope_surfaces_error_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "success": false,
                "error": "Not authorized to access this user's kvs."
            })))
            .mount(&server)
            .await;

        let err = worker(&server).get_all().wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "Not authorized to access this user's kvs.");
    }

    #[tokio::test]
    async fn test_non_envelope_error_includes_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv/k"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let err = worker(&server).load("k").wait().await.unwrap_err();
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[tokio::test]
    async fn test_load_decodes_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv/k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "body": record_json("k", r#"{"score":12}"#, "", 7)
            })))
            .mount(&server)
            .await;

        let loaded = worker(&server).load("k").wait().await.unwrap();
        assert_eq!(loaded.value, json!({"score": 12}));
        assert_eq!(loaded.version, 7);
    }

    #[tokio::test]
    async fn test_load_with_undecodable_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv/k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "body": record_json("k", "{not json", "", 1)
            })))
            .mount(&server)
            .await;

        let err = worker(&server).load("k").wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().starts_with("Invalid payload"));
    }

    #[tokio::test]
    async fn test_create_posts_value() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user/u1/kv"))
            .and(body_json(json!({"value": {"title": "doc"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "body": record_json("new-key", r#"{"title":"doc"}"#, "documents", 0)
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = worker(&server)
            .create(json!({"title": "doc"}))
            .wait()
            .await
            .unwrap();
        assert_eq!(record.key, "new-key");
        assert_eq!(record.tags, "documents");
    }

    #[tokio::test]
    async fn test_save_puts_value_tags_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/user/u1/kv/k"))
            .and(body_json(json!({"value": [1, 2], "tags": "a,b", "version": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        worker(&server)
            .save("k", json!([1, 2]), "a,b", 4)
            .wait()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "body": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let worker = HttpStorageWorker::from_config(config(&server, Some("secret"))).unwrap();
        assert!(worker.get_all().wait().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "body": []})),
            )
            .mount(&server)
            .await;

        assert!(worker(&server).get_all().wait().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_broadcasts_key() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/user/u1/kv/k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        let worker = worker(&server);
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        worker.subscribe_deletes(Arc::new(move |key: &str| {
            sink.lock().unwrap().push(key.to_string());
        }));

        worker.delete("k").wait().await.unwrap();
        assert_eq!(*deleted.lock().unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_broadcast() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/user/u1/kv/k"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "success": false,
                "error": "No kv with that key."
            })))
            .mount(&server)
            .await;

        let worker = worker(&server);
        let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&deleted);
        worker.subscribe_deletes(Arc::new(move |key: &str| {
            sink.lock().unwrap().push(key.to_string());
        }));

        let err = worker.delete("k").wait().await.unwrap_err();
        assert_eq!(err.to_string(), "No kv with that key.");
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/u1/kv"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "body": [
                    record_json("a", "1", "docs", 2),
                    record_json("b", "2", "docs,shared", 5)
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/user/u1/kv/b"))
            .and(body_json(json!({"value": 3, "tags": "docs,shared", "version": 6})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/user/u1/kv/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let service = StorageService::new(Arc::new(worker(&server)));
        let first = service.refresh();
        let second = service.refresh();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(service.find_all("docs").len(), 2);

        let shared = service.find_one("shared").unwrap();
        assert_eq!(shared.save(json!(3)).wait().await.unwrap(), 6);
        assert_eq!(shared.manifest_version(), 6);

        service.get("a").unwrap().delete().wait().await.unwrap();
        assert_eq!(service.len(), 1);
        assert_eq!(service.all()[0].key(), "b");
    }
}
