//! Worker double that hands out pending tokens so tests decide when and how
//! each call resolves.

use std::sync::{Arc, Mutex};

use crate::record::{KvRecord, LoadedValue};
use crate::token::AsyncToken;
use crate::worker::{DeleteListener, DeleteNotifier, StorageWorker, SubscriptionId};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SaveCall {
    pub key: String,
    pub value: serde_json::Value,
    pub tags: String,
    pub version: u64,
}

#[derive(Default)]
pub(crate) struct ScriptedWorker {
    pub get_all: Mutex<Vec<AsyncToken<Vec<KvRecord>>>>,
    pub creates: Mutex<Vec<(serde_json::Value, AsyncToken<KvRecord>)>>,
    pub loads: Mutex<Vec<(String, AsyncToken<LoadedValue>)>>,
    pub saves: Mutex<Vec<(SaveCall, AsyncToken<()>)>>,
    pub deletes: Mutex<Vec<(String, AsyncToken<()>)>>,
    pub notifier: Arc<DeleteNotifier>,
}

impl ScriptedWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_all_calls(&self) -> usize {
        self.get_all.lock().unwrap().len()
    }

    pub fn load_calls(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    pub fn save_calls(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.lock().unwrap().len()
    }

    pub fn last_get_all(&self) -> AsyncToken<Vec<KvRecord>> {
        self.get_all.lock().unwrap().last().unwrap().clone()
    }

    pub fn last_create(&self) -> AsyncToken<KvRecord> {
        self.creates.lock().unwrap().last().unwrap().1.clone()
    }

    pub fn last_load(&self) -> AsyncToken<LoadedValue> {
        self.loads.lock().unwrap().last().unwrap().1.clone()
    }

    pub fn last_save(&self) -> (SaveCall, AsyncToken<()>) {
        self.saves.lock().unwrap().last().unwrap().clone()
    }

    pub fn last_delete(&self) -> AsyncToken<()> {
        self.deletes.lock().unwrap().last().unwrap().1.clone()
    }
}

impl StorageWorker for ScriptedWorker {
    fn get_all(&self) -> AsyncToken<Vec<KvRecord>> {
        let token = AsyncToken::new();
        self.get_all.lock().unwrap().push(token.clone());
        token
    }

    fn create(&self, value: serde_json::Value) -> AsyncToken<KvRecord> {
        let token = AsyncToken::new();
        self.creates.lock().unwrap().push((value, token.clone()));
        token
    }

    fn load(&self, key: &str) -> AsyncToken<LoadedValue> {
        let token = AsyncToken::new();
        self.loads
            .lock()
            .unwrap()
            .push((key.to_string(), token.clone()));
        token
    }

    fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        tags: &str,
        version: u64,
    ) -> AsyncToken<()> {
        let token = AsyncToken::new();
        let call = SaveCall {
            key: key.to_string(),
            value,
            tags: tags.to_string(),
            version,
        };
        self.saves.lock().unwrap().push((call, token.clone()));
        token
    }

    fn delete(&self, key: &str) -> AsyncToken<()> {
        let token = AsyncToken::new();
        // Registered first so subscribers hear about the delete before the
        // caller's own callbacks run.
        let notifier = Arc::clone(&self.notifier);
        let deleted = key.to_string();
        token.on_success(move |()| notifier.notify(&deleted));
        self.deletes
            .lock()
            .unwrap()
            .push((key.to_string(), token.clone()));
        token
    }

    fn subscribe_deletes(&self, listener: DeleteListener) -> SubscriptionId {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe_deletes(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}
