//! Task registry and chunk cache.
//!
//! A task records one vectorization run: its id, derived name, creation
//! time, a deep snapshot of the content selection that produced it, and an
//! enabled flag. Tasks are scoped per chat and each one owns exactly one
//! backend collection, identified by `{chat_id}_{task_id}`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::errors::RecallError;
use crate::host::SettingsStorage;
use crate::settings::SelectionSettings;
use crate::vector_store::{VectorItem, VectorStore};

/// Storage key under which the per-chat task lists are persisted.
pub const TASKS_KEY: &str = "chat_recall_tasks";

const FLUSH_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorTask {
    pub task_id: String,
    pub name: String,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
    /// Content-selection configuration active when the task was created.
    pub settings: SelectionSettings,
    pub enabled: bool,
    pub item_count: usize,
}

/// Derives a unique task id from the current time and a random fragment.
pub fn derive_task_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let fragment = Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &fragment[..8])
}

/// Collection identity binding a task to exactly one backend collection.
pub fn collection_id(chat_id: &str, task_id: &str) -> String {
    format!("{}_{}", chat_id, task_id)
}

/// In-memory shadow of the last insert batch for one collection, used to
/// recover chunk text when a query response omits it. Trustworthy only
/// until the collection is purged or re-inserted.
#[derive(Debug, Clone)]
pub struct CachedCollection {
    pub timestamp: i64,
    pub items: Vec<VectorItem>,
    pub settings: SelectionSettings,
}

/// Bounded cache of insert batches keyed by collection id. Oldest entries
/// are dropped once the cap is reached; eviction otherwise happens only
/// through purge.
pub struct ChunkCache {
    inner: Mutex<VecDeque<(String, CachedCollection)>>,
    capacity: usize,
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn insert(&self, collection_id: &str, cached: CachedCollection) {
        let mut inner = self.inner.lock().await;
        inner.retain(|(key, _)| key != collection_id);
        inner.push_back((collection_id.to_string(), cached));
        while inner.len() > self.capacity {
            inner.pop_front();
        }
    }

    pub async fn get(&self, collection_id: &str) -> Option<CachedCollection> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .find(|(key, _)| key == collection_id)
            .map(|(_, cached)| cached.clone())
    }

    pub async fn evict(&self, collection_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.retain(|(key, _)| key != collection_id);
    }
}

/// Per-chat task lists, persisted through the host storage port.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Vec<VectorTask>>>>,
    storage: Arc<dyn SettingsStorage>,
    flush_pending: Arc<Mutex<bool>>,
}

impl TaskRegistry {
    /// Loads persisted task lists; a missing or malformed blob starts empty.
    pub async fn load(storage: Arc<dyn SettingsStorage>) -> Self {
        let tasks = match storage.load(TASKS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|err| {
                tracing::warn!("Persisted task lists did not deserialize: {}", err);
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(err) => {
                tracing::warn!("Failed to load task lists: {}", err);
                HashMap::new()
            }
        };
        Self {
            tasks: Arc::new(RwLock::new(tasks)),
            storage,
            flush_pending: Arc::new(Mutex::new(false)),
        }
    }

    pub async fn add_task(&self, chat_id: &str, task: VectorTask) {
        self.tasks
            .write()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .push(task);
        self.schedule_flush().await;
    }

    pub async fn list_tasks(&self, chat_id: &str) -> Vec<VectorTask> {
        self.tasks
            .read()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn enabled_tasks(&self, chat_id: &str) -> Vec<VectorTask> {
        self.list_tasks(chat_id)
            .await
            .into_iter()
            .filter(|t| t.enabled)
            .collect()
    }

    /// Toggles a task. Returns false if the task does not exist.
    pub async fn set_enabled(&self, chat_id: &str, task_id: &str, enabled: bool) -> bool {
        let found = {
            let mut tasks = self.tasks.write().await;
            tasks
                .get_mut(chat_id)
                .and_then(|list| list.iter_mut().find(|t| t.task_id == task_id))
                .map(|task| task.enabled = enabled)
                .is_some()
        };
        if found {
            self.schedule_flush().await;
        }
        found
    }

    /// Removes a task, cascading to a backend purge of its collection and
    /// eviction of its cache entry. A failed purge keeps the task record so
    /// the registry never orphans a live collection.
    pub async fn remove_task(
        &self,
        chat_id: &str,
        task_id: &str,
        client: &dyn VectorStore,
        cache: &ChunkCache,
    ) -> Result<(), RecallError> {
        let exists = self
            .list_tasks(chat_id)
            .await
            .iter()
            .any(|t| t.task_id == task_id);
        if !exists {
            return Err(RecallError::State(format!("no task {} in chat {}", task_id, chat_id)));
        }

        let cid = collection_id(chat_id, task_id);
        let purged = client.purge(&cid).await?;
        if !purged {
            return Err(RecallError::Network(format!(
                "backend refused to purge collection {}",
                cid
            )));
        }
        cache.evict(&cid).await;

        {
            let mut tasks = self.tasks.write().await;
            if let Some(list) = tasks.get_mut(chat_id) {
                list.retain(|t| t.task_id != task_id);
                if list.is_empty() {
                    tasks.remove(chat_id);
                }
            }
        }
        self.schedule_flush().await;
        Ok(())
    }

    /// Removes every task of a chat with per-task cascade semantics.
    /// Failing tasks are kept and logged; returns the number removed.
    pub async fn purge_all(
        &self,
        chat_id: &str,
        client: &dyn VectorStore,
        cache: &ChunkCache,
    ) -> usize {
        let mut removed = 0;
        for task in self.list_tasks(chat_id).await {
            match self.remove_task(chat_id, &task.task_id, client, cache).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!("Failed to remove task {}: {}", task.task_id, err);
                }
            }
        }
        removed
    }

    async fn schedule_flush(&self) {
        let mut pending = self.flush_pending.lock().await;
        if *pending {
            return;
        }
        *pending = true;
        drop(pending);

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            *registry.flush_pending.lock().await = false;
            if let Err(err) = registry.flush().await {
                tracing::warn!("Task list flush failed: {}", err);
            }
        });
    }

    /// Writes the task lists to storage immediately.
    pub async fn flush(&self) -> Result<(), RecallError> {
        let value = {
            let tasks = self.tasks.read().await;
            serde_json::to_value(&*tasks)
                .map_err(|e| RecallError::State(e.to_string()))?
        };
        self.storage.save(TASKS_KEY, &value).await
    }
}

/// Projection of one task for the host's task list rendering.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub name: String,
    pub enabled: bool,
    pub item_count: usize,
    pub timestamp: i64,
}

/// Pure `(state) -> ViewModel` projection, newest task first.
pub fn task_list_view(tasks: &[VectorTask]) -> Vec<TaskView> {
    let mut views: Vec<TaskView> = tasks
        .iter()
        .map(|t| TaskView {
            task_id: t.task_id.clone(),
            name: t.name.clone(),
            enabled: t.enabled,
            item_count: t.item_count,
            timestamp: t.timestamp,
        })
        .collect();
    views.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    views
}
