//! End-to-end pipeline tests over in-memory host and backend doubles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use chat_recall::collector;
use chat_recall::errors::RecallError;
use chat_recall::host::{
    ChatMessage, ChatStore, FileAttachment, FileStore, PromptInjector, SettingsStorage,
    WorldInfoEntry, WorldInfoStore,
};
use chat_recall::retrieval::{rearrange_chat, GenerationKind, RetrievalOutcome};
use chat_recall::settings::{InjectPosition, InjectRole, Settings};
use chat_recall::tasks::{collection_id, ChunkCache, TaskRegistry};
use chat_recall::vector_store::{QueryResponse, QueryResultItem, VectorItem, VectorStore};
use chat_recall::sync_gate::SyncGate;
use chat_recall::vectorize::{synchronize, vectorize, SyncOutcome};

struct MockChat {
    chat_id: Option<String>,
    messages: Vec<ChatMessage>,
}

impl MockChat {
    fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            chat_id: Some("chat1".to_string()),
            messages,
        }
    }
}

#[async_trait]
impl ChatStore for MockChat {
    async fn active_chat_id(&self) -> Option<String> {
        self.chat_id.clone()
    }
    async fn character_name(&self) -> String {
        "Bot".to_string()
    }
    async fn user_name(&self) -> String {
        "Ann".to_string()
    }
    async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }
}

fn message(text: &str) -> ChatMessage {
    ChatMessage {
        name: "Ann".to_string(),
        is_user: true,
        hidden: false,
        text: text.to_string(),
    }
}

#[derive(Default)]
struct MockFiles {
    attachments: Vec<FileAttachment>,
    contents: HashMap<String, String>,
}

#[async_trait]
impl FileStore for MockFiles {
    async fn attachments(&self) -> Vec<FileAttachment> {
        self.attachments.clone()
    }
    async fn fetch(&self, url: &str) -> Result<String, RecallError> {
        self.contents
            .get(url)
            .cloned()
            .ok_or_else(|| RecallError::Network(format!("no such file {url}")))
    }
}

#[derive(Default)]
struct MockWorld {
    entries: Vec<WorldInfoEntry>,
}

#[async_trait]
impl WorldInfoStore for MockWorld {
    async fn entries(&self) -> Vec<WorldInfoEntry> {
        self.entries.clone()
    }
}

#[derive(Default)]
struct MemoryStorage {
    map: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl SettingsStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<Value>, RecallError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }
    async fn save(&self, key: &str, value: &Value) -> Result<(), RecallError> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingInjector {
    last: Mutex<Option<String>>,
}

impl RecordingInjector {
    fn last(&self) -> Option<String> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl PromptInjector for RecordingInjector {
    async fn inject(
        &self,
        _tag: &str,
        text: &str,
        _position: InjectPosition,
        _depth: u32,
        _include_world_info: bool,
        _role: InjectRole,
    ) {
        *self.last.lock().unwrap() = Some(text.to_string());
    }
}

/// In-memory vector backend. Scores are deterministic (derived from the
/// stored index) so ranking assertions are stable. Collections listed in
/// `hash_only` answer queries without inline text.
#[derive(Default)]
struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, Vec<VectorItem>>>,
    hash_only: Mutex<HashSet<String>>,
    query_count: AtomicUsize,
}

impl InMemoryVectorStore {
    fn score(item: &VectorItem) -> f32 {
        0.9 - item.index as f32 * 0.01
    }

    fn collection(&self, id: &str) -> Vec<VectorItem> {
        self.collections
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn mark_hash_only(&self, id: &str) {
        self.hash_only.lock().unwrap().insert(id.to_string());
    }

    fn queries(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, collection_id: &str, items: &[VectorItem]) -> Result<(), RecallError> {
        self.collections
            .lock()
            .unwrap()
            .entry(collection_id.to_string())
            .or_default()
            .extend(items.to_vec());
        Ok(())
    }

    async fn query(
        &self,
        collection_id: &str,
        _search_text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<QueryResponse, RecallError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let mut items = self.collection(collection_id);
        items.sort_by(|a, b| {
            Self::score(b)
                .partial_cmp(&Self::score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.retain(|i| Self::score(i) >= threshold);
        items.truncate(top_k);

        if self.hash_only.lock().unwrap().contains(collection_id) {
            return Ok(QueryResponse {
                items: None,
                hashes: Some(items.iter().map(|i| i.hash).collect()),
                metadata: Some(
                    items
                        .iter()
                        .map(|i| json!({ "score": Self::score(i) }))
                        .collect(),
                ),
            });
        }
        Ok(QueryResponse {
            items: Some(
                items
                    .into_iter()
                    .map(|i| QueryResultItem {
                        score: Self::score(&i),
                        text: i.text,
                        metadata: i.metadata,
                    })
                    .collect(),
            ),
            hashes: None,
            metadata: None,
        })
    }

    async fn list(&self, collection_id: &str) -> Result<Vec<u32>, RecallError> {
        Ok(self
            .collection(collection_id)
            .iter()
            .map(|i| i.hash)
            .collect())
    }

    async fn purge(&self, collection_id: &str) -> Result<bool, RecallError> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .remove(collection_id)
            .is_some())
    }
}

async fn registry() -> TaskRegistry {
    TaskRegistry::load(Arc::new(MemoryStorage::default())).await
}

#[test]
fn logging_initializes_into_directory() {
    let dir = tempfile::tempdir().unwrap();
    chat_recall::logging::init(dir.path());
    tracing::info!("pipeline test logging online");
    assert!(dir.path().exists());
}

#[tokio::test]
async fn tag_extraction_over_chat_messages() {
    let mut settings = Settings::default();
    settings.selection.chat.tag_expressions = vec!["content".to_string()];

    let chat = MockChat::new(vec![
        message("hello <content>A</content>"),
        message("<content>B</content> - exclude,C"),
        message("plain text"),
    ]);
    let collected = collector::collect(
        &settings,
        &chat,
        &MockFiles::default(),
        &MockWorld::default(),
    )
    .await;

    let texts: Vec<&str> = collected.items.iter().map(|i| i.text.as_str()).collect();
    assert_eq!(texts, vec!["A", "B", "plain text"]);
}

#[tokio::test]
async fn blacklisted_message_keeps_empty_item() {
    let mut settings = Settings::default();
    settings.selection.chat.tag_expressions = vec!["content".to_string()];
    settings.blacklist = vec!["secret".to_string()];

    let chat = MockChat::new(vec![message("<content>this is secret info</content>")]);
    let collected = collector::collect(
        &settings,
        &chat,
        &MockFiles::default(),
        &MockWorld::default(),
    )
    .await;

    // The source item is never skipped, only emptied.
    assert_eq!(collected.items.len(), 1);
    assert_eq!(collected.items[0].text, "");
}

#[tokio::test]
async fn vectorize_without_chat_session_fails_fast() {
    let settings = Settings::default();
    let mut chat = MockChat::new(vec![message("hi")]);
    chat.chat_id = None;
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();

    let err = vectorize(
        &settings,
        &chat,
        &MockFiles::default(),
        &MockWorld::default(),
        &store,
        &registry,
        &cache,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RecallError::State(_)));
}

#[tokio::test]
async fn vectorizing_twice_creates_two_independent_collections() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("the quick brown fox")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();
    let files = MockFiles::default();
    let world = MockWorld::default();

    let task1 = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();
    let task2 = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();

    assert_ne!(task1.task_id, task2.task_id);
    assert_eq!(registry.list_tasks("chat1").await.len(), 2);

    let cid1 = collection_id("chat1", &task1.task_id);
    let cid2 = collection_id("chat1", &task2.task_id);
    assert!(!store.collection(&cid1).is_empty());
    assert!(!store.collection(&cid2).is_empty());

    // Removing one task leaves the other's vectors untouched.
    registry
        .remove_task("chat1", &task1.task_id, &store, &cache)
        .await
        .unwrap();
    assert!(store.collection(&cid1).is_empty());
    assert!(!store.collection(&cid2).is_empty());
    assert_eq!(registry.list_tasks("chat1").await.len(), 1);
}

#[tokio::test]
async fn synchronize_inserts_only_missing_chunks() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("the old mill by the river")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();
    let files = MockFiles::default();
    let world = MockWorld::default();

    let task = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();
    let cid = collection_id("chat1", &task.task_id);
    let before = store.collection(&cid).len();
    assert!(before > 0);

    // Unchanged content: every chunk hash is already listed by the backend.
    let gate = SyncGate::new();
    let outcome = synchronize(
        &gate, &settings, &chat, &files, &world, &store, &registry, &cache,
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            tasks: 1,
            inserted: 0
        }
    );
    assert_eq!(store.collection(&cid).len(), before);

    // A new message in the task's open-ended selection adds exactly its
    // chunks, leaving the existing ones alone.
    let grown = MockChat::new(vec![
        message("the old mill by the river"),
        message("a second visit at dusk"),
    ]);
    let outcome = synchronize(
        &gate, &settings, &grown, &files, &world, &store, &registry, &cache,
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            tasks: 1,
            inserted: 1
        }
    );
    assert_eq!(store.collection(&cid).len(), before + 1);
}

#[tokio::test]
async fn contended_gate_skips_synchronization() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("one quiet evening")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();
    let files = MockFiles::default();
    let world = MockWorld::default();

    let task = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();
    let cid = collection_id("chat1", &task.task_id);
    let before = store.collection(&cid).len();

    let gate = SyncGate::new();
    let held = gate.acquire().await.unwrap();
    let outcome = synchronize(
        &gate, &settings, &chat, &files, &world, &store, &registry, &cache,
    )
    .await
    .unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped);
    assert_eq!(store.collection(&cid).len(), before);

    // Releasing the gate lets the next pass run.
    drop(held);
    let outcome = synchronize(
        &gate, &settings, &chat, &files, &world, &store, &registry, &cache,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed { .. }));
}

#[tokio::test]
async fn removing_a_task_evicts_its_cache_entry() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("remember this well")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();

    let task = vectorize(
        &settings,
        &chat,
        &MockFiles::default(),
        &MockWorld::default(),
        &store,
        &registry,
        &cache,
        None,
    )
    .await
    .unwrap();

    let cid = collection_id("chat1", &task.task_id);
    assert!(cache.get(&cid).await.is_some());

    registry
        .remove_task("chat1", &task.task_id, &store, &cache)
        .await
        .unwrap();
    // No stale cached text can be served for the purged collection.
    assert!(cache.get(&cid).await.is_none());
}

#[tokio::test]
async fn retrieval_merges_inline_and_cache_recovered_results() {
    let mut settings = Settings::default();
    settings.selection.world_info.enabled = true;
    settings
        .selection
        .world_info
        .selected
        .insert("Lore".to_string(), vec!["e1".to_string()]);

    let chat = MockChat::new(vec![message("tell me about the ancient tower")]);
    let files = MockFiles::default();
    let world = MockWorld {
        entries: vec![WorldInfoEntry {
            world: "Lore".to_string(),
            uid: "e1".to_string(),
            key: vec!["tower".to_string()],
            comment: String::new(),
            content: "The tower predates the empire.".to_string(),
            disabled: false,
        }],
    };
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();

    // Task 1: chat only, answered with inline text.
    let mut chat_only = settings.clone();
    chat_only.selection.world_info.enabled = false;
    let task1 = vectorize(&chat_only, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();

    // Task 2: world info only, answered hashes-only and recovered from cache.
    let mut world_only = settings.clone();
    world_only.selection.chat.enabled = false;
    let task2 = vectorize(&world_only, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();
    store.mark_hash_only(&collection_id("chat1", &task2.task_id));

    let injector = RecordingInjector::default();
    let outcome = rearrange_chat(
        &settings,
        &chat,
        &injector,
        &store,
        &registry,
        &cache,
        GenerationKind::Normal,
    )
    .await
    .unwrap();

    assert_eq!(outcome, RetrievalOutcome::Injected);
    let injected = injector.last().unwrap();
    assert!(injected.contains("<past_chat>"));
    assert!(injected.contains("ancient tower"));
    assert!(injected.contains("<world_part>"));
    assert!(injected.contains("predates the empire"));
    let _ = task1;
}

#[tokio::test]
async fn master_switch_off_clears_injection_without_querying() {
    let mut settings = Settings::default();
    let chat = MockChat::new(vec![message("hello there")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();

    // An enabled task exists, so only the master switch gates retrieval.
    let task = vectorize(
        &settings,
        &chat,
        &MockFiles::default(),
        &MockWorld::default(),
        &store,
        &registry,
        &cache,
        None,
    )
    .await
    .unwrap();
    assert!(task.enabled);

    settings.enabled = false;
    let injector = RecordingInjector::default();
    let queries_before = store.queries();
    let outcome = rearrange_chat(
        &settings,
        &chat,
        &injector,
        &store,
        &registry,
        &cache,
        GenerationKind::Normal,
    )
    .await
    .unwrap();

    assert_eq!(outcome, RetrievalOutcome::Skipped);
    assert_eq!(store.queries(), queries_before);
    // The previous injection is cleared, not left stale.
    assert_eq!(injector.last().unwrap(), "");
}

#[tokio::test]
async fn quiet_generation_skips_retrieval() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("hello")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();
    let injector = RecordingInjector::default();

    let outcome = rearrange_chat(
        &settings,
        &chat,
        &injector,
        &store,
        &registry,
        &cache,
        GenerationKind::Quiet,
    )
    .await
    .unwrap();
    assert_eq!(outcome, RetrievalOutcome::Skipped);
    assert_eq!(store.queries(), 0);
    assert_eq!(injector.last().unwrap(), "");
}

#[tokio::test]
async fn failing_task_is_excluded_without_aborting_the_turn() {
    let settings = Settings::default();
    let chat = MockChat::new(vec![message("alpha beta gamma")]);
    let store = InMemoryVectorStore::default();
    let registry = registry().await;
    let cache = ChunkCache::default();
    let files = MockFiles::default();
    let world = MockWorld::default();

    let healthy = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();

    // A second task whose collection was dropped out-of-band: its query
    // succeeds but returns hashes with no cache entry after eviction.
    let broken = vectorize(&settings, &chat, &files, &world, &store, &registry, &cache, None)
        .await
        .unwrap();
    let broken_cid = collection_id("chat1", &broken.task_id);
    store.mark_hash_only(&broken_cid);
    cache.evict(&broken_cid).await;

    let injector = RecordingInjector::default();
    let outcome = rearrange_chat(
        &settings,
        &chat,
        &injector,
        &store,
        &registry,
        &cache,
        GenerationKind::Normal,
    )
    .await
    .unwrap();

    // The healthy task still injects.
    assert_eq!(outcome, RetrievalOutcome::Injected);
    assert!(injector.last().unwrap().contains("alpha beta gamma"));
    let _ = healthy;
}
