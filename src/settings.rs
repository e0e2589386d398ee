//! Pipeline configuration.
//!
//! Settings are loaded once from the host's key-value storage, merged
//! field-by-field over the compiled-in defaults so that older persisted
//! blobs survive schema additions, mutated through a single patch entry
//! point, and flushed back to storage with a short debounce.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::errors::RecallError;
use crate::host::SettingsStorage;

/// Storage key under which the settings blob is persisted.
pub const SETTINGS_KEY: &str = "chat_recall_settings";

const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Connection settings for the remote embedding/vector backend.
///
/// `source` discriminates the embedding provider; the remaining fields are
/// provider-specific and forwarded verbatim on every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSourceConfig {
    pub source: String,
    pub model: String,
    pub api_url: String,
    #[serde(default)]
    pub keep_alive: Option<bool>,
}

impl Default for EmbeddingSourceConfig {
    fn default() -> Self {
        Self {
            source: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            api_url: "http://localhost:11434".to_string(),
            keep_alive: Some(true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingSettings {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks, as a percentage of `chunk_size`.
    pub overlap_percent: u32,
    /// Optional delimiter tried before the built-in priority list.
    #[serde(default)]
    pub force_delimiter: Option<String>,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            overlap_percent: 10,
            force_delimiter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySettings {
    /// Master toggle for retrieval on generation turns.
    pub enabled: bool,
    /// How many trailing messages form the query text.
    pub query_messages: usize,
    /// Per-collection result cap passed to the backend.
    pub count: usize,
    /// Minimum similarity score accepted from the backend.
    pub score_threshold: f32,
    /// Global cap applied after merging all tasks' results.
    pub max_results: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            query_messages: 2,
            count: 10,
            score_threshold: 0.25,
            max_results: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InjectPosition {
    BeforePrompt,
    AfterPrompt,
    InChat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InjectRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InjectionSettings {
    /// Template with a single `{{text}}` placeholder.
    pub template: String,
    pub position: InjectPosition,
    pub depth: u32,
    pub role: InjectRole,
    pub include_world_info: bool,
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            template: "Relevant past information:\n{{text}}".to_string(),
            position: InjectPosition::InChat,
            depth: 2,
            role: InjectRole::System,
            include_world_info: false,
        }
    }
}

/// Wrapper tag names for each content group in the injected block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentTags {
    pub chat: String,
    pub world_info: String,
    pub file: String,
}

impl Default for ContentTags {
    fn default() -> Self {
        Self {
            chat: "past_chat".to_string(),
            world_info: "world_part".to_string(),
            file: "databank".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSelection {
    pub enabled: bool,
    /// First message index included.
    pub start: usize,
    /// One past the last included index; any negative value means "to the end".
    pub end: i64,
    pub include_user: bool,
    pub include_assistant: bool,
    pub include_hidden: bool,
    /// Tag-extraction expressions applied to each message.
    #[serde(default)]
    pub tag_expressions: Vec<String>,
}

impl Default for ChatSelection {
    fn default() -> Self {
        Self {
            enabled: true,
            start: 0,
            end: -1,
            include_user: true,
            include_assistant: true,
            include_hidden: false,
            tag_expressions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileSelection {
    pub enabled: bool,
    /// Attachment URLs selected for vectorization.
    #[serde(default)]
    pub selected_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldInfoSelection {
    pub enabled: bool,
    /// Selected entry uids keyed by their owning world name.
    #[serde(default)]
    pub selected: BTreeMap<String, Vec<String>>,
}

/// Content-selection scope. A deep copy of this struct is snapshotted into
/// every task at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelectionSettings {
    pub chat: ChatSelection,
    pub files: FileSelection,
    pub world_info: WorldInfoSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Master feature switch.
    pub enabled: bool,
    /// Base URL of the vector backend exposing insert/query/list/purge.
    pub backend_url: String,
    pub source: EmbeddingSourceConfig,
    pub chunking: ChunkingSettings,
    pub query: QuerySettings,
    pub injection: InjectionSettings,
    pub content_tags: ContentTags,
    pub selection: SelectionSettings,
    /// Case-insensitive keywords; an extracted block containing any of them
    /// is dropped.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: "http://127.0.0.1:3001/api/vector".to_string(),
            source: EmbeddingSourceConfig::default(),
            chunking: ChunkingSettings::default(),
            query: QuerySettings::default(),
            injection: InjectionSettings::default(),
            content_tags: ContentTags::default(),
            selection: SelectionSettings::default(),
            blacklist: Vec::new(),
        }
    }
}

/// Recursively overlays `patch` onto `base`. Objects merge key-by-key,
/// everything else is replaced.
pub fn merge_values(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_val) => merge_values(base_val, patch_val),
                    None => {
                        base_map.insert(key.clone(), patch_val.clone());
                    }
                }
            }
        }
        (base_slot, patch_val) => {
            *base_slot = patch_val.clone();
        }
    }
}

/// Shared settings handle with merge-on-load and debounced persistence.
#[derive(Clone)]
pub struct SettingsService {
    inner: Arc<RwLock<Settings>>,
    storage: Arc<dyn SettingsStorage>,
    flush_pending: Arc<Mutex<bool>>,
}

impl SettingsService {
    /// Loads persisted settings and merges them over the defaults. A missing
    /// or malformed blob falls back to defaults rather than failing startup.
    pub async fn load(storage: Arc<dyn SettingsStorage>) -> Self {
        let mut merged = serde_json::to_value(Settings::default())
            .unwrap_or_else(|_| Value::Object(Map::new()));
        match storage.load(SETTINGS_KEY).await {
            Ok(Some(persisted)) => merge_values(&mut merged, &persisted),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("Failed to load persisted settings: {}", err);
            }
        }
        let settings = match serde_json::from_value::<Settings>(merged) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!("Persisted settings did not deserialize, using defaults: {}", err);
                Settings::default()
            }
        };
        Self {
            inner: Arc::new(RwLock::new(settings)),
            storage,
            flush_pending: Arc::new(Mutex::new(false)),
        }
    }

    pub async fn snapshot(&self) -> Settings {
        self.inner.read().await.clone()
    }

    /// Applies a JSON patch onto the current settings and schedules a
    /// debounced flush. Unknown keys in the patch are carried through the
    /// merge but dropped on deserialization.
    pub async fn update(&self, patch: Value) -> Result<(), RecallError> {
        {
            let mut guard = self.inner.write().await;
            let mut current = serde_json::to_value(&*guard)
                .map_err(|e| RecallError::Configuration(e.to_string()))?;
            merge_values(&mut current, &patch);
            *guard = serde_json::from_value(current)
                .map_err(|e| RecallError::Configuration(format!("invalid settings patch: {e}")))?;
        }
        self.schedule_flush().await;
        Ok(())
    }

    async fn schedule_flush(&self) {
        let mut pending = self.flush_pending.lock().await;
        if *pending {
            return;
        }
        *pending = true;
        drop(pending);

        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            *service.flush_pending.lock().await = false;
            if let Err(err) = service.flush().await {
                tracing::warn!("Settings flush failed: {}", err);
            }
        });
    }

    /// Writes the current settings to storage immediately.
    pub async fn flush(&self) -> Result<(), RecallError> {
        let value = {
            let guard = self.inner.read().await;
            serde_json::to_value(&*guard)
                .map_err(|e| RecallError::Configuration(e.to_string()))?
        };
        self.storage.save(SETTINGS_KEY, &value).await
    }
}
