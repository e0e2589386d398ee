//! Vectorization orchestrator.
//!
//! Drives the write side of the pipeline: collect content, chunk it, hash
//! each chunk, insert the chunks into the task's backend collection in
//! fixed-size batches, then register the task and cache the insert batch.
//! Task registration is all-or-nothing: any insert failure surfaces to the
//! caller and no task record is created (batches already accepted by the
//! backend are not rolled back).

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::chunker;
use crate::collector::{self, ContentItem};
use crate::errors::RecallError;
use crate::host::{ChatStore, FileStore, WorldInfoStore};
use crate::settings::Settings;
use crate::sync_gate::SyncGate;
use crate::tasks::{
    collection_id, derive_task_id, CachedCollection, ChunkCache, TaskRegistry, VectorTask,
};
use crate::vector_store::{VectorItem, VectorStore};

/// Chunks per insert request, bounding the payload size.
const INSERT_BATCH_SIZE: usize = 50;

/// Progress events reported during a vectorization pass.
#[derive(Debug, Clone, Copy)]
pub enum Progress {
    /// One content item has been chunked and hashed.
    Item { done: usize, total: usize },
    /// One insert batch has been accepted by the backend.
    Batch { inserted: usize, total: usize },
}

pub type ProgressSink = dyn Fn(Progress) + Send + Sync;

/// Deterministic content hash, memoized by exact string. Collisions across
/// distinct texts are tolerated; they match the backend's own key
/// semantics.
pub struct HashMemo {
    seen: HashMap<String, u32>,
}

impl HashMemo {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    pub fn hash(&mut self, text: &str) -> u32 {
        if let Some(known) = self.seen.get(text) {
            return *known;
        }
        let digest = Sha256::digest(text.as_bytes());
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        self.seen.insert(text.to_string(), hash);
        hash
    }
}

impl Default for HashMemo {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunks all collected items, assigning globally increasing indices across
/// the whole pass.
fn build_chunks(settings: &Settings, items: &[ContentItem], progress: Option<&ProgressSink>) -> Vec<VectorItem> {
    let mut memo = HashMemo::new();
    let mut out = Vec::new();
    let mut global_index = 0;

    for (done, item) in items.iter().enumerate() {
        let pieces = chunker::split(
            &item.text,
            settings.chunking.chunk_size,
            settings.chunking.overlap_percent,
            settings.chunking.force_delimiter.as_deref(),
        );
        let total = pieces.len();
        for (chunk_index, text) in pieces.into_iter().enumerate() {
            let mut metadata = item.metadata.clone();
            metadata.insert("type".to_string(), json!(item.kind.as_str()));
            metadata.insert("chunk_index".to_string(), json!(chunk_index));
            metadata.insert("chunk_total".to_string(), json!(total));
            out.push(VectorItem {
                hash: memo.hash(&text),
                text,
                index: global_index,
                metadata: Value::Object(metadata),
            });
            global_index += 1;
        }
        if let Some(progress) = progress {
            progress(Progress::Item {
                done: done + 1,
                total: items.len(),
            });
        }
    }
    out
}

/// Derives the human-readable task name from the active selection. Purely
/// descriptive; retrieval never looks at it.
fn derive_task_name(settings: &Settings, items: &[ContentItem]) -> String {
    let mut parts = Vec::new();
    let selection = &settings.selection;

    if selection.chat.enabled {
        let range = if selection.chat.end < 0 {
            format!("messages {}+", selection.chat.start)
        } else {
            format!("messages {}-{}", selection.chat.start, selection.chat.end)
        };
        parts.push(range);
    }
    let file_count = items
        .iter()
        .filter(|i| i.kind == collector::ContentType::File)
        .count();
    if file_count > 0 {
        parts.push(format!("{} files", file_count));
    }
    let world_count = items
        .iter()
        .filter(|i| i.kind == collector::ContentType::WorldInfo)
        .count();
    if world_count > 0 {
        parts.push(format!("{} lore entries", world_count));
    }
    if parts.is_empty() {
        parts.push(format!("{} items", items.len()));
    }

    format!("{} @ {}", parts.join(", "), Utc::now().format("%H:%M"))
}

/// Inserts `chunks` into `cid`, skipping hashes the backend already holds,
/// in batches of [`INSERT_BATCH_SIZE`]. Returns the number inserted.
async fn insert_chunks(
    client: &dyn VectorStore,
    cid: &str,
    chunks: &[VectorItem],
    progress: Option<&ProgressSink>,
) -> Result<usize, RecallError> {
    let existing: HashSet<u32> = match client.list(cid).await {
        Ok(hashes) => hashes.into_iter().collect(),
        Err(err) => {
            // A fresh collection may not be listable yet.
            tracing::debug!("list of {} failed, assuming empty: {}", cid, err);
            HashSet::new()
        }
    };

    let pending: Vec<VectorItem> = chunks
        .iter()
        .filter(|c| !existing.contains(&c.hash))
        .cloned()
        .collect();

    let mut inserted = 0;
    for batch in pending.chunks(INSERT_BATCH_SIZE) {
        client.insert(cid, batch).await?;
        inserted += batch.len();
        if let Some(progress) = progress {
            progress(Progress::Batch {
                inserted,
                total: pending.len(),
            });
        }
    }
    Ok(inserted)
}

/// Runs one full vectorization pass and registers the resulting task.
///
/// Fails fast with a `State` error when no chat session is active or the
/// selection produced no content.
#[allow(clippy::too_many_arguments)]
pub async fn vectorize(
    settings: &Settings,
    chat: &dyn ChatStore,
    files: &dyn FileStore,
    world_info: &dyn WorldInfoStore,
    client: &dyn VectorStore,
    registry: &TaskRegistry,
    cache: &ChunkCache,
    progress: Option<&ProgressSink>,
) -> Result<VectorTask, RecallError> {
    let chat_id = chat
        .active_chat_id()
        .await
        .ok_or_else(|| RecallError::State("no active chat session".to_string()))?;

    let collected = collector::collect(settings, chat, files, world_info).await;
    if collected.items.is_empty() {
        return Err(RecallError::State("no content selected".to_string()));
    }
    for diagnostic in &collected.diagnostics {
        tracing::warn!(
            "Extraction diagnostic for {:?}: {}",
            diagnostic.expression,
            diagnostic.message
        );
    }

    let chunks = build_chunks(settings, &collected.items, progress);
    let task_id = derive_task_id();
    let cid = collection_id(&chat_id, &task_id);

    let inserted = insert_chunks(client, &cid, &chunks, progress).await?;
    tracing::info!(
        "Vectorized {} items into {} ({} chunks inserted)",
        collected.items.len(),
        cid,
        inserted
    );

    let timestamp = Utc::now().timestamp_millis();
    let task = VectorTask {
        task_id,
        name: derive_task_name(settings, &collected.items),
        timestamp,
        settings: settings.selection.clone(),
        enabled: true,
        item_count: collected.items.len(),
    };
    registry.add_task(&chat_id, task.clone()).await;
    cache
        .insert(
            &cid,
            CachedCollection {
                timestamp,
                items: chunks,
                settings: settings.selection.clone(),
            },
        )
        .await;

    Ok(task)
}

/// Outcome of an automatic synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Gate contention, wait timeout, or no active chat.
    Skipped,
    Completed {
        tasks: usize,
        inserted: usize,
    },
}

/// Automatic background pass: re-collects every enabled task's selection
/// snapshot and inserts chunks the backend does not hold yet. Guarded by
/// the [`SyncGate`]; contention aborts silently.
#[allow(clippy::too_many_arguments)]
pub async fn synchronize(
    gate: &SyncGate,
    settings: &Settings,
    chat: &dyn ChatStore,
    files: &dyn FileStore,
    world_info: &dyn WorldInfoStore,
    client: &dyn VectorStore,
    registry: &TaskRegistry,
    cache: &ChunkCache,
) -> Result<SyncOutcome, RecallError> {
    let Some(_guard) = gate.acquire().await else {
        return Ok(SyncOutcome::Skipped);
    };
    let Some(chat_id) = chat.active_chat_id().await else {
        return Ok(SyncOutcome::Skipped);
    };

    let mut synced_tasks = 0;
    let mut total_inserted = 0;

    for task in registry.enabled_tasks(&chat_id).await {
        let mut task_settings = settings.clone();
        task_settings.selection = task.settings.clone();

        let collected = collector::collect(&task_settings, chat, files, world_info).await;
        if collected.items.is_empty() {
            continue;
        }
        let chunks = build_chunks(&task_settings, &collected.items, None);
        let cid = collection_id(&chat_id, &task.task_id);

        match insert_chunks(client, &cid, &chunks, None).await {
            Ok(inserted) => {
                if inserted > 0 {
                    cache
                        .insert(
                            &cid,
                            CachedCollection {
                                timestamp: Utc::now().timestamp_millis(),
                                items: chunks,
                                settings: task.settings.clone(),
                            },
                        )
                        .await;
                }
                synced_tasks += 1;
                total_inserted += inserted;
            }
            Err(err) => {
                tracing::warn!("Sync of task {} failed: {}", task.task_id, err);
            }
        }
    }

    Ok(SyncOutcome::Completed {
        tasks: synced_tasks,
        inserted: total_inserted,
    })
}

/// Collects the current selection and groups it per type for the preview
/// view, without touching the backend.
pub async fn preview_content(
    settings: &Settings,
    chat: &dyn ChatStore,
    files: &dyn FileStore,
    world_info: &dyn WorldInfoStore,
) -> collector::PreviewGroups {
    let collected = collector::collect(settings, chat, files, world_info).await;
    collector::preview(&collected.items)
}

/// Collects the current selection and renders the export document.
pub async fn export_document(
    settings: &Settings,
    chat: &dyn ChatStore,
    files: &dyn FileStore,
    world_info: &dyn WorldInfoStore,
) -> Result<String, RecallError> {
    let collected = collector::collect(settings, chat, files, world_info).await;
    if collected.items.is_empty() {
        return Err(RecallError::State("no content selected".to_string()));
    }
    let character_name = chat.character_name().await;
    Ok(collector::render_export(&character_name, &collected.items))
}
