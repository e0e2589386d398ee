//! Retrieval orchestrator.
//!
//! Runs once per generation turn: builds a query from the most recent
//! messages, queries every enabled task's collection, merges and ranks the
//! pooled results, groups them by content type, and injects the formatted
//! block into the prompt. Every early exit clears any previously injected
//! content so a disabled state never leaves stale context behind.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::errors::RecallError;
use crate::host::{ChatStore, PromptInjector};
use crate::settings::{ContentTags, Settings};
use crate::tasks::{collection_id, ChunkCache, TaskRegistry, VectorTask};
use crate::vector_store::{QueryResponse, VectorStore};

/// Injection tag scope registered with the host. Re-injecting under this
/// tag replaces the previous block.
pub const INJECT_TAG: &str = "chat_recall";

/// How a generation turn was triggered. Quiet passes are not user-visible
/// and never receive injected context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Normal,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Skipped,
    Injected,
}

/// One merged retrieval result tagged with its source task.
#[derive(Debug, Clone)]
pub struct ScoredResult {
    pub text: String,
    pub score: f32,
    /// Content type string from the chunk metadata (`chat`, `file`,
    /// `world_info`, anything else falls back to `unknown`).
    pub kind: String,
    /// Original message index for chat results.
    pub message_index: Option<u64>,
    /// Name of the task whose collection produced this result.
    pub task: String,
}

/// Entry point called by the host on each generation turn.
#[allow(clippy::too_many_arguments)]
pub async fn rearrange_chat(
    settings: &Settings,
    chat: &dyn ChatStore,
    injector: &dyn PromptInjector,
    client: &dyn VectorStore,
    registry: &TaskRegistry,
    cache: &ChunkCache,
    generation: GenerationKind,
) -> Result<RetrievalOutcome, RecallError> {
    if generation == GenerationKind::Quiet {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    }
    if !settings.enabled || !settings.query.enabled {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    }
    let Some(chat_id) = chat.active_chat_id().await else {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    };
    let tasks = registry.enabled_tasks(&chat_id).await;
    if tasks.is_empty() {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    }

    let query = build_query(chat, settings.query.query_messages).await;
    if query.trim().is_empty() {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    }

    let mut pooled: Vec<ScoredResult> = Vec::new();
    for task in &tasks {
        let cid = collection_id(&chat_id, &task.task_id);
        let response = match client
            .query(
                &cid,
                &query,
                settings.query.count,
                settings.query.score_threshold,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Query of task {} failed, excluding it: {}", task.task_id, err);
                continue;
            }
        };
        match recover_results(&cid, task, response, cache).await {
            Ok(results) => pooled.extend(results),
            Err(err) => {
                tracing::warn!(
                    "Recovering results of task {} failed, excluding it: {}",
                    task.task_id,
                    err
                );
            }
        }
    }

    let ranked = merge_rank(pooled, settings.query.max_results);
    let block = format_groups(&settings.content_tags, &ranked);
    if block.is_empty() {
        clear_injection(settings, injector).await;
        return Ok(RetrievalOutcome::Skipped);
    }

    let text = settings.injection.template.replace("{{text}}", &block);
    injector
        .inject(
            INJECT_TAG,
            &text,
            settings.injection.position,
            settings.injection.depth,
            settings.injection.include_world_info,
            settings.injection.role,
        )
        .await;
    tracing::debug!(
        "Injected {} results from {} tasks",
        ranked.len(),
        tasks.len()
    );
    Ok(RetrievalOutcome::Injected)
}

async fn clear_injection(settings: &Settings, injector: &dyn PromptInjector) {
    injector
        .inject(
            INJECT_TAG,
            "",
            settings.injection.position,
            settings.injection.depth,
            settings.injection.include_world_info,
            settings.injection.role,
        )
        .await;
}

/// Concatenates the text of the last `count` messages, clamped to the
/// available history.
async fn build_query(chat: &dyn ChatStore, count: usize) -> String {
    let messages = chat.messages().await;
    let take = count.min(messages.len());
    messages[messages.len() - take..]
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn metadata_str(metadata: &Value, key: &str) -> Option<String> {
    metadata.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Turns one task's query response into scored results. Inline text is
/// used directly; a hashes-only response is recovered through the chunk
/// cache. No cache entry for the collection is a `CacheMiss`, which the
/// per-task loop absorbs.
async fn recover_results(
    cid: &str,
    task: &VectorTask,
    response: QueryResponse,
    cache: &ChunkCache,
) -> Result<Vec<ScoredResult>, RecallError> {
    if let Some(items) = response.items {
        return Ok(items
            .into_iter()
            .map(|item| ScoredResult {
                kind: metadata_str(&item.metadata, "type").unwrap_or_else(|| "unknown".to_string()),
                message_index: item.metadata.get("index").and_then(Value::as_u64),
                text: item.text,
                score: item.score,
                task: task.name.clone(),
            })
            .collect());
    }

    let Some(hashes) = response.hashes else {
        return Ok(Vec::new());
    };
    let Some(cached) = cache.get(cid).await else {
        return Err(RecallError::CacheMiss(cid.to_string()));
    };

    let by_hash: HashMap<u32, &crate::vector_store::VectorItem> =
        cached.items.iter().map(|item| (item.hash, item)).collect();
    let metadata = response.metadata.unwrap_or_default();

    let mut out = Vec::new();
    for (i, hash) in hashes.iter().enumerate() {
        let Some(item) = by_hash.get(hash) else {
            tracing::debug!("Hash {} not present in cache for {}", hash, cid);
            continue;
        };
        let response_meta = metadata.get(i).cloned().unwrap_or(Value::Null);
        let score = response_meta
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        out.push(ScoredResult {
            kind: metadata_str(&item.metadata, "type").unwrap_or_else(|| "unknown".to_string()),
            message_index: item.metadata.get("index").and_then(Value::as_u64),
            text: item.text.clone(),
            score,
            task: task.name.clone(),
        });
    }
    Ok(out)
}

/// Sorts pooled results by descending score (stable, so per-task order
/// breaks ties) and applies the global cap.
pub fn merge_rank(mut pooled: Vec<ScoredResult>, max_results: usize) -> Vec<ScoredResult> {
    pooled.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pooled.truncate(max_results);
    pooled
}

/// Groups results by content type and renders the injected block. Chat
/// results are re-sorted by original message index and de-duplicated;
/// world-info and file results are de-duplicated without reordering. Group
/// order is fixed: chat, world info, file.
pub fn format_groups(tags: &ContentTags, results: &[ScoredResult]) -> String {
    let mut chat: Vec<(u64, &str)> = Vec::new();
    let mut world_info: Vec<&str> = Vec::new();
    let mut file: Vec<&str> = Vec::new();

    for result in results {
        match result.kind.as_str() {
            "chat" => chat.push((result.message_index.unwrap_or(u64::MAX), &result.text)),
            "world_info" => world_info.push(&result.text),
            "file" => file.push(&result.text),
            other => {
                tracing::debug!("Result of unknown type {:?} not rendered", other);
            }
        }
    }

    chat.sort_by_key(|(index, _)| *index);
    let chat_texts = dedupe(chat.into_iter().map(|(_, text)| text));
    let world_texts = dedupe(world_info.into_iter());
    let file_texts = dedupe(file.into_iter());

    let mut blocks = Vec::new();
    for (tag, texts) in [
        (&tags.chat, chat_texts),
        (&tags.world_info, world_texts),
        (&tags.file, file_texts),
    ] {
        if texts.is_empty() {
            continue;
        }
        blocks.push(format!("<{tag}>\n{}\n</{tag}>", texts.join("\n")));
    }
    blocks.join("\n\n")
}

fn dedupe<'a>(texts: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    texts.filter(|t| seen.insert(*t)).collect()
}
