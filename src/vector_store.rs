//! HTTP client for the remote embedding/vector backend.
//!
//! The backend is treated as an opaque store: it embeds inserted chunk
//! text itself and answers similarity queries. Every request carries the
//! active embedding source's connection parameters so the backend can
//! route to the right provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RecallError;
use crate::settings::{EmbeddingSourceConfig, Settings};

/// Abstract interface over the vector backend. The production
/// implementation is the HTTP [`VectorStoreClient`]; tests substitute an
/// in-memory double.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts a batch of items; a failure fails the whole batch.
    async fn insert(&self, collection_id: &str, items: &[VectorItem]) -> Result<(), RecallError>;
    /// Similarity query. The response may omit inline text.
    async fn query(
        &self,
        collection_id: &str,
        search_text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<QueryResponse, RecallError>;
    /// Hashes the backend already holds for a collection.
    async fn list(&self, collection_id: &str) -> Result<Vec<u32>, RecallError>;
    /// Deletes a whole collection; returns the backend's success flag.
    async fn purge(&self, collection_id: &str) -> Result<bool, RecallError>;
}

/// One embedded chunk as stored by the backend. The hash is the item key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorItem {
    pub hash: u32,
    pub text: String,
    pub index: usize,
    pub metadata: Value,
}

/// A single query result with inline text.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResultItem {
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// Query response. The backend either returns `items` with inline text, or
/// only `hashes` (plus aligned `metadata`), in which case the caller must
/// recover text from its own cache.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub items: Option<Vec<QueryResultItem>>,
    #[serde(default)]
    pub hashes: Option<Vec<u32>>,
    #[serde(default)]
    pub metadata: Option<Vec<Value>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceParams<'a> {
    source: &'a str,
    model: &'a str,
    api_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRequest<'a> {
    collection_id: &'a str,
    items: &'a [VectorItem],
    #[serde(flatten)]
    source: SourceParams<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    collection_id: &'a str,
    search_text: &'a str,
    top_k: usize,
    threshold: f32,
    include_text: bool,
    #[serde(flatten)]
    source: SourceParams<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionRequest<'a> {
    collection_id: &'a str,
    #[serde(flatten)]
    source: SourceParams<'a>,
}

pub struct VectorStoreClient {
    base_url: String,
    source: EmbeddingSourceConfig,
    client: reqwest::Client,
}

impl VectorStoreClient {
    /// Validates the connection settings and builds a client. Fails fast
    /// before any network call when the backend or source is not configured.
    pub fn new(settings: &Settings) -> Result<Self, RecallError> {
        let base_url = settings.backend_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RecallError::Configuration(
                "vector backend URL is not configured".to_string(),
            ));
        }
        let source = settings.source.clone();
        if source.source.trim().is_empty() {
            return Err(RecallError::Configuration(
                "embedding source is not configured".to_string(),
            ));
        }
        if source.model.trim().is_empty() || source.api_url.trim().is_empty() {
            return Err(RecallError::Configuration(format!(
                "embedding source {:?} is missing its model or API URL",
                source.source
            )));
        }
        Ok(Self {
            base_url,
            source,
            client: reqwest::Client::new(),
        })
    }

    fn source_params(&self) -> SourceParams<'_> {
        SourceParams {
            source: &self.source.source,
            model: &self.source.model,
            api_url: &self.source.api_url,
            keep_alive: self.source.keep_alive,
        }
    }
}

#[async_trait]
impl VectorStore for VectorStoreClient {
    /// Inserts a batch of items. A non-2xx response fails the whole batch.
    async fn insert(
        &self,
        collection_id: &str,
        items: &[VectorItem],
    ) -> Result<(), RecallError> {
        let body = InsertRequest {
            collection_id,
            items,
            source: self.source_params(),
        };
        let response = self
            .client
            .post(format!("{}/insert", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(RecallError::network)?;
        if !response.status().is_success() {
            return Err(RecallError::Network(format!(
                "insert into {} failed: {}",
                collection_id,
                response.status()
            )));
        }
        Ok(())
    }

    /// Queries a collection for the `top_k` items most similar to
    /// `search_text`, filtered by `threshold`.
    async fn query(
        &self,
        collection_id: &str,
        search_text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<QueryResponse, RecallError> {
        let body = QueryRequest {
            collection_id,
            search_text,
            top_k,
            threshold,
            include_text: true,
            source: self.source_params(),
        };
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(RecallError::network)?;
        if !response.status().is_success() {
            return Err(RecallError::Network(format!(
                "query of {} failed: {}",
                collection_id,
                response.status()
            )));
        }
        response.json().await.map_err(RecallError::network)
    }

    /// Lists the hashes the backend already holds for a collection.
    async fn list(&self, collection_id: &str) -> Result<Vec<u32>, RecallError> {
        let body = CollectionRequest {
            collection_id,
            source: self.source_params(),
        };
        let response = self
            .client
            .post(format!("{}/list", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(RecallError::network)?;
        if !response.status().is_success() {
            return Err(RecallError::Network(format!(
                "list of {} failed: {}",
                collection_id,
                response.status()
            )));
        }
        response.json().await.map_err(RecallError::network)
    }

    /// Deletes a whole collection. Returns the backend's success flag.
    async fn purge(&self, collection_id: &str) -> Result<bool, RecallError> {
        let body = CollectionRequest {
            collection_id,
            source: self.source_params(),
        };
        let response = self
            .client
            .post(format!("{}/purge", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(RecallError::network)?;
        if !response.status().is_success() {
            return Err(RecallError::Network(format!(
                "purge of {} failed: {}",
                collection_id,
                response.status()
            )));
        }
        let payload: Value = response.json().await.unwrap_or(Value::Bool(true));
        Ok(payload
            .as_bool()
            .or_else(|| payload.get("success").and_then(Value::as_bool))
            .unwrap_or(true))
    }
}
