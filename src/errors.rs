use thiserror::Error;

/// Error taxonomy for the vectorization and retrieval pipeline.
///
/// `Configuration` and `State` fail fast before any network call; `Network`
/// aborts the operation that issued it; `CacheMiss` is only ever raised for a
/// single task's results and is absorbed by the retrieval loop.
#[derive(Debug, Error)]
pub enum RecallError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("cache miss for collection {0}")]
    CacheMiss(String),
    #[error("state error: {0}")]
    State(String),
}

impl RecallError {
    pub fn network<E: std::fmt::Display>(err: E) -> Self {
        RecallError::Network(err.to_string())
    }
}
