//! Task-scoped vectorization and retrieval for chat context injection.
//!
//! The pipeline extracts text from chat history, uploaded files and
//! world-info entries, chunks it, ships the chunks to a remote
//! embedding/vector backend under per-task collections, and on each
//! generation turn queries the enabled collections to inject the most
//! relevant snippets back into the prompt. The host chat application
//! plugs in through the traits in [`host`].

pub mod chunker;
pub mod collector;
pub mod errors;
pub mod host;
pub mod logging;
pub mod retrieval;
pub mod settings;
pub mod sync_gate;
pub mod tagfilter;
pub mod tasks;
pub mod vector_store;
pub mod vectorize;

pub use errors::RecallError;
pub use retrieval::{rearrange_chat, GenerationKind, RetrievalOutcome};
pub use settings::{Settings, SettingsService};
pub use sync_gate::SyncGate;
pub use tasks::{ChunkCache, TaskRegistry, VectorTask};
pub use vector_store::{VectorStore, VectorStoreClient};
pub use vectorize::{export_document, preview_content, synchronize, vectorize, SyncOutcome};
