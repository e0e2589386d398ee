//! Host application seams.
//!
//! The chat application this crate augments owns the message history, the
//! file attachments, the world-info books, prompt assembly and settings
//! persistence. Each of those surfaces is modelled here as an async trait
//! the host implements; the pipeline never touches host state directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RecallError;
use crate::settings::{InjectPosition, InjectRole};

/// A single message in the host's chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the author.
    pub name: String,
    /// True for user messages, false for assistant messages.
    pub is_user: bool,
    /// Hidden messages are excluded from collection unless the selection
    /// explicitly includes them.
    pub hidden: bool,
    /// Raw message text.
    pub text: String,
}

/// Read-only view of the active chat session.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Identifier of the active chat, if any session is open.
    async fn active_chat_id(&self) -> Option<String>;
    /// Name of the active character, used for `{{char}}` substitution and
    /// the export header.
    async fn character_name(&self) -> String;
    /// Name of the user persona, used for `{{user}}` substitution.
    async fn user_name(&self) -> String;
    /// Ordered message list of the active chat.
    async fn messages(&self) -> Vec<ChatMessage>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub url: String,
    pub name: String,
    pub size: u64,
}

/// Read-only view of the host's file attachments across all scopes.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn attachments(&self) -> Vec<FileAttachment>;
    /// Fetches the raw text content of an attachment by its URL.
    async fn fetch(&self, url: &str) -> Result<String, RecallError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldInfoEntry {
    pub world: String,
    pub uid: String,
    pub key: Vec<String>,
    pub comment: String,
    pub content: String,
    pub disabled: bool,
}

/// Read-only view of the host's world-info books.
#[async_trait]
pub trait WorldInfoStore: Send + Sync {
    async fn entries(&self) -> Vec<WorldInfoEntry>;
}

/// Prompt-injection point exposed by the host.
///
/// Calling with empty text clears any prior injection registered under the
/// same tag.
#[async_trait]
pub trait PromptInjector: Send + Sync {
    async fn inject(
        &self,
        tag: &str,
        text: &str,
        position: InjectPosition,
        depth: u32,
        include_world_info: bool,
        role: InjectRole,
    );
}

/// Key-value persistence provided by the host. Used for the settings blob
/// and the per-chat task lists.
#[async_trait]
pub trait SettingsStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>, RecallError>;
    async fn save(&self, key: &str, value: &Value) -> Result<(), RecallError>;
}
