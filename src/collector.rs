//! Content collection.
//!
//! Reads the three content sources (chat range, selected files, selected
//! world-info entries), applies tag filtering to chat messages, and yields
//! a flat list of addressable items. The same pass also backs the export
//! document and the preview view.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::host::{ChatStore, FileStore, WorldInfoStore};
use crate::settings::Settings;
use crate::tagfilter::{Diagnostic, TagFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Chat,
    File,
    WorldInfo,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Chat => "chat",
            ContentType::File => "file",
            ContentType::WorldInfo => "world_info",
        }
    }
}

/// One addressable piece of content, produced fresh on every collection
/// pass and never persisted.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub kind: ContentType,
    pub text: String,
    pub metadata: Map<String, Value>,
    pub selected: bool,
}

/// Result of a collection pass, with the extraction diagnostics that
/// accumulated along the way.
#[derive(Debug, Default)]
pub struct Collected {
    pub items: Vec<ContentItem>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs one collection pass over all three sources. Output order is stable:
/// chat, then files, then world info.
pub async fn collect(
    settings: &Settings,
    chat: &dyn ChatStore,
    files: &dyn FileStore,
    world_info: &dyn WorldInfoStore,
) -> Collected {
    let mut out = Collected::default();
    let filter = TagFilter::new(&settings.blacklist);

    collect_chat(settings, chat, &filter, &mut out).await;
    collect_files(settings, files, &mut out).await;
    collect_world_info(settings, world_info, &mut out).await;

    tracing::debug!(
        "Collected {} items ({} diagnostics)",
        out.items.len(),
        out.diagnostics.len()
    );
    out
}

async fn collect_chat(
    settings: &Settings,
    chat: &dyn ChatStore,
    filter: &TagFilter,
    out: &mut Collected,
) {
    let selection = &settings.selection.chat;
    if !selection.enabled {
        return;
    }

    let messages = chat.messages().await;
    let user_name = chat.user_name().await;
    let character_name = chat.character_name().await;

    let start = selection.start.min(messages.len());
    let end = if selection.end < 0 {
        messages.len()
    } else {
        (selection.end as usize).min(messages.len())
    };

    for (index, message) in messages.iter().enumerate().take(end).skip(start) {
        let included_role = if message.is_user {
            selection.include_user
        } else {
            selection.include_assistant
        };
        if !included_role {
            continue;
        }
        if message.hidden && !selection.include_hidden {
            continue;
        }

        let substituted = substitute_variables(&message.text, &user_name, &character_name);
        let extraction = filter.extract(&substituted, &selection.tag_expressions);
        out.diagnostics.extend(extraction.diagnostics);

        let mut metadata = Map::new();
        metadata.insert("index".to_string(), json!(index));
        metadata.insert("name".to_string(), json!(message.name));
        // An empty item still marks the message as explicitly selected.
        out.items.push(ContentItem {
            kind: ContentType::Chat,
            text: extraction.text,
            metadata,
            selected: true,
        });
    }
}

async fn collect_files(settings: &Settings, files: &dyn FileStore, out: &mut Collected) {
    let selection = &settings.selection.files;
    if !selection.enabled {
        return;
    }

    for attachment in files.attachments().await {
        if !selection.selected_urls.iter().any(|u| u == &attachment.url) {
            continue;
        }
        let text = match files.fetch(&attachment.url).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("Failed to fetch file {}: {}", attachment.url, err);
                continue;
            }
        };
        let mut metadata = Map::new();
        metadata.insert("url".to_string(), json!(attachment.url));
        metadata.insert("name".to_string(), json!(attachment.name));
        metadata.insert("size".to_string(), json!(attachment.size));
        out.items.push(ContentItem {
            kind: ContentType::File,
            text,
            metadata,
            selected: true,
        });
    }
}

async fn collect_world_info(
    settings: &Settings,
    world_info: &dyn WorldInfoStore,
    out: &mut Collected,
) {
    let selection = &settings.selection.world_info;
    if !selection.enabled {
        return;
    }

    for entry in world_info.entries().await {
        if entry.disabled {
            continue;
        }
        let selected = selection
            .selected
            .get(&entry.world)
            .is_some_and(|uids| uids.iter().any(|u| u == &entry.uid));
        if !selected {
            continue;
        }
        let mut metadata = Map::new();
        metadata.insert("world".to_string(), json!(entry.world));
        metadata.insert("uid".to_string(), json!(entry.uid));
        metadata.insert("key".to_string(), json!(entry.key));
        metadata.insert("comment".to_string(), json!(entry.comment));
        out.items.push(ContentItem {
            kind: ContentType::WorldInfo,
            text: entry.content,
            metadata,
            selected: true,
        });
    }
}

/// Replaces the `{{user}}` and `{{char}}` macros the host uses in message
/// text.
pub fn substitute_variables(text: &str, user_name: &str, character_name: &str) -> String {
    text.replace("{{user}}", user_name)
        .replace("{{char}}", character_name)
}

/// Collected items grouped per type for the preview view.
#[derive(Debug, Default, Serialize)]
pub struct PreviewGroups {
    pub chat: Vec<String>,
    pub files: Vec<String>,
    pub world_info: Vec<String>,
}

pub fn preview(items: &[ContentItem]) -> PreviewGroups {
    let mut groups = PreviewGroups::default();
    for item in items {
        match item.kind {
            ContentType::Chat => groups.chat.push(item.text.clone()),
            ContentType::File => groups.files.push(item.text.clone()),
            ContentType::WorldInfo => groups.world_info.push(item.text.clone()),
        }
    }
    groups
}

const EMPTY_SECTION: &str = "无";

/// Renders the user-facing export document: a header followed by the file,
/// world-info and chat sections, listing the collection output verbatim.
pub fn render_export(character_name: &str, items: &[ContentItem]) -> String {
    let groups = preview(items);
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

    let mut doc = String::new();
    doc.push_str(&format!("{} - {}\n\n", character_name, timestamp));

    doc.push_str("=== files ===\n");
    push_section(&mut doc, &groups.files);
    doc.push_str("\n=== world info ===\n");
    push_section(&mut doc, &groups.world_info);
    doc.push_str("\n=== chat ===\n");
    push_section(&mut doc, &groups.chat);

    doc
}

fn push_section(doc: &mut String, entries: &[String]) {
    if entries.is_empty() {
        doc.push_str(EMPTY_SECTION);
        doc.push('\n');
        return;
    }
    for entry in entries {
        doc.push_str(entry);
        doc.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_both_macros() {
        let out = substitute_variables("{{user}} greets {{char}}", "Ann", "Bot");
        assert_eq!(out, "Ann greets Bot");
    }

    #[test]
    fn export_marks_empty_sections() {
        let doc = render_export("Bot", &[]);
        assert!(doc.contains("=== files ===\n无"));
        assert!(doc.contains("=== world info ===\n无"));
        assert!(doc.contains("=== chat ===\n无"));
    }

    #[test]
    fn export_keeps_fixed_section_order() {
        let doc = render_export("Bot", &[]);
        let files = doc.find("=== files ===").unwrap();
        let world = doc.find("=== world info ===").unwrap();
        let chat = doc.find("=== chat ===").unwrap();
        assert!(files < world && world < chat);
    }

    #[test]
    fn preview_groups_by_type() {
        let items = vec![
            ContentItem {
                kind: ContentType::Chat,
                text: "a".into(),
                metadata: Map::new(),
                selected: true,
            },
            ContentItem {
                kind: ContentType::File,
                text: "b".into(),
                metadata: Map::new(),
                selected: true,
            },
        ];
        let groups = preview(&items);
        assert_eq!(groups.chat, vec!["a"]);
        assert_eq!(groups.files, vec!["b"]);
        assert!(groups.world_info.is_empty());
    }
}
