//! Memory blocks: always-loaded markdown documents injected into every
//! system prompt.
//!
//! A block lives at `{agent_root}/blocks/{label}.md` and starts with a
//! TOML section delimited by `+++` lines carrying its description; the
//! markdown body below is the block content.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A loaded memory block.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    pub label: String,
    pub description: String,
    pub file_path: PathBuf,
    pub content_chars: usize,
    pub content: String,
}

#[derive(Debug, Deserialize, Default)]
struct BlockFrontmatter {
    #[serde(default)]
    description: String,
}

/// Split a document into its `+++`-fenced TOML frontmatter and body.
/// Returns None when the document carries no frontmatter.
pub fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("+++\n").or_else(|| raw.strip_prefix("+++\r\n"))?;
    let end = rest.find("\n+++")?;
    let toml_part = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((toml_part, body))
}

/// Load every memory block under `{agent_root}/blocks/`, sorted by label.
/// A block with malformed frontmatter still loads with an empty
/// description.
pub fn load_memory_blocks(agent_root: &Path) -> Vec<MemoryBlock> {
    let dir = agent_root.join("blocks");
    let mut blocks = Vec::new();

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return blocks,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(label) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("[MEMORY] failed to read block {}: {}", path.display(), e);
                continue;
            }
        };

        let (description, content) = match split_frontmatter(&raw) {
            Some((toml_part, body)) => {
                let front: BlockFrontmatter = toml::from_str(toml_part).unwrap_or_else(|e| {
                    log::warn!("[MEMORY] invalid frontmatter in {}: {}", path.display(), e);
                    BlockFrontmatter::default()
                });
                (front.description, body.to_string())
            }
            None => (String::new(), raw),
        };

        blocks.push(MemoryBlock {
            label,
            description,
            content_chars: content.chars().count(),
            content,
            file_path: path,
        });
    }

    blocks.sort_by(|a, b| a.label.cmp(&b.label));
    blocks
}
