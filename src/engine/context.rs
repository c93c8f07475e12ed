//! Context assembly: the system prompt and the provider message list.
//!
//! The system prompt is rebuilt from disk on every provider call so block
//! edits, new skills and pinned-file changes made by tools earlier in the
//! same turn are visible immediately.

use chrono::Utc;
use std::path::Path;

use crate::memory::load_memory_blocks;
use crate::sandbox::path::resolve_sandbox_path;
use crate::session::{squash_messages, truncate_to_turns, Channel, Message, Session, MAX_TURNS};
use crate::skills::load_skills;

/// Compose the full system prompt for one provider call.
pub fn build_system_prompt(agent_root: &Path, session: &Session) -> String {
    let mut prompt = String::new();

    let base = std::fs::read_to_string(agent_root.join("core.md")).unwrap_or_else(|e| {
        log::warn!("[ENGINE] core.md unreadable: {}", e);
        String::new()
    });
    prompt.push_str("<base_instructions>\n");
    prompt.push_str(base.trim_end());
    prompt.push_str("\n</base_instructions>\n\n");

    prompt.push_str("<metadata>\n");
    prompt.push_str(&format!("time: {}\n", Utc::now().to_rfc3339()));
    match &session.channel {
        Channel::Discord {
            channel_id,
            guild_id,
            is_nsfw,
        } => {
            prompt.push_str("channel: discord\n");
            prompt.push_str(&format!("channel_id: {}\n", channel_id));
            if let Some(guild) = guild_id {
                prompt.push_str(&format!("guild_id: {}\n", guild));
            }
            prompt.push_str(&format!("nsfw: {}\n", is_nsfw));
        }
        Channel::Matrix { room_id } => {
            prompt.push_str("channel: matrix\n");
            prompt.push_str(&format!("room_id: {}\n", room_id));
        }
        Channel::Internal { job_id } => {
            prompt.push_str("channel: internal\n");
            prompt.push_str(&format!("job_id: {}\n", job_id));
        }
    }
    prompt.push_str("</metadata>\n\n");

    let blocks = load_memory_blocks(agent_root);
    prompt.push_str("<memory_blocks>\n");
    for block in &blocks {
        prompt.push_str(&format!("## {} — {}\n", block.label, block.description));
        prompt.push_str(&block.content);
        if !block.content.ends_with('\n') {
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("</memory_blocks>\n");

    let skills = load_skills(agent_root);
    if !skills.is_empty() {
        prompt.push_str("\n<skills>\n");
        prompt.push_str("Load a skill with read-skill when it matches the task.\n");
        for skill in &skills {
            prompt.push_str(&format!(
                "- {}: {} (use when: {})\n",
                skill.slug, skill.summary, skill.when_to_use
            ));
        }
        prompt.push_str("</skills>\n");
    }

    if !session.opened_files.is_empty() {
        prompt.push_str("\n<opened_files>\n");
        for path in &session.opened_files {
            match resolve_sandbox_path(agent_root, path)
                .map_err(|e| e.to_string())
                .and_then(|real| std::fs::read(&real).map_err(|e| e.to_string()))
            {
                Ok(bytes) => {
                    prompt.push_str(&format!("=== {} ({} bytes) ===\n", path, bytes.len()));
                    prompt.push_str(&String::from_utf8_lossy(&bytes));
                    prompt.push('\n');
                }
                Err(e) => {
                    prompt.push_str(&format!("=== {} (unreadable: {}) ===\n", path, e));
                }
            }
        }
        prompt.push_str("</opened_files>\n");
    }

    prompt
}

/// Shape the message list for the provider: the last `MAX_TURNS` turns of
/// history, then the pending tool responses, squashed so no two adjacent
/// user/assistant messages share a role.
pub fn build_provider_messages(session: &Session) -> Vec<Message> {
    let mut messages: Vec<Message> =
        truncate_to_turns(&session.history, MAX_TURNS).to_vec();
    messages.extend(session.pending_tool_messages.iter().cloned());
    squash_messages(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, ToolResponseContent, UserContent};
    use serde_json::json;
    use tempfile::TempDir;

    fn agent_root() -> TempDir {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("core.md"), "You are Ada.").unwrap();
        for sub in ["workspace", "memories", "blocks", "skills"] {
            std::fs::create_dir_all(root.path().join(sub)).unwrap();
        }
        root
    }

    fn discord_session() -> Session {
        Session::new(Channel::Discord {
            channel_id: "42".to_string(),
            guild_id: Some("7".to_string()),
            is_nsfw: false,
        })
    }

    #[test]
    fn test_prompt_sections_present() {
        let root = agent_root();
        std::fs::write(
            root.path().join("blocks/persona.md"),
            "+++\ndescription = \"identity\"\n+++\nI am Ada.",
        )
        .unwrap();
        std::fs::write(
            root.path().join("skills/report.md"),
            "+++\nsummary = \"weekly report\"\nwhenToUse = \"on mondays\"\n+++\nbody",
        )
        .unwrap();

        let session = discord_session();
        let prompt = build_system_prompt(root.path(), &session);

        assert!(prompt.contains("<base_instructions>\nYou are Ada."));
        assert!(prompt.contains("channel: discord"));
        assert!(prompt.contains("channel_id: 42"));
        assert!(prompt.contains("guild_id: 7"));
        assert!(prompt.contains("persona — identity"));
        assert!(prompt.contains("I am Ada."));
        assert!(prompt.contains("report: weekly report"));
    }

    #[test]
    fn test_skills_section_omitted_when_empty() {
        let root = agent_root();
        let session = discord_session();
        let prompt = build_system_prompt(root.path(), &session);
        assert!(!prompt.contains("<skills>"));
    }

    #[test]
    fn test_opened_files_include_content_and_size() {
        let root = agent_root();
        std::fs::write(root.path().join("workspace/notes.md"), "pinned text").unwrap();

        let mut session = discord_session();
        session.pin_file("/workspace/notes.md");
        let prompt = build_system_prompt(root.path(), &session);

        assert!(prompt.contains("<opened_files>"));
        assert!(prompt.contains("/workspace/notes.md (11 bytes)"));
        assert!(prompt.contains("pinned text"));
    }

    #[test]
    fn test_provider_messages_append_pending_then_squash() {
        let mut session = discord_session();
        session.history.push(Message::user_text("a"));
        session.history.push(Message::user_text("b"));
        session.pending_tool_messages.push(Message::ToolResponse {
            content: ToolResponseContent {
                id: "1".to_string(),
                name: "write".to_string(),
                output: json!({"success": true}),
            },
        });
        session.pending_tool_messages.push(Message::User {
            content: vec![UserContent::Text {
                content: "image follows".to_string(),
            }],
            id: None,
            persist: None,
        });

        let messages = build_provider_messages(&session);
        // Two user messages squashed, tool response kept, trailing user kept
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], Message::User { .. }));
        assert!(matches!(messages[1], Message::ToolResponse { .. }));
        assert!(matches!(messages[2], Message::User { .. }));
    }
}
