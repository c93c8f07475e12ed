//! Session and message model.
//!
//! A session is the conversational state attached to one chat endpoint.
//! Sessions are discriminated by channel; messages are discriminated by
//! role. Both dispatch on their discriminator in exactly two places:
//! system-prompt assembly and channel-send lookup.

pub mod store;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Maximum number of turns kept in the provider context. A turn begins at
/// a user-role message (or at the start of history).
pub const MAX_TURNS: usize = 30;

/// Predicate consulted before any outbound send for this session.
/// Returning false suppresses delivery.
pub type SendFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Channel a session is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Channel {
    Discord {
        channel_id: String,
        #[serde(default)]
        guild_id: Option<String>,
        #[serde(default)]
        is_nsfw: bool,
    },
    Matrix {
        room_id: String,
    },
    /// Ephemeral channel for isolated cron runs. Never persisted.
    Internal {
        job_id: String,
    },
}

impl Channel {
    pub fn kind(&self) -> &'static str {
        match self {
            Channel::Discord { .. } => "discord",
            Channel::Matrix { .. } => "matrix",
            Channel::Internal { .. } => "internal",
        }
    }

    /// Stable session id derived from the channel identity.
    pub fn session_id(&self) -> String {
        match self {
            Channel::Discord {
                channel_id,
                guild_id: Some(guild),
                ..
            } => format!("discord:{}|{}", channel_id, guild),
            Channel::Discord { channel_id, .. } => format!("discord:{}", channel_id),
            Channel::Matrix { room_id } => format!("matrix:{}", room_id),
            Channel::Internal { job_id } => format!("cron:{}", job_id),
        }
    }

    /// Sub-key used for engine channel overrides (guild id / room id).
    pub fn override_key(&self) -> Option<&str> {
        match self {
            Channel::Discord {
                guild_id: Some(guild),
                ..
            } => Some(guild),
            Channel::Matrix { room_id } => Some(room_id),
            _ => None,
        }
    }
}

/// Content a user-role message can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text {
        content: String,
    },
    Image {
        media_type: String,
        data: Vec<u8>,
    },
    /// Persisted form of `Image`: bytes live on disk keyed by BLAKE3 hash.
    /// Only the store produces and consumes this variant.
    ImageRef {
        id: String,
        media_type: String,
    },
}

/// Content an assistant-role message can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        content: String,
    },
    Image {
        media_type: String,
        data: Vec<u8>,
    },
    ImageRef {
        id: String,
        media_type: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
}

/// A tool response paired with the assistant tool call of the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponseContent {
    pub id: String,
    pub name: String,
    pub output: Value,
}

/// Message: tagged union over roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: Vec<UserContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Explicitly false opts this message out of persistence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persist: Option<bool>,
    },
    Assistant {
        content: Vec<AssistantContent>,
    },
    ToolResponse {
        content: ToolResponseContent,
    },
    System {
        content: String,
    },
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User {
            content: vec![UserContent::Text {
                content: text.into(),
            }],
            id: None,
            persist: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message::System {
            content: text.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::ToolResponse { .. } => "tool_response",
            Message::System { .. } => "system",
        }
    }
}

/// One agent's conversational state for one channel endpoint.
pub struct Session {
    pub channel: Channel,
    /// Ordered message history.
    pub history: Vec<Message>,
    /// Pinned file paths (virtual), injected into every system prompt.
    pub opened_files: Vec<String>,
    /// Tool responses awaiting commit before the next provider call.
    pub pending_tool_messages: Vec<Message>,
    /// Image contents queued by tools, drained into a synthetic user
    /// message at the start of the next iteration.
    pub pending_images: Vec<UserContent>,
    /// Single-flight gate: no two turns may run concurrently.
    pub busy: bool,
    /// Epoch seconds of last activity, used by `target = "last"`.
    pub last_activity: i64,
    /// Optional outbound-send interceptor.
    pub send_filter: Option<SendFilter>,
    /// Platform message id of the last inbound message, for reactions.
    pub last_message_id: Option<String>,
}

impl Session {
    pub fn new(channel: Channel) -> Self {
        Session {
            channel,
            history: Vec::new(),
            opened_files: Vec::new(),
            pending_tool_messages: Vec::new(),
            pending_images: Vec::new(),
            busy: false,
            last_activity: Utc::now().timestamp(),
            send_filter: None,
            last_message_id: None,
        }
    }

    pub fn id(&self) -> String {
        self.channel.session_id()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now().timestamp();
    }

    /// Pin a file path. Keeps insertion order, no duplicates.
    pub fn pin_file(&mut self, path: &str) {
        if !self.opened_files.iter().any(|p| p == path) {
            self.opened_files.push(path.to_string());
        }
    }

    /// Unpin a file path. Returns whether it was pinned.
    pub fn unpin_file(&mut self, path: &str) -> bool {
        let before = self.opened_files.len();
        self.opened_files.retain(|p| p != path);
        self.opened_files.len() != before
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("history_len", &self.history.len())
            .field("opened_files", &self.opened_files)
            .field("pending_tool_messages", &self.pending_tool_messages.len())
            .field("pending_images", &self.pending_images.len())
            .field("busy", &self.busy)
            .field("last_activity", &self.last_activity)
            .field("has_send_filter", &self.send_filter.is_some())
            .finish()
    }
}

/// Return the tail of `history` containing at most `max_turns` turns,
/// never splitting a turn. A turn begins at a user-role message or at the
/// start of history.
pub fn truncate_to_turns(history: &[Message], max_turns: usize) -> &[Message] {
    if history.is_empty() || max_turns == 0 {
        return &history[history.len()..];
    }

    let mut turns = 0;
    let mut start = 0;
    for (idx, msg) in history.iter().enumerate().rev() {
        if msg.is_user() || idx == 0 {
            turns += 1;
            if turns >= max_turns {
                start = idx;
                break;
            }
        }
    }
    &history[start..]
}

/// Merge consecutive same-role user/assistant messages by concatenating
/// their content arrays. Relative content order is preserved; this is a
/// normalization, not a reordering.
pub fn squash_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        let msg = match (out.pop(), msg) {
            (
                Some(Message::User {
                    content: mut prev,
                    id,
                    persist,
                }),
                Message::User { content, .. },
            ) => {
                prev.extend(content);
                Message::User {
                    content: prev,
                    id,
                    persist,
                }
            }
            (
                Some(Message::Assistant { content: mut prev }),
                Message::Assistant { content },
            ) => {
                prev.extend(content);
                Message::Assistant { content: prev }
            }
            (Some(last), msg) => {
                out.push(last);
                msg
            }
            (None, msg) => msg,
        };
        out.push(msg);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::user_text(text)
    }

    fn assistant(text: &str) -> Message {
        Message::Assistant {
            content: vec![AssistantContent::Text {
                content: text.to_string(),
            }],
        }
    }

    fn tool_response(id: &str) -> Message {
        Message::ToolResponse {
            content: ToolResponseContent {
                id: id.to_string(),
                name: "respond".to_string(),
                output: serde_json::json!({"success": true}),
            },
        }
    }

    #[test]
    fn test_session_ids() {
        let dm = Channel::Discord {
            channel_id: "42".to_string(),
            guild_id: None,
            is_nsfw: false,
        };
        assert_eq!(dm.session_id(), "discord:42");

        let guild = Channel::Discord {
            channel_id: "42".to_string(),
            guild_id: Some("7".to_string()),
            is_nsfw: false,
        };
        assert_eq!(guild.session_id(), "discord:42|7");

        let matrix = Channel::Matrix {
            room_id: "!room:example.org".to_string(),
        };
        assert_eq!(matrix.session_id(), "matrix:!room:example.org");

        let internal = Channel::Internal {
            job_id: "daily-digest".to_string(),
        };
        assert_eq!(internal.session_id(), "cron:daily-digest");
    }

    #[test]
    fn test_truncate_counts_turns_not_messages() {
        // 3 turns: each user message starts one
        let history = vec![
            user("a"),
            assistant("ra"),
            tool_response("1"),
            user("b"),
            assistant("rb"),
            user("c"),
            assistant("rc"),
        ];

        let tail = truncate_to_turns(&history, 2);
        assert_eq!(tail.len(), 4);
        assert!(tail[0].is_user());

        let tail = truncate_to_turns(&history, 1);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].is_user());

        // More turns requested than exist: whole history
        let tail = truncate_to_turns(&history, 30);
        assert_eq!(tail.len(), history.len());
    }

    #[test]
    fn test_truncate_never_splits_a_turn() {
        // History starting with assistant messages (no leading user):
        // the start of history counts as a turn boundary.
        let history = vec![assistant("orphan"), user("a"), assistant("ra")];
        let tail = truncate_to_turns(&history, 2);
        assert_eq!(tail.len(), 3);

        let tail = truncate_to_turns(&history, 1);
        assert_eq!(tail.len(), 2);
        assert!(tail[0].is_user());
    }

    #[test]
    fn test_truncate_empty_and_zero() {
        let history: Vec<Message> = vec![];
        assert!(truncate_to_turns(&history, 5).is_empty());

        let history = vec![user("a")];
        assert!(truncate_to_turns(&history, 0).is_empty());
    }

    #[test]
    fn test_squash_merges_adjacent_same_roles() {
        let messages = vec![
            user("a"),
            user("b"),
            assistant("x"),
            assistant("y"),
            user("c"),
        ];
        let squashed = squash_messages(messages);
        assert_eq!(squashed.len(), 3);

        match &squashed[0] {
            Message::User { content, .. } => {
                assert_eq!(content.len(), 2);
                match (&content[0], &content[1]) {
                    (
                        UserContent::Text { content: a },
                        UserContent::Text { content: b },
                    ) => {
                        assert_eq!(a, "a");
                        assert_eq!(b, "b");
                    }
                    _ => panic!("expected text contents in order"),
                }
            }
            _ => panic!("expected user message"),
        }

        // No two adjacent same roles remain for user/assistant
        for pair in squashed.windows(2) {
            let same = pair[0].role() == pair[1].role();
            let mergeable = matches!(pair[0], Message::User { .. } | Message::Assistant { .. });
            assert!(!(same && mergeable));
        }
    }

    #[test]
    fn test_squash_leaves_tool_responses_alone() {
        let messages = vec![
            assistant("x"),
            tool_response("1"),
            tool_response("2"),
            assistant("y"),
        ];
        let squashed = squash_messages(messages);
        assert_eq!(squashed.len(), 4);
    }

    #[test]
    fn test_pin_unpin() {
        let mut session = Session::new(Channel::Matrix {
            room_id: "!r:x".to_string(),
        });
        session.pin_file("/workspace/notes.md");
        session.pin_file("/workspace/notes.md");
        assert_eq!(session.opened_files.len(), 1);

        assert!(session.unpin_file("/workspace/notes.md"));
        assert!(!session.unpin_file("/workspace/notes.md"));
        assert!(session.opened_files.is_empty());
    }
}
