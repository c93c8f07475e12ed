//! Channel identity of the current session.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::session::Channel;
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult};

pub struct SessionInfoTool;

#[async_trait]
impl Tool for SessionInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "session-info".to_string(),
            description: "Return the identifiers of the channel this session is attached to."
                .to_string(),
            input_schema: ToolInputSchema::default(),
        }
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ToolResult {
        let session = ctx.session.lock().await;
        let mut output = match &session.channel {
            Channel::Discord {
                channel_id,
                guild_id,
                is_nsfw,
            } => json!({
                "channel": "discord",
                "channel_id": channel_id,
                "guild_id": guild_id,
                "is_nsfw": is_nsfw,
            }),
            Channel::Matrix { room_id } => json!({
                "channel": "matrix",
                "room_id": room_id,
            }),
            Channel::Internal { job_id } => json!({
                "channel": "internal",
                "job_id": job_id,
            }),
        };
        output["session_id"] = json!(session.id());
        ToolResult::success(output)
    }
}
