//! The two terminal tools: `respond` delivers content to the session's
//! channel, `no-response` ends the turn silently. Unless `final` is
//! explicitly false, the engine terminates the turn after either.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sandbox::path::resolve_sandbox_path;
use crate::tools::{
    Attachment, PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

pub struct RespondTool;

#[derive(Debug, Deserialize)]
struct RespondParams {
    content: String,
    #[serde(rename = "final")]
    is_final: Option<bool>,
    #[serde(default)]
    attachments: Option<Vec<String>>,
}

#[async_trait]
impl Tool for RespondTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "respond".to_string(),
            description: "Send a message to the user on the current channel. Set final to false \
                          to keep working after the message is delivered."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    ("content", PropertySchema::string("The message to deliver")),
                    (
                        "final",
                        PropertySchema::boolean("End the turn after sending (default true)")
                            .with_default(json!(true)),
                    ),
                    (
                        "attachments",
                        PropertySchema::string_array(
                            "Virtual paths of files to attach (e.g. /workspace/report.pdf)",
                        ),
                    ),
                ],
                vec!["content"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: RespondParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        if params.content.trim().is_empty() {
            return ToolResult::error("content must not be empty");
        }

        let mut attachments: Vec<Attachment> = Vec::new();
        for path in params.attachments.unwrap_or_default() {
            let real = match resolve_sandbox_path(&ctx.agent_root, &path) {
                Ok(p) => p,
                Err(e) => return ToolResult::error(e.to_string()),
            };
            match std::fs::read(&real) {
                Ok(bytes) => attachments.push(Attachment {
                    filename: real
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "attachment".to_string()),
                    bytes,
                }),
                Err(e) => return ToolResult::error(format!("cannot attach {}: {}", path, e)),
            }
        }

        let is_final = params.is_final.unwrap_or(true);
        if let Err(e) = (ctx.send)(params.content, attachments).await {
            log::warn!("[TOOL:respond] send failed for {}: {}", ctx.agent_slug, e);
            return ToolResult::error(format!("delivery failed: {}", e));
        }

        ToolResult::success(json!({"final": is_final, "sent": true}))
    }
}

pub struct NoResponseTool;

#[async_trait]
impl Tool for NoResponseTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "no-response".to_string(),
            description: "End the turn without sending anything to the user.".to_string(),
            input_schema: ToolInputSchema::default(),
        }
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::success(json!({"final": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Channel, Session};
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn context_capturing_sends(
        root: &TempDir,
    ) -> (ToolContext, Arc<StdMutex<Vec<String>>>) {
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let sent: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let mut ctx = ToolContext::noop(root.path().to_path_buf(), session);
        ctx.send = Arc::new(move |content, _attachments| {
            let sink = Arc::clone(&sent_clone);
            Box::pin(async move {
                sink.lock().unwrap().push(content);
                Ok(())
            })
        });
        (ctx, sent)
    }

    #[tokio::test]
    async fn test_respond_sends_and_reports_final() {
        let root = TempDir::new().unwrap();
        let (ctx, sent) = context_capturing_sends(&root);

        let tool = RespondTool;
        let result = tool
            .execute(json!({"content": "hi there"}), &ctx)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["final"], true);
        assert_eq!(result.output["sent"], true);
        assert_eq!(sent.lock().unwrap().as_slice(), &["hi there".to_string()]);
    }

    #[tokio::test]
    async fn test_respond_non_final() {
        let root = TempDir::new().unwrap();
        let (ctx, _sent) = context_capturing_sends(&root);

        let result = RespondTool
            .execute(json!({"content": "progress...", "final": false}), &ctx)
            .await;
        assert_eq!(result.output["final"], false);
    }

    #[tokio::test]
    async fn test_respond_rejects_empty_content() {
        let root = TempDir::new().unwrap();
        let (ctx, sent) = context_capturing_sends(&root);

        let result = RespondTool.execute(json!({"content": "  "}), &ctx).await;
        assert!(!result.is_success());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_response_is_terminal_and_silent() {
        let root = TempDir::new().unwrap();
        let (ctx, sent) = context_capturing_sends(&root);

        let result = NoResponseTool.execute(json!({}), &ctx).await;
        assert!(result.is_success());
        assert_eq!(result.output["final"], true);
        assert!(sent.lock().unwrap().is_empty());
    }
}
