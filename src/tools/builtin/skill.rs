//! On-demand skill loading.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::skills::read_skill_body;
use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

pub struct ReadSkillTool;

#[derive(Debug, Deserialize)]
struct ReadSkillParams {
    slug: String,
}

#[async_trait]
impl Tool for ReadSkillTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read-skill".to_string(),
            description: "Load the full instructions of a skill from your skills index."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![("slug", PropertySchema::string("Skill slug from the index"))],
                vec!["slug"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ReadSkillParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        if !crate::config::is_valid_slug(&params.slug) {
            return ToolResult::error(format!("invalid skill slug '{}'", params.slug));
        }
        match read_skill_body(&ctx.agent_root, &params.slug) {
            Ok(content) => ToolResult::success(json!({
                "slug": params.slug,
                "content": content,
            })),
            Err(e) => ToolResult::error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Channel, Session};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_read_skill() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("skills")).unwrap();
        std::fs::write(
            root.path().join("skills/report.md"),
            "+++\nsummary = \"s\"\nwhenToUse = \"w\"\n+++\nDo the thing.",
        )
        .unwrap();

        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let ctx = ToolContext::noop(root.path().to_path_buf(), session);

        let result = ReadSkillTool.execute(json!({"slug": "report"}), &ctx).await;
        assert!(result.is_success());
        assert!(result.output["content"]
            .as_str()
            .unwrap()
            .contains("Do the thing."));

        let result = ReadSkillTool.execute(json!({"slug": "missing"}), &ctx).await;
        assert!(!result.is_success());

        // Slug traversal is rejected before touching the filesystem
        let result = ReadSkillTool
            .execute(json!({"slug": "../blocks/persona"}), &ctx)
            .await;
        assert!(!result.is_success());
    }
}
