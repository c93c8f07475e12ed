//! Dynamic one-shot scheduling. The job is persisted through the
//! scheduler so it survives restarts, and armed live so it fires without
//! one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{CronJobConfig, ScheduleSpec};
use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

pub struct ScheduleTool;

#[derive(Debug, Deserialize)]
struct ScheduleParams {
    id: String,
    at: String,
    prompt: String,
    #[serde(default)]
    delivery: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

#[async_trait]
impl Tool for ScheduleTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "schedule".to_string(),
            description: "Schedule a one-shot prompt for yourself at a future time.".to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    ("id", PropertySchema::string("Slug identifying the job")),
                    (
                        "at",
                        PropertySchema::string("ISO 8601 timestamp, must be in the future"),
                    ),
                    ("prompt", PropertySchema::string("Prompt to run at that time")),
                    (
                        "delivery",
                        PropertySchema::string("announce | webhook | none")
                            .with_default(json!("announce")),
                    ),
                    (
                        "target",
                        PropertySchema::string("Target session id, or 'last'")
                            .with_default(json!("last")),
                    ),
                ],
                vec!["id", "at", "prompt"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ScheduleParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };

        if !crate::config::is_valid_slug(&params.id) {
            return ToolResult::error(format!("'{}' is not a valid job id", params.id));
        }
        let when = match DateTime::parse_from_rfc3339(&params.at) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => return ToolResult::error(format!("invalid timestamp '{}': {}", params.at, e)),
        };
        if when <= Utc::now() {
            return ToolResult::error(format!("timestamp {} is in the past", params.at));
        }

        let delivery = params.delivery.unwrap_or_else(|| "announce".to_string());
        if !["announce", "webhook", "none"].contains(&delivery.as_str()) {
            return ToolResult::error(format!("unknown delivery '{}'", delivery));
        }

        let job = CronJobConfig {
            id: params.id.clone(),
            enabled: true,
            schedule: ScheduleSpec::At {
                at: when.to_rfc3339(),
            },
            execution: "isolated".to_string(),
            delivery,
            target: params.target.unwrap_or_else(|| "last".to_string()),
            prompt: params.prompt,
            model: None,
            webhook_url: None,
        };

        let Some(ref scheduler) = ctx.scheduler else {
            return ToolResult::error("scheduler is not available in this context");
        };
        if let Err(e) = scheduler.add_one_shot(job).await {
            return ToolResult::error(format!("failed to schedule: {}", e));
        }

        ToolResult::success(json!({
            "scheduled": true,
            "id": params.id,
            "at": when.to_rfc3339(),
        }))
    }
}
