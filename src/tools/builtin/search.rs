//! Brave web search tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

pub struct BraveSearchTool;

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default)]
    count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

#[async_trait]
impl Tool for BraveSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "brave-search".to_string(),
            description: "Search the web. Returns titles, URLs and descriptions.".to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    ("query", PropertySchema::string("Search query")),
                    (
                        "count",
                        PropertySchema::integer("Number of results, 1-20")
                            .with_default(json!(5)),
                    ),
                ],
                vec!["query"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: SearchParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        if params.query.trim().is_empty() {
            return ToolResult::error("query must not be empty");
        }
        let count = params.count.unwrap_or(5).clamp(1, 20);

        let Some(ref brave) = ctx.integrations.brave else {
            return ToolResult::error_with_code(
                "Brave search is not configured; set brave.api_key in integrations.toml",
                "not_configured",
            );
        };

        let response = crate::http::shared_client()
            .get(BRAVE_ENDPOINT)
            .header("X-Subscription-Token", &brave.api_key)
            .header("Accept", "application/json")
            .query(&[("q", params.query.as_str()), ("count", &count.to_string())])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("search request failed: {}", e)),
        };
        if !response.status().is_success() {
            return ToolResult::error(format!(
                "search returned status {}",
                response.status().as_u16()
            ));
        }

        let body: BraveResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("bad search response: {}", e)),
        };

        let results: Vec<Value> = body
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(count as usize)
            .map(|r| json!({"title": r.title, "url": r.url, "description": r.description}))
            .collect();

        ToolResult::success(json!({"query": params.query, "results": results}))
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
    async fn test_missing_api_key_is_structured_error() {
        let root = TempDir::new().unwrap();
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let ctx = ToolContext::noop(root.path().to_path_buf(), session);

        let result = BraveSearchTool
            .execute(json!({"query": "rust async"}), &ctx)
            .await;
        assert!(!result.is_success());
        assert_eq!(result.output["code"], "not_configured");
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let root = TempDir::new().unwrap();
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let ctx = ToolContext::noop(root.path().to_path_buf(), session);

        let result = BraveSearchTool.execute(json!({"query": "  "}), &ctx).await;
        assert!(!result.is_success());
    }
}
