//! Sandboxed command execution tool. The actual isolation lives in the
//! sandbox module; this surface validates configuration and shapes the
//! result for the model.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sandbox::{run_sandboxed, SandboxRequest};
use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

pub struct ExecTool;

#[derive(Debug, Deserialize)]
struct ExecParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

#[async_trait]
impl Tool for ExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exec".to_string(),
            description: "Run an allowlisted binary inside your sandbox. The command is a bare \
                          binary name; shell syntax is not available."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    (
                        "command",
                        PropertySchema::string("Binary name from your allowlist, e.g. 'ls'"),
                    ),
                    ("args", PropertySchema::string_array("Arguments to pass")),
                ],
                vec!["command"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ExecParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };

        let setting = match ctx.tools_config.get("exec") {
            Some(s) => s,
            None => {
                return ToolResult::error_with_code(
                    "exec is not configured; set an allowed_binaries list in tools.toml",
                    "not_configured",
                )
            }
        };
        let allowed: Vec<String> = match setting.allowed_binaries() {
            Some(bins) if !bins.is_empty() => bins.to_vec(),
            _ => {
                return ToolResult::error_with_code(
                    "exec has no allowed_binaries configured",
                    "not_configured",
                )
            }
        };

        let request = SandboxRequest {
            command: params.command,
            args: params.args,
            allowed_binaries: allowed,
            timeout_ms: setting.timeout_ms(),
            agent_root: ctx.agent_root.clone(),
        };

        match run_sandboxed(&request).await {
            Ok(output) => ToolResult::success(json!({
                "exit_code": output.exit_code,
                "stdout": output.stdout,
                "stderr": output.stderr,
            })),
            Err(message) => ToolResult::error(message),
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

    fn ctx_with_tools(toml_src: &str, root: &TempDir) -> ToolContext {
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let mut ctx = ToolContext::noop(root.path().to_path_buf(), session);
        ctx.tools_config = toml::from_str(toml_src).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_unconfigured_exec_is_structured_error() {
        let root = TempDir::new().unwrap();
        let ctx = ctx_with_tools("", &root);
        let result = ExecTool.execute(json!({"command": "ls"}), &ctx).await;
        assert!(!result.is_success());
        assert_eq!(result.output["code"], "not_configured");
    }

    #[tokio::test]
    async fn test_allowlist_miss_surfaces_exact_error() {
        let root = TempDir::new().unwrap();
        let ctx = ctx_with_tools(r#"exec = { allowed_binaries = ["ls"] }"#, &root);
        let result = ExecTool.execute(json!({"command": "nmap"}), &ctx).await;
        assert!(!result.is_success());
        assert_eq!(
            result.output["error"],
            "Command 'nmap' is not in the allowed binaries list."
        );
    }
}
