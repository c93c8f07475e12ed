//! Workspace file tools: pinning, listing, writing, targeted edits.
//! Every path goes through the sandbox resolver.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::sandbox::path::resolve_sandbox_path;
use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

fn path_schema() -> ToolInputSchema {
    ToolInputSchema::new(
        vec![(
            "path",
            PropertySchema::string("Virtual path, e.g. /workspace/notes.md"),
        )],
        vec!["path"],
    )
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

/// Pin a file into the system prompt until closed.
pub struct OpenFileTool;

#[async_trait]
impl Tool for OpenFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "open-file".to_string(),
            description: "Pin a file so its full content stays visible in your context every \
                          iteration until you close it."
                .to_string(),
            input_schema: path_schema(),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: PathParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        let real = match resolve_sandbox_path(&ctx.agent_root, &params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        if !real.is_file() {
            return ToolResult::error(format!("{} does not exist", params.path));
        }

        let mut session = ctx.session.lock().await;
        session.pin_file(&params.path);
        ToolResult::success(json!({"opened_files": session.opened_files}))
    }
}

/// Unpin a previously opened file.
pub struct CloseFileTool;

#[async_trait]
impl Tool for CloseFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "close-file".to_string(),
            description: "Remove a file from the pinned set.".to_string(),
            input_schema: path_schema(),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: PathParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        let mut session = ctx.session.lock().await;
        let removed = session.unpin_file(&params.path);
        ToolResult::success(json!({
            "opened_files": session.opened_files,
            "removed": removed,
        }))
    }
}

/// List immediate children of a directory.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list-dir".to_string(),
            description: "List the immediate entries of a directory.".to_string(),
            input_schema: path_schema(),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: PathParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        let real = match resolve_sandbox_path(&ctx.agent_root, &params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let read = match std::fs::read_dir(&real) {
            Ok(read) => read,
            Err(e) => return ToolResult::error(format!("cannot list {}: {}", params.path, e)),
        };

        let mut entries: Vec<Value> = Vec::new();
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = match entry.path().symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => "symlink",
                Ok(meta) if meta.is_dir() => "directory",
                Ok(_) => "file",
                Err(_) => "file",
            };
            entries.push(json!({"name": name, "type": kind}));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        ToolResult::success(json!({"path": params.path, "entries": entries}))
    }
}

/// Write a file, creating parent directories.
pub struct WriteTool;

#[derive(Debug, Deserialize)]
struct WriteParams {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write".to_string(),
            description: "Write content to a file, creating parent directories. Memory blocks \
                          under /blocks must be markdown."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    ("path", PropertySchema::string("Virtual path to write")),
                    ("content", PropertySchema::string("Full file content")),
                ],
                vec!["path", "content"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: WriteParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };

        if params.path.starts_with("/blocks/")
            && Path::new(&params.path).extension().and_then(|e| e.to_str()) != Some("md")
        {
            return ToolResult::error("files under /blocks/ must have a .md extension");
        }

        let real = match resolve_sandbox_path(&ctx.agent_root, &params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        if let Some(parent) = real.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolResult::error(format!("cannot create parent dirs: {}", e));
            }
        }
        if let Err(e) = std::fs::write(&real, params.content.as_bytes()) {
            return ToolResult::error(format!("cannot write {}: {}", params.path, e));
        }

        ToolResult::success(json!({
            "path": params.path,
            "bytes_written": params.content.len(),
        }))
    }
}

/// Replace a unique occurrence of a string in a file.
pub struct StrReplaceTool;

#[derive(Debug, Deserialize)]
struct StrReplaceParams {
    path: String,
    old_text: String,
    new_text: String,
}

/// Characters of surrounding context returned with the edit.
const CONTEXT_CHARS: usize = 80;

#[async_trait]
impl Tool for StrReplaceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "str-replace".to_string(),
            description: "Replace one unique occurrence of old_text with new_text in a file. \
                          Fails when old_text is missing or ambiguous."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![
                    ("path", PropertySchema::string("Virtual path to edit")),
                    ("old_text", PropertySchema::string("Exact text to replace")),
                    ("new_text", PropertySchema::string("Replacement text")),
                ],
                vec!["path", "old_text", "new_text"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: StrReplaceParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        if params.old_text.is_empty() {
            return ToolResult::error("old_text must not be empty");
        }

        let real = match resolve_sandbox_path(&ctx.agent_root, &params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        let content = match std::fs::read_to_string(&real) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("cannot read {}: {}", params.path, e)),
        };

        let occurrences = content.matches(&params.old_text).count();
        if occurrences == 0 {
            return ToolResult::error(format!("old_text not found in {}", params.path));
        }
        if occurrences > 1 {
            return ToolResult::error(format!(
                "old_text occurs {} times in {}; provide a unique snippet",
                occurrences, params.path
            ));
        }

        let position = content.find(&params.old_text).unwrap();
        let updated = content.replacen(&params.old_text, &params.new_text, 1);
        if let Err(e) = std::fs::write(&real, updated.as_bytes()) {
            return ToolResult::error(format!("cannot write {}: {}", params.path, e));
        }

        // Excerpt around the edit so the model can verify the result.
        let mut start = position.saturating_sub(CONTEXT_CHARS);
        while start > 0 && !updated.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = (position + params.new_text.len() + CONTEXT_CHARS).min(updated.len());
        while end < updated.len() && !updated.is_char_boundary(end) {
            end += 1;
        }

        ToolResult::success(json!({
            "path": params.path,
            "context": &updated[start..end],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Channel, Session};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn setup() -> (TempDir, ToolContext) {
        let root = TempDir::new().unwrap();
        for sub in ["workspace", "memories", "blocks", "skills"] {
            std::fs::create_dir_all(root.path().join(sub)).unwrap();
        }
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let ctx = ToolContext::noop(root.path().to_path_buf(), session);
        (root, ctx)
    }

    #[tokio::test]
    async fn test_open_close_file() {
        let (root, ctx) = setup();
        std::fs::write(root.path().join("workspace/a.txt"), "hello").unwrap();

        let result = OpenFileTool
            .execute(json!({"path": "/workspace/a.txt"}), &ctx)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["opened_files"][0], "/workspace/a.txt");

        // Missing files cannot be pinned
        let result = OpenFileTool
            .execute(json!({"path": "/workspace/missing.txt"}), &ctx)
            .await;
        assert!(!result.is_success());

        let result = CloseFileTool
            .execute(json!({"path": "/workspace/a.txt"}), &ctx)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["removed"], true);
        assert!(result.output["opened_files"].as_array().unwrap().is_empty());

        let result = CloseFileTool
            .execute(json!({"path": "/workspace/a.txt"}), &ctx)
            .await;
        assert_eq!(result.output["removed"], false);
    }

    #[tokio::test]
    async fn test_list_dir_entry_types() {
        let (root, ctx) = setup();
        std::fs::write(root.path().join("workspace/file.txt"), "x").unwrap();
        std::fs::create_dir(root.path().join("workspace/sub")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(
            root.path().join("workspace/file.txt"),
            root.path().join("workspace/link"),
        )
        .unwrap();

        let result = ListDirTool
            .execute(json!({"path": "/workspace"}), &ctx)
            .await;
        assert!(result.is_success());
        let entries = result.output["entries"].as_array().unwrap();
        let kind_of = |name: &str| {
            entries
                .iter()
                .find(|e| e["name"] == name)
                .map(|e| e["type"].as_str().unwrap().to_string())
        };
        assert_eq!(kind_of("file.txt").unwrap(), "file");
        assert_eq!(kind_of("sub").unwrap(), "directory");
        #[cfg(unix)]
        assert_eq!(kind_of("link").unwrap(), "symlink");
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_guards_blocks() {
        let (root, ctx) = setup();

        let result = WriteTool
            .execute(
                json!({"path": "/workspace/deep/nested/file.txt", "content": "data"}),
                &ctx,
            )
            .await;
        assert!(result.is_success());
        assert_eq!(
            std::fs::read_to_string(root.path().join("workspace/deep/nested/file.txt")).unwrap(),
            "data"
        );

        let result = WriteTool
            .execute(json!({"path": "/blocks/notes.txt", "content": "x"}), &ctx)
            .await;
        assert!(!result.is_success());

        let result = WriteTool
            .execute(json!({"path": "/blocks/notes.md", "content": "x"}), &ctx)
            .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_str_replace_uniqueness() {
        let (root, ctx) = setup();
        std::fs::write(
            root.path().join("workspace/doc.txt"),
            "alpha beta gamma beta",
        )
        .unwrap();

        // Ambiguous
        let result = StrReplaceTool
            .execute(
                json!({"path": "/workspace/doc.txt", "old_text": "beta", "new_text": "B"}),
                &ctx,
            )
            .await;
        assert!(!result.is_success());
        assert!(result.output["error"].as_str().unwrap().contains("2"));

        // Missing
        let result = StrReplaceTool
            .execute(
                json!({"path": "/workspace/doc.txt", "old_text": "delta", "new_text": "D"}),
                &ctx,
            )
            .await;
        assert!(!result.is_success());

        // Unique succeeds and returns context
        let result = StrReplaceTool
            .execute(
                json!({"path": "/workspace/doc.txt", "old_text": "gamma", "new_text": "G"}),
                &ctx,
            )
            .await;
        assert!(result.is_success());
        assert!(result.output["context"].as_str().unwrap().contains("G"));
        assert_eq!(
            std::fs::read_to_string(root.path().join("workspace/doc.txt")).unwrap(),
            "alpha beta G beta"
        );
    }

    #[tokio::test]
    async fn test_paths_outside_sandbox_rejected() {
        let (_root, ctx) = setup();
        let result = ListDirTool.execute(json!({"path": "/etc"}), &ctx).await;
        assert!(!result.is_success());
    }
}
