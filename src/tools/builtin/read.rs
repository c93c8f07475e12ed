//! The `read` tool. Text files come back inline; images are re-encoded
//! to WebP and queued on the session so the engine can inject them as a
//! user message on the next iteration (OpenAI-shaped APIs only accept
//! images under the user role).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sandbox::path::resolve_sandbox_path;
use crate::session::UserContent;
use crate::tools::{
    PropertySchema, Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolResult,
};

/// WebP quality for re-encoded images.
const WEBP_QUALITY: f32 = 90.0;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

pub struct ReadTool;

#[derive(Debug, Deserialize)]
struct ReadParams {
    path: String,
}

fn encode_webp(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(bytes).map_err(|e| format!("failed to decode image: {}", e))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let encoder = webp::Encoder::from_rgba(&rgba, width, height);
    Ok(encoder.encode(WEBP_QUALITY).to_vec())
}

#[async_trait]
impl Tool for ReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read".to_string(),
            description: "Read a file. Text content is returned directly; images are attached \
                          to the conversation so you can see them."
                .to_string(),
            input_schema: ToolInputSchema::new(
                vec![(
                    "path",
                    PropertySchema::string("Virtual path, e.g. /workspace/img.png"),
                )],
                vec!["path"],
            ),
        }
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params: ReadParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return ToolResult::validation_error(&e),
        };
        let real = match resolve_sandbox_path(&ctx.agent_root, &params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e.to_string()),
        };
        let bytes = match std::fs::read(&real) {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("cannot read {}: {}", params.path, e)),
        };

        let extension = real
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            let webp = match encode_webp(&bytes) {
                Ok(w) => w,
                Err(e) => return ToolResult::error(e),
            };
            let webp_len = webp.len();
            let mut session = ctx.session.lock().await;
            session.pending_images.push(UserContent::Image {
                media_type: "image/webp".to_string(),
                data: webp,
            });
            return ToolResult::success(json!({
                "path": params.path,
                "attached_image": true,
                "media_type": "image/webp",
                "original_bytes": bytes.len(),
                "encoded_bytes": webp_len,
            }));
        }

        ToolResult::success(json!({
            "path": params.path,
            "content": String::from_utf8_lossy(&bytes),
            "size": bytes.len(),
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

    fn setup() -> (TempDir, ToolContext, Arc<Mutex<Session>>) {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("workspace")).unwrap();
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: "t".to_string(),
        })));
        let ctx = ToolContext::noop(root.path().to_path_buf(), Arc::clone(&session));
        (root, ctx, session)
    }

    #[tokio::test]
    async fn test_read_text_file() {
        let (root, ctx, _session) = setup();
        std::fs::write(root.path().join("workspace/notes.txt"), "remember this").unwrap();

        let result = ReadTool
            .execute(json!({"path": "/workspace/notes.txt"}), &ctx)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["content"], "remember this");
        assert_eq!(result.output["size"], 13);
    }

    #[tokio::test]
    async fn test_read_image_queues_webp() {
        let (root, ctx, session) = setup();

        // A real 2x2 PNG so the decoder has something to chew on
        let mut png = Vec::new();
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(root.path().join("workspace/img.png"), &png).unwrap();

        let result = ReadTool
            .execute(json!({"path": "/workspace/img.png"}), &ctx)
            .await;
        assert!(result.is_success());
        assert_eq!(result.output["attached_image"], true);
        assert_eq!(result.output["media_type"], "image/webp");
        // Metadata only, no inline content
        assert!(result.output.get("content").is_none());

        let guard = session.lock().await;
        assert_eq!(guard.pending_images.len(), 1);
        match &guard.pending_images[0] {
            UserContent::Image { media_type, data } => {
                assert_eq!(media_type, "image/webp");
                assert!(!data.is_empty());
            }
            other => panic!("expected image, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (_root, ctx, _session) = setup();
        let result = ReadTool
            .execute(json!({"path": "/workspace/nope.txt"}), &ctx)
            .await;
        assert!(!result.is_success());
    }
}
