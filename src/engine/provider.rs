//! OpenAI-compatible chat completion client.
//!
//! The engine talks to any endpoint speaking the Chat Completions shape.
//! The model is required to answer with tool calls; any other finish
//! reason is an engine failure, not something to paper over.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::EngineError;
use crate::session::{AssistantContent, Message, UserContent};

/// Request timeout for a single completion call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// A tool surface shown to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One fully resolved provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// The assistant message a successful call produced: tool calls, with any
/// leading text preserved.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub content: Vec<AssistantContent>,
}

impl AssistantTurn {
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|c| match c {
            AssistantContent::ToolCall { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Provider abstraction so the engine can run against a scripted stub in
/// tests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, call: ProviderCall) -> Result<AssistantTurn, EngineError>;
}

// ---- wire shapes -----------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    tool_choice: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

/// The Kimi 2.5 family ignores `tool_choice = "required"`; it gets
/// `"auto"` plus an extra system message coercing tool use. Documented
/// workaround for a known defect of that model family.
pub fn is_kimi_25(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.contains("kimi") && lower.contains("2.5")
}

const KIMI_COERCION: &str =
    "You MUST respond by calling one of the provided tools. Never answer with plain text; \
     use the respond tool to talk to the user.";

fn data_url(media_type: &str, data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        media_type,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

fn user_content_value(content: &UserContent) -> Value {
    match content {
        UserContent::Text { content } => json!({"type": "text", "text": content}),
        UserContent::Image { media_type, data } => json!({
            "type": "image_url",
            "image_url": {"url": data_url(media_type, data)}
        }),
        // An unhydrated reference has no bytes to ship; degrade to text.
        UserContent::ImageRef { id, .. } => {
            json!({"type": "text", "text": format!("[image {} unavailable]", id)})
        }
    }
}

/// Translate session messages into Chat Completions messages. The system
/// prompt travels separately as the leading system message.
pub fn build_wire_messages(call: &ProviderCall) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(call.messages.len() + 2);
    wire.push(json!({"role": "system", "content": call.system_prompt}));

    for msg in &call.messages {
        match msg {
            Message::User { content, .. } => {
                let parts: Vec<Value> = content.iter().map(user_content_value).collect();
                wire.push(json!({"role": "user", "content": parts}));
            }
            Message::Assistant { content } => {
                let text: Vec<&str> = content
                    .iter()
                    .filter_map(|c| match c {
                        AssistantContent::Text { content } => Some(content.as_str()),
                        _ => None,
                    })
                    .collect();
                let tool_calls: Vec<Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        AssistantContent::ToolCall { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let mut value = json!({"role": "assistant"});
                if !text.is_empty() {
                    value["content"] = json!(text.join("\n"));
                } else {
                    value["content"] = Value::Null;
                }
                if !tool_calls.is_empty() {
                    value["tool_calls"] = json!(tool_calls);
                }
                wire.push(value);
            }
            Message::ToolResponse { content } => {
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": content.id,
                    "content": content.output.to_string(),
                }));
            }
            Message::System { content } => {
                wire.push(json!({"role": "system", "content": content}));
            }
        }
    }

    if is_kimi_25(&call.model) {
        wire.push(json!({"role": "system", "content": KIMI_COERCION}));
    }

    wire
}

fn build_wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn parse_turn(response: WireResponse) -> Result<AssistantTurn, EngineError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::UnexpectedFinish("no choices in response".to_string()))?;

    match choice.finish_reason.as_deref() {
        Some("content_filter") => return Err(EngineError::ContentFiltered),
        Some("tool_calls") | None => {}
        Some(other) => {
            return Err(EngineError::UnexpectedFinish(format!(
                "finish_reason was '{}', expected tool_calls",
                other
            )))
        }
    }

    let calls = choice.message.tool_calls.unwrap_or_default();
    if calls.is_empty() {
        return Err(EngineError::EmptyToolCalls);
    }

    let mut content: Vec<AssistantContent> = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.trim().is_empty() {
            content.push(AssistantContent::Text { content: text });
        }
    }
    for call in calls {
        let input: Value = serde_json::from_str(&call.function.arguments).map_err(|e| {
            EngineError::MalformedToolArguments(format!(
                "tool '{}' arguments are not valid JSON: {}",
                call.function.name, e
            ))
        })?;
        content.push(AssistantContent::ToolCall {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    Ok(AssistantTurn { content })
}

/// Reqwest-backed implementation against any OpenAI-shaped endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        OpenAiProvider { client }
    }

    fn endpoint(api_base: &str) -> String {
        let base = api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, call: ProviderCall) -> Result<AssistantTurn, EngineError> {
        let tool_choice = if is_kimi_25(&call.model) {
            "auto"
        } else {
            "required"
        };

        let request = WireRequest {
            model: call.model.clone(),
            messages: build_wire_messages(&call),
            tools: build_wire_tools(&call.tools),
            tool_choice: tool_choice.to_string(),
        };

        let mut builder = self
            .client
            .post(Self::endpoint(&call.api_base))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some(ref key) = call.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Http(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(400).collect();
            return Err(EngineError::Provider {
                status: status.as_u16(),
                message: excerpt,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Http(format!("invalid response body: {}", e)))?;

        parse_turn(wire)
    }
}

/// Scripted provider for tests: pops pre-configured turns and records
/// every call it receives.
pub struct StubProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<AssistantTurn, EngineError>>>,
    calls: std::sync::Mutex<Vec<ProviderCall>>,
}

impl StubProvider {
    pub fn new(responses: Vec<Result<AssistantTurn, EngineError>>) -> Self {
        StubProvider {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a turn holding the given tool calls.
    pub fn turn(calls: Vec<(&str, &str, Value)>) -> AssistantTurn {
        AssistantTurn {
            content: calls
                .into_iter()
                .map(|(id, name, input)| AssistantContent::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                })
                .collect(),
        }
    }

    pub fn recorded_calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn complete(&self, call: ProviderCall) -> Result<AssistantTurn, EngineError> {
        self.calls.lock().unwrap().push(call);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(EngineError::UnexpectedFinish(
                    "stub provider exhausted".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolResponseContent;

    fn call_with(messages: Vec<Message>, model: &str) -> ProviderCall {
        ProviderCall {
            api_base: "https://api.example.com/v1".to_string(),
            api_key: None,
            model: model.to_string(),
            system_prompt: "base".to_string(),
            messages,
            tools: vec![],
        }
    }

    #[test]
    fn test_user_image_becomes_data_url() {
        let messages = vec![Message::User {
            content: vec![UserContent::Image {
                media_type: "image/webp".to_string(),
                data: vec![1, 2, 3],
            }],
            id: None,
            persist: None,
        }];
        let wire = build_wire_messages(&call_with(messages, "gpt-4o"));
        let user = &wire[1];
        assert_eq!(user["role"], "user");
        let url = user["content"][0]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/webp;base64,"));
    }

    #[test]
    fn test_tool_response_content_is_stringified_json() {
        let messages = vec![Message::ToolResponse {
            content: ToolResponseContent {
                id: "call_1".to_string(),
                name: "list-dir".to_string(),
                output: json!({"success": true, "entries": []}),
            },
        }];
        let wire = build_wire_messages(&call_with(messages, "gpt-4o"));
        let tool = &wire[1];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
        let content = tool["content"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(content).unwrap();
        assert_eq!(parsed["success"], true);
    }

    #[test]
    fn test_assistant_tool_call_arguments_stringified() {
        let messages = vec![Message::Assistant {
            content: vec![AssistantContent::ToolCall {
                id: "call_9".to_string(),
                name: "write".to_string(),
                input: json!({"path": "/workspace/a.txt", "content": "x"}),
            }],
        }];
        let wire = build_wire_messages(&call_with(messages, "gpt-4o"));
        let assistant = &wire[1];
        let args = assistant["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        let parsed: Value = serde_json::from_str(args).unwrap();
        assert_eq!(parsed["path"], "/workspace/a.txt");
    }

    #[test]
    fn test_kimi_25_workaround() {
        assert!(is_kimi_25("kimi-2.5-turbo"));
        assert!(is_kimi_25("Kimi-K2.5"));
        assert!(!is_kimi_25("kimi-k2-turbo"));
        assert!(!is_kimi_25("gpt-4o-2.5")); // no kimi

        let wire = build_wire_messages(&call_with(vec![Message::user_text("hi")], "kimi-2.5"));
        let last = wire.last().unwrap();
        assert_eq!(last["role"], "system");
        assert!(last["content"].as_str().unwrap().contains("tool"));
    }

    #[test]
    fn test_parse_turn_policies() {
        // content_filter trips ContentFiltered
        let filtered = WireResponse {
            choices: vec![WireChoice {
                message: WireMessage {
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some("content_filter".to_string()),
            }],
        };
        assert!(matches!(
            parse_turn(filtered),
            Err(EngineError::ContentFiltered)
        ));

        // plain stop is unexpected
        let stopped = WireResponse {
            choices: vec![WireChoice {
                message: WireMessage {
                    content: Some("text".to_string()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
        };
        assert!(matches!(
            parse_turn(stopped),
            Err(EngineError::UnexpectedFinish(_))
        ));

        // empty tool call array is an error too
        let empty = WireResponse {
            choices: vec![WireChoice {
                message: WireMessage {
                    content: None,
                    tool_calls: Some(vec![]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
        };
        assert!(matches!(parse_turn(empty), Err(EngineError::EmptyToolCalls)));

        // malformed arguments surface as MalformedToolArguments
        let malformed = WireResponse {
            choices: vec![WireChoice {
                message: WireMessage {
                    content: None,
                    tool_calls: Some(vec![WireToolCall {
                        id: "1".to_string(),
                        function: WireFunction {
                            name: "respond".to_string(),
                            arguments: "{not json".to_string(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
        };
        assert!(matches!(
            parse_turn(malformed),
            Err(EngineError::MalformedToolArguments(_))
        ));

        // the good path
        let ok = WireResponse {
            choices: vec![WireChoice {
                message: WireMessage {
                    content: Some("thinking".to_string()),
                    tool_calls: Some(vec![WireToolCall {
                        id: "1".to_string(),
                        function: WireFunction {
                            name: "respond".to_string(),
                            arguments: r#"{"content":"hi"}"#.to_string(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
        };
        let turn = parse_turn(ok).unwrap();
        assert_eq!(turn.tool_calls().count(), 1);
        assert_eq!(turn.content.len(), 2); // text + tool call
    }
}
