//! The turn engine.
//!
//! One turn: a triggering user message (chat event or scheduler tick) is
//! appended to the session, then the engine loops — assemble context,
//! call the provider, commit messages, dispatch tool calls — until a
//! terminal `respond` or `no-response` completes. Any engine-level
//! failure rolls the session history back to its pre-turn length.

pub mod context;
pub mod provider;

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{EngineConfig, IntegrationsConfig, ToolsConfig};
use crate::session::{Message, Session, ToolResponseContent, UserContent};
use crate::tools::{DownloadFn, ReactFn, SendFn, ToolContext, ToolRegistry};
use provider::{ChatProvider, ProviderCall};

/// Hard ceiling on provider iterations within one turn.
const MAX_TOOL_ITERATIONS: usize = 50;

/// Engine-level failure. Tool validation errors never appear here; they
/// flow back to the model as tool outputs.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Non-2xx from the provider, with a response body excerpt.
    Provider { status: u16, message: String },
    ContentFiltered,
    UnexpectedFinish(String),
    MalformedToolArguments(String),
    EmptyToolCalls,
    Http(String),
    IterationLimit(usize),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Provider { status, message } => {
                write!(f, "provider returned status {}: {}", status, message)
            }
            EngineError::ContentFiltered => write!(f, "provider flagged the content filter"),
            EngineError::UnexpectedFinish(reason) => {
                write!(f, "unexpected finish: {}", reason)
            }
            EngineError::MalformedToolArguments(detail) => {
                write!(f, "malformed tool arguments: {}", detail)
            }
            EngineError::EmptyToolCalls => write!(f, "model returned no tool calls"),
            EngineError::Http(detail) => write!(f, "http error: {}", detail),
            EngineError::IterationLimit(limit) => {
                write!(f, "turn exceeded {} tool iterations", limit)
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Everything one turn needs, snapshotted by the caller.
#[derive(Clone)]
pub struct TurnContext {
    pub agent_slug: String,
    pub agent_root: PathBuf,
    pub session: Arc<Mutex<Session>>,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub engine_config: EngineConfig,
    pub tools_config: ToolsConfig,
    pub integrations: IntegrationsConfig,
    pub send: SendFn,
    pub react: Option<ReactFn>,
    pub download_attachments: Option<DownloadFn>,
    pub scheduler: Option<Arc<crate::scheduler::Scheduler>>,
    /// Per-turn model override (heartbeat / cron jobs).
    pub model_override: Option<String>,
}

impl TurnContext {
    fn tool_context(&self) -> ToolContext {
        ToolContext {
            agent_slug: self.agent_slug.clone(),
            agent_root: self.agent_root.clone(),
            session: Arc::clone(&self.session),
            send: Arc::clone(&self.send),
            react: self.react.clone(),
            download_attachments: self.download_attachments.clone(),
            tools_config: self.tools_config.clone(),
            integrations: self.integrations.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

/// Append the triggering message and drive the turn to completion,
/// rolling history back and reporting a best-effort error message on
/// engine failure.
pub async fn run_turn_message(ctx: &TurnContext, message: Message) -> Result<(), EngineError> {
    let pre_len = {
        let mut session = ctx.session.lock().await;
        let len = session.history.len();
        session.history.push(message);
        session.touch();
        len
    };

    match run_turn(ctx).await {
        Ok(()) => Ok(()),
        Err(e) => {
            {
                let mut session = ctx.session.lock().await;
                session.history.truncate(pre_len);
                session.pending_tool_messages.clear();
                session.pending_images.clear();
            }
            log::error!("[ENGINE:{}] turn failed: {}", ctx.agent_slug, e);
            // Best-effort; the send path may itself be the broken part.
            let _ = (ctx.send)(format!("Engine error: {}", e), vec![]).await;
            Err(e)
        }
    }
}

/// The per-iteration loop. Assumes the triggering message is already in
/// history and the session's busy gate is held by the caller.
pub async fn run_turn(ctx: &TurnContext) -> Result<(), EngineError> {
    let tool_ctx = ctx.tool_context();
    let mut iterations = 0usize;

    loop {
        iterations += 1;
        if iterations > MAX_TOOL_ITERATIONS {
            return Err(EngineError::IterationLimit(MAX_TOOL_ITERATIONS));
        }

        // Assemble the call under the session lock, then release it for
        // the network round-trip.
        let call = {
            let mut session = ctx.session.lock().await;

            // Images queued by tools ride in as one synthetic user
            // message, after the matching tool responses.
            if !session.pending_images.is_empty() {
                let images: Vec<UserContent> = session.pending_images.drain(..).collect();
                session
                    .pending_tool_messages
                    .push(Message::User {
                        content: images,
                        id: None,
                        persist: None,
                    });
            }

            let system_prompt = context::build_system_prompt(&ctx.agent_root, &session);
            let messages = context::build_provider_messages(&session);

            let (api_base, api_key, mut model) = ctx
                .engine_config
                .resolve(session.channel.kind(), session.channel.override_key());
            if let Some(ref over) = ctx.model_override {
                model = over.clone();
            }

            let tools = ctx
                .registry
                .visible_definitions(&ctx.tools_config)
                .iter()
                .map(|d| d.to_spec())
                .collect();

            ProviderCall {
                api_base,
                api_key,
                model,
                system_prompt,
                messages,
                tools,
            }
        };

        log::debug!(
            "[ENGINE:{}] iteration {} ({} messages)",
            ctx.agent_slug,
            iterations,
            call.messages.len()
        );

        let turn = ctx.provider.complete(call).await?;

        // Commit order: pending tool responses first, then the assistant
        // message that answered them.
        let calls: Vec<(String, String, Value)> = {
            let mut session = ctx.session.lock().await;
            let pending: Vec<Message> = session.pending_tool_messages.drain(..).collect();
            session.history.extend(pending);

            let calls = turn
                .tool_calls()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            session.history.push(Message::Assistant {
                content: turn.content,
            });
            calls
        };

        let mut done = false;
        for (call_id, name, input) in calls {
            log::debug!("[ENGINE:{}] tool call {} -> {}", ctx.agent_slug, call_id, name);
            let result = ctx.registry.execute(&name, input, &tool_ctx).await;

            let terminal_tool = matches!(name.as_str(), "respond" | "no-response");
            let final_is_false =
                result.output.get("final").and_then(|v| v.as_bool()) == Some(false);
            if terminal_tool && !final_is_false {
                done = true;
            }

            let mut session = ctx.session.lock().await;
            session.pending_tool_messages.push(Message::ToolResponse {
                content: ToolResponseContent {
                    id: call_id,
                    name,
                    output: result.output,
                },
            });
        }

        if done {
            let mut session = ctx.session.lock().await;
            let pending: Vec<Message> = session.pending_tool_messages.drain(..).collect();
            session.history.extend(pending);
            session.touch();
            return Ok(());
        }
    }
}
