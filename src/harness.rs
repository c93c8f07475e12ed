//! Process-wide harness: the agent registry, per-channel transport
//! handlers, and the schedulers. Constructed once at `run`, passed by
//! handle, torn down on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::watch;
use tokio::sync::Mutex;

use crate::agent::Agent;
use crate::chunk::{chunk_message, CHUNK_LIMIT};
use crate::config::{CronConfig, HeartbeatConfig};
use crate::engine::{self, TurnContext};
use crate::scheduler::store::CronStore;
use crate::scheduler::Scheduler;
use crate::session::{Channel, Message, Session};
use crate::tools::{Attachment, BoxFuture, DownloadFn, ReactFn, SendFn};

/// Transport-facing handler types, registered per (agent, channel kind).
pub type TransportSendFn =
    Arc<dyn Fn(Channel, String, Vec<Attachment>) -> BoxFuture<Result<(), String>> + Send + Sync>;
pub type TransportReactFn =
    Arc<dyn Fn(Channel, String, Option<String>) -> BoxFuture<Result<(), String>> + Send + Sync>;
pub type TransportDownloadFn =
    Arc<dyn Fn(Channel, String) -> BoxFuture<Result<Vec<Attachment>, String>> + Send + Sync>;

/// One hosted agent plus its scheduling config.
pub struct AgentEntry {
    pub agent: Arc<Agent>,
    pub heartbeat: HeartbeatConfig,
    pub cron: CronConfig,
}

pub struct Harness {
    /// Weak self-handle so closures can reach back without keeping the
    /// harness alive past shutdown.
    self_ref: std::sync::Weak<Harness>,
    agents: StdRwLock<HashMap<String, AgentEntry>>,
    send_handlers: StdRwLock<HashMap<(String, String), TransportSendFn>>,
    react_handlers: StdRwLock<HashMap<(String, String), TransportReactFn>>,
    download_handlers: StdRwLock<HashMap<(String, String), TransportDownloadFn>>,
    schedulers: StdRwLock<HashMap<String, Arc<Scheduler>>>,
    abort: watch::Sender<bool>,
}

impl Harness {
    pub fn new(entries: Vec<AgentEntry>) -> Arc<Harness> {
        let (abort, _) = watch::channel(false);
        let agents = entries
            .into_iter()
            .map(|e| (e.agent.slug.clone(), e))
            .collect();
        Arc::new_cyclic(|weak| Harness {
            self_ref: weak.clone(),
            agents: StdRwLock::new(agents),
            send_handlers: StdRwLock::new(HashMap::new()),
            react_handlers: StdRwLock::new(HashMap::new()),
            download_handlers: StdRwLock::new(HashMap::new()),
            schedulers: StdRwLock::new(HashMap::new()),
            abort,
        })
    }

    fn self_arc(&self) -> Option<Arc<Harness>> {
        self.self_ref.upgrade()
    }

    /// Receiver for the process-wide cancellation signal.
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    pub fn agent(&self, slug: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap()
            .get(slug)
            .map(|e| Arc::clone(&e.agent))
    }

    pub fn agent_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.agents.read().unwrap().keys().cloned().collect();
        slugs.sort();
        slugs
    }

    /// Register the outbound send handler for (agent, channel kind).
    pub fn register_send(&self, slug: &str, channel_kind: &str, handler: TransportSendFn) {
        self.send_handlers
            .write()
            .unwrap()
            .insert((slug.to_string(), channel_kind.to_string()), handler);
    }

    pub fn register_react(&self, slug: &str, channel_kind: &str, handler: TransportReactFn) {
        self.react_handlers
            .write()
            .unwrap()
            .insert((slug.to_string(), channel_kind.to_string()), handler);
    }

    pub fn register_download(&self, slug: &str, channel_kind: &str, handler: TransportDownloadFn) {
        self.download_handlers
            .write()
            .unwrap()
            .insert((slug.to_string(), channel_kind.to_string()), handler);
    }

    /// Deliver content to a session's channel. The session's send filter
    /// is consulted first; content is chunked below the platform caps.
    pub async fn send(
        &self,
        agent: &Agent,
        session: &Arc<Mutex<Session>>,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<(), String> {
        let channel = {
            let guard = session.lock().await;
            if let Some(ref filter) = guard.send_filter {
                if !filter(&content) {
                    log::debug!("[HARNESS] send suppressed by filter for {}", guard.id());
                    return Ok(());
                }
            }
            guard.channel.clone()
        };

        let handler = self
            .send_handlers
            .read()
            .unwrap()
            .get(&(agent.slug.clone(), channel.kind().to_string()))
            .cloned();

        let handler = match handler {
            Some(h) => h,
            // The internal channel swallows output by default.
            None if channel.kind() == "internal" => return Ok(()),
            None => {
                return Err(format!(
                    "no send handler registered for ({}, {})",
                    agent.slug,
                    channel.kind()
                ))
            }
        };

        let mut attachments = Some(attachments);
        for chunk in chunk_message(&content, CHUNK_LIMIT) {
            handler(
                channel.clone(),
                chunk,
                attachments.take().unwrap_or_default(),
            )
            .await?;
        }
        Ok(())
    }

    /// Build the per-turn context wiring tools to this harness's
    /// transports. Closures hold a weak harness so a torn-down process
    /// fails sends instead of keeping the registry alive.
    pub fn turn_context(
        &self,
        agent: &Arc<Agent>,
        session: &Arc<Mutex<Session>>,
        model_override: Option<String>,
    ) -> TurnContext {
        let send: SendFn = {
            let weak = self.self_ref.clone();
            let agent = Arc::clone(agent);
            let session = Arc::clone(session);
            Arc::new(move |content, attachments| {
                let weak = weak.clone();
                let agent = Arc::clone(&agent);
                let session = Arc::clone(&session);
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(harness) => {
                            harness.send(&agent, &session, content, attachments).await
                        }
                        None => Err("harness is shut down".to_string()),
                    }
                })
            })
        };

        // Handlers are resolved lazily inside the closures: the registry
        // may gain transports after the context is built.
        let react: Option<ReactFn> = {
            let weak = self.self_ref.clone();
            let agent_slug = agent.slug.clone();
            let session = Arc::clone(session);
            Some(Arc::new(move |emoji: String, message_id: Option<String>| {
                let weak = weak.clone();
                let agent_slug = agent_slug.clone();
                let session = Arc::clone(&session);
                Box::pin(async move {
                    let Some(harness) = weak.upgrade() else {
                        return Err("harness is shut down".to_string());
                    };
                    let (channel, default_id) = {
                        let guard = session.lock().await;
                        (guard.channel.clone(), guard.last_message_id.clone())
                    };
                    let handler = harness
                        .react_handlers
                        .read()
                        .unwrap()
                        .get(&(agent_slug, channel.kind().to_string()))
                        .cloned();
                    match handler {
                        Some(h) => h(channel, emoji, message_id.or(default_id)).await,
                        None => Err("no react handler for this channel".to_string()),
                    }
                }) as BoxFuture<Result<(), String>>
            }))
        };

        let download: Option<DownloadFn> = {
            let weak = self.self_ref.clone();
            let agent_slug = agent.slug.clone();
            let session = Arc::clone(session);
            Some(Arc::new(move |message_id: String| {
                let weak = weak.clone();
                let agent_slug = agent_slug.clone();
                let session = Arc::clone(&session);
                Box::pin(async move {
                    let Some(harness) = weak.upgrade() else {
                        return Err("harness is shut down".to_string());
                    };
                    let channel = session.lock().await.channel.clone();
                    let handler = harness
                        .download_handlers
                        .read()
                        .unwrap()
                        .get(&(agent_slug, channel.kind().to_string()))
                        .cloned();
                    match handler {
                        Some(h) => h(channel, message_id).await,
                        None => Err("no attachment download for this channel".to_string()),
                    }
                }) as BoxFuture<Result<Vec<Attachment>, String>>
            }))
        };

        TurnContext {
            agent_slug: agent.slug.clone(),
            agent_root: agent.root.clone(),
            session: Arc::clone(session),
            registry: Arc::clone(&agent.registry),
            provider: Arc::clone(&agent.provider),
            engine_config: agent.engine_snapshot(),
            tools_config: agent.tools_config.clone(),
            integrations: agent.integrations.clone(),
            send,
            react,
            download_attachments: download,
            scheduler: self.get_scheduler(&agent.slug),
            model_override,
        }
    }

    /// Handle an inbound chat message: wait on the busy gate (up to 5 s,
    /// polling at 500 ms), run the turn, release, persist. Returns false
    /// when the event was dropped because the session stayed busy.
    pub async fn run_user_turn(
        &self,
        agent: &Arc<Agent>,
        channel: Channel,
        text: String,
        message_id: Option<String>,
    ) -> bool {
        let session = agent.session_for(channel).await;
        let session_id = {
            let mut guard = session.lock().await;
            if message_id.is_some() {
                guard.last_message_id = message_id;
            }
            guard.id()
        };

        if !agent.acquire_waiting(&session).await {
            log::warn!(
                "[HARNESS] dropping message for busy session {} ({})",
                session_id,
                agent.slug
            );
            return false;
        }

        let ctx = self.turn_context(agent, &session, None);
        let _ = engine::run_turn_message(&ctx, Message::user_text(text)).await;

        agent.release(&session).await;
        agent.store.save_session(&session_id, &session);
        true
    }

    /// Build and start a scheduler for every hosted agent.
    pub fn start_schedulers(&self) {
        let Some(this) = self.self_arc() else {
            return;
        };
        let entries: Vec<(Arc<Agent>, HeartbeatConfig, CronConfig)> = {
            let agents = self.agents.read().unwrap();
            agents
                .values()
                .map(|e| (Arc::clone(&e.agent), e.heartbeat.clone(), e.cron.clone()))
                .collect()
        };

        for (agent, heartbeat, cron) in entries {
            let store = match CronStore::open(&agent.slug, &agent.root) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("[HARNESS] no scheduler for {}: {}", agent.slug, e);
                    continue;
                }
            };
            let scheduler = Scheduler::create(Arc::clone(&agent), heartbeat, cron, store);
            scheduler.start(&this, self.abort_signal());
            self.schedulers
                .write()
                .unwrap()
                .insert(agent.slug.clone(), scheduler);
            log::info!("[HARNESS] scheduler started for {}", agent.slug);
        }
    }

    pub fn stop_schedulers(&self) {
        let schedulers: Vec<Arc<Scheduler>> = self
            .schedulers
            .write()
            .unwrap()
            .drain()
            .map(|(_, s)| s)
            .collect();
        for scheduler in schedulers {
            scheduler.stop();
        }
    }

    pub fn get_scheduler(&self, slug: &str) -> Option<Arc<Scheduler>> {
        self.schedulers.read().unwrap().get(slug).cloned()
    }

    /// Rebuild one agent's scheduler from its on-disk config.
    pub fn reload_scheduler(&self, slug: &str) -> Result<(), String> {
        let this = self
            .self_arc()
            .ok_or_else(|| "harness is shut down".to_string())?;
        let agent = self
            .agent(slug)
            .ok_or_else(|| format!("unknown agent '{}'", slug))?;
        let heartbeat = crate::config::load_heartbeat_config(slug)?;
        let cron = crate::config::load_cron_config(slug)?;

        if let Some(old) = self.schedulers.write().unwrap().remove(slug) {
            old.stop();
        }
        let store = CronStore::open(slug, &agent.root)?;
        let scheduler = Scheduler::create(agent, heartbeat.clone(), cron.clone(), store);
        scheduler.start(&this, self.abort_signal());
        self.schedulers
            .write()
            .unwrap()
            .insert(slug.to_string(), scheduler);

        {
            let mut agents = self.agents.write().unwrap();
            if let Some(entry) = agents.get_mut(slug) {
                entry.heartbeat = heartbeat;
                entry.cron = cron;
            }
        }
        log::info!("[HARNESS] scheduler reloaded for {}", slug);
        Ok(())
    }

    /// Graceful drain: stop timers, flush pending session writes, raise
    /// the abort signal for everything still listening.
    pub async fn shutdown(&self) {
        log::info!("[HARNESS] shutting down");
        self.stop_schedulers();
        let agents: Vec<Arc<Agent>> = {
            let map = self.agents.read().unwrap();
            map.values().map(|e| Arc::clone(&e.agent)).collect()
        };
        for agent in agents {
            agent.store.flush_all().await;
        }
        let _ = self.abort.send(true);
    }
}
