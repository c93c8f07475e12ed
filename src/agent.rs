//! One agent: an independent principal with its own configuration,
//! tool registry, session map and storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{EngineConfig, IntegrationsConfig, ToolsConfig};
use crate::engine::provider::ChatProvider;
use crate::session::store::SessionStore;
use crate::session::{Channel, Session};
use crate::tools::{create_default_registry, ToolRegistry};

/// How long a user-driven message waits on a busy session before the
/// event is dropped.
pub const BUSY_WAIT_TOTAL: Duration = Duration::from_secs(5);
pub const BUSY_WAIT_POLL: Duration = Duration::from_millis(500);

pub struct Agent {
    pub slug: String,
    pub root: PathBuf,
    /// Swapped atomically on config hot-reload.
    pub engine: RwLock<EngineConfig>,
    pub tools_config: ToolsConfig,
    pub integrations: IntegrationsConfig,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub store: SessionStore,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl Agent {
    /// Construct an agent over explicit parts. The caller owns the
    /// config-vs-fatal distinction: config errors abort startup, a
    /// failed store open degrades just this agent.
    pub fn assemble(
        slug: &str,
        root: PathBuf,
        engine: EngineConfig,
        tools_config: ToolsConfig,
        integrations: IntegrationsConfig,
        provider: Arc<dyn ChatProvider>,
        store: SessionStore,
    ) -> Agent {
        Agent {
            slug: slug.to_string(),
            root,
            engine: RwLock::new(engine),
            tools_config,
            integrations,
            registry: Arc::new(create_default_registry()),
            provider,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine_snapshot(&self) -> EngineConfig {
        self.engine.read().unwrap().clone()
    }

    /// Swap the engine config (hot-reload).
    pub fn replace_engine(&self, engine: EngineConfig) {
        *self.engine.write().unwrap() = engine;
        log::info!("[AGENT:{}] engine config reloaded", self.slug);
    }

    /// Restore persisted sessions into memory at startup.
    pub async fn restore_sessions(&self) -> Result<usize, String> {
        let restored = self.store.load_sessions()?;
        let mut sessions = self.sessions.lock().await;
        let count = restored.len();
        for session in restored {
            sessions.insert(session.id(), Arc::new(Mutex::new(session)));
        }
        Ok(count)
    }

    /// Get or create the session for a channel endpoint. Internal
    /// sessions are always created fresh.
    pub async fn session_for(&self, channel: Channel) -> Arc<Mutex<Session>> {
        if matches!(channel, Channel::Internal { .. }) {
            return Arc::new(Mutex::new(Session::new(channel)));
        }
        let id = channel.session_id();
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(channel))))
            .clone()
    }

    pub async fn find_session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// The session with the greatest `last_activity`.
    pub async fn last_active_session(&self) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.lock().await;
        let mut best: Option<(i64, Arc<Mutex<Session>>)> = None;
        for session in sessions.values() {
            let guard = session.lock().await;
            let activity = guard.last_activity;
            drop(guard);
            match best {
                Some((ts, _)) if ts >= activity => {}
                _ => best = Some((activity, Arc::clone(session))),
            }
        }
        best.map(|(_, s)| s)
    }

    /// Resolve a scheduler target: `"none"`, `"last"`, or an exact id.
    pub async fn resolve_target(&self, target: &str) -> Option<Arc<Mutex<Session>>> {
        match target {
            "none" => None,
            "last" => self.last_active_session().await,
            id => self.find_session(id).await,
        }
    }

    /// Flip the busy gate from false to true. Returns false when the
    /// session is already mid-turn.
    pub async fn try_acquire(&self, session: &Arc<Mutex<Session>>) -> bool {
        let mut guard = session.lock().await;
        if guard.busy {
            return false;
        }
        guard.busy = true;
        true
    }

    /// Acquire the gate, polling for up to `BUSY_WAIT_TOTAL`. Used for
    /// user-driven messages; scheduled fires never wait.
    pub async fn acquire_waiting(&self, session: &Arc<Mutex<Session>>) -> bool {
        let deadline = tokio::time::Instant::now() + BUSY_WAIT_TOTAL;
        loop {
            if self.try_acquire(session).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(BUSY_WAIT_POLL).await;
        }
    }

    pub async fn release(&self, session: &Arc<Mutex<Session>>) {
        let mut guard = session.lock().await;
        guard.busy = false;
    }

    /// Delete every persisted session and its in-memory twin.
    pub async fn clear_sessions(&self) -> Result<usize, String> {
        let ids = self.store.session_ids()?;
        for id in &ids {
            self.store.delete_session(id)?;
        }
        self.sessions.lock().await.clear();
        Ok(ids.len())
    }
}
