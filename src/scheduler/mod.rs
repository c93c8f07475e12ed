//! Per-agent scheduling: the heartbeat and cron jobs.
//!
//! Scheduled turns share the session machinery with user-driven turns;
//! the busy gate keeps them single-flight, and a scheduled fire that
//! finds its target busy skips rather than queues. Every timer observes
//! the process abort signal.

pub mod store;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::config::{ActiveHours, CronConfig, CronJobConfig, HeartbeatConfig, ScheduleSpec};
use crate::engine;
use crate::harness::Harness;
use crate::session::{Channel, Message, Session};
use store::CronStore;

/// Trimmed heartbeat reply that means "nothing to report".
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

const HEARTBEAT_PROMPT: &str = "[HEARTBEAT] Evaluate your heartbeat checklist.";

#[derive(Default)]
struct Handles {
    heartbeat: Option<JoinHandle<()>>,
    cron: HashMap<String, JoinHandle<()>>,
}

pub struct Scheduler {
    self_ref: Weak<Scheduler>,
    agent: Arc<Agent>,
    heartbeat: HeartbeatConfig,
    cron: CronConfig,
    store: CronStore,
    harness: StdMutex<Option<Weak<Harness>>>,
    abort: StdMutex<Option<watch::Receiver<bool>>>,
    handles: StdMutex<Handles>,
}

/// Compare the wall-clock time in the configured timezone, formatted
/// `HH:MM`, lexicographically against the window. Wrapping windows were
/// rejected at config load.
pub fn within_active_hours(hours: &ActiveHours, now: DateTime<Utc>) -> bool {
    let tz: chrono_tz::Tz = match hours.tz.parse() {
        Ok(tz) => tz,
        Err(_) => return true,
    };
    let hhmm = now.with_timezone(&tz).format("%H:%M").to_string();
    hours.start.as_str() <= hhmm.as_str() && hhmm.as_str() <= hours.end.as_str()
}

impl Scheduler {
    pub fn create(
        agent: Arc<Agent>,
        heartbeat: HeartbeatConfig,
        cron: CronConfig,
        store: CronStore,
    ) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak| Scheduler {
            self_ref: weak.clone(),
            agent,
            heartbeat,
            cron,
            store,
            harness: StdMutex::new(None),
            abort: StdMutex::new(None),
            handles: StdMutex::new(Handles::default()),
        })
    }

    pub fn slug(&self) -> &str {
        &self.agent.slug
    }

    fn harness_handle(&self) -> Option<Arc<Harness>> {
        self.harness.lock().unwrap().as_ref()?.upgrade()
    }

    /// Arm the heartbeat and every enabled cron job. Persisted one-shot
    /// jobs (from the `schedule` tool) are re-armed too.
    pub fn start(&self, harness: &Arc<Harness>, abort: watch::Receiver<bool>) {
        *self.harness.lock().unwrap() = Some(Arc::downgrade(harness));
        *self.abort.lock().unwrap() = Some(abort.clone());

        if self.heartbeat.enabled {
            let Some(scheduler) = self.self_ref.upgrade() else {
                return;
            };
            let interval = self.heartbeat.interval_sec.max(1);
            let mut abort = abort.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                            scheduler.fire_heartbeat().await;
                        }
                        _ = abort.changed() => {
                            if *abort.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
            self.handles.lock().unwrap().heartbeat = Some(handle);
        }

        // Config-defined jobs; recurring ones get a bookkeeping row.
        for job in self.cron.jobs.iter().filter(|j| j.enabled) {
            let job_type = match job.schedule {
                ScheduleSpec::At { .. } => "one-shot",
                _ => "recurring",
            };
            if let Err(e) = self.store.upsert_job(job, job_type, None) {
                log::warn!("[CRON:{}] bookkeeping for {} failed: {}", self.slug(), job.id, e);
            }
            self.arm_job(job.clone());
        }

        // Dynamic one-shots persisted by the schedule tool.
        let config_ids: Vec<&str> = self.cron.jobs.iter().map(|j| j.id.as_str()).collect();
        match self.store.list_jobs() {
            Ok(rows) => {
                for row in rows {
                    if row.job_type == "one-shot"
                        && row.status == "active"
                        && !config_ids.contains(&row.job_id.as_str())
                    {
                        self.arm_job(row.config);
                    }
                }
            }
            Err(e) => log::error!("[CRON:{}] failed to load persisted jobs: {}", self.slug(), e),
        }
    }

    /// Stop all timers and clear handles.
    pub fn stop(&self) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.heartbeat.take() {
            handle.abort();
        }
        for (_, handle) in handles.cron.drain() {
            handle.abort();
        }
        log::info!("[SCHED:{}] stopped", self.slug());
    }

    /// Persist a dynamic one-shot job and arm it live.
    pub async fn add_one_shot(&self, job: CronJobConfig) -> Result<(), String> {
        let next_run = match &job.schedule {
            ScheduleSpec::At { at } => Some(at.clone()),
            _ => return Err("dynamic jobs must use an absolute timestamp".to_string()),
        };
        self.store.upsert_job(&job, "one-shot", next_run.as_deref())?;
        if self.harness.lock().unwrap().is_some() {
            self.arm_job(job);
        }
        Ok(())
    }

    fn arm_job(&self, job: CronJobConfig) {
        let Some(abort) = self.abort.lock().unwrap().clone() else {
            return;
        };
        let Some(scheduler) = self.self_ref.upgrade() else {
            return;
        };
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move {
            scheduler.job_driver(job, abort).await;
        });
        self.handles.lock().unwrap().cron.insert(job_id, handle);
    }

    async fn job_driver(self: Arc<Self>, job: CronJobConfig, mut abort: watch::Receiver<bool>) {
        match job.schedule.clone() {
            ScheduleSpec::Every { every } => {
                let period = Duration::from_secs(every.max(1));
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(period) => {
                            self.fire_cron_job(&job).await;
                        }
                        _ = abort.changed() => {
                            if *abort.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            ScheduleSpec::Cron { cron: expression } => {
                let schedule = match cron::Schedule::from_str(&expression) {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!(
                            "[CRON:{}] job {} has invalid expression '{}': {}",
                            self.slug(),
                            job.id,
                            expression,
                            e
                        );
                        return;
                    }
                };
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        return;
                    };
                    let delay = (next - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::from_secs(0));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.fire_cron_job(&job).await;
                        }
                        _ = abort.changed() => {
                            if *abort.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            ScheduleSpec::At { at } => {
                let when = match DateTime::parse_from_rfc3339(&at) {
                    Ok(dt) => dt.with_timezone(&Utc),
                    Err(e) => {
                        log::error!("[CRON:{}] job {} has invalid timestamp: {}", self.slug(), job.id, e);
                        let _ = self.store.delete_job(&job.id);
                        return;
                    }
                };
                let now = Utc::now();
                if when <= now {
                    log::info!("[CRON:{}] one-shot {} is in the past, skipping", self.slug(), job.id);
                    let _ = self.store.delete_job(&job.id);
                    return;
                }
                let delay = (when - now).to_std().unwrap_or(Duration::from_secs(0));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.fire_cron_job(&job).await;
                    }
                    _ = abort.changed() => {}
                }
            }
        }
    }

    /// One heartbeat evaluation.
    pub async fn fire_heartbeat(&self) {
        let Some(harness) = self.harness_handle() else {
            return;
        };
        let hb = &self.heartbeat;

        if let Some(ref hours) = hb.active_hours {
            if !within_active_hours(hours, Utc::now()) {
                log::debug!("[HEARTBEAT:{}] outside active hours", self.slug());
                return;
            }
        }

        let checklist_path = self.agent.root.join("workspace").join("HEARTBEAT.md");
        let checklist = match std::fs::read_to_string(&checklist_path) {
            Ok(c) if !c.trim().is_empty() => c,
            _ => {
                log::debug!("[HEARTBEAT:{}] no checklist, skipping", self.slug());
                return;
            }
        };

        if hb.target == "none" {
            return;
        }
        let Some(session) = self.agent.resolve_target(&hb.target).await else {
            log::debug!("[HEARTBEAT:{}] no target session", self.slug());
            return;
        };

        if !self.agent.try_acquire(&session).await {
            log::debug!("[HEARTBEAT:{}] target busy, skipping", self.slug());
            return;
        }

        let session_id = session.lock().await.id();
        log::info!("[HEARTBEAT:{}] firing into {}", self.slug(), session_id);

        // Transient filter: an OK reply is suppressed unless show_ok,
        // anything else is an alert gated by show_alerts.
        let previous_filter = {
            let mut guard = session.lock().await;
            let prev = guard.send_filter.take();
            let visibility = hb.visibility.clone();
            guard.send_filter = Some(Arc::new(move |content: &str| {
                if content.trim() == HEARTBEAT_OK {
                    visibility.show_ok
                } else {
                    visibility.show_alerts
                }
            }));
            prev
        };

        let ctx = harness.turn_context(&self.agent, &session, hb.model.clone());
        let message = format!("{}\n\n{}", HEARTBEAT_PROMPT, checklist);
        if let Err(e) = engine::run_turn_message(&ctx, Message::user_text(message)).await {
            log::warn!("[HEARTBEAT:{}] turn failed: {}", self.slug(), e);
        }

        {
            let mut guard = session.lock().await;
            guard.send_filter = previous_filter;
        }
        self.agent.release(&session).await;
        self.agent.store.save_session(&session_id, &session);
    }

    /// One cron job execution.
    pub async fn fire_cron_job(&self, job: &CronJobConfig) {
        let Some(harness) = self.harness_handle() else {
            return;
        };
        log::info!("[CRON:{}] firing job {}", self.slug(), job.id);

        let success = if job.execution == "main" {
            self.fire_in_main_session(&harness, job).await
        } else {
            self.fire_isolated(&harness, job).await
        };

        if matches!(job.schedule, ScheduleSpec::At { .. }) {
            if let Err(e) = self.store.delete_job(&job.id) {
                log::warn!("[CRON:{}] failed to delete one-shot {}: {}", self.slug(), job.id, e);
            }
            self.handles.lock().unwrap().cron.remove(&job.id);
        } else if let Err(e) = self.store.record_run(&job.id, success) {
            log::warn!("[CRON:{}] failed to record run of {}: {}", self.slug(), job.id, e);
        }
    }

    /// Main mode: behaves like a user turn in the resolved session.
    async fn fire_in_main_session(&self, harness: &Arc<Harness>, job: &CronJobConfig) -> bool {
        let Some(session) = self.agent.resolve_target(&job.target).await else {
            log::warn!("[CRON:{}] job {} target '{}' not found", self.slug(), job.id, job.target);
            return false;
        };
        if !self.agent.try_acquire(&session).await {
            log::info!("[CRON:{}] job {} target busy, skipping", self.slug(), job.id);
            return false;
        }

        let session_id = session.lock().await.id();
        let ctx = harness.turn_context(&self.agent, &session, job.model.clone());
        let result = engine::run_turn_message(&ctx, Message::user_text(job.prompt.clone())).await;

        self.agent.release(&session).await;
        self.agent.store.save_session(&session_id, &session);
        result.is_ok()
    }

    /// Isolated mode: a fresh ephemeral session whose output is captured
    /// and delivered per the job's delivery field.
    async fn fire_isolated(&self, harness: &Arc<Harness>, job: &CronJobConfig) -> bool {
        let session = Arc::new(Mutex::new(Session::new(Channel::Internal {
            job_id: job.id.clone(),
        })));

        let captured: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let sink = Arc::clone(&captured);
            let mut guard = session.lock().await;
            guard.send_filter = Some(Arc::new(move |content: &str| {
                sink.lock().unwrap().push(content.to_string());
                false
            }));
        }

        let ctx = harness.turn_context(&self.agent, &session, job.model.clone());
        let result = engine::run_turn_message(&ctx, Message::user_text(job.prompt.clone())).await;
        let ok = result.is_ok();

        let content = captured.lock().unwrap().join("\n");
        if ok && !content.is_empty() {
            match job.delivery.as_str() {
                "announce" => match self.agent.resolve_target(&job.target).await {
                    Some(target) => {
                        if let Err(e) = harness.send(&self.agent, &target, content, vec![]).await {
                            log::warn!("[CRON:{}] announce for {} failed: {}", self.slug(), job.id, e);
                        }
                    }
                    None => log::warn!(
                        "[CRON:{}] job {} has no announce target '{}'",
                        self.slug(),
                        job.id,
                        job.target
                    ),
                },
                "webhook" => {
                    let Some(ref url) = job.webhook_url else {
                        log::warn!("[CRON:{}] job {} has webhook delivery but no URL", self.slug(), job.id);
                        return ok;
                    };
                    let body = serde_json::json!({
                        "agentSlug": self.agent.slug,
                        "jobId": job.id,
                        "content": content,
                    });
                    match crate::http::shared_client().post(url).json(&body).send().await {
                        Ok(response) if !response.status().is_success() => log::warn!(
                            "[CRON:{}] webhook for {} returned {}",
                            self.slug(),
                            job.id,
                            response.status().as_u16()
                        ),
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("[CRON:{}] webhook for {} failed: {}", self.slug(), job.id, e)
                        }
                    }
                }
                _ => {} // delivery = none discards
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, HeartbeatVisibility, IntegrationsConfig, ToolsConfig};
    use crate::engine::provider::{AssistantTurn, ChatProvider, ProviderCall, StubProvider};
    use crate::engine::EngineError;
    use crate::harness::AgentEntry;
    use crate::session::store::SessionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        agent: Arc<Agent>,
        harness: Arc<Harness>,
        stub: Arc<StubProvider>,
        sink: Arc<StdMutex<Vec<String>>>,
    }

    fn fixture_with_provider(
        provider: Arc<dyn ChatProvider>,
        stub: Arc<StubProvider>,
        heartbeat: HeartbeatConfig,
        cron: CronConfig,
    ) -> Fixture {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("core.md"), "Test agent.").unwrap();
        for sub in ["workspace", "memories", "blocks", "skills"] {
            std::fs::create_dir_all(root.path().join(sub)).unwrap();
        }
        let engine = EngineConfig {
            api_base: "http://stub".to_string(),
            api_key: None,
            model: "stub".to_string(),
            channel: Default::default(),
        };
        let store = SessionStore::open("ada", root.path()).unwrap();
        let agent = Arc::new(Agent::assemble(
            "ada",
            root.path().to_path_buf(),
            engine,
            ToolsConfig::default(),
            IntegrationsConfig::default(),
            provider,
            store,
        ));

        let harness = Harness::new(vec![AgentEntry {
            agent: Arc::clone(&agent),
            heartbeat,
            cron,
        }]);

        let sink: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        harness.register_send(
            "ada",
            "discord",
            Arc::new(move |_channel, content, _attachments| {
                let sink = Arc::clone(&sink_clone);
                Box::pin(async move {
                    sink.lock().unwrap().push(content);
                    Ok(())
                })
            }),
        );

        Fixture {
            _root: root,
            agent,
            harness,
            stub,
            sink,
        }
    }

    fn fixture(
        responses: Vec<AssistantTurn>,
        heartbeat: HeartbeatConfig,
        cron: CronConfig,
    ) -> Fixture {
        let stub = Arc::new(StubProvider::new(responses.into_iter().map(Ok).collect()));
        fixture_with_provider(stub.clone(), stub.clone(), heartbeat, cron)
    }

    fn started_scheduler(fx: &Fixture) -> Arc<Scheduler> {
        let store = CronStore::open("ada", &fx.agent.root).unwrap();
        // Heartbeat stays disabled so no driver runs; tests fire manually.
        let scheduler = Scheduler::create(
            Arc::clone(&fx.agent),
            fx_heartbeat(),
            CronConfig::default(),
            store,
        );
        scheduler.start(&fx.harness, fx.harness.abort_signal());
        scheduler
    }

    fn fx_heartbeat() -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: false,
            interval_sec: 3600,
            active_hours: None,
            target: "last".to_string(),
            model: None,
            visibility: HeartbeatVisibility {
                show_alerts: true,
                show_ok: false,
                use_indicator: false,
            },
        }
    }

    fn discord_channel() -> Channel {
        Channel::Discord {
            channel_id: "42".to_string(),
            guild_id: None,
            is_nsfw: false,
        }
    }

    fn respond_turn(text: &str) -> AssistantTurn {
        StubProvider::turn(vec![("c1", "respond", json!({"content": text}))])
    }

    #[test]
    fn test_within_active_hours_lexicographic() {
        let hours = ActiveHours {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            tz: "UTC".to_string(),
        };
        let noon = "2026-08-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let dawn = "2026-08-01T05:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let edge = "2026-08-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(within_active_hours(&hours, noon));
        assert!(!within_active_hours(&hours, dawn));
        assert!(within_active_hours(&hours, edge));

        // Timezone shifts the window: 12:00 UTC is 21:00 in Tokyo
        let tokyo = ActiveHours {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            tz: "Asia/Tokyo".to_string(),
        };
        assert!(!within_active_hours(&tokyo, noon));
    }

    #[tokio::test]
    async fn test_heartbeat_ok_suppressed() {
        let fx = fixture(
            vec![respond_turn(HEARTBEAT_OK)],
            fx_heartbeat(),
            CronConfig::default(),
        );
        std::fs::write(fx.agent.root.join("workspace/HEARTBEAT.md"), "check disk").unwrap();
        let _session = fx.agent.session_for(discord_channel()).await;

        let scheduler = started_scheduler(&fx);
        scheduler.fire_heartbeat().await;

        // Nothing reached the transport
        assert!(fx.sink.lock().unwrap().is_empty());

        // Gate cleared, filter restored, session persisted
        let session = fx.agent.find_session("discord:42").await.unwrap();
        let guard = session.lock().await;
        assert!(!guard.busy);
        assert!(guard.send_filter.is_none());
        drop(guard);

        fx.agent.store.flush_all().await;
        assert_eq!(fx.agent.store.load_sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_alert_delivered() {
        let fx = fixture(
            vec![respond_turn("disk is nearly full")],
            fx_heartbeat(),
            CronConfig::default(),
        );
        std::fs::write(fx.agent.root.join("workspace/HEARTBEAT.md"), "check disk").unwrap();
        let _session = fx.agent.session_for(discord_channel()).await;

        let scheduler = started_scheduler(&fx);
        scheduler.fire_heartbeat().await;

        assert_eq!(
            fx.sink.lock().unwrap().as_slice(),
            &["disk is nearly full".to_string()]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_skips_without_checklist() {
        let fx = fixture(
            vec![respond_turn(HEARTBEAT_OK)],
            fx_heartbeat(),
            CronConfig::default(),
        );
        let _session = fx.agent.session_for(discord_channel()).await;

        let scheduler = started_scheduler(&fx);
        scheduler.fire_heartbeat().await;

        assert!(fx.stub.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_skips_busy_target() {
        let fx = fixture(
            vec![respond_turn(HEARTBEAT_OK)],
            fx_heartbeat(),
            CronConfig::default(),
        );
        std::fs::write(fx.agent.root.join("workspace/HEARTBEAT.md"), "check").unwrap();
        let session = fx.agent.session_for(discord_channel()).await;
        assert!(fx.agent.try_acquire(&session).await);

        let scheduler = started_scheduler(&fx);
        scheduler.fire_heartbeat().await;

        assert!(fx.stub.recorded_calls().is_empty());
        // Still held by the original owner
        assert!(session.lock().await.busy);
    }

    #[tokio::test]
    async fn test_isolated_cron_announces_captured_output() {
        let fx = fixture(
            vec![respond_turn("report ready")],
            fx_heartbeat(),
            CronConfig::default(),
        );
        let _target = fx.agent.session_for(discord_channel()).await;
        let scheduler = started_scheduler(&fx);

        let job = CronJobConfig {
            id: "digest".to_string(),
            enabled: true,
            schedule: ScheduleSpec::At {
                at: "2999-01-01T00:00:00Z".to_string(),
            },
            execution: "isolated".to_string(),
            delivery: "announce".to_string(),
            target: "last".to_string(),
            prompt: "make the digest".to_string(),
            model: None,
            webhook_url: None,
        };
        scheduler.store.upsert_job(&job, "one-shot", None).unwrap();
        scheduler.fire_cron_job(&job).await;

        // The isolated run's output was captured, then announced to the
        // target channel; nothing leaked during the run itself.
        assert_eq!(
            fx.sink.lock().unwrap().as_slice(),
            &["report ready".to_string()]
        );
        // No ephemeral session joined the agent's map
        assert!(fx.agent.find_session("cron:digest").await.is_none());
        // One-shot was deleted after firing
        assert!(scheduler.store.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_main_cron_runs_in_target_session() {
        let fx = fixture(
            vec![respond_turn("done as asked")],
            fx_heartbeat(),
            CronConfig::default(),
        );
        let session = fx.agent.session_for(discord_channel()).await;
        let scheduler = started_scheduler(&fx);

        let job = CronJobConfig {
            id: "nudge".to_string(),
            enabled: true,
            schedule: ScheduleSpec::Every { every: 3600 },
            execution: "main".to_string(),
            delivery: "announce".to_string(),
            target: "discord:42".to_string(),
            prompt: "nudge the user".to_string(),
            model: None,
            webhook_url: None,
        };
        scheduler.fire_cron_job(&job).await;

        // Ran as a user turn in the shared session
        assert_eq!(fx.sink.lock().unwrap().len(), 1);
        let guard = session.lock().await;
        assert!(guard.history.len() >= 3);
        assert!(!guard.busy);
    }

    /// A provider that delays, so two fires can overlap.
    struct SlowProvider {
        inner: Arc<StubProvider>,
    }

    #[async_trait]
    impl ChatProvider for SlowProvider {
        async fn complete(&self, call: ProviderCall) -> Result<AssistantTurn, EngineError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.complete(call).await
        }
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrent_fires() {
        let stub = Arc::new(StubProvider::new(vec![
            Ok(respond_turn("first")),
            Ok(respond_turn("second")),
        ]));
        let slow = Arc::new(SlowProvider {
            inner: stub.clone(),
        });
        let fx = fixture_with_provider(slow, stub.clone(), fx_heartbeat(), CronConfig::default());
        let _session = fx.agent.session_for(discord_channel()).await;
        let scheduler = started_scheduler(&fx);

        let job = CronJobConfig {
            id: "race".to_string(),
            enabled: true,
            schedule: ScheduleSpec::Every { every: 3600 },
            execution: "main".to_string(),
            delivery: "none".to_string(),
            target: "discord:42".to_string(),
            prompt: "tick".to_string(),
            model: None,
            webhook_url: None,
        };

        let a = {
            let s = Arc::clone(&scheduler);
            let j = job.clone();
            tokio::spawn(async move { s.fire_cron_job(&j).await })
        };
        let b = {
            let s = Arc::clone(&scheduler);
            let j = job.clone();
            tokio::spawn(async move { s.fire_cron_job(&j).await })
        };
        let _ = tokio::join!(a, b);

        // The busy gate let exactly one of the two concurrent fires run
        assert_eq!(fx.stub.recorded_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_add_one_shot_persists() {
        let fx = fixture(vec![], fx_heartbeat(), CronConfig::default());
        let scheduler = started_scheduler(&fx);

        let job = CronJobConfig {
            id: "later".to_string(),
            enabled: true,
            schedule: ScheduleSpec::At {
                at: "2999-06-01T12:00:00Z".to_string(),
            },
            execution: "isolated".to_string(),
            delivery: "announce".to_string(),
            target: "last".to_string(),
            prompt: "remember the thing".to_string(),
            model: None,
            webhook_url: None,
        };
        scheduler.add_one_shot(job).await.unwrap();

        let rows = scheduler.store.list_jobs().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, "later");
        assert_eq!(rows[0].job_type, "one-shot");
        assert_eq!(rows[0].next_run.as_deref(), Some("2999-06-01T12:00:00Z"));
    }
}
