//! cireilclaw: hosts long-lived conversational agents with durable
//! memory, sandboxed tool execution, and scheduled autonomy.

use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

mod agent;
mod chunk;
mod config;
mod engine;
mod harness;
mod http;
mod memory;
mod sandbox;
mod scheduler;
mod session;
mod skills;
mod tools;

use agent::Agent;
use engine::provider::OpenAiProvider;
use harness::{AgentEntry, Harness};
use session::store::SessionStore;

#[derive(Parser)]
#[command(name = "cireilclaw", about = "Multi-agent conversational orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new agent interactively
    Init,
    /// Start the harness with all configured agents
    Run {
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Remove persisted sessions (one agent, or all)
    Clear {
        #[arg(long)]
        agent: Option<String>,
    },
}

fn init_logging(level: &str) {
    let filter = match level {
        "error" => "error",
        "warning" => "warn",
        "debug" => "debug",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Init => run_init(),
        Command::Run { log_level } => {
            init_logging(&log_level);
            run_harness()
        }
        Command::Clear { agent } => {
            init_logging("info");
            run_clear(agent.as_deref())
        }
    };
    std::process::exit(code);
}

fn prompt(question: &str, default: &str) -> String {
    if default.is_empty() {
        print!("{}: ", question);
    } else {
        print!("{} [{}]: ", question, default);
    }
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return default.to_string();
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn write_if_absent(path: &Path, content: &str) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::write(path, content)?;
    }
    Ok(())
}

/// Interactive new-agent wizard. Existing files are never overwritten.
fn run_init() -> i32 {
    let slug = prompt("Agent slug", "");
    if !config::is_valid_slug(&slug) {
        eprintln!("'{}' is not a valid slug (letters, digits, - and _)", slug);
        return 1;
    }
    let api_base = prompt("API base URL", "https://api.openai.com/v1");
    let model = prompt("Model", "gpt-4o");
    let api_key = prompt("API key (empty to skip)", "");

    let root = config::agent_root(&slug);
    let result = (|| -> std::io::Result<()> {
        for sub in ["blocks", "skills", "workspace", "memories", "images", "config"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        write_if_absent(
            &root.join("core.md"),
            &format!(
                "You are {}, a helpful assistant with a persistent workspace.\n\
                 Keep notes in /memories and your working files in /workspace.\n",
                slug
            ),
        )?;
        write_if_absent(
            &root.join("blocks").join("persona.md"),
            "+++\ndescription = \"Who this agent is\"\n+++\nDescribe the agent here.\n",
        )?;

        let mut engine_toml = format!("api_base = \"{}\"\nmodel = \"{}\"\n", api_base, model);
        if !api_key.is_empty() {
            engine_toml = format!(
                "api_base = \"{}\"\napi_key = \"{}\"\nmodel = \"{}\"\n",
                api_base, api_key, model
            );
        }
        write_if_absent(&root.join("config").join("engine.toml"), &engine_toml)?;
        write_if_absent(
            &root.join("config").join("tools.toml"),
            "# Per-tool switches. Tools default to enabled.\n\
             # exec = { enabled = true, allowed_binaries = [\"ls\", \"cat\"], timeout_ms = 60000 }\n\
             # brave-search = false\n",
        )?;
        write_if_absent(
            &root.join("config").join("heartbeat.toml"),
            "enabled = false\ninterval_sec = 1800\ntarget = \"last\"\n\n\
             [visibility]\nshow_alerts = true\nshow_ok = false\n",
        )?;
        write_if_absent(&root.join("config").join("cron.toml"), "jobs = []\n")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            println!("Agent '{}' created at {}", slug, root.display());
            0
        }
        Err(e) => {
            eprintln!("Failed to scaffold agent: {}", e);
            1
        }
    }
}

fn run_clear(slug: Option<&str>) -> i32 {
    let slugs = match slug {
        Some(s) => vec![s.to_string()],
        None => config::list_agent_slugs(),
    };
    for slug in &slugs {
        let root = config::agent_root(slug);
        if !root.join("sessions.db").exists() {
            continue;
        }
        let store = match SessionStore::open(slug, &root) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}: {}", slug, e);
                return 1;
            }
        };
        match store.session_ids() {
            Ok(ids) => {
                for id in &ids {
                    if let Err(e) = store.delete_session(id) {
                        eprintln!("{}: failed to delete {}: {}", slug, id, e);
                    }
                }
                println!("{}: removed {} session(s)", slug, ids.len());
            }
            Err(e) => {
                eprintln!("{}: {}", slug, e);
                return 1;
            }
        }
    }
    0
}

fn run_harness() -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return 1;
        }
    };
    runtime.block_on(run_harness_async())
}

async fn run_harness_async() -> i32 {
    // Global config problems abort startup.
    let integrations = match config::load_integrations_config() {
        Ok(i) => i,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };

    let slugs = config::list_agent_slugs();
    if slugs.is_empty() {
        log::error!(
            "no agents found under {}; run `cireilclaw init` first",
            config::agents_dir().display()
        );
        return 1;
    }

    let mut entries = Vec::new();
    for slug in &slugs {
        // Agent config problems abort startup too.
        let engine = match config::load_engine_config(slug) {
            Ok(c) => c,
            Err(e) => {
                log::error!("[{}] {}", slug, e);
                return 1;
            }
        };
        let tools_config = match config::load_tools_config(slug) {
            Ok(c) => c,
            Err(e) => {
                log::error!("[{}] {}", slug, e);
                return 1;
            }
        };
        let heartbeat = match config::load_heartbeat_config(slug) {
            Ok(c) => c,
            Err(e) => {
                log::error!("[{}] {}", slug, e);
                return 1;
            }
        };
        let cron = match config::load_cron_config(slug) {
            Ok(c) => c,
            Err(e) => {
                log::error!("[{}] {}", slug, e);
                return 1;
            }
        };

        // A broken database degrades the agent, never the process.
        let root = config::agent_root(slug);
        let store = match SessionStore::open(slug, &root) {
            Ok(s) => s,
            Err(e) => {
                log::error!("[{}] degraded, skipping agent: {}", slug, e);
                continue;
            }
        };

        let agent = Arc::new(Agent::assemble(
            slug,
            root,
            engine,
            tools_config,
            integrations.clone(),
            Arc::new(OpenAiProvider::new()),
            store,
        ));
        match agent.restore_sessions().await {
            Ok(count) => log::info!("[{}] restored {} session(s)", slug, count),
            Err(e) => log::warn!("[{}] session restore failed: {}", slug, e),
        }
        entries.push(AgentEntry {
            agent,
            heartbeat,
            cron,
        });
    }

    if entries.is_empty() {
        log::error!("all agents failed to initialize");
        return 1;
    }

    let harness = Harness::new(entries);
    harness.start_schedulers();
    log::info!("harness running with {} agent(s)", harness.agent_slugs().len());

    // Chat transports attach here: each registers its send/react/download
    // handlers on the harness and feeds inbound events to run_user_turn.
    spawn_config_watcher(&harness);

    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("failed to listen for shutdown signal");
        harness.shutdown().await;
        return 1;
    }
    log::info!("shutdown requested (Ctrl-C again to force)");

    tokio::select! {
        _ = harness.shutdown() => {
            log::info!("clean shutdown");
            0
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("forced exit");
            1
        }
    }
}

/// Poll per-agent config mtimes and hot-reload: engine.toml swaps the
/// engine config atomically; heartbeat/cron changes rebuild the
/// scheduler.
fn spawn_config_watcher(harness: &Arc<Harness>) {
    let weak = Arc::downgrade(harness);
    let mut abort = harness.abort_signal();

    tokio::spawn(async move {
        let mut stamps: std::collections::HashMap<std::path::PathBuf, SystemTime> =
            std::collections::HashMap::new();

        let changed = |stamps: &mut std::collections::HashMap<std::path::PathBuf, SystemTime>,
                       path: &Path| {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            match (modified, stamps.get(path)) {
                (Some(now), Some(prev)) if now != *prev => {
                    stamps.insert(path.to_path_buf(), now);
                    true
                }
                (Some(now), None) => {
                    stamps.insert(path.to_path_buf(), now);
                    false
                }
                _ => false,
            }
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = abort.changed() => {
                    if *abort.borrow() {
                        return;
                    }
                }
            }

            let Some(harness) = weak.upgrade() else {
                return;
            };
            for slug in harness.agent_slugs() {
                let config_dir = config::agent_root(&slug).join("config");

                if changed(&mut stamps, &config_dir.join("engine.toml")) {
                    match config::load_engine_config(&slug) {
                        Ok(engine) => {
                            if let Some(agent) = harness.agent(&slug) {
                                agent.replace_engine(engine);
                            }
                        }
                        Err(e) => log::error!("[{}] engine reload failed: {}", slug, e),
                    }
                }

                let heartbeat_changed = changed(&mut stamps, &config_dir.join("heartbeat.toml"));
                let cron_changed = changed(&mut stamps, &config_dir.join("cron.toml"));
                if heartbeat_changed || cron_changed {
                    if let Err(e) = harness.reload_scheduler(&slug) {
                        log::error!("[{}] scheduler reload failed: {}", slug, e);
                    }
                }
            }
        }
    });
}
