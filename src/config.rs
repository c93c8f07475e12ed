//! On-disk configuration: root directory layout and TOML config shapes.
//!
//! Everything an agent owns lives under `{root}/agents/{slug}/`:
//! base instructions, memory blocks, skills, workspace, per-agent config
//! and the session database. The root defaults to `$HOME/.cireilclaw`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Default values
pub mod defaults {
    /// Directory name under `$HOME` that holds all agent state
    pub const ROOT_DIR_NAME: &str = ".cireilclaw";
    /// Sandbox exec timeout when the tool config does not set one
    pub const EXEC_TIMEOUT_MS: u64 = 60_000;
    /// Heartbeat interval when enabled without an explicit interval
    pub const HEARTBEAT_INTERVAL_SEC: u64 = 30 * 60;
}

/// Resolve the root directory (`$HOME/.cireilclaw`).
pub fn root_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(defaults::ROOT_DIR_NAME)
}

/// Directory holding all agent roots.
pub fn agents_dir() -> PathBuf {
    root_dir().join("agents")
}

/// Root directory for a single agent.
pub fn agent_root(slug: &str) -> PathBuf {
    agents_dir().join(slug)
}

/// Path to the global integrations config.
pub fn integrations_path() -> PathBuf {
    root_dir().join("config").join("integrations.toml")
}

/// Validate an agent slug: URL-safe, non-empty.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Per-call override of the engine endpoint for one guild or room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOverride {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Channel-keyed override tables: channel kind -> sub-key -> override.
/// The sub-key is a guild id for Discord and a room id for Matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOverrides {
    #[serde(default)]
    pub discord: HashMap<String, EngineOverride>,
    #[serde(default)]
    pub matrix: HashMap<String, EngineOverride>,
}

impl ChannelOverrides {
    pub fn is_empty(&self) -> bool {
        self.discord.is_empty() && self.matrix.is_empty()
    }
}

/// Engine configuration from `config/engine.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub channel: ChannelOverrides,
}

impl EngineConfig {
    /// Apply the channel override for a (channel kind, sub-key) pair,
    /// returning the effective (api_base, api_key, model) triple.
    pub fn resolve(
        &self,
        channel_kind: &str,
        sub_key: Option<&str>,
    ) -> (String, Option<String>, String) {
        let ov = match (channel_kind, sub_key) {
            ("discord", Some(key)) => self.channel.discord.get(key),
            ("matrix", Some(key)) => self.channel.matrix.get(key),
            _ => None,
        };

        match ov {
            Some(o) => (
                o.api_base.clone().unwrap_or_else(|| self.api_base.clone()),
                o.api_key.clone().or_else(|| self.api_key.clone()),
                o.model.clone().unwrap_or_else(|| self.model.clone()),
            ),
            None => (
                self.api_base.clone(),
                self.api_key.clone(),
                self.model.clone(),
            ),
        }
    }
}

/// A single tool's setting in `config/tools.toml`: either a bare bool or
/// a table with `enabled` plus tool-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSetting {
    Enabled(bool),
    Detailed {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        allowed_binaries: Option<Vec<String>>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

impl ToolSetting {
    pub fn is_enabled(&self) -> bool {
        match self {
            ToolSetting::Enabled(b) => *b,
            ToolSetting::Detailed { enabled, .. } => *enabled,
        }
    }

    pub fn allowed_binaries(&self) -> Option<&[String]> {
        match self {
            ToolSetting::Detailed {
                allowed_binaries: Some(bins),
                ..
            } => Some(bins),
            _ => None,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            ToolSetting::Detailed {
                timeout_ms: Some(ms),
                ..
            } => *ms,
            _ => defaults::EXEC_TIMEOUT_MS,
        }
    }
}

/// Tool table from `config/tools.toml`. Tools absent from the table are
/// enabled with their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(flatten)]
    pub tools: HashMap<String, ToolSetting>,
}

impl ToolsConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.get(name).map(|s| s.is_enabled()).unwrap_or(true)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSetting> {
        self.tools.get(name)
    }
}

/// Active-hours window for the heartbeat. `start`/`end` are `HH:MM`
/// strings compared lexicographically in the named timezone; windows that
/// wrap midnight are rejected at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start: String,
    pub end: String,
    pub tz: String,
}

/// Heartbeat delivery visibility switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatVisibility {
    #[serde(default = "default_true")]
    pub show_alerts: bool,
    #[serde(default)]
    pub show_ok: bool,
    #[serde(default)]
    pub use_indicator: bool,
}

impl Default for HeartbeatVisibility {
    fn default() -> Self {
        HeartbeatVisibility {
            show_alerts: true,
            show_ok: false,
            use_indicator: false,
        }
    }
}

/// Heartbeat schema from `config/heartbeat.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_sec: u64,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub visibility: HeartbeatVisibility,
}

fn default_heartbeat_interval() -> u64 {
    defaults::HEARTBEAT_INTERVAL_SEC
}

fn default_target() -> String {
    "last".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: false,
            interval_sec: defaults::HEARTBEAT_INTERVAL_SEC,
            active_hours: None,
            target: "last".to_string(),
            model: None,
            visibility: HeartbeatVisibility::default(),
        }
    }
}

/// Schedule variant: fixed interval, cron expression, or one-shot instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    Every { every: u64 },
    Cron { cron: String },
    At { at: String },
}

/// One cron job from `config/cron.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: ScheduleSpec,
    #[serde(default = "default_execution")]
    pub execution: String,
    #[serde(default = "default_delivery")]
    pub delivery: String,
    #[serde(default = "default_target")]
    pub target: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_execution() -> String {
    "isolated".to_string()
}

fn default_delivery() -> String {
    "announce".to_string()
}

/// Cron table from `config/cron.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub jobs: Vec<CronJobConfig>,
}

/// Global integrations from `{root}/config/integrations.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub brave: Option<BraveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraveConfig {
    pub api_key: String,
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    toml::from_str(&raw).map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))
}

/// Load and validate an agent's engine config. Missing or malformed
/// config is a startup abort for that agent.
pub fn load_engine_config(slug: &str) -> Result<EngineConfig, String> {
    let path = agent_root(slug).join("config").join("engine.toml");
    read_toml(&path)
}

/// Load an agent's tool table. A missing file means all defaults.
pub fn load_tools_config(slug: &str) -> Result<ToolsConfig, String> {
    let path = agent_root(slug).join("config").join("tools.toml");
    if !path.exists() {
        return Ok(ToolsConfig::default());
    }
    read_toml(&path)
}

/// Load an agent's heartbeat config, validating the active-hours window.
pub fn load_heartbeat_config(slug: &str) -> Result<HeartbeatConfig, String> {
    let path = agent_root(slug).join("config").join("heartbeat.toml");
    if !path.exists() {
        return Ok(HeartbeatConfig::default());
    }
    let config: HeartbeatConfig = read_toml(&path)?;
    if let Some(ref hours) = config.active_hours {
        validate_active_hours(hours)?;
    }
    Ok(config)
}

/// Load an agent's cron jobs.
pub fn load_cron_config(slug: &str) -> Result<CronConfig, String> {
    let path = agent_root(slug).join("config").join("cron.toml");
    if !path.exists() {
        return Ok(CronConfig::default());
    }
    read_toml(&path)
}

/// Load the global integrations config. Missing file yields defaults.
pub fn load_integrations_config() -> Result<IntegrationsConfig, String> {
    let path = integrations_path();
    if !path.exists() {
        return Ok(IntegrationsConfig::default());
    }
    read_toml(&path)
}

/// Validate an `HH:MM` time string.
fn is_hhmm(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let hh: u32 = match s[0..2].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let mm: u32 = match s[3..5].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    hh < 24 && mm < 60
}

/// The window comparison is lexicographic `HH:MM`, so windows that wrap
/// midnight cannot be expressed and are rejected here.
pub fn validate_active_hours(hours: &ActiveHours) -> Result<(), String> {
    if !is_hhmm(&hours.start) || !is_hhmm(&hours.end) {
        return Err(format!(
            "active_hours times must be HH:MM, got start={} end={}",
            hours.start, hours.end
        ));
    }
    if hours.start > hours.end {
        return Err(format!(
            "active_hours window {}–{} wraps midnight, which is not supported",
            hours.start, hours.end
        ));
    }
    hours
        .tz
        .parse::<chrono_tz::Tz>()
        .map_err(|_| format!("unknown timezone: {}", hours.tz))?;
    Ok(())
}

/// Enumerate agent slugs by listing `{root}/agents/`.
pub fn list_agent_slugs() -> Vec<String> {
    let dir = agents_dir();
    let mut slugs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_slug(name) {
                        slugs.push(name.to_string());
                    }
                }
            }
        }
    }
    slugs.sort();
    slugs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_parse_with_overrides() {
        let raw = r#"
            api_base = "https://api.example.com/v1"
            api_key = "sk-test"
            model = "gpt-4o"

            [channel.discord."guild-123"]
            model = "gpt-4o-mini"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.model, "gpt-4o");

        let (base, key, model) = config.resolve("discord", Some("guild-123"));
        assert_eq!(base, "https://api.example.com/v1");
        assert_eq!(key.as_deref(), Some("sk-test"));
        assert_eq!(model, "gpt-4o-mini");

        // Unknown sub-key falls through to the base config
        let (_, _, model) = config.resolve("discord", Some("guild-999"));
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn test_tool_setting_forms() {
        let raw = r#"
            brave-search = false
            exec = { enabled = true, allowed_binaries = ["ls", "cat"], timeout_ms = 5000 }
        "#;
        let config: ToolsConfig = toml::from_str(raw).unwrap();
        assert!(!config.is_enabled("brave-search"));
        assert!(config.is_enabled("exec"));
        assert!(config.is_enabled("respond")); // absent tools default on

        let exec = config.get("exec").unwrap();
        assert_eq!(exec.allowed_binaries().unwrap(), &["ls", "cat"]);
        assert_eq!(exec.timeout_ms(), 5000);
    }

    #[test]
    fn test_schedule_spec_variants() {
        #[derive(Deserialize)]
        struct Holder {
            schedule: ScheduleSpec,
        }
        let every: Holder = toml::from_str("schedule = { every = 60 }").unwrap();
        assert_eq!(every.schedule, ScheduleSpec::Every { every: 60 });

        let cron: Holder = toml::from_str(r#"schedule = { cron = "0 0 * * * *" }"#).unwrap();
        assert!(matches!(cron.schedule, ScheduleSpec::Cron { .. }));

        let at: Holder = toml::from_str(r#"schedule = { at = "2030-01-01T00:00:00Z" }"#).unwrap();
        assert!(matches!(at.schedule, ScheduleSpec::At { .. }));
    }

    #[test]
    fn test_active_hours_validation() {
        let ok = ActiveHours {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            tz: "Europe/Berlin".to_string(),
        };
        assert!(validate_active_hours(&ok).is_ok());

        let wrapping = ActiveHours {
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            tz: "UTC".to_string(),
        };
        assert!(validate_active_hours(&wrapping).is_err());

        let bad_tz = ActiveHours {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
            tz: "Mars/Olympus".to_string(),
        };
        assert!(validate_active_hours(&bad_tz).is_err());

        let bad_time = ActiveHours {
            start: "9am".to_string(),
            end: "17:00".to_string(),
            tz: "UTC".to_string(),
        };
        assert!(validate_active_hours(&bad_time).is_err());
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("ada"));
        assert!(is_valid_slug("agent-2_test"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("has space"));
        assert!(!is_valid_slug("dot.dot"));
    }
}
