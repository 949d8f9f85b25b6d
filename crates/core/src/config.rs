//! Runtime configuration for Conduit.
//!
//! Every field has a default so an empty file is a valid configuration.
//! Values are loaded from TOML or JSON, then overridden from the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;
use crate::types::agent_stream_name;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub bus: BusSettings,
    pub dispatch: DispatchSettings,
    pub retention: RetentionSettings,
    pub shutdown: ShutdownSettings,
    pub store: StoreSettings,
    pub workers: WorkerSettings,
    pub stages: StageCatalog,
    pub audit: AuditSettings,
}

impl ConductorConfig {
    /// Load configuration from an optional file, apply environment overrides, validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file. `.json` files are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        if path.extension().is_some_and(|e| e == "json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            toml::from_str(&content).map_err(|e| Error::toml_parse_failed(e.to_string()))
        }
    }

    /// Apply `CONDUIT_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("CONDUIT_NATS_URL") {
            self.bus.url = url;
        }
        if let Some(token) = lookup("CONDUIT_NATS_TOKEN") {
            self.bus.credentials = Some(BusCredentials::Token { token });
        }
        if let (Some(user), Some(password)) =
            (lookup("CONDUIT_NATS_USER"), lookup("CONDUIT_NATS_PASSWORD"))
        {
            self.bus.credentials = Some(BusCredentials::UserPassword { user, password });
        }
        if let Some(name) = lookup("CONDUIT_DURABLE_NAME") {
            self.bus.durable_name = name;
        }
        if let Some(max) = lookup("CONDUIT_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.dispatch.max_concurrent_workers = max;
        }
        if let Some(secs) = lookup("CONDUIT_DRAIN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.shutdown.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(url) = lookup("CONDUIT_STORE_URL") {
            self.store.url = url;
        }
        if let Some(root) = lookup("CONDUIT_PROJECT_ROOT") {
            self.workers.project_root = PathBuf::from(root);
        }
        self
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_concurrent_workers == 0 {
            return Err(Error::invalid_config("dispatch.max_concurrent_workers must be > 0"));
        }
        if self.retention.max_messages == 0
            || self.retention.max_bytes == 0
            || self.retention.max_message_size == 0
        {
            return Err(Error::invalid_config("retention limits must be > 0"));
        }
        if self.retention.max_age.is_zero() {
            return Err(Error::invalid_config("retention.max_age must be > 0"));
        }
        if self.stages.is_empty() {
            return Err(Error::invalid_config("stages must list at least one stage"));
        }
        if self.bus.durable_name.trim().is_empty() {
            return Err(Error::invalid_config("bus.durable_name must not be empty"));
        }
        self.workers.check_stream_names()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Message bus connection and consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub url: String,
    pub credentials: Option<BusCredentials>,
    /// Durable consumer name; one active dispatcher per name.
    pub durable_name: String,
    /// Subject the durable consumer is scoped to.
    pub filter_subject: String,
    /// Redelivery attempts before the bus gives up on a message.
    pub max_deliver: i64,
    /// How long the bus waits for an ack before redelivering.
    #[serde(with = "duration_secs")]
    pub ack_wait: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            credentials: None,
            durable_name: "conduit-dispatcher".to_string(),
            filter_subject: "orchestration.events.stage.started".to_string(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Bus authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusCredentials {
    UserPassword { user: String, password: String },
    Token { token: String },
}

// ============================================================================
// Dispatch
// ============================================================================

/// When a delivered stage event is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack as soon as a dispatch slot is held (at-most-once).
    #[default]
    OnAdmission,
    /// Ack after the stage pipeline finishes (at-least-once).
    OnCompletion,
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_concurrent_workers: usize,
    pub ack_mode: AckMode,
}

impl DispatchSettings {
    /// Unacked deliveries the bus may have outstanding to the dispatcher.
    ///
    /// On admission only the event waiting for a slot is unacked, so one is
    /// enough. On completion every running stage holds its delivery.
    #[must_use]
    pub fn max_ack_pending(&self) -> i64 {
        match self.ack_mode {
            AckMode::OnAdmission => 1,
            AckMode::OnCompletion => i64::try_from(self.max_concurrent_workers).unwrap_or(i64::MAX),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            ack_mode: AckMode::OnAdmission,
        }
    }
}

// ============================================================================
// Retention
// ============================================================================

/// Per-stream retention limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_messages: u64,
    pub max_bytes: u64,
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    /// Per-message ceiling; oversized publishes are rejected.
    pub max_message_size: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_bytes: 1024 * 1024 * 1024,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            max_message_size: 1024 * 1024,
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Graceful shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Knowledge store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Connection URL (e.g. "mem://", "ws://localhost:8000", "rocksdb://path")
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "conduit".to_string(),
            database: "knowledge".to_string(),
            username: None,
            password: None,
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Cost/latency class of the model an agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Lightweight,
    #[default]
    Capable,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lightweight => write!(f, "lightweight"),
            Self::Capable => write!(f, "capable"),
        }
    }
}

/// Model names per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierModels {
    pub lightweight: String,
    pub capable: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            lightweight: "haiku".to_string(),
            capable: "sonnet".to_string(),
        }
    }
}

impl TierModels {
    /// Model name for a tier.
    #[must_use]
    pub fn for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Lightweight => &self.lightweight,
            ModelTier::Capable => &self.capable,
        }
    }
}

/// How to launch one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Executable name or path.
    pub executable: String,
    /// Arguments; `{agent}` and `{model}` are substituted at launch.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub tier: ModelTier,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            tier: ModelTier::Capable,
        }
    }
}

impl AgentProfile {
    /// Render the argument list for an agent and model.
    #[must_use]
    pub fn render_args(&self, agent_id: &str, model: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{agent}", agent_id).replace("{model}", model))
            .collect()
    }
}

/// Agent registry and process placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Working directory for every spawned worker.
    pub project_root: PathBuf,
    /// Profile used for identities missing from `agents`.
    pub default_profile: AgentProfile,
    pub agents: HashMap<String, AgentProfile>,
    pub models: TierModels,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            default_profile: AgentProfile::default(),
            agents: HashMap::new(),
            models: TierModels::default(),
        }
    }
}

impl WorkerSettings {
    /// Resolve the profile for an agent, falling back to the default profile.
    #[must_use]
    pub fn resolve(&self, agent_id: &str) -> &AgentProfile {
        self.agents.get(agent_id).unwrap_or(&self.default_profile)
    }

    /// Model name an agent runs on.
    #[must_use]
    pub fn model_for(&self, agent_id: &str) -> &str {
        self.models.for_tier(self.resolve(agent_id).tier)
    }

    /// Fail if two registered agents would share a deliverables stream.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming both agents.
    pub fn check_stream_names(&self) -> Result<()> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for agent_id in self.agent_ids() {
            if let Some(other) = seen.insert(agent_stream_name(agent_id), agent_id) {
                return Err(Error::invalid_config(format!(
                    "agents '{other}' and '{agent_id}' map to the same stream {}",
                    agent_stream_name(agent_id)
                )));
            }
        }
        Ok(())
    }

    /// Registered agent identities, sorted for deterministic provisioning.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Ordered list of workflow stage names; ordinals are 1-based positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCatalog(Vec<String>);

impl Default for StageCatalog {
    fn default() -> Self {
        Self::new(
            [
                "Research",
                "Critique",
                "Backend",
                "Frontend",
                "QA",
                "Statistics",
                "Deployment",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        )
    }
}

impl StageCatalog {
    /// Create a catalog from stage names in workflow order.
    #[must_use]
    pub const fn new(stages: Vec<String>) -> Self {
        Self(stages)
    }

    /// 1-based ordinal of a stage, matched case-insensitively.
    #[must_use]
    pub fn ordinal(&self, stage_name: &str) -> Option<u32> {
        self.0
            .iter()
            .position(|s| s.eq_ignore_ascii_case(stage_name.trim()))
            .and_then(|i| u32::try_from(i).ok())
            .map(|i| i.saturating_add(1))
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Bounds on what gets persisted per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub max_raw_output_bytes: usize,
    pub max_learnings_per_run: usize,
    pub lessons_per_dispatch: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            max_raw_output_bytes: 32 * 1024,
            max_learnings_per_run: 5,
            lessons_per_dispatch: 5,
        }
    }
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConductorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_concurrent_workers, 4);
        assert_eq!(config.dispatch.ack_mode, AckMode::OnAdmission);
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.bus.filter_subject, "orchestration.events.stage.started");
    }

    #[test]
    fn test_toml_file_with_agents() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
stages = ["Research", "Backend"]

[bus]
url = "nats://bus:4222"
credentials = {{ user = "conduit", password = "secret" }}

[dispatch]
max_concurrent_workers = 2
ack_mode = "on_completion"

[workers.agents.cynthia]
executable = "claude"
args = ["--print", "--model", "{{model}}"]
tier = "lightweight"
"#
        )
        .unwrap();

        let config = ConductorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bus.url, "nats://bus:4222");
        assert_eq!(
            config.bus.credentials,
            Some(BusCredentials::UserPassword {
                user: "conduit".to_string(),
                password: "secret".to_string()
            })
        );
        assert_eq!(config.dispatch.ack_mode, AckMode::OnCompletion);
        assert_eq!(config.workers.resolve("cynthia").tier, ModelTier::Lightweight);
        assert_eq!(config.workers.model_for("cynthia"), "haiku");
        assert_eq!(config.stages.ordinal("backend"), Some(2));
        // untouched sections keep their defaults
        assert_eq!(config.retention.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_shipped_example_config_parses() {
        let config: ConductorConfig =
            toml::from_str(include_str!("../../../conduit.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers.agent_ids().len(), 7);
        assert_eq!(config.workers.model_for("billy"), "haiku");
        assert_eq!(config.workers.model_for("cynthia"), "sonnet");
        assert_eq!(config.stages.ordinal("Deployment"), Some(7));
    }

    #[test]
    fn test_unknown_agent_falls_back_to_default_profile() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.resolve("nobody"), &AgentProfile::default());
        assert_eq!(settings.model_for("nobody"), "sonnet");
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let profile = AgentProfile {
            executable: "agent-cli".to_string(),
            args: vec!["--as".to_string(), "{agent}".to_string(), "-m={model}".to_string()],
            tier: ModelTier::Capable,
        };
        assert_eq!(
            profile.render_args("roy", "sonnet"),
            vec!["--as", "roy", "-m=sonnet"]
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = ConductorConfig::default().with_overrides(|key| match key {
            "CONDUIT_NATS_URL" => Some("nats://elsewhere:4222".to_string()),
            "CONDUIT_MAX_CONCURRENT" => Some("8".to_string()),
            "CONDUIT_DRAIN_TIMEOUT_SECS" => Some("5".to_string()),
            "CONDUIT_NATS_TOKEN" => Some("t0k3n".to_string()),
            _ => None,
        });
        assert_eq!(config.bus.url, "nats://elsewhere:4222");
        assert_eq!(config.dispatch.max_concurrent_workers, 8);
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(5));
        assert_eq!(
            config.bus.credentials,
            Some(BusCredentials::Token { token: "t0k3n".to_string() })
        );
    }

    #[test]
    fn test_validate_rejects_zero_concurrency_and_empty_stages() {
        let mut config = ConductorConfig::default();
        config.dispatch.max_concurrent_workers = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        let mut config = ConductorConfig::default();
        config.stages = StageCatalog::new(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_agents_sharing_a_stream() {
        let mut config = ConductorConfig::default();
        for agent in ["qa-bot", "qa_bot"] {
            config
                .workers
                .agents
                .insert(agent.to_string(), AgentProfile::default());
        }
        let err = config.validate();
        assert!(matches!(err, Err(Error::InvalidConfig { .. })));
        assert!(err.is_err_and(|e| e.to_string().contains("DELIVERABLES_QA_BOT")));

        config.workers.agents.remove("qa_bot");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_ack_pending_follows_ack_mode() {
        let mut dispatch = DispatchSettings::default();
        assert_eq!(dispatch.max_ack_pending(), 1);
        dispatch.ack_mode = AckMode::OnCompletion;
        dispatch.max_concurrent_workers = 3;
        assert_eq!(dispatch.max_ack_pending(), 3);
    }

    #[test]
    fn test_stage_ordinals() {
        let stages = StageCatalog::default();
        assert_eq!(stages.ordinal("Research"), Some(1));
        assert_eq!(stages.ordinal("qa"), Some(5));
        assert_eq!(stages.ordinal("Marketing"), None);
    }
}
