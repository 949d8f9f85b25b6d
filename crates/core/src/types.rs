//! Domain types shared across the bus, worker and orchestrator crates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::lenient;

// ============================================================================
// Completion notices
// ============================================================================

/// Outcome a worker reports about its own work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeStatus {
    Complete,
    Failed,
    Blocked,
}

impl FromStr for NoticeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "complete" | "completed" | "success" | "done" => Ok(Self::Complete),
            "failed" | "failure" | "error" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(Error::invalid_record(format!("unknown notice status '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for NoticeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for NoticeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// The small structured status object a worker prints when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub status: NoticeStatus,
    #[serde(deserialize_with = "lenient::string")]
    pub agent: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub task: String,
    /// Where the worker believes its deliverable lives.
    #[serde(
        default,
        rename = "nats_channel",
        alias = "deliverable_locator",
        alias = "deliverable",
        deserialize_with = "lenient::opt_string"
    )]
    pub deliverable_locator: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub complexity: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list", skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub ready_for_next_stage: bool,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub completion_time: Option<String>,
    #[serde(default, deserialize_with = "lenient::string_list", skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default, deserialize_with = "lenient::string_list", skip_serializing_if = "Vec::is_empty")]
    pub key_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CompletionNotice {
    /// Create a minimal notice.
    pub fn new(status: NoticeStatus, agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            status,
            agent: agent.into(),
            task: task.into(),
            deliverable_locator: None,
            summary: String::new(),
            complexity: None,
            blockers: Vec::new(),
            ready_for_next_stage: false,
            completion_time: None,
            files_modified: Vec::new(),
            key_changes: Vec::new(),
            metadata: None,
        }
    }

    /// Set the summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Key changes from the top-level list plus any `metadata.key_changes`.
    #[must_use]
    pub fn all_key_changes(&self) -> Vec<String> {
        let nested = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("key_changes"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string);

        self.key_changes.iter().cloned().chain(nested).collect()
    }
}

// ============================================================================
// Deliverables
// ============================================================================

/// Opaque audit pointer to a published message: stream plus sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliverableLocator {
    pub stream: String,
    pub sequence: u64,
}

impl DeliverableLocator {
    /// Create a locator.
    pub fn new(stream: impl Into<String>, sequence: u64) -> Self {
        Self {
            stream: stream.into(),
            sequence,
        }
    }
}

impl fmt::Display for DeliverableLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.sequence)
    }
}

/// Descriptive metadata published alongside a deliverable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableMetadata {
    pub agent: String,
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeliverableMetadata {
    /// Create metadata stamped with the current time.
    pub fn new(agent: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task_type: task_type.into(),
            feature: None,
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Set the feature label.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    /// Attach an extra key.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A full work-product keyed by (agent, task type, request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deliverable {
    pub agent_id: String,
    pub task_type: String,
    pub request_id: String,
    pub payload: Value,
    pub metadata: DeliverableMetadata,
}

/// Compact "latest deliverable for this stage" row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverableCacheRow {
    pub request_id: String,
    pub agent_id: String,
    pub stage_ordinal: u32,
    pub stage_name: String,
    pub status: NoticeStatus,
    pub summary: String,
    pub subject: String,
    pub locator: String,
    pub notice: Value,
    pub completed_at: DateTime<Utc>,
}

impl DeliverableCacheRow {
    /// Composite key `(request_id, agent_id, stage_ordinal)` as a single string.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.request_id, &self.agent_id, self.stage_ordinal)
    }
}

/// Build the composite cache key.
#[must_use]
pub fn cache_key(request_id: &str, agent_id: &str, stage_ordinal: u32) -> String {
    format!("{request_id}:{agent_id}:{stage_ordinal}")
}

// ============================================================================
// Streams
// ============================================================================

/// What the bus does when a stream hits a retention limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the oldest messages to make room.
    #[default]
    Old,
    /// Reject new messages.
    New,
}

/// Bounded, persistent stream owned by one worker identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    pub subject_pattern: String,
    pub max_messages: u64,
    pub max_bytes: u64,
    pub max_age: Duration,
    pub max_message_size: u32,
    pub discard_policy: DiscardPolicy,
}

/// `DELIVERABLES_<ID>` with the id uppercased and non-alphanumerics mapped to `_`.
///
/// The mapping is lossy: `qa-bot` and `qa_bot` share a stream name.
#[must_use]
pub fn agent_stream_name(agent_id: &str) -> String {
    let id: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("DELIVERABLES_{id}")
}

// ============================================================================
// Knowledge: audit records and learnings
// ============================================================================

/// Kind of audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Work finished but produced no structured notice.
    Change,
    /// Worker failed or could not be started.
    Failure,
}

/// Append-only change/failure entry kept for human triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub agent_id: String,
    pub request_id: String,
    pub stage_name: String,
    pub status: String,
    pub summary: String,
    pub change_details: Value,
    pub truncated_raw_output: String,
    pub recorded_at: DateTime<Utc>,
}

/// Category of a harvested lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    Pattern,
    AntiPattern,
    BestPractice,
    Gotcha,
    Optimization,
}

impl fmt::Display for LearningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::AntiPattern => write!(f, "anti_pattern"),
            Self::BestPractice => write!(f, "best_practice"),
            Self::Gotcha => write!(f, "gotcha"),
            Self::Optimization => write!(f, "optimization"),
        }
    }
}

/// A reusable lesson mined from worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub agent_id: String,
    pub learning_type: LearningType,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub example_context: Option<String>,
    pub confidence_score: f64,
    #[serde(default)]
    pub times_applied: u32,
    pub created_at: DateTime<Utc>,
}
