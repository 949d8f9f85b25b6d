//! Best-effort learning extraction from worker output.
//!
//! Two sources feed the harvester: marker lines in stdout (`LESSON:`,
//! `WARNING:`, `TIP:`, `NOTE:`) and the key changes listed in a parsed
//! completion notice. Nothing here can fail a dispatch.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, warn};

use conduit_core::{CompletionNotice, Learning, LearningType};

use crate::persistence::KnowledgeStore;

const TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Lesson,
    Warning,
    Tip,
    Note,
}

impl Marker {
    const ALL: [(Self, &'static str); 4] = [
        (Self::Lesson, "lesson:"),
        (Self::Warning, "warning:"),
        (Self::Tip, "tip:"),
        (Self::Note, "note:"),
    ];

    fn learning_type(self, text: &str) -> LearningType {
        match self {
            Self::Warning => LearningType::Gotcha,
            Self::Tip => LearningType::BestPractice,
            Self::Lesson | Self::Note => classify(text),
        }
    }

    const fn confidence(self) -> f64 {
        match self {
            Self::Warning => 0.8,
            Self::Lesson | Self::Tip => 0.7,
            Self::Note => 0.5,
        }
    }
}

/// Classify free text by keyword.
#[must_use]
pub fn classify(text: &str) -> LearningType {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let any = |prefixes: &[&str]| {
        words
            .iter()
            .any(|w| prefixes.iter().any(|p| w.starts_with(p)))
    };

    if any(&["fix", "bug", "error"]) {
        LearningType::Gotcha
    } else if any(&["performance", "faster", "cach"]) {
        LearningType::Optimization
    } else if any(&["should", "always", "prefer"]) {
        LearningType::BestPractice
    } else {
        LearningType::Pattern
    }
}

/// Strip list bullets and numbering from the start of a line.
fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim_start();
    let without_number = trimmed
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .strip_prefix(['.', ')'])
        .filter(|_| trimmed.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(trimmed);
    without_number
        .trim_start_matches(['-', '*', '•', '>', '#'])
        .trim_start()
}

fn parse_marker(line: &str) -> Option<(Marker, &str)> {
    let body = strip_bullet(line);
    Marker::ALL.iter().find_map(|(marker, prefix)| {
        let head = body.get(..prefix.len())?;
        if head.eq_ignore_ascii_case(prefix) {
            let text = body.get(prefix.len()..)?.trim();
            (!text.is_empty()).then_some((*marker, text))
        } else {
            None
        }
    })
}

fn title_of(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    match first_line.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => first_line.get(..cut).unwrap_or(first_line).to_string(),
        None => first_line.to_string(),
    }
}

/// Mines learnings from one successful worker run.
#[derive(Debug, Clone, Copy)]
pub struct LearningHarvester {
    max_per_run: usize,
}

impl LearningHarvester {
    #[must_use]
    pub const fn new(max_per_run: usize) -> Self {
        Self { max_per_run }
    }

    /// Extract learnings, deduplicated by title and capped per run.
    #[must_use]
    pub fn harvest(&self, agent_id: &str, stdout: &str, notice: Option<&CompletionNotice>) -> Vec<Learning> {
        let now = Utc::now();
        let task = notice.map(|n| n.task.clone()).filter(|t| !t.is_empty());

        let from_markers = stdout.lines().filter_map(parse_marker).map(|(marker, text)| Learning {
            agent_id: agent_id.to_string(),
            learning_type: marker.learning_type(text),
            title: title_of(text),
            description: text.to_string(),
            example_context: None,
            confidence_score: marker.confidence(),
            times_applied: 0,
            created_at: now,
        });

        let key_changes = notice.map(CompletionNotice::all_key_changes).unwrap_or_default();
        let from_changes = key_changes
            .iter()
            .map(|change| change.trim())
            .filter(|change| !change.is_empty())
            .map(|change| Learning {
                agent_id: agent_id.to_string(),
                learning_type: classify(change),
                title: title_of(change),
                description: change.to_string(),
                example_context: task.clone(),
                confidence_score: 0.6,
                times_applied: 0,
                created_at: now,
            });

        let mut seen = HashSet::new();
        from_markers
            .chain(from_changes)
            .filter(|learning| seen.insert(learning.title.to_lowercase()))
            .take(self.max_per_run)
            .collect()
    }

    /// Harvest and persist. Returns the number of learnings written; store
    /// failures are logged and count as zero.
    pub async fn harvest_into(
        &self,
        store: &dyn KnowledgeStore,
        agent_id: &str,
        stdout: &str,
        notice: Option<&CompletionNotice>,
    ) -> usize {
        let learnings = self.harvest(agent_id, stdout, notice);
        if learnings.is_empty() {
            return 0;
        }
        match store.append_learnings(&learnings).await {
            Ok(written) => {
                debug!(agent_id = %agent_id, written, "Harvested learnings");
                written
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to persist learnings");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use conduit_core::NoticeStatus;

    use super::*;
    use crate::persistence::InMemoryKnowledgeStore;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(classify("Fixed an off-by-one"), LearningType::Gotcha);
        assert_eq!(classify("Caching the schema made it faster"), LearningType::Optimization);
        assert_eq!(classify("Always pin versions"), LearningType::BestPractice);
        assert_eq!(classify("Split handlers by route"), LearningType::Pattern);
        assert_eq!(classify("prefix routes"), LearningType::Pattern);
    }

    #[test]
    fn test_marker_parsing() {
        assert_eq!(parse_marker("LESSON: keep it small"), Some((Marker::Lesson, "keep it small")));
        assert_eq!(parse_marker("  - warning: migrations lock"), Some((Marker::Warning, "migrations lock")));
        assert_eq!(parse_marker("2. Tip: batch inserts"), Some((Marker::Tip, "batch inserts")));
        assert_eq!(parse_marker("* note: uses v2 api"), Some((Marker::Note, "uses v2 api")));
        assert_eq!(parse_marker("LESSON:"), None);
        assert_eq!(parse_marker("plain text"), None);
        assert_eq!(parse_marker("é"), None);
    }

    #[test]
    fn test_harvest_types_dedupe_and_cap() {
        let stdout = "\
LESSON: Always validate input
WARNING: The cache is not shared
TIP: Use prepared statements
lesson: always validate input
NOTE: Fixed the flaky retry bug
";
        let mut notice = CompletionNotice::new(NoticeStatus::Complete, "roy", "backend");
        notice.key_changes = vec!["Added index for faster lookups".to_string(), "Renamed module".to_string()];

        let learnings = LearningHarvester::new(5).harvest("roy", stdout, Some(&notice));

        let got: Vec<(&str, LearningType)> = learnings
            .iter()
            .map(|l| (l.title.as_str(), l.learning_type))
            .collect();
        assert_eq!(
            got,
            vec![
                ("Always validate input", LearningType::BestPractice),
                ("The cache is not shared", LearningType::Gotcha),
                ("Use prepared statements", LearningType::BestPractice),
                ("Fixed the flaky retry bug", LearningType::Gotcha),
                ("Added index for faster lookups", LearningType::Optimization),
            ]
        );
        assert_eq!(learnings[4].example_context.as_deref(), Some("backend"));
    }

    #[test]
    fn test_long_titles_are_cut() {
        let text = format!("LESSON: {}", "é".repeat(200));
        let learnings = LearningHarvester::new(5).harvest("a", &text, None);
        assert_eq!(learnings[0].title.chars().count(), TITLE_MAX_CHARS);
        assert_eq!(learnings[0].description.chars().count(), 200);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = InMemoryKnowledgeStore::new();
        store.set_fail_writes(true);
        let written = LearningHarvester::new(5)
            .harvest_into(&store, "roy", "TIP: something useful", None)
            .await;
        assert_eq!(written, 0);

        store.set_fail_writes(false);
        let written = LearningHarvester::new(5)
            .harvest_into(&store, "roy", "TIP: something useful", None)
            .await;
        assert_eq!(written, 1);
        assert_eq!(store.all_learnings().await.len(), 1);
    }
}
