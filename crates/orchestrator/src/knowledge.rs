//! Knowledge retrieval and worker context composition.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, warn};

use conduit_core::{DeliverableCacheRow, Learning, StageEvent};

use crate::persistence::KnowledgeStore;

/// What the store knows that is relevant to one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeSnapshot {
    pub lessons: Vec<Learning>,
    pub prior_decisions: Vec<DeliverableCacheRow>,
}

impl KnowledgeSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty() && self.prior_decisions.is_empty()
    }
}

/// Loads lessons and prior decisions before a worker is spawned.
#[derive(Clone)]
pub struct KnowledgeRetriever {
    store: Arc<dyn KnowledgeStore>,
    lessons_limit: usize,
}

impl KnowledgeRetriever {
    pub fn new(store: Arc<dyn KnowledgeStore>, lessons_limit: usize) -> Self {
        Self {
            store,
            lessons_limit,
        }
    }

    /// Retrieve knowledge for a dispatch. Store failures degrade to empty
    /// sections.
    pub async fn retrieve(&self, agent_id: &str, request_id: &str, stage_ordinal: u32) -> KnowledgeSnapshot {
        let lessons = self
            .store
            .top_learnings(agent_id, self.lessons_limit)
            .await
            .unwrap_or_else(|e| {
                warn!(agent_id = %agent_id, error = %e, "Lesson retrieval failed");
                Vec::new()
            });

        let prior_decisions = self
            .store
            .prior_decisions(request_id, stage_ordinal)
            .await
            .unwrap_or_else(|e| {
                warn!(request_id = %request_id, error = %e, "Prior decision retrieval failed");
                Vec::new()
            });

        debug!(
            agent_id = %agent_id,
            request_id = %request_id,
            lessons = lessons.len(),
            prior_decisions = prior_decisions.len(),
            "Retrieved knowledge"
        );

        KnowledgeSnapshot {
            lessons,
            prior_decisions,
        }
    }
}

const NOTICE_CONTRACT: &str = r#"When you finish, print a completion notice as a fenced JSON block:

```json
{
  "status": "complete | failed | blocked",
  "agent": "<your agent id>",
  "task": "<task type>",
  "nats_channel": "<deliverable subject>",
  "summary": "<one paragraph>",
  "complexity": "low | medium | high",
  "blockers": [],
  "ready_for_next_stage": true,
  "completion_time": "<ISO-8601>",
  "files_modified": [],
  "key_changes": []
}
```
"#;

/// Renders the text written to a worker's stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextComposer;

impl ContextComposer {
    /// Compose the context for one stage event.
    #[must_use]
    pub fn compose(event: &StageEvent, task_type: &str, knowledge: &KnowledgeSnapshot) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# Stage: {}", event.stage_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Request: {}", event.request_id);
        let _ = writeln!(out, "- Agent: {}", event.agent_id);
        let _ = writeln!(
            out,
            "- Deliverable subject: deliverables.{}.{}.{}",
            event.agent_id, task_type, event.request_id
        );
        let _ = writeln!(out);

        if let Some(data) = &event.context_data {
            let rendered = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            let _ = writeln!(out, "## Context\n\n```json\n{rendered}\n```\n");
        }

        if !knowledge.prior_decisions.is_empty() {
            let _ = writeln!(out, "## Prior decisions\n");
            for row in &knowledge.prior_decisions {
                let _ = writeln!(
                    out,
                    "- [{} / {}] {} ({}): {}",
                    row.stage_ordinal, row.stage_name, row.agent_id, row.status, row.summary
                );
            }
            let _ = writeln!(out);
        }

        if !knowledge.lessons.is_empty() {
            let _ = writeln!(out, "## Lessons from earlier runs\n");
            for lesson in &knowledge.lessons {
                let _ = writeln!(
                    out,
                    "- ({}) {}: {}",
                    lesson.learning_type, lesson.title, lesson.description
                );
            }
            let _ = writeln!(out);
        }

        out.push_str(NOTICE_CONTRACT);
        out
    }
}
