//! Subject naming and wildcard matching.
//!
//! Subjects are dot-separated tokens. `*` matches exactly one token and `>`
//! matches one or more trailing tokens.

use crate::error::{BusError, BusResult};

/// Namespace for control-plane events.
pub const ORCHESTRATION_NAMESPACE: &str = "orchestration.events";

/// Subject carrying `stage.started` events.
pub const STAGE_STARTED_SUBJECT: &str = "orchestration.events.stage.started";

/// Subject carrying `stage.failed` events.
pub const STAGE_FAILED_SUBJECT: &str = "orchestration.events.stage.failed";

/// Root token of every deliverable subject.
pub const DELIVERABLES_PREFIX: &str = "deliverables";

/// Check that a value can be used as a single subject token.
///
/// # Errors
///
/// Returns `InvalidSubjectToken` for empty tokens or tokens containing
/// `.`, `*`, `>` or whitespace.
pub fn validate_token(token: &str) -> BusResult<&str> {
    if token.is_empty() {
        return Err(BusError::invalid_subject_token(token, "token is empty"));
    }
    match token
        .chars()
        .find(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace())
    {
        Some(c) => Err(BusError::invalid_subject_token(
            token,
            format!("reserved character {c:?}"),
        )),
        None => Ok(token),
    }
}

/// `deliverables.<agent>.<task_type>.<request_id>`
///
/// # Errors
///
/// Returns `InvalidSubjectToken` if any part is not a valid token.
pub fn deliverable_subject(agent_id: &str, task_type: &str, request_id: &str) -> BusResult<String> {
    Ok(format!(
        "{DELIVERABLES_PREFIX}.{}.{}.{}",
        validate_token(agent_id)?,
        validate_token(task_type)?,
        validate_token(request_id)?
    ))
}

/// Normalize a stage name into a task-type token: `"Research"` → `"research"`.
#[must_use]
pub fn task_type_for_stage(stage_name: &str) -> String {
    stage_name
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .replace(['.', '*', '>'], "-")
}

/// NATS-style wildcard match of `subject` against `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliverable_subject() {
        let subject = deliverable_subject("cynthia", "research", "REQ-1");
        assert_eq!(subject.ok().as_deref(), Some("deliverables.cynthia.research.REQ-1"));
    }

    #[test]
    fn test_reserved_characters_rejected() {
        assert!(deliverable_subject("cyn.thia", "research", "REQ-1").is_err());
        assert!(deliverable_subject("cynthia", "re search", "REQ-1").is_err());
        assert!(deliverable_subject("cynthia", "research", "REQ-*").is_err());
        assert!(deliverable_subject("cynthia", "", "REQ-1").is_err());
    }

    #[test]
    fn test_task_type_for_stage() {
        assert_eq!(task_type_for_stage("Research"), "research");
        assert_eq!(task_type_for_stage("  Frontend  Review "), "frontend-review");
        assert_eq!(task_type_for_stage("v1.2"), "v1-2");
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(subject_matches("deliverables.cynthia.>", "deliverables.cynthia.research.REQ-1"));
        assert!(!subject_matches("deliverables.cynthia.>", "deliverables.cynthia"));
        assert!(!subject_matches("deliverables.cynthia.>", "deliverables.roy.backend.REQ-1"));
        assert!(subject_matches("orchestration.events.*.started", "orchestration.events.stage.started"));
        assert!(subject_matches(STAGE_STARTED_SUBJECT, STAGE_STARTED_SUBJECT));
        assert!(!subject_matches(STAGE_STARTED_SUBJECT, STAGE_FAILED_SUBJECT));
        assert!(!subject_matches("a.*", "a.b.c"));
    }
}
