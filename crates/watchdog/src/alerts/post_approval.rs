//! Post-Approval Regression
//!
//! Detects a CI failure or merge conflict observed after the change was
//! approved. Failures before approval are expected and ignored.

use chrono::{DateTime, Utc};

use super::approval_loop::is_approval_comment;
use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::event::{CheckConclusion, Event, ExternalStatus, ReviewState};

pub struct Handler;

impl Handler {
    pub fn new() -> Self {
        Self
    }

    /// Earliest approval, by review or by approval comment.
    fn approved_at(status: &ExternalStatus) -> Option<DateTime<Utc>> {
        let by_review = status
            .reviews
            .iter()
            .filter(|r| r.state == ReviewState::Approved)
            .filter_map(|r| r.submitted_at);
        let by_comment = status
            .comments
            .iter()
            .filter(|c| is_approval_comment(&c.body))
            .map(|c| c.created_at);
        by_review.chain(by_comment).min()
    }

    /// Failed checks that completed after approval (or are still reporting failure
    /// with no completion time).
    fn failing_after(status: &ExternalStatus, approved_at: DateTime<Utc>) -> Vec<String> {
        status
            .checks
            .iter()
            .filter(|c| c.conclusion == CheckConclusion::Failure)
            .filter(|c| c.completed_at.map_or(true, |t| t >= approved_at))
            .map(|c| c.name.clone())
            .collect()
    }

    fn has_merge_conflict(status: &ExternalStatus) -> bool {
        status.mergeable == Some(false)
            || status
                .merge_state_status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("DIRTY"))
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertHandler for Handler {
    fn name(&self) -> &'static str {
        AlertKind::PostApprovalRegression.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::ExternalStatusUpdated(status) = event else {
            return Ok(None);
        };

        let Some(approved_at) = Self::approved_at(status) else {
            return Ok(None);
        };

        let failed_checks = Self::failing_after(status, approved_at);
        let conflict = Self::has_merge_conflict(status);
        if failed_checks.is_empty() && !conflict {
            return Ok(None);
        }

        let message = match (failed_checks.is_empty(), conflict) {
            (false, true) => format!(
                "Approved but {} CI checks are failing and the PR has merge conflicts: {}",
                failed_checks.len(),
                failed_checks.join(", ")
            ),
            (false, false) => format!(
                "Approved but {} CI checks are failing: {}",
                failed_checks.len(),
                failed_checks.join(", ")
            ),
            (true, _) => "Approved but the PR has merge conflicts".to_string(),
        };

        let mut alert = Alert::new(
            AlertKind::PostApprovalRegression,
            &status.subject.name,
            message,
            ctx.now,
        )
        .with_severity(Severity::Critical)
        .with_task_id(event.task_id())
        .with_context("approved_at", approved_at.to_rfc3339())
        .with_context("failed_checks", failed_checks.join(", "))
        .with_context("failed_count", failed_checks.len().to_string())
        .with_context("merge_conflict", conflict.to_string());
        if let Some(pr) = status.pr_number {
            alert = alert.with_context("pr_number", pr.to_string());
        }

        Ok(Some(alert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertConfig;
    use crate::event::{Check, Comment, Review, SubjectRef};
    use crate::history::History;
    use chrono::Duration;

    fn evaluate(status: ExternalStatus) -> Option<Alert> {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        Handler::new()
            .evaluate(&Event::ExternalStatusUpdated(status), &ctx)
            .unwrap()
    }

    fn failed_check(name: &str, at: DateTime<Utc>) -> Check {
        Check {
            name: name.into(),
            conclusion: CheckConclusion::Failure,
            completed_at: Some(at),
        }
    }

    #[test]
    fn test_failure_after_approval_fires() {
        let t = Utc::now() - Duration::hours(1);
        let status = ExternalStatus {
            subject: SubjectRef::new("cto", "play-task-6"),
            task_id: Some("6".into()),
            pr_number: Some(42),
            reviews: vec![Review {
                author: "5DLabs-Tess".into(),
                state: ReviewState::Approved,
                submitted_at: Some(t),
            }],
            checks: vec![failed_check("clippy", t + Duration::minutes(3))],
            ..Default::default()
        };

        let alert = evaluate(status).unwrap();
        assert_eq!(alert.kind, AlertKind::PostApprovalRegression);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.context.get("failed_checks").unwrap(), "clippy");
        assert_eq!(alert.context.get("pr_number").unwrap(), "42");
        assert_eq!(alert.task_id.as_deref(), Some("6"));
    }

    #[test]
    fn test_failure_before_approval_ignored() {
        let t = Utc::now() - Duration::hours(1);
        let status = ExternalStatus {
            comments: vec![Comment {
                author: "5DLabs-Tess".into(),
                body: "Approved".into(),
                created_at: t,
            }],
            checks: vec![failed_check("tests", t - Duration::minutes(10))],
            mergeable: Some(true),
            ..Default::default()
        };
        assert!(evaluate(status).is_none());
    }

    #[test]
    fn test_merge_conflict_after_approval() {
        let status = ExternalStatus {
            comments: vec![Comment {
                author: "5DLabs-Tess".into(),
                body: "LGTM".into(),
                created_at: Utc::now(),
            }],
            merge_state_status: Some("DIRTY".into()),
            ..Default::default()
        };
        let alert = evaluate(status).unwrap();
        assert_eq!(alert.context.get("merge_conflict").unwrap(), "true");
    }

    #[test]
    fn test_no_approval_no_alert() {
        let status = ExternalStatus {
            checks: vec![failed_check("tests", Utc::now())],
            mergeable: Some(false),
            ..Default::default()
        };
        assert!(evaluate(status).is_none());
    }
}
