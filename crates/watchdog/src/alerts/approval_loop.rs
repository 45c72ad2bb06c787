//! Repeated Approval Loop
//!
//! Detects when the same actor approves more than N times in a row without the
//! workflow advancing (no other approver, no new commit in between), which
//! indicates an agent stuck re-approving.

use chrono::{DateTime, Utc};

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::event::{Event, ExternalStatus, ReviewState};

/// Keywords that indicate an approval comment
const APPROVAL_KEYWORDS: &[&str] = &[
    "approved",
    "lgtm",
    "looks good",
    "all checks pass",
    "✅",
];

pub fn is_approval_comment(body: &str) -> bool {
    let lower = body.to_lowercase();
    APPROVAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Entry<'a> {
    Commit,
    Approval(&'a str),
}

/// Longest run of consecutive approvals by one author.
fn longest_streak(status: &ExternalStatus) -> Option<(&str, u32)> {
    let mut timeline: Vec<(DateTime<Utc>, Entry<'_>)> = Vec::new();

    timeline.extend(
        status
            .comments
            .iter()
            .filter(|c| is_approval_comment(&c.body))
            .map(|c| (c.created_at, Entry::Approval(c.author.as_str()))),
    );
    timeline.extend(
        status
            .reviews
            .iter()
            .filter(|r| r.state == ReviewState::Approved)
            .filter_map(|r| r.submitted_at.map(|t| (t, Entry::Approval(r.author.as_str())))),
    );
    timeline.extend(status.commits.iter().map(|c| (c.committed_at, Entry::Commit)));
    timeline.sort();

    let mut best: Option<(&str, u32)> = None;
    let mut current: Option<(&str, u32)> = None;

    for (_, entry) in &timeline {
        current = match (entry, current) {
            (Entry::Approval(author), Some((prev, n))) if prev == *author => Some((prev, n + 1)),
            (Entry::Approval(author), _) => Some((*author, 1)),
            (Entry::Commit, _) => None,
        };
        if let Some((author, n)) = current {
            if best.map_or(true, |(_, b)| n > b) {
                best = Some((author, n));
            }
        }
    }

    best
}

pub struct Handler;

impl Handler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertHandler for Handler {
    fn name(&self) -> &'static str {
        AlertKind::RepeatedApproval.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::ExternalStatusUpdated(status) = event else {
            return Ok(None);
        };

        let threshold = ctx.config.approval_loop_threshold;
        let Some((agent, count)) = longest_streak(status).filter(|(_, n)| *n > threshold) else {
            return Ok(None);
        };

        Ok(Some(
            Alert::new(
                AlertKind::RepeatedApproval,
                &status.subject.name,
                format!(
                    "{} has posted {} approvals in a row - possible infinite loop",
                    agent, count
                ),
                ctx.now,
            )
            .with_severity(Severity::Warning)
            .with_task_id(event.task_id())
            .with_context("agent", agent)
            .with_context("approval_count", count.to_string())
            .with_context("threshold", threshold.to_string())
            .with_context("repository", status.repository.clone()),
        ))
    }
}
