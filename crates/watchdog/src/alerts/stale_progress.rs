//! Stale Progress
//!
//! Detects when no new commit has reached the task's branch for longer than
//! the threshold while an agent pod for that task is running.

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::config::bounded_minutes;
use crate::event::Event;

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
        AlertKind::StaleProgress.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::PodStateChanged(pod) = event else {
            return Ok(None);
        };
        if pod.phase != "Running" {
            return Ok(None);
        }

        let Some(task_id) = event.task_id() else {
            return Ok(None);
        };
        let Some(status) = ctx.history.external_status(task_id) else {
            return Ok(None);
        };
        let Some(last_commit) = status.last_commit_at() else {
            return Ok(None);
        };

        let elapsed = ctx.now - last_commit;
        let threshold = bounded_minutes(ctx.config.stale_progress_threshold_mins);
        if elapsed <= threshold {
            return Ok(None);
        }

        Ok(Some(
            Alert::new(
                AlertKind::StaleProgress,
                &pod.subject.name,
                format!(
                    "No commits for {} minutes while {} is running",
                    elapsed.num_minutes(),
                    pod.agent()
                ),
                ctx.now,
            )
            .with_severity(Severity::Warning)
            .with_task_id(Some(task_id))
            .with_context("pod_name", pod.subject.name.clone())
            .with_context("last_commit_at", last_commit.to_rfc3339())
            .with_context("elapsed_minutes", elapsed.num_minutes().to_string())
            .with_context(
                "threshold_minutes",
                ctx.config.stale_progress_threshold_mins.to_string(),
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertConfig;
    use crate::event::{Commit, ExternalStatus, PodEvent, SubjectRef, TASK_ID_LABEL};
    use crate::history::History;
    use chrono::{DateTime, Duration, Utc};

    fn history_with_commit(at: DateTime<Utc>) -> History {
        let mut history = History::new();
        history.record(&Event::ExternalStatusUpdated(ExternalStatus {
            task_id: Some("4".into()),
            commits: vec![Commit {
                sha: "abc123".into(),
                message: "wip".into(),
                committed_at: at,
            }],
            ..Default::default()
        }));
        history
    }

    fn running_pod() -> Event {
        let mut pod = PodEvent {
            subject: SubjectRef::new("cto", "play-task-4-abc-rex-1"),
            phase: "Running".into(),
            ..Default::default()
        };
        pod.labels.insert(TASK_ID_LABEL.into(), "4".into());
        pod.labels.insert("agent".into(), "rex".into());
        Event::PodStateChanged(pod)
    }

    #[test]
    fn test_fires_after_threshold() {
        let now = Utc::now();
        let history = history_with_commit(now - Duration::minutes(40));
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now,
            history: &history,
            config: &config,
            stage_findings: &[],
        };

        let alert = Handler::new().evaluate(&running_pod(), &ctx).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::StaleProgress);
        assert_eq!(alert.task_id.as_deref(), Some("4"));
        assert_eq!(alert.context.get("elapsed_minutes").unwrap(), "40");
    }

    #[test]
    fn test_recent_commit_is_fine() {
        let now = Utc::now();
        let history = history_with_commit(now - Duration::minutes(5));
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now,
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        assert!(Handler::new().evaluate(&running_pod(), &ctx).unwrap().is_none());
    }

    #[test]
    fn test_unknown_task_is_ignored() {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        assert!(Handler::new().evaluate(&running_pod(), &ctx).unwrap().is_none());
    }
}
