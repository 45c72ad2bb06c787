//! Step Timeout
//!
//! Detects when a workflow step has been running longer than the configured
//! threshold for that agent role.

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
        AlertKind::StepTimeout.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::PodStateChanged(pod) = event else {
            return Ok(None);
        };
        if pod.phase != "Running" {
            return Ok(None);
        }
        let Some(started_at) = pod.started_at else {
            return Ok(None);
        };

        let agent = pod.agent();
        let threshold = bounded_minutes(ctx.config.step_timeouts.for_agent(agent));
        let elapsed = ctx.now - started_at;
        if elapsed <= threshold {
            return Ok(None);
        }

        Ok(Some(
            Alert::new(
                AlertKind::StepTimeout,
                &pod.subject.name,
                format!(
                    "Step {} has been running for {} minutes (threshold: {} min)",
                    pod.subject.name,
                    elapsed.num_minutes(),
                    threshold.num_minutes()
                ),
                ctx.now,
            )
            .with_severity(Severity::Warning)
            .with_task_id(event.task_id())
            .with_context("pod_name", pod.subject.name.clone())
            .with_context("agent", agent)
            .with_context("elapsed_minutes", elapsed.num_minutes().to_string())
            .with_context("threshold_minutes", threshold.num_minutes().to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertConfig;
    use crate::event::{PodEvent, SubjectRef};
    use crate::history::History;
    use chrono::{Duration, Utc};

    fn pod(agent: &str, running_for_mins: i64) -> Event {
        let mut pod = PodEvent {
            subject: SubjectRef::new("cto", "play-task-9-abc-step-2"),
            phase: "Running".into(),
            started_at: Some(Utc::now() - Duration::minutes(running_for_mins)),
            ..Default::default()
        };
        pod.labels.insert("agent".into(), agent.into());
        Event::PodStateChanged(pod)
    }

    fn evaluate(event: &Event) -> Option<Alert> {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        Handler::new().evaluate(event, &ctx).unwrap()
    }

    #[test]
    fn test_threshold_depends_on_agent() {
        // Cleo gets 15 minutes, Rex 45
        let alert = evaluate(&pod("cleo", 20)).unwrap();
        assert_eq!(alert.kind, AlertKind::StepTimeout);
        assert_eq!(alert.context.get("threshold_minutes").unwrap(), "15");

        assert!(evaluate(&pod("rex", 20)).is_none());
    }

    #[test]
    fn test_pod_without_start_time_ignored() {
        let event = Event::PodStateChanged(PodEvent {
            phase: "Running".into(),
            ..Default::default()
        });
        assert!(evaluate(&event).is_none());
    }
}
