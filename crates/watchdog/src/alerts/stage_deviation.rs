//! Stage Deviation
//!
//! Folds stage tracker findings into the alert pipeline. The tracker does the
//! classifying; this handler picks the strongest finding for the event's task.

use chrono::{DateTime, Utc};

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::event::Event;
use crate::stage::StageDeviation;

/// Convert a tracker finding into an alert.
///
/// Also used for findings produced by the periodic tick, which have no
/// triggering event.
pub fn deviation_alert(deviation: &StageDeviation, now: DateTime<Utc>) -> Alert {
    let alert = match deviation {
        StageDeviation::StageTimeout {
            task_id,
            stage,
            elapsed,
            budget,
            ..
        } => Alert::new(
            AlertKind::StepTimeout,
            deviation.subject(),
            format!(
                "Task {} has been in stage {} for {} minutes (budget: {} min)",
                task_id,
                stage,
                elapsed.num_minutes(),
                budget.num_minutes()
            ),
            now,
        )
        .with_severity(Severity::Warning)
        .with_context("stage", stage.clone())
        .with_context("elapsed_minutes", elapsed.num_minutes().to_string())
        .with_context("threshold_minutes", budget.num_minutes().to_string()),

        StageDeviation::InvalidTransition {
            task_id,
            from,
            to,
            expected,
            ..
        } => {
            let expected = expected.as_deref().unwrap_or("none");
            Alert::new(
                AlertKind::InvalidTransition,
                deviation.subject(),
                format!("Task {task_id} moved from {from} to {to} (expected {expected})"),
                now,
            )
            .with_severity(Severity::Info)
            .with_context("from_stage", from.clone())
            .with_context("to_stage", to.clone())
            .with_context("expected_stage", expected)
        }

        StageDeviation::StageStuck {
            task_id,
            stage,
            idle,
            budget,
            ..
        } => Alert::new(
            AlertKind::StageStuck,
            deviation.subject(),
            format!(
                "Task {} stuck in stage {}: no transition or activity for {} minutes",
                task_id,
                stage,
                idle.num_minutes()
            ),
            now,
        )
        .with_severity(Severity::Critical)
        .with_context("stage", stage.clone())
        .with_context("idle_minutes", idle.num_minutes().to_string())
        .with_context("threshold_minutes", budget.num_minutes().to_string()),
    };

    let alert = alert
        .with_task_id(Some(deviation.task_id()))
        .with_context("task_id", deviation.task_id());
    match deviation.agent() {
        Some(agent) => alert.with_context("agent", agent),
        None => alert,
    }
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
        "Stage Deviation"
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Some(task_id) = event.task_id() else {
            return Ok(None);
        };

        let strongest = ctx
            .stage_findings
            .iter()
            .filter(|d| d.task_id() == task_id)
            .min_by_key(|d| d.priority());

        Ok(strongest.map(|d| deviation_alert(d, ctx.now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertConfig;
    use crate::event::{SubjectRef, WorkflowEvent, TASK_ID_LABEL};
    use crate::history::History;
    use chrono::Duration;

    fn workflow_event(task: &str) -> Event {
        let mut wf = WorkflowEvent {
            subject: SubjectRef::new("cto", format!("play-task-{task}-abc")),
            ..Default::default()
        };
        wf.labels.insert(TASK_ID_LABEL.into(), task.into());
        Event::WorkflowPhaseChanged(wf)
    }

    fn timeout(task: &str) -> StageDeviation {
        StageDeviation::StageTimeout {
            task_id: task.into(),
            subject: format!("play-task-{task}-abc"),
            stage: "quality".into(),
            agent: Some("Cleo".into()),
            elapsed: Duration::minutes(42),
            budget: Duration::minutes(30),
        }
    }

    fn invalid(task: &str) -> StageDeviation {
        StageDeviation::InvalidTransition {
            task_id: task.into(),
            subject: format!("play-task-{task}-abc"),
            from: "implementation".into(),
            to: "testing".into(),
            expected: Some("quality".into()),
        }
    }

    fn evaluate(event: &Event, findings: &[StageDeviation]) -> Option<Alert> {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: findings,
        };
        Handler::new().evaluate(event, &ctx).unwrap()
    }

    #[test]
    fn test_strongest_finding_for_task_wins() {
        let findings = vec![timeout("4"), invalid("4"), invalid("5")];
        let alert = evaluate(&workflow_event("4"), &findings).unwrap();
        assert_eq!(alert.kind, AlertKind::InvalidTransition);
        assert_eq!(alert.workflow_family, "play-task-4");
        assert_eq!(alert.task_id.as_deref(), Some("4"));
        assert_eq!(alert.context.get("expected_stage").unwrap(), "quality");
    }

    #[test]
    fn test_timeout_maps_to_step_timeout_kind() {
        let alert = deviation_alert(&timeout("4"), Utc::now());
        assert_eq!(alert.kind, AlertKind::StepTimeout);
        assert_eq!(alert.context.get("elapsed_minutes").unwrap(), "42");
        assert_eq!(alert.context.get("agent").unwrap(), "Cleo");
    }

    #[test]
    fn test_other_task_findings_ignored() {
        assert!(evaluate(&workflow_event("9"), &[timeout("4")]).is_none());
    }
}
