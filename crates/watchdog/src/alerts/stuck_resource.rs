//! Stuck Resource
//!
//! Detects a task resource (CodeRun) that has not left a non-terminal phase
//! within the threshold since it was first observed.

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::config::bounded_minutes;
use crate::event::{is_terminal_phase, Event};

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
        AlertKind::StuckResource.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::TaskResourcePhaseChanged(resource) = event else {
            return Ok(None);
        };
        if is_terminal_phase(&resource.phase) {
            return Ok(None);
        }

        let first_seen = ctx
            .history
            .resource_first_seen(&resource.subject)
            .unwrap_or(resource.observed_at);
        let elapsed = ctx.now - first_seen;
        let threshold = bounded_minutes(ctx.config.stuck_resource_threshold_mins);
        if elapsed <= threshold {
            return Ok(None);
        }

        let phase = if resource.phase.is_empty() {
            "Unknown"
        } else {
            resource.phase.as_str()
        };

        Ok(Some(
            Alert::new(
                AlertKind::StuckResource,
                &resource.subject.name,
                format!(
                    "CodeRun {} stuck in {} phase for {} minutes",
                    resource.subject.name,
                    phase,
                    elapsed.num_minutes()
                ),
                ctx.now,
            )
            .with_severity(Severity::Warning)
            .with_task_id(event.task_id())
            .with_context("coderun_name", resource.subject.name.clone())
            .with_context("phase", phase)
            .with_context("agent", resource.agent.clone())
            .with_context("first_seen_at", first_seen.to_rfc3339())
            .with_context("elapsed_minutes", elapsed.num_minutes().to_string()),
        ))
    }
}
