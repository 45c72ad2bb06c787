//! Resource Failure
//!
//! Detects when a pod or task resource enters a Failed/Error phase, or a pod is
//! crash looping.

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity};
use crate::event::{ContainerState, Event};

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

fn is_failed_phase(phase: &str) -> bool {
    matches!(phase, "Failed" | "Error")
}

impl AlertHandler for Handler {
    fn name(&self) -> &'static str {
        AlertKind::ResourceFailure.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        match event {
            Event::PodStateChanged(pod) => {
                let crash_looping = pod.container_statuses.iter().any(|c| {
                    matches!(&c.state, ContainerState::Waiting { reason: Some(r) } if r == "CrashLoopBackOff")
                });
                if !is_failed_phase(&pod.phase) && !crash_looping {
                    return Ok(None);
                }

                let restarts = pod.total_restarts();
                let is_crash_loop = crash_looping || restarts > ctx.config.crash_loop_restarts;
                let (severity, message) = if is_crash_loop {
                    (
                        Severity::Critical,
                        format!(
                            "Pod {} in CrashLoopBackOff ({} restarts)",
                            pod.subject.name, restarts
                        ),
                    )
                } else {
                    (
                        Severity::Warning,
                        format!("Pod {} failed with phase: {}", pod.subject.name, pod.phase),
                    )
                };

                Ok(Some(
                    Alert::new(AlertKind::ResourceFailure, &pod.subject.name, message, ctx.now)
                        .with_severity(severity)
                        .with_task_id(event.task_id())
                        .with_context("pod_name", pod.subject.name.clone())
                        .with_context("phase", pod.phase.clone())
                        .with_context("restart_count", restarts.to_string())
                        .with_context("agent", pod.agent()),
                ))
            }
            Event::TaskResourcePhaseChanged(resource) if is_failed_phase(&resource.phase) => {
                let mut alert = Alert::new(
                    AlertKind::ResourceFailure,
                    &resource.subject.name,
                    format!(
                        "CodeRun {} failed: {}",
                        resource.subject.name,
                        resource.message.as_deref().unwrap_or("no message")
                    ),
                    ctx.now,
                )
                .with_severity(Severity::Warning)
                .with_task_id(event.task_id())
                .with_context("coderun_name", resource.subject.name.clone())
                .with_context("phase", resource.phase.clone())
                .with_context("agent", resource.agent.clone());
                if let Some(msg) = &resource.message {
                    alert = alert.with_context("message", msg.clone());
                }
                Ok(Some(alert))
            }
            Event::WorkflowPhaseChanged(workflow) if is_failed_phase(&workflow.phase) => Ok(Some(
                Alert::new(
                    AlertKind::ResourceFailure,
                    &workflow.subject.name,
                    format!(
                        "Workflow {} failed: {}",
                        workflow.subject.name,
                        workflow.message.as_deref().unwrap_or("no message")
                    ),
                    ctx.now,
                )
                .with_severity(Severity::Warning)
                .with_task_id(event.task_id())
                .with_context("workflow_name", workflow.subject.name.clone())
                .with_context("phase", workflow.phase.clone()),
            )),
            _ => Ok(None),
        }
    }
}
