//! Alert detection.
//!
//! Each handler detects one condition class from a normalized event and the
//! recent history. Handlers run in a fixed order; a failing or panicking
//! handler is logged and skipped without affecting the others.
//!
//! # Alert Kinds
//! - Silent failure: container died while the pod still reports "Running"
//! - Stale progress: no commits for the threshold duration
//! - Repeated approval: same actor approving in a loop
//! - Post-approval regression: CI failure or merge conflict after approval
//! - Resource failure: pod or task resource in Failed/Error, crash loops
//! - Step timeout: step running longer than its agent's threshold
//! - Stuck resource: task resource not leaving a non-terminal phase
//! - Stage deviation: stage timeout, invalid transition or stuck stage

pub mod approval_loop;
pub mod post_approval;
pub mod resource_failure;
pub mod silent_failure;
pub mod stage_deviation;
pub mod stale_progress;
pub mod step_timeout;
pub mod stuck_resource;
pub mod types;

pub use stage_deviation::deviation_alert;
pub use types::{
    Alert, AlertConfig, AlertHandler, AlertKind, EvalContext, Severity, SilentFailureConfig,
    StepTimeouts,
};

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

use crate::event::Event;

/// Label used to exclude subjects from monitoring
pub const EXCLUDE_LABEL: &str = "healer.platform/exclude";

/// Infrastructure that must never alert on itself (includes the watchdog)
const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    "heal",
    "cto-tools",
    "cto-controller",
    "vault-mcp-server",
    "openmemory",
    "event-cleaner",
    "workspace-pvc-cleaner",
];

/// Subjects skipped before any handler runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Name prefixes
    pub prefixes: Vec<String>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl ExclusionConfig {
    pub fn is_excluded_name(&self, name: &str) -> bool {
        self.prefixes
            .iter()
            .any(|p| !p.is_empty() && name.starts_with(p.as_str()))
    }
}

/// Registry of all alert handlers
pub struct AlertRegistry {
    handlers: Vec<Box<dyn AlertHandler>>,
    exclusions: ExclusionConfig,
}

impl AlertRegistry {
    /// Create a registry with every built-in handler, in evaluation order
    pub fn new(exclusions: ExclusionConfig) -> Self {
        Self::with_handlers(
            exclusions,
            vec![
                Box::new(silent_failure::Handler::new()),
                Box::new(stale_progress::Handler::new()),
                Box::new(approval_loop::Handler::new()),
                Box::new(post_approval::Handler::new()),
                Box::new(resource_failure::Handler::new()),
                Box::new(step_timeout::Handler::new()),
                Box::new(stuck_resource::Handler::new()),
                Box::new(stage_deviation::Handler::new()),
            ],
        )
    }

    pub fn with_handlers(exclusions: ExclusionConfig, handlers: Vec<Box<dyn AlertHandler>>) -> Self {
        Self {
            handlers,
            exclusions,
        }
    }

    /// Append a handler; it runs after the existing ones.
    pub fn register(&mut self, handler: Box<dyn AlertHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn exclusions(&self) -> &ExclusionConfig {
        &self.exclusions
    }

    /// Prefix match on the subject name, or the exclude label set to "true".
    pub fn is_excluded(&self, event: &Event) -> bool {
        if self.exclusions.is_excluded_name(&event.subject().name) {
            return true;
        }
        event
            .labels()
            .and_then(|labels| labels.get(EXCLUDE_LABEL))
            .is_some_and(|v| v == "true")
    }

    /// Evaluate all handlers against an event.
    pub fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> Vec<Alert> {
        if self.is_excluded(event) {
            debug!(subject = %event.subject(), "Skipping excluded subject");
            return vec![];
        }

        let mut alerts = Vec::new();
        for handler in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.evaluate(event, ctx))) {
                Ok(Ok(Some(alert))) => alerts.push(alert),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(
                    handler = handler.name(),
                    subject = %event.subject(),
                    error = %e,
                    "Alert handler failed"
                ),
                Err(panic) => error!(
                    handler = handler.name(),
                    subject = %event.subject(),
                    panic = panic_message(panic.as_ref()),
                    "Alert handler panicked"
                ),
            }
        }
        alerts
    }
}

impl Default for AlertRegistry {
    fn default() -> Self {
        Self::new(ExclusionConfig::default())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        ContainerState, ContainerStatus, ExternalStatus, PodEvent, SubjectRef, TaskResourceEvent,
        WorkflowEvent,
    };
    use crate::history::History;
    use chrono::{Duration, Utc};

    struct Panicking;

    impl AlertHandler for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn evaluate(&self, _: &Event, _: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
            panic!("handler bug");
        }
    }

    struct Failing;

    impl AlertHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn evaluate(&self, _: &Event, _: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
            anyhow::bail!("bad input")
        }
    }

    struct Always;

    impl AlertHandler for Always {
        fn name(&self) -> &'static str {
            "always"
        }
        fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
            Ok(Some(Alert::new(
                AlertKind::ResourceFailure,
                &event.subject().name,
                "always fires",
                ctx.now,
            )))
        }
    }

    fn run(registry: &AlertRegistry, event: &Event) -> Vec<Alert> {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        registry.evaluate(event, &ctx)
    }

    fn pod(name: &str) -> Event {
        Event::PodStateChanged(PodEvent {
            subject: SubjectRef::new("cto", name),
            phase: "Failed".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let registry = AlertRegistry::with_handlers(
            ExclusionConfig::default(),
            vec![Box::new(Panicking), Box::new(Failing), Box::new(Always)],
        );
        let alerts = run(&registry, &pod("play-task-4-abc"));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message, "always fires");
    }

    #[test]
    fn test_excluded_prefix_never_alerts_for_any_variant() {
        let mut registry = AlertRegistry::default();
        registry.register(Box::new(Always));

        let name = "heal-remediation-task1-abc";
        let events = vec![
            pod(name),
            Event::WorkflowPhaseChanged(WorkflowEvent {
                subject: SubjectRef::new("cto", name),
                phase: "Failed".into(),
                ..Default::default()
            }),
            Event::TaskResourcePhaseChanged(TaskResourceEvent {
                subject: SubjectRef::new("cto", name),
                phase: "Failed".into(),
                observed_at: Utc::now() - Duration::hours(1),
                ..Default::default()
            }),
            Event::ExternalStatusUpdated(ExternalStatus {
                subject: SubjectRef::new("cto", name),
                mergeable: Some(false),
                ..Default::default()
            }),
        ];
        for event in &events {
            assert!(run(&registry, event).is_empty());
        }
    }

    #[test]
    fn test_exclude_label() {
        let registry = AlertRegistry::default();
        let mut pod = PodEvent {
            subject: SubjectRef::new("cto", "play-task-4-abc"),
            phase: "Failed".into(),
            ..Default::default()
        };
        pod.labels.insert(EXCLUDE_LABEL.into(), "true".into());
        assert!(run(&registry, &Event::PodStateChanged(pod)).is_empty());
    }

    #[test]
    fn test_builtin_handlers_fire() {
        let registry = AlertRegistry::default();
        let event = Event::PodStateChanged(PodEvent {
            subject: SubjectRef::new("cto", "play-task-4-abc-step-1"),
            phase: "Running".into(),
            started_at: Some(Utc::now() - Duration::minutes(5)),
            container_statuses: vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Terminated {
                    exit_code: 1,
                    reason: Some("Error".into()),
                    finished_at: Some(Utc::now()),
                },
                restart_count: 0,
            }],
            ..Default::default()
        });
        let alerts = run(&registry, &event);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SilentFailure);
        assert_eq!(alerts[0].context.get("detection_method").unwrap(), "exit_code");
    }

    #[test]
    fn test_handler_order() {
        let names = AlertRegistry::default().handler_names();
        assert_eq!(names.first(), Some(&"Silent Failure"));
        assert_eq!(names.last(), Some(&"Stage Deviation"));
    }
}
