//! Silent Failure
//!
//! Detects when a pod's primary container has failed but the pod still reports
//! "Running" (sidecar containers keep it alive).
//!
//! Signals are evaluated as an ordered chain and the first match wins, so one
//! underlying failure yields exactly one alert carrying the strongest evidence:
//! 1. Exit code: container terminated with non-zero exit code
//! 2. Ready status: container ready=false while pod Running
//! 3. Pod conditions: ContainersReady=False (or Ready=False)
//! 4. Restart count: restarts at or above threshold
//! 5. Terminated duration: container dead beyond the grace period

use chrono::{DateTime, Duration, Utc};

use super::types::{Alert, AlertHandler, AlertKind, EvalContext, Severity, SilentFailureConfig};
use crate::event::{ContainerState, Event, PodEvent};

/// Signal attribution, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ExitCode,
    ReadyStatus,
    PodCondition,
    RestartCount,
    TerminatedDuration,
}

impl Signal {
    pub fn priority(self) -> u8 {
        match self {
            Self::ExitCode => 1,
            Self::ReadyStatus => 2,
            Self::PodCondition => 3,
            Self::RestartCount => 4,
            Self::TerminatedDuration => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExitCode => "exit_code",
            Self::ReadyStatus => "ready_status",
            Self::PodCondition => "pod_condition",
            Self::RestartCount => "restart_count",
            Self::TerminatedDuration => "terminated_duration",
        }
    }
}

#[derive(Debug)]
struct Detection {
    signal: Signal,
    container: String,
    message: String,
    exit_code: Option<i32>,
    reason: Option<String>,
}

type SignalRule = fn(&PodEvent, &SilentFailureConfig, DateTime<Utc>) -> Option<Detection>;

/// Ordered rule list. Earlier entries win.
const SIGNAL_CHAIN: &[(Signal, SignalRule)] = &[
    (Signal::ExitCode, detect_by_exit_code),
    (Signal::ReadyStatus, detect_by_ready_status),
    (Signal::PodCondition, detect_by_pod_conditions),
    (Signal::RestartCount, detect_by_restart_count),
    (Signal::TerminatedDuration, detect_by_terminated_duration),
];

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
        AlertKind::SilentFailure.name()
    }

    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>> {
        let Event::PodStateChanged(pod) = event else {
            return Ok(None);
        };

        // Only pods that still claim to be healthy
        if pod.phase != "Running" {
            return Ok(None);
        }

        let Some(detection) = detect_silent_failure(pod, &ctx.config.silent_failure, ctx.now)
        else {
            return Ok(None);
        };

        let mut alert = Alert::new(
            AlertKind::SilentFailure,
            &pod.subject.name,
            detection.message,
            ctx.now,
        )
        .with_severity(Severity::Critical)
        .with_task_id(event.task_id())
        .with_context("pod_name", pod.subject.name.clone())
        .with_context("container_name", detection.container)
        .with_context("detection_method", detection.signal.as_str())
        .with_context("signal_priority", detection.signal.priority().to_string())
        .with_context("pod_phase", pod.phase.clone())
        .with_context("agent", pod.agent());

        if let Some(code) = detection.exit_code {
            alert = alert.with_context("exit_code", code.to_string());
        }
        if let Some(reason) = detection.reason {
            alert = alert.with_context("reason", reason);
        }

        Ok(Some(alert))
    }
}

/// Walk the chain and return the first (strongest) detection.
fn detect_silent_failure(
    pod: &PodEvent,
    config: &SilentFailureConfig,
    now: DateTime<Utc>,
) -> Option<Detection> {
    SIGNAL_CHAIN.iter().find_map(|(signal, rule)| {
        rule(pod, config, now).map(|mut d| {
            d.signal = *signal;
            d
        })
    })
}

/// Signal 1: Container terminated with non-zero exit code
fn detect_by_exit_code(
    pod: &PodEvent,
    _config: &SilentFailureConfig,
    _now: DateTime<Utc>,
) -> Option<Detection> {
    pod.container_statuses.iter().find_map(|container| {
        let ContainerState::Terminated {
            exit_code, reason, ..
        } = &container.state
        else {
            return None;
        };
        (*exit_code != 0).then(|| Detection {
            signal: Signal::ExitCode,
            container: container.name.clone(),
            message: format!(
                "Container '{}' terminated with exit code {} but pod still Running",
                container.name, exit_code
            ),
            exit_code: Some(*exit_code),
            reason: reason.clone(),
        })
    })
}

/// Signal 2: Container not ready while pod is Running
fn detect_by_ready_status(
    pod: &PodEvent,
    config: &SilentFailureConfig,
    now: DateTime<Utc>,
) -> Option<Detection> {
    for container in pod.container_statuses.iter().filter(|c| !c.ready) {
        match &container.state {
            // Still starting up
            ContainerState::Waiting { .. } => continue,
            ContainerState::Running {
                started_at: Some(start),
            } if now.signed_duration_since(*start)
                < Duration::seconds(config.startup_grace_secs) =>
            {
                continue;
            }
            // Clean exit is left to the terminated-duration signal
            ContainerState::Terminated { exit_code: 0, .. } => continue,
            _ => {}
        }

        return Some(Detection {
            signal: Signal::ReadyStatus,
            container: container.name.clone(),
            message: format!("Container '{}' not ready while pod Running", container.name),
            exit_code: None,
            reason: None,
        });
    }
    None
}

/// Signal 3: Pod condition ContainersReady=False, falling back to Ready=False
fn detect_by_pod_conditions(
    pod: &PodEvent,
    config: &SilentFailureConfig,
    now: DateTime<Utc>,
) -> Option<Detection> {
    if let Some(started_at) = pod.started_at {
        if now.signed_duration_since(started_at) < Duration::seconds(config.startup_grace_secs) {
            return None;
        }
    }

    let find = |kind: &str| {
        pod.conditions
            .iter()
            .find(|c| c.condition_type == kind && c.status == "False")
    };

    if let Some(condition) = find("ContainersReady") {
        // "containers with unready status: [factory-claude]"
        let container = condition
            .message
            .as_deref()
            .and_then(|m| m.strip_prefix("containers with unready status: ["))
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or("unknown");

        return Some(Detection {
            signal: Signal::PodCondition,
            container: container.to_string(),
            message: format!(
                "Pod condition ContainersReady=False: {}",
                condition.reason.as_deref().unwrap_or("unknown")
            ),
            exit_code: None,
            reason: condition.reason.clone(),
        });
    }

    find("Ready").map(|condition| Detection {
        signal: Signal::PodCondition,
        container: "unknown".into(),
        message: format!(
            "Pod condition Ready=False: {}",
            condition.reason.as_deref().unwrap_or("unknown")
        ),
        exit_code: None,
        reason: condition.reason.clone(),
    })
}

/// Signal 4: High restart count
fn detect_by_restart_count(
    pod: &PodEvent,
    config: &SilentFailureConfig,
    _now: DateTime<Utc>,
) -> Option<Detection> {
    pod.container_statuses
        .iter()
        .find(|c| c.restart_count >= config.restart_threshold)
        .map(|container| Detection {
            signal: Signal::RestartCount,
            container: container.name.clone(),
            message: format!(
                "Container '{}' has restarted {} times (threshold: {})",
                container.name, container.restart_count, config.restart_threshold
            ),
            exit_code: None,
            reason: None,
        })
}

/// Signal 5: Container terminated for longer than the grace period
fn detect_by_terminated_duration(
    pod: &PodEvent,
    config: &SilentFailureConfig,
    now: DateTime<Utc>,
) -> Option<Detection> {
    pod.container_statuses.iter().find_map(|container| {
        let ContainerState::Terminated {
            finished_at: Some(finished),
            exit_code,
            reason,
        } = &container.state
        else {
            return None;
        };
        let dead_for = now.signed_duration_since(*finished);
        (dead_for > Duration::seconds(config.terminated_grace_secs)).then(|| Detection {
            signal: Signal::TerminatedDuration,
            container: container.name.clone(),
            message: format!(
                "Container '{}' has been terminated for {}s (threshold: {}s)",
                container.name,
                dead_for.num_seconds(),
                config.terminated_grace_secs
            ),
            exit_code: Some(*exit_code),
            reason: reason.clone(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertConfig;
    use crate::event::{ContainerStatus, PodCondition, SubjectRef};
    use crate::history::History;

    fn pod(name: &str, containers: Vec<ContainerStatus>) -> PodEvent {
        PodEvent {
            subject: SubjectRef::new("cto", name),
            observed_at: Utc::now(),
            phase: "Running".into(),
            container_statuses: containers,
            ..Default::default()
        }
    }

    fn evaluate(pod: PodEvent) -> Option<Alert> {
        let history = History::new();
        let config = AlertConfig::default();
        let ctx = EvalContext {
            now: Utc::now(),
            history: &history,
            config: &config,
            stage_findings: &[],
        };
        Handler::new()
            .evaluate(&Event::PodStateChanged(pod), &ctx)
            .unwrap()
    }

    fn method(alert: &Alert) -> &str {
        alert.context.get("detection_method").unwrap()
    }

    #[test]
    fn test_detects_silent_failure_by_exit_code() {
        let alert = evaluate(pod(
            "rex-pod-123",
            vec![
                ContainerStatus {
                    name: "factory-claude".into(),
                    ready: false,
                    state: ContainerState::Terminated {
                        exit_code: 1,
                        reason: Some("Error".into()),
                        finished_at: None,
                    },
                    restart_count: 0,
                },
                ContainerStatus {
                    name: "docker-daemon".into(),
                    ready: true,
                    state: ContainerState::Running { started_at: None },
                    restart_count: 0,
                },
            ],
        ))
        .unwrap();

        assert_eq!(alert.kind, AlertKind::SilentFailure);
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.message.contains("factory-claude"));
        assert!(alert.message.contains("exit code 1"));
        assert_eq!(method(&alert), "exit_code");
    }

    #[test]
    fn test_exit_code_wins_over_restart_count() {
        let alert = evaluate(pod(
            "crashing",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Terminated {
                    exit_code: 137,
                    reason: Some("OOMKilled".into()),
                    finished_at: Some(Utc::now() - Duration::minutes(5)),
                },
                restart_count: 7,
            }],
        ))
        .unwrap();

        assert_eq!(method(&alert), "exit_code");
        assert_eq!(alert.context.get("exit_code").unwrap(), "137");
        assert_eq!(alert.context.get("reason").unwrap(), "OOMKilled");
    }

    #[test]
    fn test_readiness_fires_before_restart_count() {
        // ready=false, Running, no restarts, no exit code
        let alert = evaluate(pod(
            "play-task-4-abc-step-123",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Running { started_at: None },
                restart_count: 0,
            }],
        ))
        .unwrap();

        assert_eq!(method(&alert), "ready_status");
        assert_eq!(alert.workflow_family, "play-task-4");
    }

    #[test]
    fn test_detects_by_pod_condition() {
        let mut p = pod("rex-pod-123", vec![]);
        p.started_at = Some(Utc::now() - Duration::minutes(2));
        p.conditions = vec![PodCondition {
            condition_type: "ContainersReady".into(),
            status: "False".into(),
            reason: Some("ContainersNotReady".into()),
            message: Some("containers with unready status: [factory-claude]".into()),
        }];

        let alert = evaluate(p).unwrap();
        assert_eq!(method(&alert), "pod_condition");
        assert_eq!(alert.context.get("container_name").unwrap(), "factory-claude");
    }

    #[test]
    fn test_detects_by_restart_count() {
        let mut p = pod(
            "crashloop-pod",
            vec![ContainerStatus {
                name: "unstable".into(),
                ready: true,
                state: ContainerState::Running { started_at: None },
                restart_count: 3,
            }],
        );
        p.conditions = vec![PodCondition {
            condition_type: "Ready".into(),
            status: "True".into(),
            ..Default::default()
        }];

        let alert = evaluate(p).unwrap();
        assert_eq!(method(&alert), "restart_count");
    }

    #[test]
    fn test_clean_exit_reported_only_after_grace() {
        let fresh = pod(
            "agent",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Terminated {
                    exit_code: 0,
                    reason: Some("Completed".into()),
                    finished_at: Some(Utc::now() - Duration::seconds(10)),
                },
                restart_count: 0,
            }],
        );
        assert!(evaluate(fresh).is_none());

        let stale = pod(
            "agent",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Terminated {
                    exit_code: 0,
                    reason: Some("Completed".into()),
                    finished_at: Some(Utc::now() - Duration::minutes(3)),
                },
                restart_count: 0,
            }],
        );
        let alert = evaluate(stale).unwrap();
        assert_eq!(method(&alert), "terminated_duration");
    }

    #[test]
    fn test_healthy_and_starting_pods_ignored() {
        let healthy = pod(
            "healthy",
            vec![ContainerStatus {
                name: "main".into(),
                ready: true,
                state: ContainerState::Running { started_at: None },
                restart_count: 0,
            }],
        );
        assert!(evaluate(healthy).is_none());

        let starting = pod(
            "starting",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Running {
                    started_at: Some(Utc::now() - Duration::seconds(10)),
                },
                restart_count: 0,
            }],
        );
        assert!(evaluate(starting).is_none());

        let waiting = pod(
            "creating",
            vec![ContainerStatus {
                name: "main".into(),
                ready: false,
                state: ContainerState::Waiting {
                    reason: Some("ContainerCreating".into()),
                },
                restart_count: 0,
            }],
        );
        assert!(evaluate(waiting).is_none());
    }

    #[test]
    fn test_non_running_pods_ignored() {
        let mut p = pod(
            "done",
            vec![ContainerStatus {
                name: "main".into(),
                state: ContainerState::Terminated {
                    exit_code: 1,
                    reason: None,
                    finished_at: None,
                },
                ..Default::default()
            }],
        );
        p.phase = "Failed".into();
        assert!(evaluate(p).is_none());
    }

    #[test]
    fn test_chain_is_in_priority_order() {
        let priorities: Vec<u8> = SIGNAL_CHAIN.iter().map(|(s, _)| s.priority()).collect();
        assert_eq!(priorities, vec![1, 2, 3, 4, 5]);
    }
}
