//! Core types for the alert system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{check_minutes, MAX_DURATION_MINS};
use crate::dedup::{extract_workflow_family, DedupKey};
use crate::error::WatchdogError;
use crate::event::Event;
use crate::history::History;
use crate::stage::StageDeviation;

/// Condition class an alert belongs to. Each kind has its own dedup key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    SilentFailure,
    StaleProgress,
    RepeatedApproval,
    PostApprovalRegression,
    ResourceFailure,
    StepTimeout,
    StuckResource,
    StageStuck,
    InvalidTransition,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SilentFailure => "silent-failure",
            Self::StaleProgress => "stale-progress",
            Self::RepeatedApproval => "repeated-approval",
            Self::PostApprovalRegression => "post-approval-regression",
            Self::ResourceFailure => "resource-failure",
            Self::StepTimeout => "step-timeout",
            Self::StuckResource => "stuck-resource",
            Self::StageStuck => "stage-stuck",
            Self::InvalidTransition => "invalid-transition",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SilentFailure => "Silent Failure",
            Self::StaleProgress => "Stale Progress",
            Self::RepeatedApproval => "Repeated Approval Loop",
            Self::PostApprovalRegression => "Post-Approval Regression",
            Self::ResourceFailure => "Resource Failure",
            Self::StepTimeout => "Step Timeout",
            Self::StuckResource => "Stuck Resource",
            Self::StageStuck => "Stage Stuck",
            Self::InvalidTransition => "Invalid Stage Transition",
        }
    }

    /// Whether a new alert of this kind leads to a spawned remediation.
    /// Invalid transitions are escalated for review only.
    pub fn spawns_remediation(self) -> bool {
        !matches!(self, Self::InvalidTransition)
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A detected condition. A new detection produces a new value; alerts are
/// never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    /// Pod, task resource, workflow or task the alert is about
    pub subject: String,
    /// Grouping key derived from `subject`
    pub workflow_family: String,
    pub task_id: Option<String>,
    pub message: String,
    pub context: HashMap<String, String>,
    pub detected_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        subject: impl Into<String>,
        message: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let subject = subject.into();
        Self {
            kind,
            severity: Severity::Warning,
            workflow_family: extract_workflow_family(&subject),
            subject,
            task_id: None,
            message: message.into(),
            context: HashMap::new(),
            detected_at,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_task_id(mut self, task_id: Option<&str>) -> Self {
        self.task_id = task_id.filter(|t| !t.is_empty()).map(String::from);
        self
    }

    /// Identity used for suppression.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.workflow_family.clone(), self.kind)
    }
}

/// Configuration for alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minutes without a commit before stale progress fires
    pub stale_progress_threshold_mins: u64,
    /// Approvals in a row by one actor tolerated before the loop alert
    pub approval_loop_threshold: u32,
    /// Minutes a task resource may stay non-terminal
    pub stuck_resource_threshold_mins: u64,
    /// Restarts at which a failed pod is reported as crash looping
    pub crash_loop_restarts: i32,
    /// Step timeout thresholds by agent role
    pub step_timeouts: StepTimeouts,
    pub silent_failure: SilentFailureConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            stale_progress_threshold_mins: 15,
            approval_loop_threshold: 2,
            stuck_resource_threshold_mins: 10,
            crash_loop_restarts: 3,
            step_timeouts: StepTimeouts::default(),
            silent_failure: SilentFailureConfig::default(),
        }
    }
}

impl AlertConfig {
    /// Reject thresholds that cannot be represented as durations.
    pub fn validate(&self) -> crate::error::Result<()> {
        check_minutes(
            "alerts.stale_progress_threshold_mins",
            self.stale_progress_threshold_mins,
        )?;
        check_minutes(
            "alerts.stuck_resource_threshold_mins",
            self.stuck_resource_threshold_mins,
        )?;
        let steps = &self.step_timeouts;
        for (field, mins) in [
            ("implementation_mins", steps.implementation_mins),
            ("quality_mins", steps.quality_mins),
            ("testing_mins", steps.testing_mins),
            ("security_mins", steps.security_mins),
            ("integration_mins", steps.integration_mins),
            ("default_mins", steps.default_mins),
        ] {
            check_minutes(&format!("alerts.step_timeouts.{field}"), mins)?;
        }

        let max_secs = (MAX_DURATION_MINS * 60) as i64;
        for (field, secs) in [
            ("terminated_grace_secs", self.silent_failure.terminated_grace_secs),
            ("startup_grace_secs", self.silent_failure.startup_grace_secs),
        ] {
            if !(0..=max_secs).contains(&secs) {
                return Err(WatchdogError::Config(format!(
                    "alerts.silent_failure.{field} must be between 0 and {max_secs}"
                )));
            }
        }
        Ok(())
    }
}

/// Timeout thresholds for each agent role (values in minutes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    pub implementation_mins: u64, // Rex/Blaze
    pub quality_mins: u64,        // Cleo
    pub testing_mins: u64,        // Tess
    pub security_mins: u64,       // Cipher
    pub integration_mins: u64,    // Atlas
    pub default_mins: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            implementation_mins: 45,
            quality_mins: 15,
            testing_mins: 30,
            security_mins: 15,
            integration_mins: 20,
            default_mins: 60,
        }
    }
}

impl StepTimeouts {
    /// Threshold for the role an agent name maps to.
    pub fn for_agent(&self, agent: &str) -> u64 {
        let agent = agent.to_lowercase();
        match agent.as_str() {
            a if a.contains("rex") || a.contains("blaze") => self.implementation_mins,
            a if a.contains("cleo") => self.quality_mins,
            a if a.contains("tess") => self.testing_mins,
            a if a.contains("cipher") => self.security_mins,
            a if a.contains("atlas") => self.integration_mins,
            _ => self.default_mins,
        }
    }
}

/// Thresholds for the silent failure signal chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilentFailureConfig {
    /// Restart count at or above which a container is considered unstable
    pub restart_threshold: i32,
    /// Seconds a container may sit terminated before the duration signal fires
    pub terminated_grace_secs: i64,
    /// Readiness is not judged during the first seconds after start
    pub startup_grace_secs: i64,
}

impl Default for SilentFailureConfig {
    fn default() -> Self {
        Self {
            restart_threshold: 3,
            terminated_grace_secs: 60,
            startup_grace_secs: 30,
        }
    }
}

/// Read-only inputs available to alert handlers
pub struct EvalContext<'a> {
    /// Evaluation clock
    pub now: DateTime<Utc>,
    pub history: &'a History,
    pub config: &'a AlertConfig,
    /// Stage deviations classified for this event
    pub stage_findings: &'a [StageDeviation],
}

/// Trait for alert handlers.
///
/// Handlers are pure functions of the event and the read-only context: no I/O,
/// no shared mutation. A handler returns at most one alert per event.
pub trait AlertHandler: Send + Sync {
    /// Human-readable handler name used in logs
    fn name(&self) -> &'static str;

    /// Evaluate an event and return an alert if the condition is met
    fn evaluate(&self, event: &Event, ctx: &EvalContext<'_>) -> anyhow::Result<Option<Alert>>;
}
