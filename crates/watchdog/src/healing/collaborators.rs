//! Interfaces to the outside world used by the healing loop.
//!
//! Only the loop controller calls these; alert handlers never do I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::alerts::{Alert, AlertKind};
use crate::config::bounded_minutes;
use crate::dedup::sanitize_label_value;
use crate::stage::StageState;

/// Marker carried in place of logs when retrieval failed.
pub const CONTEXT_UNAVAILABLE: &str = "context unavailable";

/// Window of logs to retrieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// `minutes` before `end`, up to `end`.
    pub fn lookback(end: DateTime<Utc>, minutes: u64) -> Self {
        Self {
            start: end - bounded_minutes(minutes),
            end,
        }
    }
}

/// Logs and status gathered for an alert before escalation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatheredContext {
    /// Recent logs, empty when unavailable
    pub logs: String,
    /// Why logs are missing, if they are
    pub unavailable_reason: Option<String>,
    /// Stage state of the alert's task at admission
    pub stage: Option<StageState>,
}

impl GatheredContext {
    pub fn available(logs: String) -> Self {
        Self {
            logs,
            ..Default::default()
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            logs: String::new(),
            unavailable_reason: Some(reason.into()),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: Option<StageState>) -> Self {
        self.stage = stage;
        self
    }

    pub fn is_available(&self) -> bool {
        self.unavailable_reason.is_none()
    }

    /// Log text for briefs, or the unavailable marker.
    pub fn logs_or_marker(&self) -> String {
        match &self.unavailable_reason {
            Some(reason) => format!("{CONTEXT_UNAVAILABLE}: {reason}"),
            None if self.logs.trim().is_empty() => "No logs available.".to_string(),
            None => self.logs.clone(),
        }
    }
}

/// Labels that tie a remediation back to the alert that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationLabels {
    pub workflow_family: String,
    pub alert_kind: AlertKind,
    pub task_id: Option<String>,
}

impl CorrelationLabels {
    pub fn for_alert(alert: &Alert) -> Self {
        Self {
            workflow_family: alert.workflow_family.clone(),
            alert_kind: alert.kind,
            task_id: alert.task_id.clone(),
        }
    }

    /// Kubernetes labels for the remediation resource.
    pub fn to_labels(&self, target: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "workflow-family".to_string(),
            sanitize_label_value(&self.workflow_family),
        );
        labels.insert("alert-type".to_string(), self.alert_kind.as_str().to_string());
        labels.insert(
            "task-id".to_string(),
            sanitize_label_value(self.task_id.as_deref().unwrap_or("unknown")),
        );
        labels.insert("remediation".to_string(), "true".to_string());
        labels.insert("target-pod".to_string(), sanitize_label_value(target));
        labels
    }
}

/// What the spawner needs to start corrective work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub alert: Alert,
    pub gathered_context: GatheredContext,
    pub correlation_labels: CorrelationLabels,
    /// Audit record created during escalation
    pub issue_ref: String,
}

impl RemediationRequest {
    pub fn new(alert: Alert, gathered_context: GatheredContext, issue_ref: String) -> Self {
        let correlation_labels = CorrelationLabels::for_alert(&alert);
        Self {
            alert,
            gathered_context,
            correlation_labels,
            issue_ref,
        }
    }
}

/// Historical log retrieval. Best-effort: may fail or return empty text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, subject: &str, range: TimeRange) -> anyhow::Result<String>;
}

/// Durable audit record (issue) for an alert.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Returns the record id (issue URL or number).
    async fn create(&self, alert: &Alert, context: &GatheredContext) -> anyhow::Result<String>;
}

/// Creates corrective work items.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemediationSpawner: Send + Sync {
    /// Returns the reference later matched against task resource events.
    async fn spawn(&self, request: &RemediationRequest) -> anyhow::Result<String>;
}
