//! Normalized events consumed by the detection core.
//!
//! Raw watch and poll payloads are reduced to a small closed set of variants
//! before reaching the alert handlers. Events are never mutated after
//! construction; handlers receive them by shared reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label carrying the task identifier on pods, workflows and task resources.
pub const TASK_ID_LABEL: &str = "task-id";

/// Label carrying the agent name on pods and task resources.
pub const AGENT_LABEL: &str = "agent";

/// Namespace-qualified identity of the entity an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub namespace: String,
    pub name: String,
}

impl SubjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Events from the watch streams and the repository poller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Pod phase, readiness or container state changed
    PodStateChanged(PodEvent),
    /// Workflow phase (and possibly pipeline stage) changed
    WorkflowPhaseChanged(WorkflowEvent),
    /// Task resource (`CodeRun`) phase changed
    TaskResourcePhaseChanged(TaskResourceEvent),
    /// Repository review/check/comment state was refreshed
    ExternalStatusUpdated(ExternalStatus),
}

impl Event {
    /// Entity this event is about.
    pub fn subject(&self) -> &SubjectRef {
        match self {
            Self::PodStateChanged(e) => &e.subject,
            Self::WorkflowPhaseChanged(e) => &e.subject,
            Self::TaskResourcePhaseChanged(e) => &e.subject,
            Self::ExternalStatusUpdated(e) => &e.subject,
        }
    }

    /// When the normalizer observed the change.
    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            Self::PodStateChanged(e) => e.observed_at,
            Self::WorkflowPhaseChanged(e) => e.observed_at,
            Self::TaskResourcePhaseChanged(e) => e.observed_at,
            Self::ExternalStatusUpdated(e) => e.observed_at,
        }
    }

    /// Labels on the subject, if the variant carries any.
    pub fn labels(&self) -> Option<&HashMap<String, String>> {
        match self {
            Self::PodStateChanged(e) => Some(&e.labels),
            Self::WorkflowPhaseChanged(e) => Some(&e.labels),
            Self::TaskResourcePhaseChanged(e) => Some(&e.labels),
            Self::ExternalStatusUpdated(_) => None,
        }
    }

    /// Task this event belongs to, when known.
    pub fn task_id(&self) -> Option<&str> {
        let id = match self {
            Self::PodStateChanged(e) => e.labels.get(TASK_ID_LABEL).map(String::as_str),
            Self::WorkflowPhaseChanged(e) => e.labels.get(TASK_ID_LABEL).map(String::as_str),
            Self::TaskResourcePhaseChanged(e) => e.task_id.as_deref(),
            Self::ExternalStatusUpdated(e) => e.task_id.as_deref(),
        };
        id.filter(|s| !s.is_empty())
    }

    /// Workflow removed from the cluster; its task is no longer tracked.
    pub fn is_workflow_deletion(&self) -> bool {
        matches!(self, Self::WorkflowPhaseChanged(e) if e.phase == DELETED_PHASE)
    }

    /// Short variant name for logging.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::PodStateChanged(_) => "pod",
            Self::WorkflowPhaseChanged(_) => "workflow",
            Self::TaskResourcePhaseChanged(_) => "task-resource",
            Self::ExternalStatusUpdated(_) => "external-status",
        }
    }
}

/// Phase given to workflows and task resources removed from the cluster.
pub const DELETED_PHASE: &str = "Deleted";

/// Whether a phase string denotes a finished subject.
pub fn is_terminal_phase(phase: &str) -> bool {
    matches!(
        phase,
        "Succeeded" | "Failed" | "Error" | "Completed" | "Cancelled" | DELETED_PHASE
    )
}

/// Simplified Pod representation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodEvent {
    pub subject: SubjectRef,
    pub observed_at: DateTime<Utc>,
    pub phase: String,
    pub labels: HashMap<String, String>,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatus>,
    pub started_at: Option<DateTime<Utc>>,
}

impl PodEvent {
    /// Agent label, or `unknown`.
    pub fn agent(&self) -> &str {
        self.labels.get(AGENT_LABEL).map_or("unknown", String::as_str)
    }

    /// Sum of restarts across containers.
    pub fn total_restarts(&self) -> i32 {
        self.container_statuses.iter().map(|c| c.restart_count).sum()
    }
}

/// Pod condition from status.conditions[]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodCondition {
    /// Condition type: "Ready", "ContainersReady", "Initialized", etc.
    pub condition_type: String,
    /// Status: "True", "False", "Unknown"
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Container status within a pod
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub state: ContainerState,
    pub restart_count: i32,
}

/// Container state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContainerState {
    Waiting {
        reason: Option<String>,
    },
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        reason: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    },
}

impl Default for ContainerState {
    fn default() -> Self {
        Self::Waiting { reason: None }
    }
}

/// Workflow phase change, optionally carrying the pipeline stage it reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub subject: SubjectRef,
    pub observed_at: DateTime<Utc>,
    pub phase: String,
    pub message: Option<String>,
    pub labels: HashMap<String, String>,
    /// Raw stage value (e.g. `quality-in-progress`), resolved by the stage sequence.
    pub stage: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Task resource (`CodeRun`) phase change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResourceEvent {
    pub subject: SubjectRef,
    pub observed_at: DateTime<Utc>,
    pub phase: String,
    pub message: Option<String>,
    pub agent: String,
    pub task_id: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Review, check and comment state of the repository change backing a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalStatus {
    pub subject: SubjectRef,
    pub observed_at: DateTime<Utc>,
    pub task_id: Option<String>,
    pub repository: String,
    pub pr_number: Option<u32>,
    pub comments: Vec<Comment>,
    pub commits: Vec<Commit>,
    pub checks: Vec<Check>,
    pub reviews: Vec<Review>,
    pub mergeable: Option<bool>,
    pub merge_state_status: Option<String>,
}

impl ExternalStatus {
    /// Most recent commit time, if any commits are known.
    pub fn last_commit_at(&self) -> Option<DateTime<Utc>> {
        self.commits.iter().map(|c| c.committed_at).max()
    }
}

/// A PR comment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A commit on the PR branch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
}

/// A CI check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub conclusion: CheckConclusion,
    pub completed_at: Option<DateTime<Utc>>,
}

/// CI check conclusion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckConclusion {
    #[default]
    Pending,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

/// A PR review
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Review state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    #[default]
    Pending,
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
}
