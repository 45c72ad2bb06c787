//! Per-task stage tracking and deviation classification.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::sequence::StageSequence;
use crate::event::Event;

/// Where a task is in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub task_id: String,
    /// Workflow (or other subject) the task was last observed through
    pub subject: String,
    pub expected_stage_sequence: Vec<String>,
    pub current_stage: String,
    pub stage_entered_at: DateTime<Utc>,
    /// Latest activity signal (commit, task resource phase change)
    pub last_activity: DateTime<Utc>,
    /// The overrun of the current stage has already been reported
    pub timeout_reported: bool,
    /// A remediation was spawned for this task since the last transition
    pub remediation_pending: bool,
}

/// A mismatch between a task's expected and observed pipeline position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDeviation {
    /// The task has been in one stage longer than its budget
    StageTimeout {
        task_id: String,
        subject: String,
        stage: String,
        /// Agent responsible for the stage
        agent: Option<String>,
        elapsed: Duration,
        budget: Duration,
    },
    /// The observed transition is not an edge of the sequence
    InvalidTransition {
        task_id: String,
        subject: String,
        from: String,
        to: String,
        expected: Option<String>,
    },
    /// No transition and no activity for longer than the budget
    StageStuck {
        task_id: String,
        subject: String,
        stage: String,
        agent: Option<String>,
        idle: Duration,
        budget: Duration,
    },
}

impl StageDeviation {
    pub fn task_id(&self) -> &str {
        match self {
            Self::StageTimeout { task_id, .. }
            | Self::InvalidTransition { task_id, .. }
            | Self::StageStuck { task_id, .. } => task_id,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Self::StageTimeout { subject, .. }
            | Self::InvalidTransition { subject, .. }
            | Self::StageStuck { subject, .. } => subject,
        }
    }

    /// Agent responsible for the stage the finding is about.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::StageTimeout { agent, .. } | Self::StageStuck { agent, .. } => agent.as_deref(),
            Self::InvalidTransition { .. } => None,
        }
    }

    /// Lower is stronger.
    pub fn priority(&self) -> u8 {
        match self {
            Self::InvalidTransition { .. } => 1,
            Self::StageTimeout { .. } => 2,
            Self::StageStuck { .. } => 3,
        }
    }
}

/// Owns every task's `StageState`. Only the loop controller mutates it.
#[derive(Debug, Clone)]
pub struct StageTracker {
    sequence: StageSequence,
    tasks: HashMap<String, StageState>,
}

impl StageTracker {
    pub fn new(sequence: StageSequence) -> Self {
        Self {
            sequence,
            tasks: HashMap::new(),
        }
    }

    pub fn sequence(&self) -> &StageSequence {
        &self.sequence
    }

    /// Fold an event into stage state. Returns an `InvalidTransition` finding
    /// when the observed stage change is not an edge of the sequence; the
    /// state follows the observation either way.
    pub fn observe(&mut self, event: &Event) -> Vec<StageDeviation> {
        let Some(task_id) = event.task_id().map(String::from) else {
            return vec![];
        };

        match event {
            Event::WorkflowPhaseChanged(workflow) => {
                let Some(raw) = workflow.stage.as_deref() else {
                    return vec![];
                };
                let Some(stage) = self.sequence.resolve(raw).map(String::from) else {
                    debug!(task_id = %task_id, stage = %raw, "Ignoring unknown stage");
                    return vec![];
                };
                self.transition(&task_id, &workflow.subject.name, &stage, workflow.observed_at)
                    .into_iter()
                    .collect()
            }
            Event::TaskResourcePhaseChanged(resource) => {
                self.record_activity(&task_id, resource.observed_at);
                vec![]
            }
            Event::ExternalStatusUpdated(status) => {
                if let Some(at) = status.last_commit_at() {
                    self.record_activity(&task_id, at);
                }
                vec![]
            }
            Event::PodStateChanged(_) => vec![],
        }
    }

    fn transition(
        &mut self,
        task_id: &str,
        subject: &str,
        stage: &str,
        at: DateTime<Utc>,
    ) -> Option<StageDeviation> {
        let Some(state) = self.tasks.get_mut(task_id) else {
            info!(task_id = %task_id, stage = %stage, "Tracking task");
            self.tasks.insert(
                task_id.to_string(),
                StageState {
                    task_id: task_id.to_string(),
                    subject: subject.to_string(),
                    expected_stage_sequence: self.sequence.names(),
                    current_stage: stage.to_string(),
                    stage_entered_at: at,
                    last_activity: at,
                    timeout_reported: false,
                    remediation_pending: false,
                },
            );
            return None;
        };

        state.subject = subject.to_string();
        if state.current_stage == stage {
            return None;
        }

        let from = std::mem::replace(&mut state.current_stage, stage.to_string());
        state.stage_entered_at = at;
        state.last_activity = at;
        state.timeout_reported = false;
        state.remediation_pending = false;

        if self.sequence.is_valid_transition(&from, stage) {
            info!(task_id = %task_id, from = %from, to = %stage, "Stage transition");
            return None;
        }

        let expected = self.sequence.expected_next(&from).map(String::from);
        info!(
            task_id = %task_id,
            from = %from,
            to = %stage,
            expected = ?expected,
            "Invalid stage transition"
        );
        Some(StageDeviation::InvalidTransition {
            task_id: task_id.to_string(),
            subject: subject.to_string(),
            from,
            to: stage.to_string(),
            expected,
        })
    }

    fn record_activity(&mut self, task_id: &str, at: DateTime<Utc>) {
        if let Some(state) = self.tasks.get_mut(task_id) {
            if at > state.last_activity {
                state.last_activity = at;
            }
        }
    }

    /// Suppress `StageStuck` for a task until its next transition.
    pub fn mark_remediation(&mut self, task_id: &str) {
        if let Some(state) = self.tasks.get_mut(task_id) {
            state.remediation_pending = true;
        }
    }

    /// Classify one task at `now`. At most one finding per call: the first
    /// evaluation past the budget reports `StageTimeout`, later ones report
    /// `StageStuck` while there is still no activity.
    pub fn evaluate_task(&mut self, task_id: &str, now: DateTime<Utc>) -> Option<StageDeviation> {
        let state = self.tasks.get_mut(task_id)?;
        if self.sequence.is_terminal(&state.current_stage) {
            return None;
        }

        let budget = self.sequence.timeout_for(&state.current_stage);
        let elapsed = now - state.stage_entered_at;
        if elapsed <= budget {
            return None;
        }
        let agent = self.sequence.agent_for(&state.current_stage).map(String::from);

        if !state.timeout_reported {
            state.timeout_reported = true;
            return Some(StageDeviation::StageTimeout {
                task_id: state.task_id.clone(),
                subject: state.subject.clone(),
                stage: state.current_stage.clone(),
                agent,
                elapsed,
                budget,
            });
        }

        let idle = now - state.stage_entered_at.max(state.last_activity);
        if idle > budget && !state.remediation_pending {
            return Some(StageDeviation::StageStuck {
                task_id: state.task_id.clone(),
                subject: state.subject.clone(),
                stage: state.current_stage.clone(),
                agent,
                idle,
                budget,
            });
        }

        None
    }

    /// Classify every tracked task (periodic tick).
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<StageDeviation> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.evaluate_task(id, now))
            .collect()
    }

    pub fn state(&self, task_id: &str) -> Option<&StageState> {
        self.tasks.get(task_id)
    }

    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop tracking a task (its workflow was deleted).
    pub fn forget(&mut self, task_id: &str) -> Option<StageState> {
        let removed = self.tasks.remove(task_id);
        if removed.is_some() {
            info!(task_id = %task_id, "Stopped tracking task");
        }
        removed
    }

    /// Drop tasks that have sat in a terminal stage for longer than that
    /// stage's budget. Returns the removed task ids.
    pub fn prune_finished(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let sequence = &self.sequence;
        let mut removed = Vec::new();
        self.tasks.retain(|task_id, state| {
            let finished = sequence.is_terminal(&state.current_stage)
                && now - state.stage_entered_at > sequence.timeout_for(&state.current_stage);
            if finished {
                removed.push(task_id.clone());
            }
            !finished
        });
        if !removed.is_empty() {
            debug!(tasks = ?removed, "Pruned finished tasks");
        }
        removed.sort();
        removed
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new(StageSequence::default())
    }
}
