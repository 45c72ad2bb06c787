//! Recent history handed to alert handlers.
//!
//! Only the loop controller writes it (before each evaluation); handlers get a
//! shared reference.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::event::{is_terminal_phase, Event, ExternalStatus, SubjectRef};

#[derive(Debug, Default, Clone)]
pub struct History {
    /// Latest repository status per task id
    external: HashMap<String, ExternalStatus>,
    /// First time each non-terminal task resource was observed
    resource_first_seen: HashMap<SubjectRef, DateTime<Utc>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an event into the history.
    pub fn record(&mut self, event: &Event) {
        match event {
            Event::ExternalStatusUpdated(status) => {
                if let Some(task_id) = status.task_id.as_deref().filter(|t| !t.is_empty()) {
                    self.external.insert(task_id.to_string(), status.clone());
                }
            }
            Event::TaskResourcePhaseChanged(resource) => {
                if is_terminal_phase(&resource.phase) {
                    self.resource_first_seen.remove(&resource.subject);
                } else {
                    self.resource_first_seen
                        .entry(resource.subject.clone())
                        .or_insert(resource.observed_at);
                }
            }
            Event::PodStateChanged(_) | Event::WorkflowPhaseChanged(_) => {}
        }
    }

    /// Latest repository status known for a task.
    pub fn external_status(&self, task_id: &str) -> Option<&ExternalStatus> {
        self.external.get(task_id)
    }

    /// When a task resource was first seen in a non-terminal phase.
    pub fn resource_first_seen(&self, subject: &SubjectRef) -> Option<DateTime<Utc>> {
        self.resource_first_seen.get(subject).copied()
    }

    /// Drop everything kept for a task that is no longer tracked.
    pub fn forget_task(&mut self, task_id: &str) {
        self.external.remove(task_id);
    }

    /// Number of tasks with a known repository status.
    pub fn tracked_tasks(&self) -> usize {
        self.external.len()
    }

    /// Number of tracked non-terminal resources.
    pub fn tracked_resources(&self) -> usize {
        self.resource_first_seen.len()
    }
}
