//! Pipeline stage sequence.
//!
//! The expected stage order is configuration data. Each stage carries the
//! agent responsible for it and an optional time budget.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{bounded_minutes, check_minutes};
use crate::error::{Result, WatchdogError};

/// Stage timeout - 30 minutes is the target, anything longer is suspicious.
pub const DEFAULT_STAGE_TIMEOUT_MINS: u64 = 30;

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    /// Canonical name
    pub name: String,
    /// Other spellings seen in labels and ConfigMaps
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Agent responsible for the stage, if any
    #[serde(default)]
    pub agent: Option<String>,
    /// Overrides the sequence-wide budget
    #[serde(default)]
    pub timeout_mins: Option<u64>,
}

impl StageDef {
    pub fn new(name: &str, aliases: &[&str], agent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
            agent: agent.map(String::from),
            timeout_mins: None,
        }
    }

    fn matches(&self, value: &str) -> bool {
        self.name.eq_ignore_ascii_case(value)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(value))
    }
}

/// Ordered stage definitions plus an optional failure stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSequence {
    pub stages: Vec<StageDef>,
    /// Reachable from every non-terminal stage
    pub failure: Option<StageDef>,
    pub default_timeout_mins: u64,
}

impl Default for StageSequence {
    fn default() -> Self {
        Self {
            stages: vec![
                StageDef::new(
                    "implementation",
                    &["implementation-in-progress", "pending"],
                    Some("Rex"),
                ),
                StageDef::new("quality", &["quality-in-progress"], Some("Cleo")),
                StageDef::new("security", &["security-in-progress"], Some("Cipher")),
                StageDef::new("testing", &["testing-in-progress"], Some("Tess")),
                StageDef::new(
                    "integration",
                    &["waiting-atlas-integration", "atlas"],
                    Some("Atlas"),
                ),
                StageDef::new("merged", &["waiting-pr-merged", "merge"], None),
                StageDef::new("complete", &["completed", "done"], None),
            ],
            failure: Some(StageDef::new("failed", &["error"], None)),
            default_timeout_mins: DEFAULT_STAGE_TIMEOUT_MINS,
        }
    }
}

impl StageSequence {
    fn all(&self) -> impl Iterator<Item = &StageDef> {
        self.stages.iter().chain(self.failure.iter())
    }

    fn get(&self, name: &str) -> Option<&StageDef> {
        self.all().find(|s| s.name == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Canonical stage name for a label value or alias.
    pub fn resolve(&self, value: &str) -> Option<&str> {
        let value = value.trim();
        self.all().find(|s| s.matches(value)).map(|s| s.name.as_str())
    }

    /// Canonical names in order, excluding the failure stage.
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_failure(&self, name: &str) -> bool {
        self.failure.as_ref().is_some_and(|f| f.name == name)
    }

    /// Last stage of the sequence or the failure stage.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.is_failure(name) || self.stages.last().is_some_and(|s| s.name == name)
    }

    /// Stage expected after `name`.
    pub fn expected_next(&self, name: &str) -> Option<&str> {
        let idx = self.position(name)?;
        self.stages.get(idx + 1).map(|s| s.name.as_str())
    }

    /// Whether `from -> to` is an edge of the sequence.
    ///
    /// Edges are: each stage to its successor, every non-terminal stage to the
    /// failure stage, and the failure stage back to the first stage (retry).
    pub fn is_valid_transition(&self, from: &str, to: &str) -> bool {
        if self.expected_next(from) == Some(to) {
            return true;
        }
        if self.is_failure(to) {
            return !self.is_terminal(from) && self.position(from).is_some();
        }
        self.is_failure(from) && self.stages.first().is_some_and(|s| s.name == to)
    }

    /// Time budget for a stage.
    pub fn timeout_for(&self, name: &str) -> Duration {
        let mins = self
            .get(name)
            .and_then(|s| s.timeout_mins)
            .unwrap_or(self.default_timeout_mins);
        bounded_minutes(mins)
    }

    pub fn agent_for(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|s| s.agent.as_deref())
    }

    /// Reject empty sequences and ambiguous names.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(WatchdogError::Config(
                "stage sequence must contain at least one stage".into(),
            ));
        }
        if self.default_timeout_mins == 0 {
            return Err(WatchdogError::Config(
                "stages.default_timeout_mins must be greater than zero".into(),
            ));
        }
        check_minutes("stages.default_timeout_mins", self.default_timeout_mins)?;

        let mut seen = HashSet::new();
        for stage in self.all() {
            for spelling in std::iter::once(&stage.name).chain(stage.aliases.iter()) {
                if !seen.insert(spelling.to_lowercase()) {
                    return Err(WatchdogError::Config(format!(
                        "stage name or alias '{spelling}' is used more than once"
                    )));
                }
            }
            if stage.timeout_mins == Some(0) {
                return Err(WatchdogError::Config(format!(
                    "stage '{}' has a zero timeout",
                    stage.name
                )));
            }
            if let Some(mins) = stage.timeout_mins {
                check_minutes(&format!("stage '{}' timeout_mins", stage.name), mins)?;
            }
        }
        Ok(())
    }
}
