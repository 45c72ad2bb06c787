//! Repository status poller.
//!
//! Lists open PRs labelled `task-<id>` with `gh pr list`, reads each one with
//! `gh pr view --json` and feeds the result into the event channel as
//! `ExternalStatusUpdated`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::WatchdogError;
use crate::event::Event;
use crate::normalize::{parse_pr_status, PR_VIEW_FIELDS};

/// PR label prefix linking a PR to its task (`task-4`)
pub const TASK_LABEL_PREFIX: &str = "task-";

/// PR polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrPollConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Open PRs listed per poll
    pub limit: u32,
}

impl Default for PrPollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 120,
            limit: 100,
        }
    }
}

impl PrPollConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.interval_secs == 0 {
            return Err(WatchdogError::Config(
                "github.interval_secs must be greater than zero".into(),
            ));
        }
        if self.limit == 0 {
            return Err(WatchdogError::Config(
                "github.limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Open PR and the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPr {
    pub number: u64,
    pub task_id: String,
}

fn task_from_label(name: &str) -> Option<&str> {
    name.strip_prefix(TASK_LABEL_PREFIX)
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
}

/// PRs from `gh pr list --json number,labels` carrying a task label.
pub fn parse_pr_list(json: &Value) -> Vec<TaskPr> {
    json.as_array()
        .map(|prs| {
            prs.iter()
                .filter_map(|pr| {
                    let number = pr["number"].as_u64()?;
                    let task_id = pr["labels"]
                        .as_array()?
                        .iter()
                        .filter_map(|l| l["name"].as_str())
                        .find_map(task_from_label)?;
                    Some(TaskPr {
                        number,
                        task_id: task_id.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct PrPoller {
    repository: String,
    interval: Duration,
    limit: u32,
}

impl PrPoller {
    pub fn new(repository: impl Into<String>, config: &PrPollConfig) -> Self {
        Self {
            repository: repository.into(),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            limit: config.limit,
        }
    }

    fn list_args(&self) -> Vec<String> {
        vec![
            "pr".into(),
            "list".into(),
            "-R".into(),
            self.repository.clone(),
            "--state".into(),
            "open".into(),
            "--json".into(),
            "number,labels".into(),
            "--limit".into(),
            self.limit.to_string(),
        ]
    }

    fn view_args(&self, number: u64) -> Vec<String> {
        vec![
            "pr".into(),
            "view".into(),
            number.to_string(),
            "-R".into(),
            self.repository.clone(),
            "--json".into(),
            PR_VIEW_FIELDS.into(),
        ]
    }

    async fn gh_json(&self, args: &[String]) -> Result<Value> {
        let output = Command::new("gh")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute gh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh {} failed: {}", args[..2].join(" "), stderr.trim());
        }
        serde_json::from_slice(&output.stdout).context("Failed to parse gh output")
    }

    /// One pass over the open task PRs. A PR that cannot be read is skipped.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let listed = self.gh_json(&self.list_args()).await?;
        let prs = parse_pr_list(&listed);
        debug!(repository = %self.repository, count = prs.len(), "Polled task PRs");

        let mut events = Vec::with_capacity(prs.len());
        for pr in prs {
            let status = match self.gh_json(&self.view_args(pr.number)).await {
                Ok(json) => parse_pr_status(&json, &self.repository, &pr.task_id, now),
                Err(e) => {
                    warn!(pr = pr.number, task_id = %pr.task_id, error = %format!("{e:#}"), "Failed to read PR");
                    continue;
                }
            };
            match status {
                Ok(status) => events.push(Event::ExternalStatusUpdated(status)),
                Err(e) => warn!(pr = pr.number, error = %e, "Skipping malformed PR status"),
            }
        }
        Ok(events)
    }

    /// Poll until the event channel closes.
    pub async fn run(self, tx: mpsc::Sender<Event>) {
        info!(
            repository = %self.repository,
            interval_secs = self.interval.as_secs(),
            "PR poller started"
        );
        loop {
            match self.poll(Utc::now()).await {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %format!("{e:#}"), "PR poll failed"),
            }

            // Sleep after polling, so the first poll is immediate
            tokio::select! {
                () = sleep(self.interval) => {}
                () = tx.closed() => return,
            }
        }
    }
}
