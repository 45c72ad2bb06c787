//! GitHub issue tracker using the `gh` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use super::collaborators::{GatheredContext, IssueTracker};
use super::templates::{issue_title, BriefRenderer};
use crate::alerts::Alert;

/// Creates one issue per admitted alert as its audit record.
pub struct GhIssueTracker {
    repository: String,
    renderer: Arc<BriefRenderer>,
}

impl GhIssueTracker {
    /// `repository` is `owner/repo`.
    pub fn new(repository: impl Into<String>, renderer: Arc<BriefRenderer>) -> Self {
        Self {
            repository: repository.into(),
            renderer,
        }
    }

    fn issue_args(&self, alert: &Alert, body: &str) -> Vec<String> {
        vec![
            "issue".into(),
            "create".into(),
            "--repo".into(),
            self.repository.clone(),
            "--title".into(),
            issue_title(alert),
            "--body".into(),
            body.to_string(),
            "--label".into(),
            format!("heal,{}", alert.kind.as_str()),
        ]
    }
}

#[async_trait]
impl IssueTracker for GhIssueTracker {
    async fn create(&self, alert: &Alert, context: &GatheredContext) -> Result<String> {
        let body = self.renderer.render_issue(alert, context)?;

        debug!(
            repo = %self.repository,
            kind = %alert.kind,
            subject = %alert.subject,
            "Creating GitHub issue"
        );

        let output = Command::new("gh")
            .args(self.issue_args(alert, &body))
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute gh issue create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh issue create failed: {}", stderr.trim());
        }

        let issue_url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(issue_url = %issue_url, "Created GitHub issue");
        Ok(issue_url)
    }
}
