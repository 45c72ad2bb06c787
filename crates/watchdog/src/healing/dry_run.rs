//! Collaborators that log what they would do instead of doing it.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::collaborators::{GatheredContext, IssueTracker, RemediationRequest, RemediationSpawner};
use crate::alerts::Alert;

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Default)]
pub struct DryRunIssueTracker;

#[async_trait]
impl IssueTracker for DryRunIssueTracker {
    async fn create(&self, alert: &Alert, context: &GatheredContext) -> Result<String> {
        let reference = format!("dry-run-issue-{}", short_id());
        info!(
            issue = %reference,
            kind = %alert.kind,
            subject = %alert.subject,
            context_available = context.is_available(),
            "[DRY RUN] Would create issue"
        );
        Ok(reference)
    }
}

/// References it returns never reach a terminal phase, so run it with
/// `healing.dry_run` set and the loop leaves them unattached.
#[derive(Debug, Default)]
pub struct DryRunSpawner;

#[async_trait]
impl RemediationSpawner for DryRunSpawner {
    async fn spawn(&self, request: &RemediationRequest) -> Result<String> {
        let reference = format!(
            "heal-remediation-{}-{}",
            request.alert.kind.as_str(),
            short_id()
        );
        info!(
            remediation = %reference,
            family = %request.correlation_labels.workflow_family,
            issue = %request.issue_ref,
            "[DRY RUN] Would spawn remediation"
        );
        Ok(reference)
    }
}
