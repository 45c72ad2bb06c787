//! Remediation spawner creating `CodeRun` resources with `kubectl`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::collaborators::{RemediationRequest, RemediationSpawner};
use super::templates::BriefRenderer;

/// Label the controller uses to recognise remediation runs
pub const REMEDIATION_TYPE_LABEL: &str = "agents.platform/type";

/// Agent settings for remediation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// GitHub App the remediation agent runs as
    pub agent: String,
    /// CLI tool (e.g., "claude", "codex")
    pub cli: String,
    pub model: String,
    /// Prompt template the controller mounts for the agent
    pub template: String,
    /// kubectl binary
    pub kubectl: String,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            agent: "5DLabs-Rex".into(),
            cli: "claude".into(),
            model: "claude-opus-4-5-20251101".into(),
            template: "heal/remediation".into(),
            kubectl: "kubectl".into(),
        }
    }
}

/// Spawns one `CodeRun` per admitted alert.
pub struct KubectlSpawner {
    namespace: String,
    repository: String,
    config: SpawnerConfig,
    renderer: Arc<BriefRenderer>,
}

impl KubectlSpawner {
    pub fn new(
        namespace: impl Into<String>,
        repository: impl Into<String>,
        config: SpawnerConfig,
        renderer: Arc<BriefRenderer>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            repository: repository.into(),
            config,
            renderer,
        }
    }

    /// Build the `CodeRun` manifest, returning its name and YAML.
    fn manifest(&self, request: &RemediationRequest) -> Result<(String, String)> {
        let alert = &request.alert;
        let uid = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("heal-remediation-{}-{}", alert.kind.as_str(), &uid[..8]);

        let mut labels = request.correlation_labels.to_labels(&alert.subject);
        labels.insert(REMEDIATION_TYPE_LABEL.into(), "heal-remediation".into());

        let brief = self.renderer.render_remediation(
            alert,
            &request.gathered_context,
            &request.issue_ref,
        )?;
        let alert_json = serde_json::to_string(alert).context("Failed to serialize alert")?;

        let manifest = serde_json::json!({
            "apiVersion": "agents.platform/v1",
            "kind": "CodeRun",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": labels,
            },
            "spec": {
                "taskId": alert.task_id.as_deref().unwrap_or("0"),
                "githubApp": self.config.agent,
                "model": self.config.model,
                "repositoryUrl": format!("https://github.com/{}", self.repository),
                "workingDirectory": ".",
                "service": "heal",
                "cliConfig": {
                    "cliType": self.config.cli,
                    "model": self.config.model,
                    "settings": {
                        "template": self.config.template,
                        "watchRole": "remediation",
                    },
                },
                "env": {
                    "REMEDIATION_MODE": "true",
                    "ALERT_CONTEXT": alert_json,
                    "ISSUE_REF": request.issue_ref,
                    "REMEDIATION_BRIEF": brief,
                },
            },
        });

        let yaml = serde_yaml::to_string(&manifest).context("Failed to serialize CodeRun")?;
        Ok((name, yaml))
    }
}

#[async_trait]
impl RemediationSpawner for KubectlSpawner {
    async fn spawn(&self, request: &RemediationRequest) -> Result<String> {
        let (name, yaml) = self.manifest(request)?;
        debug!(coderun = %name, namespace = %self.namespace, "Creating remediation CodeRun");

        // A spawn abandoned by the caller's timeout must not create the CodeRun
        let mut child = Command::new(&self.config.kubectl)
            .args(["create", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn kubectl create")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(yaml.as_bytes())
                .await
                .context("Failed to write YAML to kubectl stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for kubectl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create remediation CodeRun: {}", stderr.trim());
        }

        info!(coderun = %name, "Created remediation CodeRun");
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertKind};
    use crate::healing::collaborators::GatheredContext;
    use chrono::Utc;

    fn spawner(config: SpawnerConfig) -> KubectlSpawner {
        KubectlSpawner::new(
            "cto",
            "5dlabs/cto",
            config,
            Arc::new(BriefRenderer::new().unwrap()),
        )
    }

    fn request() -> RemediationRequest {
        let alert = Alert::new(
            AlertKind::SilentFailure,
            "play-task-4-abc-step-123",
            "Container 'main' terminated with exit code 1",
            Utc::now(),
        )
        .with_task_id(Some("4"));
        RemediationRequest::new(
            alert,
            GatheredContext::available("boom".into()),
            "https://github.com/5dlabs/cto/issues/7".into(),
        )
    }

    #[test]
    fn test_manifest_carries_correlation_labels() {
        let spawner = spawner(SpawnerConfig::default());
        let request = request();

        let (name, yaml) = spawner.manifest(&request).unwrap();
        assert!(name.starts_with("heal-remediation-silent-failure-"));
        assert_eq!(name.len(), "heal-remediation-silent-failure-".len() + 8);

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let labels = &parsed["metadata"]["labels"];
        assert_eq!(labels["workflow-family"].as_str(), Some("play-task-4"));
        assert_eq!(labels["alert-type"].as_str(), Some("silent-failure"));
        assert_eq!(labels["task-id"].as_str(), Some("4"));
        assert_eq!(labels["remediation"].as_str(), Some("true"));
        assert_eq!(labels[REMEDIATION_TYPE_LABEL].as_str(), Some("heal-remediation"));
        assert_eq!(parsed["spec"]["taskId"].as_str(), Some("4"));
        assert_eq!(
            parsed["spec"]["env"]["ISSUE_REF"].as_str(),
            Some("https://github.com/5dlabs/cto/issues/7")
        );
        assert!(parsed["spec"]["env"]["REMEDIATION_BRIEF"]
            .as_str()
            .unwrap()
            .contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_spawn_kills_kubectl() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("created");
        let script = dir.path().join("kubectl");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nsleep 2\ntouch {}\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spawner = spawner(SpawnerConfig {
            kubectl: script.display().to_string(),
            ..Default::default()
        });
        let result =
            tokio::time::timeout(Duration::from_millis(300), spawner.spawn(&request())).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_kubectl_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("kubectl");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho 'coderuns.agents.platform is forbidden' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spawner = spawner(SpawnerConfig {
            kubectl: script.display().to_string(),
            ..Default::default()
        });
        let err = spawner.spawn(&request()).await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }
}
