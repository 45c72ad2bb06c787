//! Watchdog configuration.
//!
//! Loaded from TOML, YAML or JSON (chosen by file extension). Every section
//! is optional and falls back to its defaults.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::alerts::{AlertConfig, ExclusionConfig};
use crate::dedup::DedupConfig;
use crate::error::WatchdogError;
use crate::healing::{HealingConfig, LokiConfig};
use crate::poller::PrPollConfig;
use crate::stage::StageSequence;

/// Upper bound for any minutes-valued setting (one week)
pub const MAX_DURATION_MINS: u64 = 7 * 24 * 60;

/// Minutes setting as a duration, clamped to `MAX_DURATION_MINS`.
pub fn bounded_minutes(mins: u64) -> Duration {
    Duration::minutes(mins.min(MAX_DURATION_MINS) as i64)
}

/// Reject a minutes setting above `MAX_DURATION_MINS`.
pub fn check_minutes(field: &str, mins: u64) -> crate::error::Result<()> {
    if mins > MAX_DURATION_MINS {
        return Err(WatchdogError::Config(format!(
            "{field} must be at most {MAX_DURATION_MINS} minutes, got {mins}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub alerts: AlertConfig,
    pub dedup: DedupConfig,
    pub exclusions: ExclusionConfig,
    pub stages: StageSequence,
    pub healing: HealingConfig,
    pub loki: LokiConfig,
    pub github: PrPollConfig,
}

impl WatchdogConfig {
    /// Load from a file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let mut config: Self = match extension.as_str() {
            "toml" => toml::from_str(&content).context("Failed to parse TOML config")?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&content).context("Failed to parse YAML config")?
            }
            "json" => serde_json::from_str(&content).context("Failed to parse JSON config")?,
            other => anyhow::bail!(
                "Unsupported config format: '{other}' (expected toml, yaml or json)"
            ),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// `LOKI_URL`, `WATCHDOG_NAMESPACE` and `WATCHDOG_REPOSITORY` win over
    /// file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("LOKI_URL") {
            self.loki.base_url = url;
        }
        if let Ok(namespace) = std::env::var("WATCHDOG_NAMESPACE") {
            self.loki.namespace.clone_from(&namespace);
            self.healing.namespace = namespace;
        }
        if let Ok(repository) = std::env::var("WATCHDOG_REPOSITORY") {
            self.healing.repository = repository;
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.alerts.validate()?;
        self.dedup.validate()?;
        self.stages.validate()?;
        self.healing.validate()?;
        self.github.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchdogError;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{suffix}"))
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_toml_with_partial_sections() {
        let file = write_config(
            "toml",
            r#"
[dedup]
window_mins = 45

[alerts]
stale_progress_threshold_mins = 20

[healing]
repository = "acme/platform"
"#,
        );
        let config = WatchdogConfig::load(file.path()).unwrap();
        assert_eq!(config.dedup.window_mins, 45);
        assert_eq!(config.alerts.stale_progress_threshold_mins, 20);
        assert_eq!(config.alerts.approval_loop_threshold, 2);
        assert_eq!(config.healing.repository, "acme/platform");
        assert_eq!(config.stages.stages.len(), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_yaml_stage_sequence() {
        let file = write_config(
            "yaml",
            r"
stages:
  default_timeout_mins: 20
  stages:
    - name: build
      agent: Rex
    - name: review
      aliases: [reviewing]
      timeout_mins: 60
    - name: done
exclusions:
  prefixes: [infra-]
",
        );
        let config = WatchdogConfig::load(file.path()).unwrap();
        assert_eq!(config.stages.names(), vec!["build", "review", "done"]);
        assert!(config.stages.is_failure("failed"));
        assert_eq!(config.stages.resolve("reviewing"), Some("review"));
        assert!(config.exclusions.is_excluded_name("infra-proxy"));
        assert!(!config.exclusions.is_excluded_name("heal-remediation-x"));
    }

    #[test]
    #[serial]
    fn test_rejects_unknown_extension() {
        let file = write_config("ini", "window=1");
        let err = WatchdogConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config format"));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = WatchdogConfig::default();
        config.dedup.window_mins = 0;
        assert!(matches!(config.validate(), Err(WatchdogError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_minutes() {
        let mut config = WatchdogConfig::default();
        config.dedup.window_mins = u64::MAX;
        assert!(matches!(config.validate(), Err(WatchdogError::Config(_))));

        let mut config = WatchdogConfig::default();
        config.stages.stages[0].timeout_mins = Some(MAX_DURATION_MINS + 1);
        assert!(config.validate().is_err());

        let mut config = WatchdogConfig::default();
        config.alerts.step_timeouts.testing_mins = u64::MAX;
        assert!(config.validate().is_err());

        config.alerts.step_timeouts.testing_mins = MAX_DURATION_MINS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bounded_minutes_clamps() {
        assert_eq!(bounded_minutes(30), Duration::minutes(30));
        assert_eq!(
            bounded_minutes(u64::MAX),
            Duration::minutes(MAX_DURATION_MINS as i64)
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_stages() {
        let mut config = WatchdogConfig::default();
        config.stages.stages[1].aliases.push("implementation".into());
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("LOKI_URL", "http://loki.test:3100");
        std::env::set_var("WATCHDOG_NAMESPACE", "staging");
        std::env::set_var("WATCHDOG_REPOSITORY", "acme/platform");

        let mut config = WatchdogConfig::default();
        config.apply_env_overrides();

        std::env::remove_var("LOKI_URL");
        std::env::remove_var("WATCHDOG_NAMESPACE");
        std::env::remove_var("WATCHDOG_REPOSITORY");

        assert_eq!(config.loki.base_url, "http://loki.test:3100");
        assert_eq!(config.loki.namespace, "staging");
        assert_eq!(config.healing.namespace, "staging");
        assert_eq!(config.healing.repository, "acme/platform");
    }
}
