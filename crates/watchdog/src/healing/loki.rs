//! Loki log source.
//!
//! Retrieves historical pod logs from Grafana Loki so context is still
//! available after pods have been garbage collected.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::collaborators::{LogSource, TimeRange};
use super::redact::redact_secrets;

/// Default Loki service URL (internal Kubernetes DNS)
const DEFAULT_LOKI_URL: &str = "http://loki.logging.svc.cluster.local:3100";

/// Configuration for the Loki client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LokiConfig {
    /// Base URL for the Loki API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of log entries to return per query
    pub limit: u32,
    /// Namespace the watched pods run in
    pub namespace: String,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LOKI_URL.to_string(),
            timeout_secs: 30,
            limit: 5000,
            namespace: "cto".to_string(),
        }
    }
}

/// Loki query response structure
#[derive(Debug, Deserialize)]
struct LokiResponse {
    status: String,
    data: LokiData,
}

#[derive(Debug, Deserialize)]
struct LokiData {
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    values: Vec<(String, String)>, // (timestamp_ns, line)
}

/// Log source backed by Loki's `query_range` API.
#[derive(Debug, Clone)]
pub struct LokiLogSource {
    config: LokiConfig,
    client: reqwest::Client,
}

impl LokiLogSource {
    pub fn new(config: LokiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { config, client })
    }

    /// Query logs for every pod whose name starts with `subject`, oldest first.
    async fn query(&self, subject: &str, range: TimeRange) -> Result<Vec<(DateTime<Utc>, String)>> {
        let query = format!(
            r#"{{namespace="{}", pod=~"{}.*"}}"#,
            self.config.namespace, subject
        );
        let url = format!(
            "{}/loki/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(query = %query, "Querying Loki");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query.as_str()),
                ("start", &nanos(range.start).to_string()),
                ("end", &nanos(range.end).to_string()),
                ("limit", &self.config.limit.to_string()),
                ("direction", "forward"),
            ])
            .send()
            .await
            .context("Failed to send request to Loki")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Loki query failed with status {status}: {body}");
        }

        let parsed: LokiResponse = response
            .json()
            .await
            .context("Failed to parse Loki response")?;
        if parsed.status != "success" {
            anyhow::bail!("Loki returned status: {}", parsed.status);
        }

        let mut entries: Vec<(DateTime<Utc>, String)> = parsed
            .data
            .result
            .into_iter()
            .flat_map(|stream| stream.values)
            .filter_map(|(ts, line)| match ts.parse::<i64>() {
                Ok(ns) => Some((DateTime::from_timestamp_nanos(ns), line)),
                Err(_) => {
                    warn!(timestamp = %ts, "Skipping Loki entry with invalid timestamp");
                    None
                }
            })
            .collect();
        entries.sort_by_key(|(ts, _)| *ts);
        Ok(entries)
    }
}

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_default()
}

#[async_trait]
impl LogSource for LokiLogSource {
    async fn fetch(&self, subject: &str, range: TimeRange) -> Result<String> {
        let entries = self.query(subject, range).await?;
        let text = entries
            .iter()
            .map(|(ts, line)| format!("[{}] {}", ts.format("%H:%M:%S%.3f"), line))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(redact_secrets(&text))
    }
}
