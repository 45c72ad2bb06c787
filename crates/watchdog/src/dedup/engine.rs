//! Deduplication engine.
//!
//! Explicit service over a `DedupStore`, shared by reference with the loop
//! controller. Nothing else touches the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::record::{Decision, DedupKey, DedupRecord, SuppressReason};
use super::store::{DedupStore, InMemoryDedupStore};
use crate::alerts::Alert;
use crate::config::{bounded_minutes, check_minutes};
use crate::error::{Result, WatchdogError};

/// Time window (in minutes) during which repeats of a key are suppressed
pub const DEFAULT_DEDUP_WINDOW_MINS: u64 = 30;

/// Dedup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_mins: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_mins: DEFAULT_DEDUP_WINDOW_MINS,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_mins == 0 {
            return Err(WatchdogError::Config(
                "dedup.window_mins must be greater than zero".into(),
            ));
        }
        check_minutes("dedup.window_mins", self.window_mins)
    }
}

#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn DedupStore>,
    window: Duration,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn DedupStore>, config: &DedupConfig) -> Self {
        Self {
            store,
            window: bounded_minutes(config.window_mins),
        }
    }

    /// Engine backed by a process-local store.
    pub fn in_memory(config: &DedupConfig) -> Self {
        Self::new(Arc::new(InMemoryDedupStore::new()), config)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether an alert is new, recording the sighting atomically.
    ///
    /// The alert's `detected_at` is the clock, so replays decide the same way.
    pub async fn check_and_record(&self, alert: &Alert) -> Result<Decision> {
        let key = alert.dedup_key();
        let decision = self
            .store
            .check_and_record(&key, alert.detected_at, self.window)
            .await
            .inspect_err(|e| warn!(key = %key, error = %e, "Dedup store unavailable"))?;

        match &decision {
            Decision::New => info!(
                family = %key.workflow_family,
                kind = %key.alert_kind,
                subject = %alert.subject,
                "New alert"
            ),
            Decision::Suppressed(SuppressReason::ActiveRemediation(reference)) => debug!(
                family = %key.workflow_family,
                kind = %key.alert_kind,
                remediation = %reference,
                "Suppressed: remediation in progress"
            ),
            Decision::Suppressed(SuppressReason::WithinWindow) => debug!(
                family = %key.workflow_family,
                kind = %key.alert_kind,
                window_mins = self.window.num_minutes(),
                "Suppressed: within dedup window"
            ),
        }

        Ok(decision)
    }

    /// Record that `remediation_ref` now owns `key`.
    pub async fn attach_remediation(
        &self,
        key: &DedupKey,
        remediation_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.attach_remediation(key, remediation_ref, at).await?;
        info!(key = %key, remediation = %remediation_ref, "Remediation attached");
        Ok(())
    }

    /// Clear the remediation with this reference, if any record holds it.
    pub async fn resolve_remediation(&self, remediation_ref: &str) -> Result<Option<DedupKey>> {
        let key = self.store.resolve_remediation(remediation_ref).await?;
        if let Some(key) = &key {
            info!(key = %key, remediation = %remediation_ref, "Remediation resolved");
        }
        Ok(key)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.purge_expired(now, self.window).await?;
        if removed > 0 {
            debug!(removed, "Purged expired dedup records");
        }
        Ok(removed)
    }

    pub async fn record(&self, key: &DedupKey) -> Result<Option<DedupRecord>> {
        self.store.get(key).await
    }

    pub async fn snapshot(&self) -> Result<Vec<(DedupKey, DedupRecord)>> {
        self.store.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::dedup::store::MockDedupStore;

    fn alert(subject: &str, at: DateTime<Utc>) -> Alert {
        Alert::new(AlertKind::SilentFailure, subject, "container exited", at)
    }

    #[tokio::test]
    async fn test_concurrent_identical_alerts_one_new() {
        let engine = DedupEngine::in_memory(&DedupConfig::default());
        let now = Utc::now();
        let a = alert("play-task-4-abc-step-1", now);
        let b = alert("play-task-4-def-step-2", now);

        let (ra, rb) = tokio::join!(
            {
                let engine = engine.clone();
                let a = a.clone();
                tokio::spawn(async move { engine.check_and_record(&a).await })
            },
            {
                let engine = engine.clone();
                let b = b.clone();
                tokio::spawn(async move { engine.check_and_record(&b).await })
            }
        );
        let decisions = [ra.unwrap().unwrap(), rb.unwrap().unwrap()];
        assert_eq!(decisions.iter().filter(|d| d.is_new()).count(), 1);

        let records = engine.snapshot().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.suppressed_count, 1);
    }

    #[tokio::test]
    async fn test_new_again_after_window() {
        let engine = DedupEngine::in_memory(&DedupConfig::default());
        let t0 = Utc::now();
        assert!(engine
            .check_and_record(&alert("play-task-4-a", t0))
            .await
            .unwrap()
            .is_new());
        assert!(!engine
            .check_and_record(&alert("play-task-4-b", t0 + Duration::minutes(10)))
            .await
            .unwrap()
            .is_new());
        assert!(engine
            .check_and_record(&alert("play-task-4-c", t0 + Duration::minutes(31)))
            .await
            .unwrap()
            .is_new());
    }

    #[tokio::test]
    async fn test_active_remediation_suppresses_until_resolved() {
        let engine = DedupEngine::in_memory(&DedupConfig::default());
        let t0 = Utc::now();
        let first = alert("play-task-4-a", t0);
        engine.check_and_record(&first).await.unwrap();
        engine
            .attach_remediation(&first.dedup_key(), "heal-remediation-xyz", t0)
            .await
            .unwrap();

        let later = alert("play-task-4-b", t0 + Duration::hours(2));
        assert_eq!(
            engine.check_and_record(&later).await.unwrap(),
            Decision::Suppressed(SuppressReason::ActiveRemediation(
                "heal-remediation-xyz".into()
            ))
        );

        engine
            .resolve_remediation("heal-remediation-xyz")
            .await
            .unwrap();
        let after = alert("play-task-4-c", t0 + Duration::hours(3));
        assert!(engine.check_and_record(&after).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_different_kinds_do_not_suppress_each_other() {
        let engine = DedupEngine::in_memory(&DedupConfig::default());
        let now = Utc::now();
        let silent = alert("play-task-4-a", now);
        let timeout = Alert::new(AlertKind::StepTimeout, "play-task-4-a", "slow", now);
        assert!(engine.check_and_record(&silent).await.unwrap().is_new());
        assert!(engine.check_and_record(&timeout).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockDedupStore::new();
        store
            .expect_check_and_record()
            .returning(|_, _, _| Err(WatchdogError::StoreUnavailable("redis down".into())));
        let engine = DedupEngine::new(Arc::new(store), &DedupConfig::default());

        let err = engine
            .check_and_record(&alert("play-task-4-a", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::StoreUnavailable(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(DedupConfig { window_mins: 0 }.validate().is_err());
        assert!(DedupConfig::default().validate().is_ok());
    }
}
