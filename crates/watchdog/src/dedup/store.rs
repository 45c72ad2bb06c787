//! Dedup record storage.
//!
//! The store is the only shared mutable state in the core. Every operation is
//! atomic per key: two racing `check_and_record` calls for the same key see
//! one `New` and one `Suppressed`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::record::{Decision, DedupKey, DedupRecord};
use crate::error::{Result, WatchdogError};

/// Backing store for dedup records.
///
/// Implementations must make `check_and_record` linearizable per key
/// (a lock, a compare-and-set, or a single writer). Any failure to reach the
/// store is reported as `WatchdogError::StoreUnavailable`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Look up, decide and update in one atomic step.
    async fn check_and_record(
        &self,
        key: &DedupKey,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<Decision>;

    /// Mark a spawned remediation as active for `key`.
    async fn attach_remediation(
        &self,
        key: &DedupKey,
        remediation_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Clear the record holding `remediation_ref`, returning its key.
    async fn resolve_remediation(&self, remediation_ref: &str) -> Result<Option<DedupKey>>;

    /// Drop expired records, returning how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>, window: Duration) -> Result<usize>;

    async fn get(&self, key: &DedupKey) -> Result<Option<DedupRecord>>;

    async fn snapshot(&self) -> Result<Vec<(DedupKey, DedupRecord)>>;
}

/// Process-local store. One mutex guards the whole map, which serializes
/// every key.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<DedupKey, DedupRecord>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn check_and_record(
        &self,
        key: &DedupKey,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Result<Decision> {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) => Ok(record.observe(at, window)),
            None => {
                records.insert(key.clone(), DedupRecord::new(at));
                Ok(Decision::New)
            }
        }
    }

    async fn attach_remediation(
        &self,
        key: &DedupKey,
        remediation_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| DedupRecord::new(at));

        match &record.active_remediation_ref {
            Some(existing) if existing != remediation_ref => {
                Err(WatchdogError::RemediationConflict {
                    key: key.to_string(),
                    existing: existing.clone(),
                })
            }
            _ => {
                record.active_remediation_ref = Some(remediation_ref.to_string());
                Ok(())
            }
        }
    }

    async fn resolve_remediation(&self, remediation_ref: &str) -> Result<Option<DedupKey>> {
        let mut records = self.records.lock().await;
        let found = records
            .iter_mut()
            .find(|(_, r)| r.active_remediation_ref.as_deref() == Some(remediation_ref));

        Ok(found.map(|(key, record)| {
            record.active_remediation_ref = None;
            key.clone()
        }))
    }

    async fn purge_expired(&self, now: DateTime<Utc>, window: Duration) -> Result<usize> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now, window));
        Ok(before - records.len())
    }

    async fn get(&self, key: &DedupKey) -> Result<Option<DedupRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn snapshot(&self) -> Result<Vec<(DedupKey, DedupRecord)>> {
        let records = self.records.lock().await;
        let mut entries: Vec<_> = records
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
