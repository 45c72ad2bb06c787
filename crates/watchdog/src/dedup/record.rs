//! Dedup keys, records and decisions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::AlertKind;

/// Identity used for suppression: one key per workflow family and alert kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub workflow_family: String,
    pub alert_kind: AlertKind,
}

impl DedupKey {
    pub fn new(workflow_family: impl Into<String>, alert_kind: AlertKind) -> Self {
        Self {
            workflow_family: workflow_family.into(),
            alert_kind,
        }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_family, self.alert_kind)
    }
}

/// Stored state for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Last time an alert for this key was admitted as new
    pub last_admitted_at: DateTime<Utc>,
    pub suppressed_count: u64,
    /// Spawned remediation that has not resolved yet
    pub active_remediation_ref: Option<String>,
}

impl DedupRecord {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            first_seen_at: at,
            last_seen_at: at,
            last_admitted_at: at,
            suppressed_count: 0,
            active_remediation_ref: None,
        }
    }

    /// Apply one sighting at `at` and decide.
    ///
    /// Active remediation suppresses unconditionally. Otherwise the sighting
    /// is suppressed while it falls within `window` of the last admission.
    pub fn observe(&mut self, at: DateTime<Utc>, window: Duration) -> Decision {
        if at > self.last_seen_at {
            self.last_seen_at = at;
        }

        if let Some(reference) = &self.active_remediation_ref {
            self.suppressed_count += 1;
            return Decision::Suppressed(SuppressReason::ActiveRemediation(reference.clone()));
        }

        if at - self.last_admitted_at < window {
            self.suppressed_count += 1;
            return Decision::Suppressed(SuppressReason::WithinWindow);
        }

        self.last_admitted_at = at;
        Decision::New
    }

    /// No matching alert within `window` and no active remediation.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.active_remediation_ref.is_none() && now - self.last_seen_at >= window
    }
}

/// Why an alert was suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Remediation with this reference is still running
    ActiveRemediation(String),
    /// Already admitted within the dedup window
    WithinWindow,
}

/// Outcome of `check_and_record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    New,
    Suppressed(SuppressReason),
}

impl Decision {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_anchored_at_admission() {
        let t0 = Utc::now();
        let window = Duration::minutes(30);
        let mut record = DedupRecord::new(t0);

        // Frequent repeats do not extend suppression forever
        for m in [10, 20, 29] {
            assert_eq!(
                record.observe(t0 + Duration::minutes(m), window),
                Decision::Suppressed(SuppressReason::WithinWindow)
            );
        }
        assert_eq!(record.observe(t0 + Duration::minutes(30), window), Decision::New);
        assert_eq!(record.suppressed_count, 3);
        assert_eq!(record.last_admitted_at, t0 + Duration::minutes(30));
    }

    #[test]
    fn test_active_remediation_suppresses_past_window() {
        let t0 = Utc::now();
        let mut record = DedupRecord::new(t0);
        record.active_remediation_ref = Some("heal-remediation-a2-xyz".into());

        assert_eq!(
            record.observe(t0 + Duration::hours(5), Duration::minutes(30)),
            Decision::Suppressed(SuppressReason::ActiveRemediation(
                "heal-remediation-a2-xyz".into()
            ))
        );
        assert!(!record.is_expired(t0 + Duration::hours(10), Duration::minutes(30)));
    }

    #[test]
    fn test_out_of_order_sighting_is_suppressed() {
        let t0 = Utc::now();
        let mut record = DedupRecord::new(t0);
        let decision = record.observe(t0 - Duration::seconds(1), Duration::minutes(30));
        assert!(!decision.is_new());
        assert_eq!(record.last_seen_at, t0);
    }

    #[test]
    fn test_expiry() {
        let t0 = Utc::now();
        let record = DedupRecord::new(t0);
        let window = Duration::minutes(30);
        assert!(!record.is_expired(t0 + Duration::minutes(29), window));
        assert!(record.is_expired(t0 + Duration::minutes(30), window));
    }
}
