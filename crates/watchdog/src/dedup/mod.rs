//! Alert deduplication.
//!
//! Alerts are keyed by `(workflow_family, alert_kind)`. A key is suppressed
//! while a remediation for it is active, or while it falls within the dedup
//! window of its last admission. Deduplication is scoped by workflow family:
//! pods from the same workflow (e.g. `play-task-4-*`) group together, pods from
//! different workflows (`atlas-*` vs `play-*`) are treated separately.

mod engine;
mod family;
mod record;
mod store;

pub use engine::{DedupConfig, DedupEngine, DEFAULT_DEDUP_WINDOW_MINS};
pub use family::{extract_workflow_family, sanitize_label_value};
pub use record::{Decision, DedupKey, DedupRecord, SuppressReason};
pub use store::{DedupStore, InMemoryDedupStore};

#[cfg(test)]
pub use store::MockDedupStore;
