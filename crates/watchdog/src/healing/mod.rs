//! Self-healing loop.
//!
//! The controller admits alerts through the dedup engine, then gathers logs,
//! files an audit issue and spawns a remediation run. All blocking I/O lives
//! here, behind the collaborator traits.

pub mod collaborators;
pub mod controller;
pub mod dry_run;
pub mod issues;
pub mod loki;
pub mod redact;
pub mod spawner;
pub mod templates;

pub use collaborators::{
    CorrelationLabels, GatheredContext, IssueTracker, LogSource, RemediationRequest,
    RemediationSpawner, TimeRange, CONTEXT_UNAVAILABLE,
};
pub use controller::{
    Admission, Collaborators, CycleOutcome, CycleReport, CycleRunner, HealingConfig, HealingLoop,
    LoopState, PendingCycle,
};
pub use dry_run::{DryRunIssueTracker, DryRunSpawner};
pub use issues::GhIssueTracker;
pub use loki::{LokiConfig, LokiLogSource};
pub use redact::redact_secrets;
pub use spawner::{KubectlSpawner, SpawnerConfig};
pub use templates::{issue_title, BriefRenderer};
