//! Self-healing operations watchdog.
//!
//! Watches a multi-agent pipeline running as workflows, pods and task
//! resources, detects failure conditions, deduplicates them by workflow
//! family and drives a bounded remediation loop: gather context, file an
//! audit issue, spawn a remediation run and wait for it to finish.
//!
//! ```text
//! Event -> AlertRegistry -> DedupEngine -> HealingLoop -> issue + CodeRun
//!              ^
//!         StageTracker
//! ```

pub mod alerts;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod healing;
pub mod history;
pub mod normalize;
pub mod poller;
pub mod stage;

pub use alerts::{Alert, AlertHandler, AlertKind, AlertRegistry, ExclusionConfig, Severity};
pub use config::WatchdogConfig;
pub use dedup::{extract_workflow_family, Decision, DedupEngine, DedupKey};
pub use error::{Result, WatchdogError};
pub use event::Event;
pub use healing::{HealingConfig, HealingLoop};
pub use stage::{StageSequence, StageTracker};
