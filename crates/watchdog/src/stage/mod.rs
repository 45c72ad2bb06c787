//! Workflow stage tracking.
//!
//! Tracks each task's position in the pipeline against an expected stage
//! sequence and classifies deviations (timeout, invalid transition, stuck).
//! Findings are converted into alerts by the stage deviation handler.

mod sequence;
mod tracker;

pub use sequence::{StageDef, StageSequence, DEFAULT_STAGE_TIMEOUT_MINS};
pub use tracker::{StageDeviation, StageState, StageTracker};
