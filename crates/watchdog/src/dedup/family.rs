//! Workflow family extraction.
//!
//! Subject names carry run-specific suffixes (random hashes, step ordinals).
//! The family keeps only the leading segments that name the logical
//! workflow, so every alert about one run groups under one key.

/// Leading segments kept for names starting with `prefix`.
struct FamilyRule {
    prefix: &'static str,
    segments: usize,
}

/// Checked in order; first matching prefix wins.
const FAMILY_RULES: &[FamilyRule] = &[
    // play-task-N-* -> play-task-N
    FamilyRule {
        prefix: "play-task-",
        segments: 3,
    },
    // heal-remediation-* -> heal-remediation
    FamilyRule {
        prefix: "heal-remediation-",
        segments: 2,
    },
    FamilyRule {
        prefix: "healer-remediation-",
        segments: 2,
    },
    // atlas-conflict-monitor-* -> atlas-conflict-monitor
    FamilyRule {
        prefix: "atlas-conflict-",
        segments: 3,
    },
    // atlas-batch-integration-* -> atlas-batch-integration
    FamilyRule {
        prefix: "atlas-batch-",
        segments: 3,
    },
    // atlas-guardian-* -> atlas-guardian
    FamilyRule {
        prefix: "atlas-",
        segments: 2,
    },
];

/// Segments kept when no rule matches (cto-tools, cto-controller, ...)
const DEFAULT_SEGMENTS: usize = 2;

fn keep_segments(name: &str, segments: usize) -> String {
    name.split('-').take(segments).collect::<Vec<_>>().join("-")
}

/// Extract the workflow family from a subject name.
///
/// Examples:
/// - `play-task-4-abc-step-123` -> `play-task-4`
/// - `atlas-conflict-monitor-xyz` -> `atlas-conflict-monitor`
/// - `heal-remediation-task1-a7-abc` -> `heal-remediation`
/// - `cto-tools-67db5dff7-hn8xh` -> `cto-tools`
///
/// Idempotent: the family of a family is itself.
pub fn extract_workflow_family(name: &str) -> String {
    let segments = FAMILY_RULES
        .iter()
        .find(|rule| name.starts_with(rule.prefix))
        .map_or(DEFAULT_SEGMENTS, |rule| rule.segments);
    keep_segments(name, segments)
}

/// Sanitize a value for use as a Kubernetes label value.
/// Label values must be <= 63 chars, alphanumeric with hyphens/underscores/dots.
pub fn sanitize_label_value(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(63)
        .collect();

    sanitized
        .trim_start_matches(['-', '.', '_'])
        .trim_end_matches(['-', '.', '_'])
        .to_string()
}
