//! Raw payload normalization.
//!
//! Turns `kubectl get -w -o json --output-watch-events` lines (pods, Argo
//! workflows, CodeRuns) and `gh pr view --json` output into [`Event`]s.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Result, WatchdogError};
use crate::event::{
    Check, CheckConclusion, Comment, Commit, ContainerState, ContainerStatus, Event,
    ExternalStatus, PodCondition, PodEvent, Review, ReviewState, SubjectRef, TaskResourceEvent,
    WorkflowEvent, DELETED_PHASE, TASK_ID_LABEL,
};

/// Workflow label carrying the pipeline stage
pub const STAGE_LABEL: &str = "current-stage";

/// Fields requested from `gh pr view --json`
pub const PR_VIEW_FIELDS: &str =
    "number,comments,commits,statusCheckRollup,reviews,mergeable,mergeStateStatus";

/// Parse one watch line. `Ok(None)` for pod deletions.
pub fn parse_watch_line(line: &str, observed_at: DateTime<Utc>) -> Result<Option<Event>> {
    let json: Value = serde_json::from_str(line)
        .map_err(|e| WatchdogError::MalformedEvent(format!("invalid JSON: {e}")))?;
    parse_watch_event(&json, observed_at)
}

/// Parse a watch envelope (`{"type": ..., "object": ...}`) or a bare object.
///
/// Deleted workflows and CodeRuns come back with the `Deleted` phase so
/// tracking and active remediations end with them. Deleted pods are dropped.
pub fn parse_watch_event(json: &Value, observed_at: DateTime<Utc>) -> Result<Option<Event>> {
    let (event_type, object) = match json.get("object") {
        Some(object) => (json["type"].as_str().unwrap_or("MODIFIED"), object),
        None => ("MODIFIED", json),
    };
    let deleted = event_type == "DELETED";

    let kind = object["kind"].as_str().unwrap_or_default();
    let event = match kind {
        "Pod" if deleted => return Ok(None),
        "Pod" => Event::PodStateChanged(parse_pod(object, observed_at)?),
        "Workflow" => {
            let mut workflow = parse_workflow(object, observed_at)?;
            if deleted {
                workflow.phase = DELETED_PHASE.to_string();
                workflow.stage = None;
            }
            Event::WorkflowPhaseChanged(workflow)
        }
        "CodeRun" => {
            let mut resource = parse_coderun(object, observed_at)?;
            if deleted {
                resource.phase = DELETED_PHASE.to_string();
            }
            Event::TaskResourcePhaseChanged(resource)
        }
        "" => return Err(WatchdogError::MalformedEvent("object has no kind".into())),
        other => {
            return Err(WatchdogError::MalformedEvent(format!(
                "unsupported kind: {other}"
            )))
        }
    };
    Ok(Some(event))
}

fn subject(json: &Value) -> Result<SubjectRef> {
    let name = json["metadata"]["name"]
        .as_str()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| WatchdogError::MalformedEvent("object has no metadata.name".into()))?;
    let namespace = json["metadata"]["namespace"].as_str().unwrap_or("default");
    Ok(SubjectRef::new(namespace, name))
}

fn labels(json: &Value) -> HashMap<String, String> {
    json["metadata"]["labels"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_pod(json: &Value, observed_at: DateTime<Utc>) -> Result<PodEvent> {
    let container_statuses = json["status"]["containerStatuses"]
        .as_array()
        .map(|statuses| statuses.iter().map(parse_container_status).collect())
        .unwrap_or_default();

    let conditions = json["status"]["conditions"]
        .as_array()
        .map(|conds| {
            conds
                .iter()
                .map(|cond| PodCondition {
                    condition_type: cond["type"].as_str().unwrap_or("").to_string(),
                    status: cond["status"].as_str().unwrap_or("Unknown").to_string(),
                    reason: cond["reason"].as_str().map(String::from),
                    message: cond["message"].as_str().map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PodEvent {
        subject: subject(json)?,
        observed_at,
        phase: json["status"]["phase"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
        labels: labels(json),
        conditions,
        container_statuses,
        started_at: timestamp(&json["status"]["startTime"]),
    })
}

fn parse_container_status(status: &Value) -> ContainerStatus {
    let state = &status["state"];
    let state = if state["terminated"].is_object() {
        let terminated = &state["terminated"];
        ContainerState::Terminated {
            exit_code: terminated["exitCode"].as_i64().unwrap_or(0) as i32,
            reason: terminated["reason"].as_str().map(String::from),
            finished_at: timestamp(&terminated["finishedAt"]),
        }
    } else if state["running"].is_object() {
        ContainerState::Running {
            started_at: timestamp(&state["running"]["startedAt"]),
        }
    } else {
        ContainerState::Waiting {
            reason: state["waiting"]["reason"].as_str().map(String::from),
        }
    };

    ContainerStatus {
        name: status["name"].as_str().unwrap_or("").to_string(),
        ready: status["ready"].as_bool().unwrap_or(false),
        state,
        restart_count: status["restartCount"].as_i64().unwrap_or(0) as i32,
    }
}

fn parse_workflow(json: &Value, observed_at: DateTime<Utc>) -> Result<WorkflowEvent> {
    let labels = labels(json);
    Ok(WorkflowEvent {
        subject: subject(json)?,
        observed_at,
        phase: json["status"]["phase"]
            .as_str()
            .unwrap_or("Pending")
            .to_string(),
        message: json["status"]["message"].as_str().map(String::from),
        stage: labels.get(STAGE_LABEL).cloned(),
        labels,
        started_at: timestamp(&json["status"]["startedAt"]),
    })
}

fn parse_coderun(json: &Value, observed_at: DateTime<Utc>) -> Result<TaskResourceEvent> {
    let labels = labels(json);
    let task_id = json["spec"]["taskId"]
        .as_str()
        .map(String::from)
        .or_else(|| json["spec"]["taskId"].as_i64().map(|n| n.to_string()))
        .or_else(|| labels.get(TASK_ID_LABEL).cloned())
        .filter(|t| !t.is_empty());

    Ok(TaskResourceEvent {
        subject: subject(json)?,
        observed_at,
        phase: json["status"]["phase"]
            .as_str()
            .unwrap_or("Pending")
            .to_string(),
        message: json["status"]["message"].as_str().map(String::from),
        agent: json["spec"]["githubApp"].as_str().unwrap_or("").to_string(),
        task_id,
        labels,
    })
}

/// Parse `gh pr view --json <PR_VIEW_FIELDS>` output for a task.
pub fn parse_pr_status(
    json: &Value,
    repository: &str,
    task_id: &str,
    observed_at: DateTime<Utc>,
) -> Result<ExternalStatus> {
    let Some(number) = json["number"].as_u64() else {
        return Err(WatchdogError::MalformedEvent("PR has no number".into()));
    };

    let items = |field: &str| json[field].as_array().cloned().unwrap_or_default();

    let comments = items("comments")
        .iter()
        .filter_map(|c| {
            Some(Comment {
                author: c["author"]["login"].as_str()?.to_string(),
                body: c["body"].as_str().unwrap_or("").to_string(),
                created_at: timestamp(&c["createdAt"])?,
            })
        })
        .collect();

    let commits = items("commits")
        .iter()
        .filter_map(|c| {
            Some(Commit {
                sha: c["oid"].as_str()?.to_string(),
                message: c["messageHeadline"].as_str().unwrap_or("").to_string(),
                committed_at: timestamp(&c["committedDate"])?,
            })
        })
        .collect();

    let checks = items("statusCheckRollup")
        .iter()
        .filter_map(|c| {
            Some(Check {
                name: c["name"].as_str().or_else(|| c["context"].as_str())?.to_string(),
                conclusion: check_conclusion(
                    c["conclusion"].as_str().or_else(|| c["state"].as_str()),
                ),
                completed_at: timestamp(&c["completedAt"]),
            })
        })
        .collect();

    let reviews = items("reviews")
        .iter()
        .filter_map(|r| {
            Some(Review {
                author: r["author"]["login"].as_str()?.to_string(),
                state: review_state(r["state"].as_str()?),
                submitted_at: timestamp(&r["submittedAt"]),
            })
        })
        .collect();

    let mergeable = match json["mergeable"].as_str() {
        Some("MERGEABLE") => Some(true),
        Some("CONFLICTING") => Some(false),
        _ => None,
    };

    Ok(ExternalStatus {
        subject: SubjectRef::new(repository, format!("pr-{number}")),
        observed_at,
        task_id: Some(task_id.to_string()).filter(|t| !t.is_empty()),
        repository: repository.to_string(),
        pr_number: u32::try_from(number).ok(),
        comments,
        commits,
        checks,
        reviews,
        mergeable,
        merge_state_status: json["mergeStateStatus"].as_str().map(String::from),
    })
}

fn check_conclusion(value: Option<&str>) -> CheckConclusion {
    match value.map(str::to_ascii_uppercase).as_deref() {
        Some("SUCCESS" | "NEUTRAL") => CheckConclusion::Success,
        Some("FAILURE" | "ERROR" | "TIMED_OUT" | "ACTION_REQUIRED" | "STARTUP_FAILURE") => {
            CheckConclusion::Failure
        }
        Some("CANCELLED") => CheckConclusion::Cancelled,
        Some("SKIPPED") => CheckConclusion::Skipped,
        _ => CheckConclusion::Pending,
    }
}

fn review_state(value: &str) -> ReviewState {
    match value {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "COMMENTED" => ReviewState::Commented,
        "DISMISSED" => ReviewState::Dismissed,
        _ => ReviewState::Pending,
    }
}
