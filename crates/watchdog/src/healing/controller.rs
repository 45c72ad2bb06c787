//! Self-healing loop controller.
//!
//! Per alert: `Monitoring -> AlertDetected -> DedupCheck`, then either
//! `Suppressed -> Monitoring` or
//! `FetchContext -> Escalate -> SpawnRemediation -> MonitorRemediation`.
//!
//! Events are handled one at a time so per-subject order is preserved. The
//! dedup check runs inline before any side effect; admitted cycles then run
//! concurrently and report back when they finish. Remediation resolves when a
//! terminal phase is observed for the task resource the spawner returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::collaborators::{
    GatheredContext, IssueTracker, LogSource, RemediationRequest, RemediationSpawner, TimeRange,
};
use super::spawner::SpawnerConfig;
use crate::alerts::{deviation_alert, Alert, AlertConfig, AlertRegistry, EvalContext};
use crate::config::check_minutes;
use crate::dedup::{Decision, DedupEngine, DedupKey, SuppressReason};
use crate::error::{Result, WatchdogError};
use crate::event::{is_terminal_phase, Event};
use crate::history::History;
use crate::stage::{StageState, StageTracker};

/// Loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Namespace remediation runs are created in
    pub namespace: String,
    /// Repository issues are filed against and remediations work on
    pub repository: String,
    pub fetch_timeout_secs: u64,
    pub spawn_timeout_secs: u64,
    /// Issue creation attempts before the cycle halts
    pub escalation_attempts: u32,
    /// Delay before the first retry, doubled on each further retry
    pub escalation_backoff_ms: u64,
    /// Minutes of logs gathered before the alert
    pub log_lookback_mins: u64,
    /// How often stage deviations are re-evaluated
    pub tick_interval_secs: u64,
    /// Directory with `issue.hbs` / `remediation.hbs` overrides
    pub templates_dir: Option<PathBuf>,
    pub remediation: SpawnerConfig,
    /// Spawned references are not attached to dedup keys, since dry-run
    /// remediations never reach a terminal phase. Only the window suppresses.
    pub dry_run: bool,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            namespace: "cto".into(),
            repository: "5dlabs/cto".into(),
            fetch_timeout_secs: 30,
            spawn_timeout_secs: 60,
            escalation_attempts: 3,
            escalation_backoff_ms: 500,
            log_lookback_mins: 10,
            tick_interval_secs: 60,
            templates_dir: None,
            remediation: SpawnerConfig::default(),
            dry_run: false,
        }
    }
}

impl HealingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.escalation_attempts == 0 {
            return Err(WatchdogError::Config(
                "healing.escalation_attempts must be at least 1".into(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(WatchdogError::Config(
                "healing.tick_interval_secs must be greater than zero".into(),
            ));
        }
        if self.fetch_timeout_secs == 0 || self.spawn_timeout_secs == 0 {
            return Err(WatchdogError::Config(
                "healing timeouts must be greater than zero".into(),
            ));
        }
        check_minutes("healing.log_lookback_mins", self.log_lookback_mins)
    }
}

/// Controller states, recorded in each cycle's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopState {
    Monitoring,
    AlertDetected,
    DedupCheck,
    Suppressed,
    FetchContext,
    Escalate,
    SpawnRemediation,
    MonitorRemediation,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Monitoring => "monitoring",
            Self::AlertDetected => "alert-detected",
            Self::DedupCheck => "dedup-check",
            Self::Suppressed => "suppressed",
            Self::FetchContext => "fetch-context",
            Self::Escalate => "escalate",
            Self::SpawnRemediation => "spawn-remediation",
            Self::MonitorRemediation => "monitor-remediation",
        };
        f.write_str(name)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Suppressed(SuppressReason),
    /// Dedup store could not be consulted; nothing was done
    StoreUnavailable(String),
    /// No audit record could be created; nothing was spawned
    EscalationFailed(String),
    /// Audit record created; this kind is not remediated automatically
    Escalated { issue: String },
    /// The key stays free so a later cycle can retry
    SpawnFailed { issue: String, error: String },
    RemediationSpawned {
        issue: String,
        remediation_ref: String,
    },
    /// Dry run: spawned but not attached, the key is only window-suppressed
    DryRun {
        issue: String,
        remediation_ref: String,
    },
    /// Another remediation got attached to the key first
    Conflict {
        issue: String,
        remediation_ref: String,
        existing: String,
    },
    AttachFailed {
        issue: String,
        remediation_ref: String,
        error: String,
    },
}

/// Result of one pass through the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub alert: Alert,
    pub key: DedupKey,
    pub trace: Vec<LoopState>,
    pub outcome: CycleOutcome,
}

/// An admitted alert waiting for its side effects.
#[derive(Debug, Clone)]
pub struct PendingCycle {
    pub alert: Alert,
    pub key: DedupKey,
    pub trace: Vec<LoopState>,
    /// Stage state of the alert's task at admission
    pub stage: Option<StageState>,
}

/// Outcome of the dedup boundary.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Finished without side effects
    Settled(CycleReport),
    /// New alert, continue with `CycleRunner::run`
    Remediate(PendingCycle),
}

/// External systems the loop talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub logs: Arc<dyn LogSource>,
    pub issues: Arc<dyn IssueTracker>,
    pub spawner: Arc<dyn RemediationSpawner>,
}

fn enter(trace: &mut Vec<LoopState>, key: &DedupKey, state: LoopState) {
    debug!(key = %key, state = %state, "Loop state");
    trace.push(state);
}

/// Runs the side-effecting part of a cycle. Cheap to clone.
#[derive(Clone)]
pub struct CycleRunner {
    dedup: DedupEngine,
    collaborators: Collaborators,
    config: HealingConfig,
}

impl CycleRunner {
    pub fn new(dedup: DedupEngine, collaborators: Collaborators, config: HealingConfig) -> Self {
        Self {
            dedup,
            collaborators,
            config,
        }
    }

    /// Fetch context, escalate, spawn and attach.
    pub async fn run(&self, pending: PendingCycle) -> CycleReport {
        let PendingCycle {
            alert,
            key,
            mut trace,
            stage,
        } = pending;

        enter(&mut trace, &key, LoopState::FetchContext);
        let context = self.fetch_context(&alert).await.with_stage(stage);

        enter(&mut trace, &key, LoopState::Escalate);
        let issue = match self.escalate(&alert, &context).await {
            Ok(issue) => issue,
            Err(e) => {
                error!(
                    key = %key,
                    subject = %alert.subject,
                    severity = ?alert.severity,
                    error = %format!("{e:#}"),
                    "Escalation failed, halting cycle without remediation"
                );
                enter(&mut trace, &key, LoopState::Monitoring);
                return report(alert, key, trace, CycleOutcome::EscalationFailed(format!("{e:#}")));
            }
        };

        if !alert.kind.spawns_remediation() {
            info!(key = %key, issue = %issue, "Escalated for review");
            enter(&mut trace, &key, LoopState::Monitoring);
            return report(alert, key, trace, CycleOutcome::Escalated { issue });
        }

        enter(&mut trace, &key, LoopState::SpawnRemediation);
        let remediation_ref = match self.spawn(&alert, context, &issue).await {
            Ok(reference) => reference,
            Err(error) => {
                warn!(key = %key, error = %error, "Remediation spawn failed, key left free");
                enter(&mut trace, &key, LoopState::Monitoring);
                return report(alert, key, trace, CycleOutcome::SpawnFailed { issue, error });
            }
        };

        if self.config.dry_run {
            info!(key = %key, remediation = %remediation_ref, "Dry run, remediation not attached");
            enter(&mut trace, &key, LoopState::Monitoring);
            return report(
                alert,
                key,
                trace,
                CycleOutcome::DryRun {
                    issue,
                    remediation_ref,
                },
            );
        }

        let outcome = match self
            .dedup
            .attach_remediation(&key, &remediation_ref, alert.detected_at)
            .await
        {
            Ok(()) => {
                enter(&mut trace, &key, LoopState::MonitorRemediation);
                CycleOutcome::RemediationSpawned {
                    issue,
                    remediation_ref,
                }
            }
            Err(WatchdogError::RemediationConflict { existing, .. }) => {
                warn!(
                    key = %key,
                    remediation = %remediation_ref,
                    existing = %existing,
                    "Key already owned by another remediation"
                );
                enter(&mut trace, &key, LoopState::Monitoring);
                CycleOutcome::Conflict {
                    issue,
                    remediation_ref,
                    existing,
                }
            }
            Err(e) => {
                error!(key = %key, remediation = %remediation_ref, error = %e, "Failed to attach remediation");
                enter(&mut trace, &key, LoopState::Monitoring);
                CycleOutcome::AttachFailed {
                    issue,
                    remediation_ref,
                    error: e.to_string(),
                }
            }
        };
        report(alert, key, trace, outcome)
    }

    /// Best-effort log retrieval, bounded by `fetch_timeout_secs`.
    async fn fetch_context(&self, alert: &Alert) -> GatheredContext {
        let range = TimeRange::lookback(alert.detected_at, self.config.log_lookback_mins);
        let secs = self.config.fetch_timeout_secs;

        match timeout(
            Duration::from_secs(secs),
            self.collaborators.logs.fetch(&alert.subject, range),
        )
        .await
        {
            Ok(Ok(logs)) => GatheredContext::available(logs),
            Ok(Err(e)) => {
                warn!(subject = %alert.subject, error = %format!("{e:#}"), "Log retrieval failed");
                GatheredContext::unavailable(format!("{e:#}"))
            }
            Err(_) => {
                let e = WatchdogError::Timeout {
                    operation: "log fetch",
                    secs,
                };
                warn!(subject = %alert.subject, error = %e, "Log retrieval failed");
                GatheredContext::unavailable(e.to_string())
            }
        }
    }

    /// Create the audit record, retrying with exponential backoff.
    async fn escalate(&self, alert: &Alert, context: &GatheredContext) -> anyhow::Result<String> {
        let attempts = self.config.escalation_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.escalation_backoff_ms);
        let mut attempt = 1;

        loop {
            match self.collaborators.issues.create(alert, context).await {
                Ok(issue) => return Ok(issue),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "Issue creation failed, retrying"
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("Issue creation failed after {attempt} attempts")))
                }
            }
        }
    }

    async fn spawn(
        &self,
        alert: &Alert,
        context: GatheredContext,
        issue: &str,
    ) -> std::result::Result<String, String> {
        let request = RemediationRequest::new(alert.clone(), context, issue.to_string());
        let secs = self.config.spawn_timeout_secs;

        match timeout(
            Duration::from_secs(secs),
            self.collaborators.spawner.spawn(&request),
        )
        .await
        {
            Ok(Ok(reference)) => Ok(reference),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(WatchdogError::Timeout {
                operation: "remediation spawn",
                secs,
            }
            .to_string()),
        }
    }
}

fn report(alert: Alert, key: DedupKey, trace: Vec<LoopState>, outcome: CycleOutcome) -> CycleReport {
    CycleReport {
        alert,
        key,
        trace,
        outcome,
    }
}

/// Event-driven controller tying detection, dedup and remediation together.
pub struct HealingLoop {
    registry: AlertRegistry,
    alert_config: AlertConfig,
    history: History,
    tracker: StageTracker,
    dedup: DedupEngine,
    runner: CycleRunner,
    tick_interval: Duration,
}

impl HealingLoop {
    pub fn new(
        registry: AlertRegistry,
        alert_config: AlertConfig,
        tracker: StageTracker,
        dedup: DedupEngine,
        collaborators: Collaborators,
        config: HealingConfig,
    ) -> Self {
        let tick_interval = Duration::from_secs(config.tick_interval_secs.max(1));
        Self {
            registry,
            alert_config,
            history: History::new(),
            tracker,
            runner: CycleRunner::new(dedup.clone(), collaborators, config),
            dedup,
            tick_interval,
        }
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Fold one event into history and stage state, evaluate handlers and
    /// run the dedup check for every alert raised.
    pub async fn handle_event(&mut self, event: &Event, now: DateTime<Utc>) -> Vec<Admission> {
        // Remediation runs are themselves excluded, so resolve first
        if let Event::TaskResourcePhaseChanged(resource) = event {
            if is_terminal_phase(&resource.phase) {
                if let Err(e) = self.dedup.resolve_remediation(&resource.subject.name).await {
                    error!(remediation = %resource.subject, error = %e, "Failed to resolve remediation");
                }
            }
        }

        if self.registry.is_excluded(event) {
            debug!(subject = %event.subject(), kind = event.variant_name(), "Skipping excluded subject");
            return vec![];
        }

        self.history.record(event);
        let mut findings = Vec::new();
        match event.task_id() {
            Some(task_id) if event.is_workflow_deletion() => self.forget_task(task_id),
            Some(task_id) => {
                findings = self.tracker.observe(event);
                findings.extend(self.tracker.evaluate_task(task_id, now));
            }
            None => {}
        }

        let ctx = EvalContext {
            now,
            history: &self.history,
            config: &self.alert_config,
            stage_findings: &findings,
        };
        let alerts = self.registry.evaluate(event, &ctx);

        let mut admissions = Vec::with_capacity(alerts.len());
        for alert in alerts {
            admissions.push(self.admit(alert).await);
        }
        admissions
    }

    fn forget_task(&mut self, task_id: &str) {
        self.tracker.forget(task_id);
        self.history.forget_task(task_id);
    }

    /// Periodic work: purge expired dedup records, drop finished tasks and
    /// re-evaluate stages.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<Admission> {
        if let Err(e) = self.dedup.purge_expired(now).await {
            warn!(error = %e, "Failed to purge dedup records");
        }
        for task_id in self.tracker.prune_finished(now) {
            self.history.forget_task(&task_id);
        }

        let findings = self.tracker.evaluate(now);
        let mut admissions = Vec::new();
        for finding in findings {
            if self.registry.exclusions().is_excluded_name(finding.subject()) {
                continue;
            }
            admissions.push(self.admit(deviation_alert(&finding, now)).await);
        }
        admissions
    }

    /// The dedup boundary. Completes before any side effect.
    pub async fn admit(&self, alert: Alert) -> Admission {
        let key = alert.dedup_key();
        let mut trace = Vec::new();
        enter(&mut trace, &key, LoopState::AlertDetected);
        enter(&mut trace, &key, LoopState::DedupCheck);

        match self.dedup.check_and_record(&alert).await {
            Ok(Decision::New) => {
                let stage = alert
                    .task_id
                    .as_deref()
                    .and_then(|t| self.tracker.state(t))
                    .cloned();
                Admission::Remediate(PendingCycle {
                    alert,
                    key,
                    trace,
                    stage,
                })
            }
            Ok(Decision::Suppressed(reason)) => {
                enter(&mut trace, &key, LoopState::Suppressed);
                enter(&mut trace, &key, LoopState::Monitoring);
                Admission::Settled(report(alert, key, trace, CycleOutcome::Suppressed(reason)))
            }
            Err(e) => {
                error!(
                    key = %key,
                    subject = %alert.subject,
                    message = %alert.message,
                    error = %e,
                    "Dedup store unavailable, not remediating"
                );
                enter(&mut trace, &key, LoopState::Monitoring);
                Admission::Settled(report(
                    alert,
                    key,
                    trace,
                    CycleOutcome::StoreUnavailable(e.to_string()),
                ))
            }
        }
    }

    /// Apply a finished cycle's result to loop state.
    pub fn complete(&mut self, report: &CycleReport) {
        if let CycleOutcome::RemediationSpawned { remediation_ref, .. } = &report.outcome {
            if let Some(task_id) = report.alert.task_id.as_deref() {
                self.tracker.mark_remediation(task_id);
            }
            info!(key = %report.key, remediation = %remediation_ref, "Monitoring remediation");
        } else {
            debug!(key = %report.key, outcome = ?report.outcome, "Cycle finished");
        }
    }

    /// Handle an event and run any admitted cycles inline.
    pub async fn process(&mut self, event: &Event, now: DateTime<Utc>) -> Vec<CycleReport> {
        let admissions = self.handle_event(event, now).await;
        self.settle(admissions).await
    }

    /// Tick and run any admitted cycles inline.
    pub async fn process_tick(&mut self, now: DateTime<Utc>) -> Vec<CycleReport> {
        let admissions = self.tick(now).await;
        self.settle(admissions).await
    }

    async fn settle(&mut self, admissions: Vec<Admission>) -> Vec<CycleReport> {
        let mut reports = Vec::with_capacity(admissions.len());
        for admission in admissions {
            let report = match admission {
                Admission::Settled(report) => report,
                Admission::Remediate(pending) => self.runner.run(pending).await,
            };
            self.complete(&report);
            reports.push(report);
        }
        reports
    }

    fn dispatch(&mut self, admissions: Vec<Admission>, cycles: &mut JoinSet<CycleReport>) {
        for admission in admissions {
            match admission {
                Admission::Settled(report) => self.complete(&report),
                Admission::Remediate(pending) => {
                    let runner = self.runner.clone();
                    cycles.spawn(async move { runner.run(pending).await });
                }
            }
        }
    }

    /// Run until the event channel closes, then wait for in-flight cycles.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let mut cycles = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_secs = self.tick_interval.as_secs(), "Healing loop started");

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        info!("Event stream closed");
                        break;
                    };
                    let admissions = self.handle_event(&event, Utc::now()).await;
                    self.dispatch(admissions, &mut cycles);
                }
                _ = ticker.tick() => {
                    let admissions = self.tick(Utc::now()).await;
                    self.dispatch(admissions, &mut cycles);
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => match joined {
                    Ok(report) => self.complete(&report),
                    Err(e) => error!(error = %e, "Healing cycle panicked"),
                },
            }
        }

        while let Some(joined) = cycles.join_next().await {
            match joined {
                Ok(report) => self.complete(&report),
                Err(e) => error!(error = %e, "Healing cycle panicked"),
            }
        }
        info!("Healing loop stopped");
    }
}
