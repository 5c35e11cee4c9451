//! Build orchestrator: the sequential control loop of one build session.
//!
//! ```text
//! pre-flight ─▶ loop {
//!     limits (iterations, wall clock)
//!     ensure sessions
//!     reserve cost ─▶ generate ─▶ settle cost
//!        │ failure: classify ─▶ error log ─▶ escalation
//!     validate
//!        │ failure: classify ─▶ error log ─▶ escalation
//!     fitness ─▶ success / rollback check
//!     checkpoint every K iterations
//! } ─▶ terminal: checkpoint, history, notification, publish, report
//! ```
//!
//! No external call starts once the wall-clock deadline has passed. Tracker
//! updates go through a background task so a slow ticketing endpoint never
//! holds up the loop.
//!
//! Every collaborator is injected, so tests drive the loop with in-memory
//! fakes and paused time.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordination::{
    ArtifactRef, BuildSession, BuildStatus, Checkpoint, CheckpointStore, ErrorClassifier,
    ErrorLog, ErrorRecord, EscalationEngine, EscalationState, FitnessRecord, FitnessTracker,
    HealthMonitor, HealthReport, LadderStatus, ProbeTarget, Reservation, SessionEvent,
    SessionManager, Transition,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::config::BuildConfig;
use crate::errors::OrchestrationError;
use crate::generator::{GenerationBackend, GenerationRequest};
use crate::notify::Notifier;
use crate::telemetry::{append_history, BuildHistoryEntry};
use crate::tracker_bridge::{StatusTracker, StatusUpdate};
use crate::validator::Validator;
use crate::vcs_bridge::Publisher;

/// Error records included in the final report.
pub const REPORT_ERROR_TAIL: usize = 5;

/// Loop limits and switches, lifted out of [`BuildConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub wall_clock_timeout: Duration,
    pub per_call_timeout: Duration,
    pub cost_ceiling: f64,
    pub checkpoint_interval: u32,
    pub target_score: f64,
    pub skip_preflight: bool,
    pub publish: bool,
    /// Endpoints whose sessions are checked at the top of each iteration
    pub session_endpoints: Vec<String>,
    pub probe_targets: Vec<ProbeTarget>,
    pub workdir: PathBuf,
    pub history_path: PathBuf,
}

impl LoopSettings {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            wall_clock_timeout: config.wall_clock_timeout(),
            per_call_timeout: config.per_call_timeout(),
            cost_ceiling: config.cost_ceiling,
            checkpoint_interval: config.checkpoint_interval.max(1),
            target_score: config.target_score,
            skip_preflight: config.skip_preflight,
            publish: config.publish,
            session_endpoints: vec![config.backtest_endpoint.clone()],
            probe_targets: config.probe_targets(),
            workdir: config.workdir.clone(),
            history_path: config.history_path(),
        }
    }
}

/// Everything the loop talks to.
pub struct Collaborators {
    pub generator: Arc<dyn GenerationBackend>,
    pub validator: Arc<dyn Validator>,
    pub health: HealthMonitor,
    pub sessions: Arc<SessionManager>,
    pub session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: ArtifactStore,
    pub tracker: Arc<dyn StatusTracker>,
    pub notifier: Arc<dyn Notifier>,
    pub publisher: Option<Arc<dyn Publisher>>,
}

/// Structured summary emitted on every terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub session_id: Uuid,
    pub branch: String,
    pub status: BuildStatus,
    pub reason: Option<String>,
    pub iterations: u32,
    pub cost: f64,
    pub cost_ceiling: f64,
    pub tier: usize,
    pub backend: String,
    pub best: Option<FitnessRecord>,
    pub error_tail: Vec<ErrorRecord>,
    pub escalations: usize,
    pub rollbacks: u32,
    pub pr_url: Option<String>,
    pub duration_secs: f64,
}

impl BuildReport {
    /// One line for chat and ticket updates.
    pub fn headline(&self) -> String {
        let best = self
            .best
            .as_ref()
            .map(|b| format!("{:.4}", b.score))
            .unwrap_or_else(|| "none".into());
        let mut line = format!(
            "Strategy build {} {}: {} iterations, ${:.2} of ${:.2}, best score {}, tier {} ({})",
            self.branch,
            self.status,
            self.iterations,
            self.cost,
            self.cost_ceiling,
            best,
            self.tier,
            self.backend
        );
        if let Some(reason) = &self.reason {
            line.push_str(&format!(" [{reason}]"));
        }
        if let Some(url) = &self.pr_url {
            line.push_str(&format!(" {url}"));
        }
        line
    }
}

/// Mutable control-loop state; exactly what a checkpoint captures.
struct LoopState {
    session: BuildSession,
    escalation: EscalationState,
    fitness: FitnessTracker,
    errors: ErrorLog,
    working: Option<ArtifactRef>,
    directive: Option<String>,
    last_error: Option<String>,
    rollbacks: u32,
}

impl LoopState {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.session.clone(),
            self.escalation.clone(),
            self.fitness.clone(),
            self.errors.clone(),
            self.working.clone(),
            self.directive.clone(),
        )
    }
}

pub struct BuildOrchestrator {
    settings: LoopSettings,
    engine: EscalationEngine,
    classifier: ErrorClassifier,
    collab: Collaborators,
    updates: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl BuildOrchestrator {
    pub fn new(config: &BuildConfig, collab: Collaborators) -> Result<Self, OrchestrationError> {
        let engine =
            EscalationEngine::with_config(config.backend_ladder(), config.escalation_config())?;
        Ok(Self {
            settings: LoopSettings::from_config(config),
            engine,
            classifier: ErrorClassifier::with_threshold(config.similarity_threshold),
            collab,
            updates: None,
        })
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Probe every endpoint. `Err` when a critical endpoint is down.
    pub async fn preflight(&self) -> Result<HealthReport, OrchestrationError> {
        let report = self
            .collab
            .health
            .check_all(&self.settings.probe_targets)
            .await;
        for outcome in &report.outcomes {
            if outcome.is_reduced_confidence() {
                warn!(
                    endpoint = %outcome.endpoint,
                    confidence = outcome.confidence,
                    "Endpoint healthy via fallback probe"
                );
            }
        }
        let blocking: Vec<&str> = report
            .blocking()
            .into_iter()
            .map(|o| o.endpoint.as_str())
            .collect();
        if !blocking.is_empty() {
            return Err(OrchestrationError::Unrecoverable(format!(
                "pre-flight failed: critical endpoints down: {}",
                blocking.join(", ")
            )));
        }
        info!(endpoints = report.outcomes.len(), "Pre-flight passed");
        Ok(report)
    }

    /// Run a build to a terminal state, optionally resuming a checkpoint.
    pub async fn run(
        &mut self,
        spec: &str,
        resume: Option<Checkpoint>,
    ) -> Result<BuildReport, OrchestrationError> {
        if let Some(cp) = &resume {
            if cp.session.status.is_terminal() {
                info!(
                    session = %cp.session.id,
                    status = %cp.session.status,
                    "Checkpoint is already terminal"
                );
                let state = self.resume_state(cp.clone());
                return Ok(self.report(&state, None, Duration::ZERO));
            }
        }

        let started = Instant::now();
        let (updates, update_task) =
            spawn_status_updates(self.collab.tracker.clone(), self.settings.per_call_timeout);
        self.updates = Some(updates);

        let report = match self.gate().await {
            Ok(()) => self.run_loop(spec, resume, started).await,
            Err(message) => {
                let mut state = match resume {
                    Some(cp) => self.resume_state(cp),
                    None => self.fresh_state(),
                };
                self.engine.mark_unrecoverable(&mut state.escalation, message);
                self.finish(state, started.elapsed()).await
            }
        };

        self.updates = None;
        self.stop_status_updates(update_task).await;
        Ok(report)
    }

    /// Pre-flight unless skipped; `Err` carries the reason the build cannot start.
    async fn gate(&self) -> Result<(), String> {
        if self.settings.skip_preflight {
            info!("Skipping pre-flight health checks");
            return Ok(());
        }
        match self.preflight().await {
            Ok(_) => Ok(()),
            Err(OrchestrationError::Unrecoverable(message)) => {
                error!("{message}");
                Err(message)
            }
            Err(other) => {
                error!("{other}");
                Err(other.to_string())
            }
        }
    }

    async fn run_loop(
        &mut self,
        spec: &str,
        resume: Option<Checkpoint>,
        started: Instant,
    ) -> BuildReport {
        let mut state = match resume {
            Some(cp) => self.resume_state(cp),
            None => self.fresh_state(),
        };
        if let Some(working) = state.working.clone() {
            if let Err(e) = self
                .collab
                .artifacts
                .restore(&working, &self.settings.workdir)
            {
                warn!("Could not restore working artifact on resume: {e:#}");
            }
        }

        info!(
            session = %state.session.id,
            branch = %state.session.branch,
            iteration = state.session.iteration,
            tier = state.escalation.tier,
            cost = state.escalation.total_cost,
            budget = state.escalation.remaining_budget(),
            "Build session starting"
        );

        let cancel = CancellationToken::new();
        let refresh = self.collab.sessions.clone().spawn_refresh(cancel.clone());
        let deadline = Instant::now() + self.settings.wall_clock_timeout;

        self.drive(spec, &mut state, deadline).await;

        cancel.cancel();
        if let Err(e) = refresh.await {
            warn!("Session refresh task ended abnormally: {e}");
        }
        self.drain_session_events(&state);

        self.finish(state, started.elapsed()).await
    }

    /// Give queued tracker updates one call timeout to flush, then drop them.
    async fn stop_status_updates(&self, mut task: JoinHandle<()>) {
        match tokio::time::timeout(self.settings.per_call_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Status update task ended abnormally: {e}"),
            Err(_) => {
                warn!("Status updates still pending at shutdown, dropping them");
                task.abort();
            }
        }
    }

    fn fresh_state(&self) -> LoopState {
        LoopState {
            session: BuildSession::new(None),
            escalation: self.engine.initial_state(self.settings.cost_ceiling),
            fitness: FitnessTracker::new(),
            errors: ErrorLog::new(),
            working: None,
            directive: None,
            last_error: None,
            rollbacks: 0,
        }
    }

    fn resume_state(&self, cp: Checkpoint) -> LoopState {
        let last_error = cp.errors.records().last().map(|r| r.message.clone());
        LoopState {
            session: cp.session,
            escalation: cp.escalation,
            fitness: cp.fitness,
            errors: cp.errors,
            working: cp.working_artifact,
            directive: cp.pending_directive,
            last_error,
            rollbacks: 0,
        }
    }

    async fn drive(&mut self, spec: &str, state: &mut LoopState, deadline: Instant) {
        loop {
            self.drain_session_events(state);

            if state.session.iteration >= self.settings.max_iterations {
                info!(max = self.settings.max_iterations, "Iteration limit reached");
                self.engine
                    .abort_iteration_limit(&mut state.escalation, self.settings.max_iterations);
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    limit_secs = self.settings.wall_clock_timeout.as_secs(),
                    "Wall-clock limit reached"
                );
                self.engine
                    .abort_wall_clock(&mut state.escalation, self.settings.wall_clock_timeout.as_secs());
                break;
            }

            let iteration = match state.session.begin_iteration() {
                Ok(i) => i,
                Err(e) => {
                    error!("Cannot start iteration: {e}");
                    self.engine
                        .mark_unrecoverable(&mut state.escalation, e.to_string());
                    break;
                }
            };

            self.iterate(spec, state, iteration, deadline).await;

            if !state.escalation.is_active() {
                break;
            }
            if iteration % self.settings.checkpoint_interval == 0 {
                self.save_checkpoint(state);
            }
            self.track(state, "running", state.escalation.summary());
        }
    }

    async fn iterate(&self, spec: &str, state: &mut LoopState, iteration: u32, deadline: Instant) {
        for endpoint in &self.settings.session_endpoints {
            let ensured = self
                .guarded("session", deadline, async {
                    self.collab
                        .sessions
                        .ensure_valid(endpoint)
                        .await
                        .map_err(OrchestrationError::from)
                })
                .await;
            if let Err(e) = ensured {
                self.record_failure(state, iteration, e, false);
                return;
            }
        }

        let (backend, estimate) = match self.engine.reserve(&mut state.escalation) {
            Reservation::Granted {
                tier,
                backend,
                estimate,
            } => {
                debug!(iteration, tier, backend = %backend.name, estimate, "Cost reserved");
                (backend, estimate)
            }
            Reservation::Denied(reason) => {
                warn!(iteration, %reason, "No backend call issued");
                return;
            }
        };

        let request = GenerationRequest {
            spec: spec.to_string(),
            iteration,
            best_score: state.fitness.best().map(|b| b.score),
            directive: state.directive.take(),
            last_error: state.last_error.clone(),
        };
        let generated = self
            .guarded(
                "generation",
                deadline,
                self.collab.generator.generate(&request, &backend),
            )
            .await;

        let actual = match &generated {
            Ok(out) => out.cost,
            Err(e) => e.reported_cost(),
        };
        let crossed = self
            .engine
            .settle(&mut state.escalation, estimate, actual);
        state.session.set_cost(state.escalation.total_cost);

        let output = match generated {
            Ok(output) => output,
            Err(e) => {
                self.record_failure(state, iteration, e, crossed.is_some());
                return;
            }
        };

        let artifact_ref = match self.collab.artifacts.store(&output.artifact) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(state, iteration, e.into(), crossed.is_some());
                return;
            }
        };
        if crossed.is_some() {
            info!(
                iteration,
                digest = %artifact_ref.short_digest(),
                "Ceiling reached; artifact kept unvalidated"
            );
            state.working = Some(artifact_ref);
            return;
        }

        let validated = self
            .guarded(
                "validation",
                deadline,
                self.collab.validator.validate(&output.artifact),
            )
            .await;
        let score = match validated {
            Ok(score) => score,
            Err(e) => {
                if e.is_deadline() {
                    state.working = Some(artifact_ref);
                } else if matches!(e, OrchestrationError::Mcp(_)) {
                    self.report_midloop_health().await;
                }
                self.record_failure(state, iteration, e, false);
                return;
            }
        };

        if let Err(e) = state
            .fitness
            .record(iteration, score, artifact_ref.clone())
        {
            self.record_failure(state, iteration, e.into(), false);
            return;
        }
        state.working = Some(artifact_ref);
        state.last_error = None;
        info!(iteration, score, cost = state.escalation.total_cost, "Artifact scored");

        if score >= self.settings.target_score {
            info!(iteration, score, target = self.settings.target_score, "Target fitness reached");
            self.engine.mark_succeeded(&mut state.escalation);
        } else if state.fitness.should_rollback() {
            self.roll_back(state, iteration);
        }
    }

    /// Restore the best artifact as the baseline and owe the agent a directive.
    fn roll_back(&self, state: &mut LoopState, iteration: u32) {
        let Some(best) = state.fitness.best().cloned() else {
            return;
        };
        warn!(
            iteration,
            best_iteration = best.iteration,
            best_score = best.score,
            "Fitness regressed three times in a row, rolling back"
        );
        if let Err(e) = self
            .collab
            .artifacts
            .restore(&best.artifact, &self.settings.workdir)
        {
            warn!("Rollback restore failed: {e:#}");
        }
        state.working = Some(best.artifact.clone());
        state.directive = Some(format!(
            "The last three versions scored progressively worse; the best version \
             (score {:.4}, iteration {}) has been restored. Best score so far is {:.4}. \
             Improve on it without repeating the recent changes.",
            best.score, best.iteration, best.score
        ));
        state.rollbacks += 1;
    }

    /// Classify a per-call failure, log it and feed the escalation engine.
    fn record_failure(
        &self,
        state: &mut LoopState,
        iteration: u32,
        err: OrchestrationError,
        skip_escalation: bool,
    ) {
        if err.is_deadline() {
            warn!(iteration, "{err}");
            self.engine.abort_wall_clock(
                &mut state.escalation,
                self.settings.wall_clock_timeout.as_secs(),
            );
            return;
        }

        let text = err.failure_text();
        let kind = self.classifier.classify(&text, &state.errors);
        let record = ErrorRecord::new(text.clone(), kind, iteration);
        warn!(iteration, %kind, tier = state.escalation.tier, "Iteration failed: {text}");

        if let Err(e) = state.errors.append(record.clone()) {
            error!("Error log rejected record: {e}");
        }
        state.last_error = Some(text.clone());

        if err.is_unrecoverable() {
            self.engine.mark_unrecoverable(&mut state.escalation, text);
            return;
        }
        if skip_escalation {
            debug!(iteration, "Cost ceiling crossed on settlement; escalation not evaluated");
            return;
        }
        match self.engine.record_failure(&mut state.escalation, &record) {
            Transition::Promote { to, .. } => {
                let backend = &self.engine.current_backend(&state.escalation).name;
                info!(iteration, tier = to, %backend, "Backend promoted");
            }
            Transition::Fail(reason) => warn!(iteration, %reason, "Escalation ladder failed"),
            Transition::Stay => {}
        }
    }

    /// Bound one external call by the per-call timeout.
    ///
    /// Nothing starts once the wall-clock deadline has passed. A call already in
    /// flight may outlive the deadline by at most one per-call timeout; if it is
    /// cut off after the deadline, the clock is blamed rather than the call.
    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        deadline: Instant,
        call: F,
    ) -> Result<T, OrchestrationError>
    where
        F: Future<Output = Result<T, OrchestrationError>>,
    {
        let now = Instant::now();
        if now >= deadline {
            return Err(OrchestrationError::DeadlineReached { operation });
        }
        let per_call = self.settings.per_call_timeout;
        let limit = (now + per_call).min(deadline + per_call);
        match tokio::time::timeout_at(limit, call).await {
            Ok(result) => result,
            Err(_) if Instant::now() >= deadline => {
                Err(OrchestrationError::DeadlineReached { operation })
            }
            Err(_) => Err(OrchestrationError::Timeout {
                operation,
                after: per_call,
            }),
        }
    }

    async fn report_midloop_health(&self) {
        let report = self
            .collab
            .health
            .check_all(&self.settings.probe_targets)
            .await;
        for outcome in report.blocking() {
            warn!(endpoint = %outcome.endpoint, "Critical endpoint down mid-build");
        }
    }

    fn drain_session_events(&mut self, state: &LoopState) {
        let mut events = Vec::new();
        if let Some(rx) = self.collab.session_events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        for event in events {
            match &event {
                SessionEvent::Initialized { endpoint } | SessionEvent::Refreshed { endpoint } => {
                    debug!(%endpoint, ?event, "Session event");
                }
                SessionEvent::RefreshFailed { endpoint, message } => {
                    warn!(%endpoint, "Session refresh failed: {message}");
                }
                SessionEvent::Unavailable { endpoint, message } => {
                    warn!(%endpoint, "Session unavailable: {message}");
                    self.track(
                        state,
                        "degraded",
                        format!("{endpoint} session unavailable: {message}"),
                    );
                }
            }
        }
    }

    fn save_checkpoint(&self, state: &LoopState) {
        let checkpoint = state.checkpoint();
        match self.collab.checkpoints.save(&checkpoint) {
            Ok(()) => debug!(
                session = %state.session.id,
                iteration = state.session.iteration,
                "Checkpoint saved"
            ),
            Err(e) => warn!(session = %state.session.id, "Checkpoint save failed: {e}"),
        }
    }

    /// Queue a tracker update; never waits on the tracker.
    fn track(&self, state: &LoopState, status: &str, message: impl Into<String>) {
        let update = StatusUpdate::new(
            state.session.id,
            state.session.iteration,
            status,
            message,
        );
        match &self.updates {
            Some(tx) if tx.send(update).is_ok() => {}
            _ => debug!(status, "Status update dropped, no tracker worker"),
        }
    }

    async fn finish(&self, mut state: LoopState, elapsed: Duration) -> BuildReport {
        let status = state.escalation.status.as_build_status();
        if status.is_terminal() {
            if let Err(e) = state.session.finish(status) {
                warn!("Session status not updated: {e}");
            }
        }
        state.session.set_cost(state.escalation.total_cost);

        // Leave the best version in the working copy.
        if let Some(best) = state.fitness.best().cloned() {
            if state.working.as_ref() != Some(&best.artifact) {
                match self
                    .collab
                    .artifacts
                    .restore(&best.artifact, &self.settings.workdir)
                {
                    Ok(_) => state.working = Some(best.artifact),
                    Err(e) => warn!("Could not restore best artifact: {e:#}"),
                }
            }
        }

        self.save_checkpoint(&state);

        let mut pr_url = None;
        if self.settings.publish && state.fitness.best().is_some() {
            if let Some(publisher) = &self.collab.publisher {
                let title = format!("Strategy build {}", state.session.branch);
                let body = self.report(&state, None, elapsed).headline();
                match publisher.publish(&state.session.branch, &title, &body).await {
                    Ok(url) => pr_url = Some(url),
                    Err(e) => warn!("Publishing failed: {e:#}"),
                }
            }
        }

        let report = self.report(&state, pr_url, elapsed);
        append_history(
            &BuildHistoryEntry {
                session_id: report.session_id,
                branch: report.branch.clone(),
                status: report.status,
                iterations: report.iterations,
                cost: report.cost,
                best_score: report.best.as_ref().map(|b| b.score),
                final_tier: report.tier,
                duration_secs: report.duration_secs,
                finished_at: Utc::now(),
            },
            &self.settings.history_path,
        );

        let headline = report.headline();
        self.track(&state, report.status.as_str(), headline.clone());
        self.collab.notifier.notify(&headline).await;
        info!(
            session = %report.session_id,
            status = %report.status,
            iterations = report.iterations,
            cost = report.cost,
            "Build session finished"
        );
        report
    }

    fn report(&self, state: &LoopState, pr_url: Option<String>, elapsed: Duration) -> BuildReport {
        let reason = match &state.escalation.status {
            LadderStatus::Aborted(r) | LadderStatus::Failed(r) => Some(r.to_string()),
            _ => None,
        };
        BuildReport {
            session_id: state.session.id,
            branch: state.session.branch.clone(),
            status: state.session.status,
            reason,
            iterations: state.session.iteration,
            cost: state.escalation.total_cost,
            cost_ceiling: state.escalation.cost_ceiling,
            tier: state.escalation.tier,
            backend: self
                .engine
                .current_backend(&state.escalation)
                .name
                .clone(),
            best: state.fitness.best().cloned(),
            error_tail: state.errors.tail(REPORT_ERROR_TAIL).to_vec(),
            escalations: state.escalation.escalation_history.len(),
            rollbacks: state.rollbacks,
            pr_url,
            duration_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Deliver tracker updates in order, each bounded by the call timeout.
fn spawn_status_updates(
    tracker: Arc<dyn StatusTracker>,
    per_call: Duration,
) -> (mpsc::UnboundedSender<StatusUpdate>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
    let task = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match tokio::time::timeout(per_call, tracker.update(&update)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Status update failed: {e:#}"),
                Err(_) => debug!(
                    iteration = update.iteration,
                    "Status update timed out after {}s",
                    per_call.as_secs()
                ),
            }
        }
    });
    (tx, task)
}
