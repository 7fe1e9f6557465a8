//! Runs stages in order with checkpointing and pause/resume/abort.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointStore;
use super::progress::{ProgressEvent, ProgressKind, ProgressReporter};
use super::stage::{Stage, StageContext};
use super::state::{PipelineState, StageReport, StageStatus};
use super::stages::default_stages;
use super::{PipelineConfig, PipelineError};
use crate::backend::GenerationRequest;
use crate::budget::{BudgetCheck, BudgetStatus, RejectionStrategy, UsageLedger};
use crate::metrics::{RequestTally, RunMetrics, RunMetricsCollector};
use crate::session::{RequestOutcome, SessionContext};

/// Requested run mode, observed at stage and request boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Abort,
}

/// Remote control for a running pipeline.
///
/// Neither call interrupts a request that is already in flight; the
/// orchestrator lets those finish, saves a checkpoint and returns.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    control: Arc<watch::Sender<Control>>,
}

impl PipelineHandle {
    pub fn pause(&self) {
        self.control.send_replace(Control::Pause);
    }

    pub fn abort(&self) {
        self.control.send_replace(Control::Abort);
    }

    pub fn is_stopping(&self) -> bool {
        *self.control.borrow() != Control::Run
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Paused,
    Aborted,
    /// A required stage could not finish. Work of earlier stages is kept.
    Failed { stage: String, reason: String },
}

/// Result of [`PipelineOrchestrator::run`] and friends. Partial results
/// are returned the same way as complete ones.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub state: PipelineState,
    pub ledger: UsageLedger,
    pub budget_status: BudgetStatus,
    pub warnings: Vec<String>,
    pub metrics: RunMetrics,
}

impl PipelineOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn completed_stages(&self) -> &[String] {
        &self.state.completed_stages
    }
}

enum Gate {
    Proceed {
        requests: Vec<GenerationRequest>,
        preapproved: bool,
    },
    Rejected(String),
    Stopped(Control),
}

enum StageRun {
    Advanced,
    Stopped(Control),
    Halted { stage: String, reason: String },
}

/// Drives the stage sequence for one session.
pub struct PipelineOrchestrator {
    session: Arc<SessionContext>,
    stages: Vec<Arc<dyn Stage>>,
    store: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
    progress: ProgressReporter,
    control: Arc<watch::Sender<Control>>,
}

impl PipelineOrchestrator {
    /// Orchestrator over the built-in stages.
    pub fn new(session: Arc<SessionContext>, store: Arc<dyn CheckpointStore>, config: PipelineConfig) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Self {
            session,
            stages: default_stages(),
            store,
            config,
            progress: ProgressReporter::disabled(),
            control: Arc::new(control),
        }
    }

    pub fn with_stages(mut self, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id().to_string()).collect()
    }

    /// Start a fresh run for `brief`.
    pub async fn run(&self, brief: impl Into<String>) -> Result<PipelineOutcome, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let mut state = PipelineState::new(self.session.session_id(), brief, self.stage_ids());
        state.ledger = self.session.cost_guard().snapshot();
        state.characters = self.session.characters().snapshot();
        info!(session = %state.session_id, stages = state.total_stages(), "pipeline starting");
        self.drive(state).await
    }

    /// Continue the session's checkpointed run.
    pub async fn resume(&self) -> Result<PipelineOutcome, PipelineError> {
        let session_id = self.session.session_id();
        let state = self
            .store
            .load(session_id)?
            .ok_or_else(|| PipelineError::NoCheckpoint(session_id.to_string()))?;
        self.resume_from(state).await
    }

    /// Continue from an explicit checkpoint. Completed stages are not run
    /// again, and neither are finished requests of the interrupted stage.
    pub async fn resume_from(&self, state: PipelineState) -> Result<PipelineOutcome, PipelineError> {
        let expected = self.stage_ids();
        if state.stages != expected {
            return Err(PipelineError::StageMismatch {
                expected,
                found: state.stages,
            });
        }
        self.session.cost_guard().restore(state.ledger.clone());
        self.session.characters().restore(state.characters.clone());
        info!(
            session = %state.session_id,
            stage = state.current_stage_id().unwrap_or("-"),
            completed = state.completed_stages.len(),
            "pipeline resuming"
        );
        self.drive(state).await
    }

    /// Drop a session's checkpoint.
    pub fn discard(&self, session_id: &str) -> Result<(), PipelineError> {
        self.store.discard(session_id)?;
        Ok(())
    }

    async fn drive(&self, mut state: PipelineState) -> Result<PipelineOutcome, PipelineError> {
        self.control.send_replace(Control::Run);
        let metrics = RunMetricsCollector::new(&state.session_id, state.total_stages());

        while !state.is_finished() {
            if let Some(control) = self.stop_requested() {
                return self.stopped(state, control, &metrics);
            }
            let stage = Arc::clone(&self.stages[state.current_stage]);
            match self.run_stage(stage.as_ref(), &mut state, &metrics).await? {
                StageRun::Advanced => {}
                StageRun::Stopped(control) => return self.stopped(state, control, &metrics),
                StageRun::Halted { stage, reason } => {
                    warn!(session = %state.session_id, stage = %stage, reason = %reason, "pipeline halted");
                    self.emit(&state, Some(stage.as_str()), ProgressKind::Failed { reason: reason.clone() }, None);
                    return Ok(self.outcome(RunStatus::Failed { stage, reason }, state, &metrics));
                }
            }
        }

        self.store.discard(&state.session_id)?;
        info!(
            session = %state.session_id,
            completed = state.completed_stages.len(),
            skipped = state.skipped_stages.len(),
            "pipeline completed"
        );
        self.emit(&state, None, ProgressKind::Completed, Some(Duration::ZERO));
        Ok(self.outcome(RunStatus::Completed, state, &metrics))
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        state: &mut PipelineState,
        metrics: &RunMetricsCollector,
    ) -> Result<StageRun, PipelineError> {
        let stage_id = stage.id().to_string();
        let started = Instant::now();
        metrics.start_stage(&stage_id);
        info!(session = %state.session_id, stage = %stage_id, "stage starting");
        self.emit(state, Some(stage_id.as_str()), ProgressKind::StageStarted, None);

        let planned = stage.plan(&self.context(&stage_id, state));
        let planned = match planned {
            Ok(planned) => planned,
            Err(err) => {
                let status = StageStatus::Failed { reason: err.to_string() };
                return self.unfinished(&stage_id, state, status, Tally::default(), started, metrics);
            }
        };
        let pending: Vec<GenerationRequest> = planned
            .iter()
            .filter(|r| !state.partial_results.contains_key(&r.id))
            .cloned()
            .collect();
        if pending.len() < planned.len() {
            debug!(stage = %stage_id, finished = planned.len() - pending.len(), "skipping finished requests");
        }

        let (requests, preapproved) = match self.stage_gate(&stage_id, pending).await {
            Gate::Proceed { requests, preapproved } => (requests, preapproved),
            Gate::Rejected(reason) => {
                let tally = Tally {
                    skipped: planned.len() as u32,
                    ..Tally::default()
                };
                return self.unfinished(&stage_id, state, StageStatus::Skipped { reason }, tally, started, metrics);
            }
            Gate::Stopped(control) => {
                metrics.complete_stage(&stage_id, started.elapsed(), false);
                return Ok(StageRun::Stopped(control));
            }
        };

        let total = planned.len();
        let mut done = total - requests.len();
        state.set_stage_progress(done, total);
        let stages_left = state.total_stages().saturating_sub(state.current_stage + 1);
        let concurrency = self.session.max_concurrent().max(1);

        let mut tally = Tally::default();
        let mut stop = None;
        let mut queue = requests.into_iter();
        let mut in_flight = FuturesUnordered::new();
        loop {
            while stop.is_none() && in_flight.len() < concurrency {
                if let Some(control) = self.stop_requested() {
                    stop = Some(control);
                    break;
                }
                let Some(request) = queue.next() else { break };
                let session = self.session.as_ref();
                in_flight.push(async move { session.generate(&request, preapproved).await });
            }
            let Some(report) = in_flight.next().await else { break };

            done += 1;
            tally.cost += report.cost;
            let success = report.outcome.is_success();
            match report.outcome {
                RequestOutcome::Succeeded { result } => {
                    tally.succeeded += 1;
                    metrics.record_request(&stage_id, RequestTally::Succeeded, report.attempts, report.duration);
                    state.partial_results.insert(report.request_id.clone(), result);
                }
                RequestOutcome::Failed { error, .. } => {
                    tally.failed += 1;
                    metrics.record_request(&stage_id, RequestTally::Failed, report.attempts, report.duration);
                    tally.failures.push(format!("{}: {}", report.request_id, error));
                }
                RequestOutcome::Skipped { reason } => {
                    tally.skipped += 1;
                    metrics.record_request(&stage_id, RequestTally::Skipped, report.attempts, report.duration);
                    tally.skips.push(format!("{}: {}", report.request_id, reason));
                }
            }
            state.set_stage_progress(done, total);
            state.ledger = self.session.cost_guard().snapshot();
            let eta = metrics.estimate_remaining(total - done, stages_left, concurrency);
            self.emit(
                state,
                Some(stage_id.as_str()),
                ProgressKind::RequestFinished {
                    request_id: report.request_id,
                    success,
                },
                eta,
            );
        }

        if let Some(control) = stop {
            metrics.complete_stage(&stage_id, started.elapsed(), false);
            return Ok(StageRun::Stopped(control));
        }
        if !tally.skips.is_empty() {
            let status = StageStatus::Skipped {
                reason: tally.skips.join("; "),
            };
            return self.unfinished(&stage_id, state, status, tally, started, metrics);
        }
        if !tally.failures.is_empty() {
            let status = StageStatus::Failed {
                reason: tally.failures.join("; "),
            };
            return self.unfinished(&stage_id, state, status, tally, started, metrics);
        }

        let results: Option<Vec<_>> = planned
            .iter()
            .map(|r| state.partial_results.get(&r.id).cloned())
            .collect();
        let finished = match results {
            Some(results) => stage.finish(&self.context(&stage_id, state), &results),
            None => Err(PipelineError::Stage {
                stage: stage_id.clone(),
                message: "results missing for planned requests".to_string(),
            }),
        };
        let output = match finished {
            Ok(output) => output,
            Err(err) => {
                let status = StageStatus::Failed { reason: err.to_string() };
                return self.unfinished(&stage_id, state, status, tally, started, metrics);
            }
        };

        for warning in &output.warnings {
            warn!(stage = %stage_id, warning = %warning, "stage warning");
        }
        state.warnings.extend(output.warnings);
        state.outputs.insert(stage_id.clone(), output.value);
        state.completed_stages.push(stage_id.clone());
        state.reports.push(tally.report(&stage_id, true, StageStatus::Completed, started.elapsed()));
        state.advance();
        self.checkpoint(state)?;
        metrics.complete_stage(&stage_id, started.elapsed(), true);
        info!(
            session = %state.session_id,
            stage = %stage_id,
            requests = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage completed"
        );
        self.emit(state, Some(stage_id.as_str()), ProgressKind::StageFinished, None);
        Ok(StageRun::Advanced)
    }

    /// A stage that was skipped by the budget gate or failed. Optional
    /// stages are passed over; required ones halt the run.
    fn unfinished(
        &self,
        stage_id: &str,
        state: &mut PipelineState,
        status: StageStatus,
        tally: Tally,
        started: Instant,
        metrics: &RunMetricsCollector,
    ) -> Result<StageRun, PipelineError> {
        let required = self.config.is_required(stage_id);
        let reason = match &status {
            StageStatus::Skipped { reason } => format!("skipped: {}", reason),
            StageStatus::Failed { reason } => format!("failed: {}", reason),
            StageStatus::Completed => String::new(),
        };
        state.reports.push(tally.report(stage_id, required, status, started.elapsed()));
        metrics.complete_stage(stage_id, started.elapsed(), false);

        if required {
            self.checkpoint(state)?;
            return Ok(StageRun::Halted {
                stage: stage_id.to_string(),
                reason,
            });
        }

        warn!(session = %state.session_id, stage = %stage_id, reason = %reason, "optional stage passed over");
        state.warnings.push(format!("stage '{}' {}", stage_id, reason));
        state.skipped_stages.push(stage_id.to_string());
        state.advance();
        self.checkpoint(state)?;
        self.emit(state, Some(stage_id), ProgressKind::StageSkipped { reason }, None);
        Ok(StageRun::Advanced)
    }

    /// One approval round for everything the stage is about to send.
    async fn stage_gate(&self, stage_id: &str, pending: Vec<GenerationRequest>) -> Gate {
        let guard = self.session.cost_guard();
        let estimate = guard.estimator().estimate_all(pending.iter().map(|r| &r.operation));
        if pending.is_empty() || guard.evaluate(estimate) != BudgetCheck::NeedsApproval {
            return Gate::Proceed {
                requests: pending,
                preapproved: false,
            };
        }

        let approved = tokio::select! {
            approved = guard.request_approval(estimate) => approved,
            control = self.wait_for_stop() => return Gate::Stopped(control),
        };
        if approved {
            return Gate::Proceed {
                requests: pending,
                preapproved: true,
            };
        }

        if guard.policy().on_rejection == RejectionStrategy::Degrade {
            let mut requests = pending;
            loop {
                let mut lowered = false;
                for request in &mut requests {
                    if let Some(operation) = request.operation.degraded() {
                        request.operation = operation;
                        lowered = true;
                    }
                }
                if !lowered {
                    break;
                }
                let degraded = guard.estimator().estimate_all(requests.iter().map(|r| &r.operation));
                if guard.evaluate(degraded) != BudgetCheck::NeedsApproval {
                    warn!(stage = %stage_id, estimate, degraded, "stage degraded to fit budget");
                    return Gate::Proceed {
                        requests,
                        preapproved: false,
                    };
                }
            }
        }

        Gate::Rejected(format!(
            "estimated cost {:.4} would exceed budget limit {:.4} and was not approved",
            estimate,
            guard.policy().limit
        ))
    }

    fn stopped(
        &self,
        mut state: PipelineState,
        control: Control,
        metrics: &RunMetricsCollector,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.checkpoint(&mut state)?;
        let (status, kind) = match control {
            Control::Abort => (RunStatus::Aborted, ProgressKind::Aborted),
            _ => (RunStatus::Paused, ProgressKind::Paused),
        };
        info!(
            session = %state.session_id,
            stage = state.current_stage_id().unwrap_or("-"),
            status = ?status,
            "pipeline stopped"
        );
        let stage = state.current_stage_id().map(str::to_string);
        self.emit(&state, stage.as_deref(), kind, None);
        Ok(self.outcome(status, state, metrics))
    }

    fn checkpoint(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        state.ledger = self.session.cost_guard().snapshot();
        state.characters = self.session.characters().snapshot();
        state.touch();
        self.store.save(state)?;
        Ok(())
    }

    fn context<'a>(&'a self, stage_id: &'a str, state: &'a PipelineState) -> StageContext<'a> {
        StageContext {
            stage_id,
            state,
            characters: self.session.characters(),
            config: &self.config,
        }
    }

    fn stop_requested(&self) -> Option<Control> {
        match *self.control.borrow() {
            Control::Run => None,
            control => Some(control),
        }
    }

    async fn wait_for_stop(&self) -> Control {
        let mut rx = self.control.subscribe();
        let control = match rx.wait_for(|c| *c != Control::Run).await {
            Ok(control) => *control,
            Err(_) => std::future::pending().await,
        };
        control
    }

    fn emit(&self, state: &PipelineState, stage: Option<&str>, kind: ProgressKind, eta: Option<Duration>) {
        self.progress.emit(ProgressEvent {
            session_id: state.session_id.clone(),
            kind,
            current_stage: stage.map(str::to_string),
            completed_stages: state.completed_stages.clone(),
            current_stage_progress: state.current_stage_progress,
            overall_progress: state.overall_progress,
            estimated_time_remaining: eta,
        });
    }

    fn outcome(&self, status: RunStatus, state: PipelineState, metrics: &RunMetricsCollector) -> PipelineOutcome {
        PipelineOutcome {
            status,
            ledger: self.session.cost_guard().snapshot(),
            budget_status: self.session.cost_guard().status(),
            warnings: state.warnings.clone(),
            metrics: metrics.finish(),
            state,
        }
    }
}

/// Per-stage request counts.
#[derive(Debug, Default)]
struct Tally {
    succeeded: u32,
    failed: u32,
    skipped: u32,
    cost: f64,
    failures: Vec<String>,
    skips: Vec<String>,
}

impl Tally {
    fn report(&self, stage_id: &str, required: bool, status: StageStatus, duration: Duration) -> StageReport {
        StageReport {
            stage_id: stage_id.to_string(),
            required,
            status,
            requests_succeeded: self.succeeded,
            requests_failed: self.failed,
            requests_skipped: self.skipped,
            cost: self.cost,
            duration,
        }
    }
}
