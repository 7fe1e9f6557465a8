//! Execution metrics for pipeline runs.
//!
//! The collector records request and stage durations as they complete. Those
//! samples drive the `estimated_time_remaining` figure in progress events,
//! and [`RunMetricsCollector::finish`] condenses them into a [`RunMetrics`]
//! summary for the run outcome.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How a single request ended, for counting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTally {
    Succeeded,
    Failed,
    Skipped,
}

/// Duration statistics over a set of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    /// Number of samples
    pub count: u32,
    /// Mean duration
    pub mean: Duration,
    /// Minimum duration
    pub min: Duration,
    /// Maximum duration
    pub max: Duration,
    /// Sum of all durations (for calculating mean)
    pub total: Duration,
}

impl DurationStats {
    /// Add a new duration sample.
    pub fn add_sample(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.mean = self.total / self.count;

        if self.count == 1 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Metrics for one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage_id: String,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Backend attempts across all requests of the stage
    pub attempts: u32,
    /// Wall time of the stage, summed across resumes
    pub duration: Duration,
}

impl StageMetrics {
    fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> u32 {
        self.succeeded + self.failed + self.skipped
    }
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Wall time of this invocation (not counting earlier paused runs)
    pub run_duration: Duration,
    pub expected_stages: u32,
    pub stages_completed: u32,
    pub requests_succeeded: u32,
    pub requests_failed: u32,
    pub requests_skipped: u32,
    pub attempts: u32,
    /// Attempts beyond the first, across all requests
    pub retries: u32,
    pub request_durations: DurationStats,
    pub stage_durations: BTreeMap<String, Duration>,
    pub stages: Vec<StageMetrics>,
}

#[derive(Debug)]
struct RunMetricsState {
    session_id: String,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    expected_stages: usize,
    requests: DurationStats,
    stage_durations: DurationStats,
    stages: Vec<StageMetrics>,
    completed_stages: u32,
}

impl RunMetricsState {
    fn stage_mut(&mut self, stage_id: &str) -> &mut StageMetrics {
        let index = match self.stages.iter().position(|s| s.stage_id == stage_id) {
            Some(index) => index,
            None => {
                self.stages.push(StageMetrics::new(stage_id));
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    /// Create a new run metrics collector.
    pub fn new(session_id: impl Into<String>, expected_stages: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                session_id: session_id.into(),
                started_at: Utc::now(),
                started_instant: Instant::now(),
                expected_stages,
                requests: DurationStats::default(),
                stage_durations: DurationStats::default(),
                stages: Vec::new(),
                completed_stages: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunMetricsState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the start of a stage.
    pub fn start_stage(&self, stage_id: &str) {
        self.state().stage_mut(stage_id);
    }

    /// Record one finished request.
    pub fn record_request(&self, stage_id: &str, tally: RequestTally, attempts: u32, duration: Duration) {
        let mut state = self.state();
        if tally != RequestTally::Skipped {
            state.requests.add_sample(duration);
        }
        let stage = state.stage_mut(stage_id);
        stage.attempts += attempts;
        match tally {
            RequestTally::Succeeded => stage.succeeded += 1,
            RequestTally::Failed => stage.failed += 1,
            RequestTally::Skipped => stage.skipped += 1,
        }
    }

    /// Record the end of a stage. `completed` is false for stages that
    /// stopped early (paused, aborted, failed).
    pub fn complete_stage(&self, stage_id: &str, duration: Duration, completed: bool) {
        let mut state = self.state();
        state.stage_mut(stage_id).duration += duration;
        if completed {
            state.stage_durations.add_sample(duration);
            state.completed_stages += 1;
        }
    }

    /// Mean duration of a finished request, if any has finished.
    pub fn mean_request_duration(&self) -> Option<Duration> {
        let state = self.state();
        (!state.requests.is_empty()).then_some(state.requests.mean)
    }

    /// Remaining time estimate from observed durations.
    ///
    /// Requests left in the current stage run `concurrency` at a time; each
    /// stage still to come is assumed to take as long as the average stage
    /// so far. `None` until at least one request has finished.
    pub fn estimate_remaining(
        &self,
        requests_left_in_stage: usize,
        stages_left: usize,
        concurrency: usize,
    ) -> Option<Duration> {
        let state = self.state();
        if state.requests.is_empty() {
            return None;
        }
        let waves = requests_left_in_stage.div_ceil(concurrency.max(1)) as u32;
        let current = state.requests.mean * waves;
        let per_stage = if state.stage_durations.is_empty() {
            state.requests.mean
        } else {
            state.stage_durations.mean
        };
        Some(current + per_stage * stages_left as u32)
    }

    /// Build a run metrics snapshot.
    pub fn finish(&self) -> RunMetrics {
        let state = self.state();
        let (succeeded, failed, skipped, attempts) =
            state.stages.iter().fold((0, 0, 0, 0), |acc, stage| {
                (
                    acc.0 + stage.succeeded,
                    acc.1 + stage.failed,
                    acc.2 + stage.skipped,
                    acc.3 + stage.attempts,
                )
            });
        let sent = succeeded + failed;
        RunMetrics {
            session_id: state.session_id.clone(),
            started_at: state.started_at,
            completed_at: Utc::now(),
            run_duration: state.started_instant.elapsed(),
            expected_stages: state.expected_stages as u32,
            stages_completed: state.completed_stages,
            requests_succeeded: succeeded,
            requests_failed: failed,
            requests_skipped: skipped,
            attempts,
            retries: attempts.saturating_sub(sent),
            request_durations: state.requests.clone(),
            stage_durations: state
                .stages
                .iter()
                .map(|stage| (stage.stage_id.clone(), stage.duration))
                .collect(),
            stages: state.stages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_stats() {
        let mut stats = DurationStats::default();
        stats.add_sample(Duration::from_millis(100));
        stats.add_sample(Duration::from_millis(300));
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, Duration::from_millis(200));
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(300));
    }

    #[test]
    fn test_estimate_requires_samples() {
        let collector = RunMetricsCollector::new("s", 3);
        assert_eq!(collector.estimate_remaining(4, 2, 2), None);
    }

    #[test]
    fn test_estimate_remaining() {
        let collector = RunMetricsCollector::new("s", 3);
        collector.start_stage("idea");
        collector.record_request("idea", RequestTally::Succeeded, 1, Duration::from_secs(2));
        collector.complete_stage("idea", Duration::from_secs(4), true);

        // Five requests at concurrency two is three waves of 2s, plus one 4s stage.
        let eta = collector.estimate_remaining(5, 1, 2);
        assert_eq!(eta, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_finish_counts_retries() {
        let collector = RunMetricsCollector::new("session-1", 2);
        collector.record_request("video", RequestTally::Succeeded, 3, Duration::from_millis(10));
        collector.record_request("video", RequestTally::Failed, 2, Duration::from_millis(10));
        collector.record_request("video", RequestTally::Skipped, 0, Duration::ZERO);
        collector.complete_stage("video", Duration::from_millis(30), true);

        let metrics = collector.finish();
        assert_eq!(metrics.session_id, "session-1");
        assert_eq!(metrics.requests_succeeded, 1);
        assert_eq!(metrics.requests_failed, 1);
        assert_eq!(metrics.requests_skipped, 1);
        assert_eq!(metrics.attempts, 5);
        assert_eq!(metrics.retries, 3);
        assert_eq!(metrics.stages_completed, 1);
        assert_eq!(metrics.request_durations.count, 2);
        assert_eq!(metrics.stages[0].requests(), 3);
        assert_eq!(
            metrics.stage_durations.get("video"),
            Some(&Duration::from_millis(30))
        );
    }

    #[test]
    fn test_incomplete_stage_not_used_for_estimates() {
        let collector = RunMetricsCollector::new("s", 2);
        collector.record_request("script", RequestTally::Succeeded, 1, Duration::from_secs(1));
        collector.complete_stage("script", Duration::from_secs(60), false);
        assert_eq!(collector.estimate_remaining(0, 1, 1), Some(Duration::from_secs(1)));
        assert_eq!(collector.finish().stages_completed, 0);
    }
}
