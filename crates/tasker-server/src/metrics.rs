//! Prometheus metrics collection and formatting.
//!
//! Counters and histograms are recorded through hook methods on [`Metrics`]
//! at submission, claim, terminal transition, cache lookup and external call
//! time. Gauges are computed from the store and broker when scraped. Output
//! is Prometheus text exposition format.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tasker_core::{TaskStatus, TaskType};
use tracing::warn;

use crate::state::AppState;

const EXECUTION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
const EXTERNAL_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Outcome of a claim attempt, as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimResult {
    /// Pending task claimed.
    Claimed,
    /// Running task re-claimed by a retry or a crash takeover.
    Resumed,
    /// Task was already terminal.
    Duplicate,
    /// Another worker holds a live claim.
    HeldElsewhere,
}

impl ClaimResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Resumed => "resumed",
            Self::Duplicate => "duplicate",
            Self::HeldElsewhere => "held_elsewhere",
        }
    }
}

/// Outcome of one handler execution, as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionResult {
    Success,
    Failure,
    Retry,
}

impl ExecutionResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (bound, count) in self.bounds.iter().zip(self.counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }

    fn write(&self, output: &mut String, name: &str, label: &str) {
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            writeln!(output, "{name}_bucket{{{label},le=\"{bound}\"}} {count}").ok();
        }
        writeln!(output, "{name}_bucket{{{label},le=\"+Inf\"}} {}", self.count).ok();
        writeln!(output, "{name}_sum{{{label}}} {}", self.sum).ok();
        writeln!(output, "{name}_count{{{label}}} {}", self.count).ok();
    }
}

/// In-process metrics registry.
#[derive(Default)]
pub struct Metrics {
    submissions: Mutex<BTreeMap<TaskType, u64>>,
    claims: Mutex<BTreeMap<ClaimResult, u64>>,
    executions: Mutex<BTreeMap<(TaskType, ExecutionResult), u64>>,
    execution_duration: Mutex<BTreeMap<TaskType, Histogram>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    external_requests: Mutex<BTreeMap<(&'static str, &'static str), u64>>,
    external_duration: Mutex<BTreeMap<&'static str, Histogram>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Metrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A task was accepted by the submission engine.
    pub fn record_submission(&self, task_type: TaskType) {
        *lock(&self.submissions).entry(task_type).or_default() += 1;
    }

    /// A worker attempted to claim a task.
    pub fn record_claim(&self, result: ClaimResult) {
        *lock(&self.claims).entry(result).or_default() += 1;
    }

    /// A handler execution finished.
    pub fn record_execution(&self, task_type: TaskType, result: ExecutionResult, elapsed: Duration) {
        *lock(&self.executions).entry((task_type, result)).or_default() += 1;
        lock(&self.execution_duration)
            .entry(task_type)
            .or_insert_with(|| Histogram::new(EXECUTION_BUCKETS))
            .observe(elapsed.as_secs_f64());
    }

    /// Result cache lookup hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Result cache lookup missed (or the cache was unavailable).
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An outbound API call finished with `status`.
    pub fn record_external_call(&self, api: &'static str, status: &'static str, elapsed: Duration) {
        *lock(&self.external_requests).entry((api, status)).or_default() += 1;
        lock(&self.external_duration)
            .entry(api)
            .or_insert_with(|| Histogram::new(EXTERNAL_BUCKETS))
            .observe(elapsed.as_secs_f64());
    }

    pub fn submissions(&self, task_type: TaskType) -> u64 {
        lock(&self.submissions).get(&task_type).copied().unwrap_or(0)
    }

    pub fn claims(&self, result: ClaimResult) -> u64 {
        lock(&self.claims).get(&result).copied().unwrap_or(0)
    }

    pub fn executions(&self, task_type: TaskType, result: ExecutionResult) -> u64 {
        lock(&self.executions)
            .get(&(task_type, result))
            .copied()
            .unwrap_or(0)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn external_requests(&self, api: &str, status: &str) -> u64 {
        lock(&self.external_requests)
            .iter()
            .filter(|((a, s), _)| *a == api && *s == status)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Write counters and histograms in Prometheus format.
    fn write_recorded(&self, output: &mut String) {
        writeln!(output, "# HELP tasker_tasks_submitted_total Total number of tasks submitted").ok();
        writeln!(output, "# TYPE tasker_tasks_submitted_total counter").ok();
        for (task_type, n) in lock(&self.submissions).iter() {
            writeln!(output, "tasker_tasks_submitted_total{{task_name=\"{task_type}\"}} {n}").ok();
        }

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_task_claims_total Claim attempts by outcome").ok();
        writeln!(output, "# TYPE tasker_task_claims_total counter").ok();
        for (result, n) in lock(&self.claims).iter() {
            writeln!(output, "tasker_task_claims_total{{outcome=\"{}\"}} {n}", result.label()).ok();
        }

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_task_executions_total Total number of task executions").ok();
        writeln!(output, "# TYPE tasker_task_executions_total counter").ok();
        for ((task_type, result), n) in lock(&self.executions).iter() {
            writeln!(
                output,
                "tasker_task_executions_total{{task_name=\"{task_type}\",status=\"{}\"}} {n}",
                result.label()
            )
            .ok();
        }

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_task_execution_duration_seconds Task execution duration in seconds").ok();
        writeln!(output, "# TYPE tasker_task_execution_duration_seconds histogram").ok();
        for (task_type, histogram) in lock(&self.execution_duration).iter() {
            let label = format!("task_name=\"{task_type}\"");
            histogram.write(output, "tasker_task_execution_duration_seconds", &label);
        }

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_cache_hits_total Total number of cache hits").ok();
        writeln!(output, "# TYPE tasker_cache_hits_total counter").ok();
        writeln!(output, "tasker_cache_hits_total {}", self.cache_hits()).ok();
        writeln!(output, "# HELP tasker_cache_misses_total Total number of cache misses").ok();
        writeln!(output, "# TYPE tasker_cache_misses_total counter").ok();
        writeln!(output, "tasker_cache_misses_total {}", self.cache_misses()).ok();

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_external_api_requests_total Total number of external API requests").ok();
        writeln!(output, "# TYPE tasker_external_api_requests_total counter").ok();
        for ((api, status), n) in lock(&self.external_requests).iter() {
            writeln!(
                output,
                "tasker_external_api_requests_total{{api_name=\"{api}\",status=\"{status}\"}} {n}"
            )
            .ok();
        }

        writeln!(output).ok();
        writeln!(output, "# HELP tasker_external_api_duration_seconds External API request duration in seconds").ok();
        writeln!(output, "# TYPE tasker_external_api_duration_seconds histogram").ok();
        for (api, histogram) in lock(&self.external_duration).iter() {
            let label = format!("api_name=\"{api}\"");
            histogram.write(output, "tasker_external_api_duration_seconds", &label);
        }
    }
}

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &AppState) -> String {
    let mut output = String::new();

    state.metrics.write_recorded(&mut output);
    collect_task_metrics(state, &mut output).await;
    collect_queue_metrics(state, &mut output).await;

    output
}

/// Collect task gauges by status.
async fn collect_task_metrics(state: &AppState, output: &mut String) {
    let counts: HashMap<TaskStatus, u64> = match state.store.count_by_status().await {
        Ok(counts) => counts,
        Err(e) => {
            warn!(error = %e, "Failed to count tasks for metrics");
            return;
        }
    };

    writeln!(output).ok();
    writeln!(output, "# HELP tasker_tasks_by_status Current number of tasks by status").ok();
    writeln!(output, "# TYPE tasker_tasks_by_status gauge").ok();
    for status in TaskStatus::ALL {
        let n = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "tasker_tasks_by_status{{status=\"{status}\"}} {n}").ok();
    }
}

/// Collect queue depth gauges.
async fn collect_queue_metrics(state: &AppState, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP tasker_queue_depth Messages waiting per queue, visible or delayed").ok();
    writeln!(output, "# TYPE tasker_queue_depth gauge").ok();
    for queue in &state.config.queues {
        match state.broker.depth(&queue.name).await {
            Ok(depth) => {
                writeln!(output, "tasker_queue_depth{{queue=\"{}\"}} {depth}", queue.name).ok();
            }
            Err(e) => warn!(queue = %queue.name, error = %e, "Failed to read queue depth"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = AppState::in_memory(Config::default()).unwrap();
        let output = collect_metrics(&state).await;

        assert!(output.contains("tasker_tasks_by_status{status=\"pending\"} 0"));
        assert!(output.contains("tasker_tasks_by_status{status=\"failed\"} 0"));
        assert!(output.contains("tasker_cache_hits_total 0"));
        assert!(output.contains("tasker_queue_depth{queue=\"default\"} 0"));
        assert!(output.contains("tasker_queue_depth{queue=\"external-api\"} 0"));
    }

    #[test]
    fn test_recorded_counters_are_rendered() {
        let metrics = Metrics::new();
        metrics.record_submission(TaskType::Sum);
        metrics.record_submission(TaskType::Sum);
        metrics.record_claim(ClaimResult::Duplicate);
        metrics.record_execution(TaskType::Sum, ExecutionResult::Success, Duration::from_millis(50));
        metrics.record_external_call("open_meteo", "timeout", Duration::from_secs(3));

        let mut output = String::new();
        metrics.write_recorded(&mut output);

        assert!(output.contains("tasker_tasks_submitted_total{task_name=\"sum\"} 2"));
        assert!(output.contains("tasker_task_claims_total{outcome=\"duplicate\"} 1"));
        assert!(output
            .contains("tasker_task_executions_total{task_name=\"sum\",status=\"success\"} 1"));
        assert!(output.contains(
            "tasker_task_execution_duration_seconds_bucket{task_name=\"sum\",le=\"0.1\"} 1"
        ));
        assert!(output.contains(
            "tasker_external_api_duration_seconds_bucket{api_name=\"open_meteo\",le=\"2.5\"} 0"
        ));
        assert!(output.contains(
            "tasker_external_api_duration_seconds_bucket{api_name=\"open_meteo\",le=\"5\"} 1"
        ));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let mut histogram = Histogram::new(&[1.0, 2.0]);
        histogram.observe(0.5);
        histogram.observe(1.5);
        histogram.observe(9.0);
        assert_eq!(histogram.counts, vec![1, 2]);
        assert_eq!(histogram.count, 3);
    }
}
