//! Streaming metrics collector: ingests results from all virtual users,
//! maintains running aggregates plus a bounded reservoir sample, and flushes
//! batches to the configured sinks.
//!
//! Running totals are authoritative and never drop a result; the reservoir
//! and the stored-results list are bounded views used for percentiles and
//! per-step breakdowns respectively.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::results::{
    ErrorDetail, StepRecord, StepStats, TestSummary, TimelineBucket, VuStartEvent,
};
use crate::sink::Sink;

/// Percentile levels reported in every summary.
const PERCENTILE_LEVELS: [f64; 6] = [50.0, 90.0, 95.0, 99.0, 99.9, 99.99];

/// Timeline bucket width in seconds.
const TIMELINE_BUCKET_S: u64 = 5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Reservoir sample capacity for percentile estimation.
    pub reservoir_capacity: usize,
    /// Full result objects kept verbatim; beyond this only aggregates and
    /// the reservoir are updated.
    pub max_stored: usize,
    /// Pending-buffer size that triggers a flush.
    pub batch_size: usize,
    /// Pending-buffer hard cap; a flush is forced at this size regardless of
    /// `batch_size`.
    pub hard_cap: usize,
    /// Timer-driven flush cadence; `None` disables the timer.
    pub flush_interval: Option<Duration>,
    /// When set, every flush overwrites this file with the full stored
    /// result list as a JSON array (live dashboard feed).
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity: 10_000,
            max_stored: 50_000,
            batch_size: 100,
            hard_cap: 1000,
            flush_interval: Some(Duration::from_millis(500)),
            snapshot_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Running statistics
// ---------------------------------------------------------------------------

/// Aggregates updated on every recorded result.
#[derive(Debug, Clone)]
pub struct RunningStats {
    pub n_total: u64,
    pub n_success: u64,
    pub n_fail: u64,
    /// Sum of successful durations (ms); the summary's average divides this
    /// by `n_success`.
    pub sum_duration_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_bytes: u64,
    pub status_counts: HashMap<u16, u64>,
    /// Failure counts keyed by error kind.
    pub error_counts: HashMap<String, u64>,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            n_total: 0,
            n_success: 0,
            n_fail: 0,
            sum_duration_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
            total_bytes: 0,
            status_counts: HashMap::new(),
            error_counts: HashMap::new(),
        }
    }
}

type ErrorGroupKey = (String, String, Option<u16>, String);

#[derive(Default)]
struct CollectorState {
    stats: RunningStats,
    /// Durations of all recorded results (success and failure), bounded by
    /// reservoir sampling.
    reservoir: Vec<f64>,
    stored: Vec<StepRecord>,
    pending: Vec<StepRecord>,
    vu_starts: Vec<VuStartEvent>,
    error_groups: HashMap<ErrorGroupKey, ErrorDetail>,
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

pub struct MetricsCollector {
    config: CollectorConfig,
    state: Mutex<CollectorState>,
    sinks: Vec<Arc<dyn Sink>>,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    flush_notify: Notify,
    shutdown: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(config: CollectorConfig, sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            config,
            state: Mutex::new(CollectorState::default()),
            sinks,
            started_at: Utc::now(),
            start_instant: Instant::now(),
            flush_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Start the batch flush loop. Idempotent per collector instance.
    pub fn start(collector: &Arc<Self>) {
        let mut task = collector.flush_task.lock().expect("flush task poisoned");
        if task.is_some() {
            return;
        }
        let collector = Arc::clone(collector);
        *task = Some(tokio::spawn(async move {
            let period = collector
                .config
                .flush_interval
                .unwrap_or(Duration::from_millis(500));
            let timer_enabled = collector.config.flush_interval.is_some();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; consume it so the loop starts
            // on a full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick(), if timer_enabled => collector.flush().await,
                    _ = collector.flush_notify.notified() => collector.flush().await,
                    _ = collector.shutdown.cancelled() => break,
                }
            }
        }));
    }

    /// Record one result. Safe for concurrent callers; everything happens in
    /// a single short critical section, with the flush itself running on the
    /// collector task.
    pub fn record_result(&self, record: StepRecord) {
        let should_flush = {
            let mut state = self.state.lock().expect("collector poisoned");
            let stats = &mut state.stats;

            stats.n_total += 1;
            if record.success {
                stats.n_success += 1;
                stats.sum_duration_ms += record.duration_ms;
                if record.duration_ms < stats.min_ms {
                    stats.min_ms = record.duration_ms;
                }
                if record.duration_ms > stats.max_ms {
                    stats.max_ms = record.duration_ms;
                }
            } else {
                stats.n_fail += 1;
                let kind = record
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                *stats.error_counts.entry(kind).or_insert(0) += 1;
            }
            if let Some(status) = record.status {
                *stats.status_counts.entry(status).or_insert(0) += 1;
            }
            if let Some(bytes) = record.bytes_received {
                stats.total_bytes += bytes;
            }

            // Reservoir sampling: full buffer slots are replaced with
            // probability capacity/n_total at a uniformly random index.
            let n_total = state.stats.n_total;
            if state.reservoir.len() < self.config.reservoir_capacity {
                state.reservoir.push(record.duration_ms);
            } else {
                let j = rand::thread_rng().gen_range(0..n_total as usize);
                if j < self.config.reservoir_capacity {
                    state.reservoir[j] = record.duration_ms;
                }
            }

            if !record.success {
                let key: ErrorGroupKey = (
                    record.scenario.clone(),
                    record.step_name.clone(),
                    record.status,
                    record.error.clone().unwrap_or_default(),
                );
                let detail = state.error_groups.entry(key).or_insert_with(|| ErrorDetail {
                    scenario: record.scenario.clone(),
                    step_name: record.step_name.clone(),
                    status: record.status,
                    error: record.error.clone().unwrap_or_default(),
                    count: 0,
                    first_seen: record.timestamp,
                    error_kind: record.error_kind,
                });
                detail.count += 1;
            }

            if state.stored.len() < self.config.max_stored {
                state.stored.push(record.clone());
            }

            state.pending.push(record);
            let threshold = self.config.batch_size.min(self.config.hard_cap);
            state.pending.len() >= threshold
        };

        if should_flush {
            self.flush_notify.notify_one();
        }
    }

    /// Record that a virtual user came up. Events keep creation order.
    pub fn record_vu_start(&self, vu_id: u32) {
        let mut state = self.state.lock().expect("collector poisoned");
        state.vu_starts.push(VuStartEvent {
            vu_id,
            started_at: Utc::now(),
            offset_ms: self.start_instant.elapsed().as_millis() as u64,
        });
    }

    /// Stop the flush loop, drain the pending buffer, and return once all
    /// in-flight flushes are complete.
    pub async fn finalize(&self) {
        self.shutdown.cancel();
        let task = self.flush_task.lock().expect("flush task poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.flush().await;
    }

    /// Fan the final summary out to every sink and finalize them.
    pub async fn publish_summary(&self, summary: &TestSummary) {
        for sink in &self.sinks {
            if let Err(e) = sink.write_summary(summary).await {
                tracing::warn!(sink = sink.name(), error = %e, "summary write failed");
            }
            if let Err(e) = sink.finalize().await {
                tracing::warn!(sink = sink.name(), error = %e, "sink finalize failed");
            }
        }
    }

    /// Swap the pending buffer out under the lock, then flush it to every
    /// target without holding the lock.
    async fn flush(&self) {
        let (batch, snapshot) = {
            let mut state = self.state.lock().expect("collector poisoned");
            if state.pending.is_empty() {
                return;
            }
            let batch = std::mem::take(&mut state.pending);
            let snapshot = self
                .config
                .snapshot_path
                .as_ref()
                .map(|path| (path.clone(), state.stored.clone()));
            (batch, snapshot)
        };

        // Real-time dispatch: each sink is best-effort and isolated.
        for sink in &self.sinks {
            for record in &batch {
                if let Err(e) = sink.write_result(record).await {
                    tracing::warn!(sink = sink.name(), error = %e, "result write failed");
                    break;
                }
            }
        }

        // Incremental snapshot: overwrite the full current result list.
        if let Some((path, stored)) = snapshot {
            match serde_json::to_vec(&stored) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        tracing::warn!(path = %path.display(), error = %e, "snapshot write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "snapshot serialization failed"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn running_stats(&self) -> RunningStats {
        self.state.lock().expect("collector poisoned").stats.clone()
    }

    pub fn vu_starts(&self) -> Vec<VuStartEvent> {
        self.state
            .lock()
            .expect("collector poisoned")
            .vu_starts
            .clone()
    }

    #[cfg(test)]
    fn reservoir_len(&self) -> usize {
        self.state.lock().expect("collector poisoned").reservoir.len()
    }

    /// Build the summary from running stats, the reservoir, stored results,
    /// and VU start events.
    pub fn summary(&self, test_name: &str) -> TestSummary {
        let state = self.state.lock().expect("collector poisoned");
        let stats = &state.stats;
        let finished_at = Utc::now();
        let elapsed_s = self.start_instant.elapsed().as_secs_f64();

        let success_rate = if stats.n_total > 0 {
            100.0 * stats.n_success as f64 / stats.n_total as f64
        } else {
            0.0
        };
        let avg_response_ms = if stats.n_success > 0 {
            stats.sum_duration_ms / stats.n_success as f64
        } else {
            0.0
        };
        let requests_per_second = if elapsed_s > 0.0 {
            stats.n_total as f64 / elapsed_s
        } else {
            0.0
        };
        let bytes_per_second = if elapsed_s > 0.0 {
            stats.total_bytes as f64 / elapsed_s
        } else {
            0.0
        };

        let mut sorted = state.reservoir.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));
        let mut percentiles = HashMap::new();
        for level in PERCENTILE_LEVELS {
            let key = if level.fract() == 0.0 {
                format!("{level:.0}")
            } else {
                level.to_string()
            };
            percentiles.insert(key, percentile(&sorted, level));
        }

        let mut error_details: Vec<ErrorDetail> = state.error_groups.values().cloned().collect();
        error_details.sort_by(|a, b| b.count.cmp(&a.count));

        TestSummary {
            test_name: test_name.to_string(),
            started_at: self.started_at,
            finished_at,
            total_requests: stats.n_total,
            successful_requests: stats.n_success,
            failed_requests: stats.n_fail,
            success_rate,
            avg_response_ms,
            min_response_ms: if stats.min_ms == f64::MAX { 0.0 } else { stats.min_ms },
            max_response_ms: stats.max_ms,
            percentiles,
            requests_per_second,
            bytes_per_second,
            status_distribution: stats.status_counts.clone(),
            error_distribution: stats.error_counts.clone(),
            error_details,
            step_statistics: step_statistics(&state.stored),
            vu_ramp_up: state.vu_starts.clone(),
            timeline: timeline(&state.stored, &state.vu_starts, self.started_at),
        }
    }
}

// ---------------------------------------------------------------------------
// Summary helpers
// ---------------------------------------------------------------------------

/// Percentile over a sorted sample: index `ceil(p·N/100) - 1`, clamped.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

/// Per-step aggregates grouped by `(scenario, step_name)` over stored
/// results, ordered by scenario then step name.
fn step_statistics(stored: &[StepRecord]) -> Vec<StepStats> {
    let mut groups: HashMap<(String, String), StepStats> = HashMap::new();
    for record in stored {
        let key = (record.scenario.clone(), record.step_name.clone());
        let entry = groups.entry(key).or_insert_with(|| StepStats {
            scenario: record.scenario.clone(),
            step_name: record.step_name.clone(),
            count: 0,
            success_count: 0,
            fail_count: 0,
            avg_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: 0.0,
        });
        entry.count += 1;
        if record.success {
            entry.success_count += 1;
        } else {
            entry.fail_count += 1;
        }
        // avg_ms accumulates the sum until the final division below.
        entry.avg_ms += record.duration_ms;
        if record.duration_ms < entry.min_ms {
            entry.min_ms = record.duration_ms;
        }
        if record.duration_ms > entry.max_ms {
            entry.max_ms = record.duration_ms;
        }
    }

    let mut stats: Vec<StepStats> = groups
        .into_values()
        .map(|mut s| {
            if s.count > 0 {
                s.avg_ms /= s.count as f64;
            }
            if s.min_ms == f64::MAX {
                s.min_ms = 0.0;
            }
            s
        })
        .collect();
    stats.sort_by(|a, b| {
        a.scenario
            .cmp(&b.scenario)
            .then_with(|| a.step_name.cmp(&b.step_name))
    });
    stats
}

/// 5-second timeline buckets over stored results; `active_vus` counts VU
/// start events at or before each bucket's left edge.
fn timeline(
    stored: &[StepRecord],
    vu_starts: &[VuStartEvent],
    started_at: DateTime<Utc>,
) -> Vec<TimelineBucket> {
    #[derive(Default)]
    struct Acc {
        requests: u64,
        successes: u64,
        sum_ms: f64,
    }

    let mut buckets: HashMap<u64, Acc> = HashMap::new();
    for record in stored {
        let offset_ms = (record.timestamp - started_at).num_milliseconds().max(0) as u64;
        let bucket = offset_ms / 1000 / TIMELINE_BUCKET_S * TIMELINE_BUCKET_S;
        let acc = buckets.entry(bucket).or_default();
        acc.requests += 1;
        if record.success {
            acc.successes += 1;
        }
        acc.sum_ms += record.duration_ms;
    }

    let mut keys: Vec<u64> = buckets.keys().copied().collect();
    keys.sort_unstable();
    keys.into_iter()
        .map(|bucket_start_s| {
            let acc = &buckets[&bucket_start_s];
            let active_vus = vu_starts
                .iter()
                .filter(|e| e.offset_ms <= bucket_start_s * 1000)
                .count() as u64;
            TimelineBucket {
                bucket_start_s,
                active_vus,
                requests: acc.requests,
                avg_rt_ms: if acc.requests > 0 {
                    acc.sum_ms / acc.requests as f64
                } else {
                    0.0
                },
                success_rate: if acc.requests > 0 {
                    100.0 * acc.successes as f64 / acc.requests as f64
                } else {
                    0.0
                },
                throughput: acc.requests as f64 / TIMELINE_BUCKET_S as f64,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
