//! Result and summary types produced by the engine and consumed by sinks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// StepRecord — one measurable step execution
// ---------------------------------------------------------------------------

/// The immutable record of one measurable step execution. Produced by a
/// virtual user, then handed off to the metrics collector.
///
/// Invariant: `success` is true exactly when `error` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepRecord {
    pub id: Uuid,
    pub vu_id: u32,
    pub iteration: u64,
    pub scenario: String,
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    /// Time to first byte, when the handler measures it (ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_first_byte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Raw response body, captured only within the debug envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
}

impl StepRecord {
    /// Construct a record, deriving `success` from the presence of an error
    /// so the two can never disagree.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vu_id: u32,
        iteration: u64,
        scenario: impl Into<String>,
        step_name: impl Into<String>,
        duration_ms: f64,
        error: Option<String>,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        let success = error.is_none();
        Self {
            id: Uuid::new_v4(),
            vu_id,
            iteration,
            scenario: scenario.into(),
            step_name: step_name.into(),
            timestamp: Utc::now(),
            duration_ms,
            success,
            status: None,
            bytes_sent: None,
            bytes_received: None,
            latency_first_byte: None,
            connect_time: None,
            error,
            error_kind,
            response_body: None,
            response_headers: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// VuStartEvent
// ---------------------------------------------------------------------------

/// Recorded when a load pattern brings a virtual user up; events appear in
/// creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VuStartEvent {
    pub vu_id: u32,
    pub started_at: DateTime<Utc>,
    /// Milliseconds since the test started.
    pub offset_ms: u64,
}

// ---------------------------------------------------------------------------
// Per-step statistics
// ---------------------------------------------------------------------------

/// Aggregates for one `(scenario, step_name)` pair, computed from stored
/// results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepStats {
    pub scenario: String,
    pub step_name: String,
    pub count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

// ---------------------------------------------------------------------------
// Error details
// ---------------------------------------------------------------------------

/// One grouped error: the key is `(scenario, step, status, error message)`;
/// the first occurrence's metadata is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorDetail {
    pub scenario: String,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// One 5-second timeline bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimelineBucket {
    /// Seconds since test start at the bucket's left edge.
    pub bucket_start_s: u64,
    /// Virtual users started at or before the bucket's left edge.
    pub active_vus: u64,
    pub requests: u64,
    pub avg_rt_ms: f64,
    pub success_rate: f64,
    /// Requests per second within the bucket.
    pub throughput: f64,
}

// ---------------------------------------------------------------------------
// TestSummary
// ---------------------------------------------------------------------------

/// Aggregated summary of a completed test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestSummary {
    pub test_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// `100 · successes / total`, 0 when nothing ran.
    pub success_rate: f64,
    /// Mean duration over successful requests (ms).
    pub avg_response_ms: f64,
    pub min_response_ms: f64,
    pub max_response_ms: f64,
    /// Percentiles over the reservoir sample, keyed `"50"`, `"90"`, `"95"`,
    /// `"99"`, `"99.9"`, `"99.99"`.
    pub percentiles: HashMap<String, f64>,
    pub requests_per_second: f64,
    pub bytes_per_second: f64,
    pub status_distribution: HashMap<u16, u64>,
    /// Error counts keyed by error kind.
    pub error_distribution: HashMap<String, u64>,
    /// Grouped errors, sorted by count descending.
    pub error_details: Vec<ErrorDetail>,
    pub step_statistics: Vec<StepStats>,
    pub vu_ramp_up: Vec<VuStartEvent>,
    pub timeline: Vec<TimelineBucket>,
}
