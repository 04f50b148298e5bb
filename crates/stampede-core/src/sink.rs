//! Output sinks. The metrics collector fans each flushed batch out to every
//! configured sink; a sink failure is logged and never aborts the test.
//!
//! Only file-backed sinks are implemented here; they double as the
//! collector's own results-file flush target. Network sink kinds
//! (influxdb/graphite/webhook) are accepted in `outputs[]` but skipped with
//! a warning; wiring them up is an integration concern.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::plan::model::{OutputConfig, SinkKind};
use crate::results::{StepRecord, TestSummary};

// ---------------------------------------------------------------------------
// Sink contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Sink: Send + Sync {
    /// Prepare the sink (open files, establish connections).
    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Consume one result record.
    async fn write_result(&self, record: &StepRecord) -> Result<(), EngineError>;

    /// Consume the final summary.
    async fn write_summary(&self, summary: &TestSummary) -> Result<(), EngineError>;

    /// Flush and release resources.
    async fn finalize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Human-readable identifier used in error logs.
    fn name(&self) -> &str;
}

/// Build sinks from output descriptors. Disabled entries are skipped;
/// unsupported kinds are skipped with a warning.
pub fn build_sinks(outputs: &[OutputConfig]) -> Vec<Arc<dyn Sink>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    for output in outputs {
        if !output.enabled {
            continue;
        }
        match output.kind {
            SinkKind::Csv => {
                let path = output
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("results.csv"));
                sinks.push(Arc::new(CsvFileSink::new(path)));
            }
            SinkKind::Json => {
                let path = output
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("results.ndjson"));
                sinks.push(Arc::new(NdjsonFileSink::new(path)));
            }
            SinkKind::Influxdb | SinkKind::Graphite | SinkKind::Webhook => {
                tracing::warn!(kind = ?output.kind, "network sink not wired in core, skipping");
            }
        }
    }
    sinks
}

// ---------------------------------------------------------------------------
// NDJSON file sink
// ---------------------------------------------------------------------------

/// Appends one JSON object per result line; the summary lands next to the
/// results file with a `.summary.json` suffix.
pub struct NdjsonFileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl NdjsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sink for NdjsonFileSink {
    async fn initialize(&self) -> Result<(), EngineError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn write_result(&self, record: &StepRecord) -> Result<(), EngineError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| EngineError::Sink("ndjson sink not initialized".to_string()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn write_summary(&self, summary: &TestSummary) -> Result<(), EngineError> {
        let path = summary_path(&self.path);
        let content = serde_json::to_string_pretty(summary)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn finalize(&self) -> Result<(), EngineError> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}

// ---------------------------------------------------------------------------
// CSV file sink
// ---------------------------------------------------------------------------

const CSV_HEADER: &str =
    "timestamp,scenario,step_name,vu_id,iteration,status,duration_ms,bytes_received,success,error\n";

/// Appends one CSV row per result. The header is written when the file is
/// created empty.
pub struct CsvFileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Sink for CsvFileSink {
    async fn initialize(&self) -> Result<(), EngineError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if file.metadata().await?.len() == 0 {
            file.write_all(CSV_HEADER.as_bytes()).await?;
        }
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn write_result(&self, record: &StepRecord) -> Result<(), EngineError> {
        let row = format!(
            "{},{},{},{},{},{},{:.3},{},{},{}\n",
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            csv_escape(&record.scenario),
            csv_escape(&record.step_name),
            record.vu_id,
            record.iteration,
            record.status.map(|s| s.to_string()).unwrap_or_default(),
            record.duration_ms,
            record.bytes_received.unwrap_or(0),
            record.success,
            record.error.as_deref().map(csv_escape).unwrap_or_default(),
        );
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| EngineError::Sink("csv sink not initialized".to_string()))?;
        file.write_all(row.as_bytes()).await?;
        Ok(())
    }

    async fn write_summary(&self, summary: &TestSummary) -> Result<(), EngineError> {
        let path = summary_path(&self.path);
        let content = serde_json::to_string_pretty(summary)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn finalize(&self) -> Result<(), EngineError> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "csv"
    }
}

/// Wrap a field in quotes and escape embedded quotes where needed.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn summary_path(results_path: &Path) -> PathBuf {
    let stem = results_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    results_path.with_file_name(format!("{stem}.summary.json"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_record(step: &str, success: bool) -> StepRecord {
        StepRecord::new(
            1,
            0,
            "main",
            step,
            12.5,
            if success {
                None
            } else {
                Some("connection refused".to_string())
            },
            None,
        )
    }

    fn make_summary() -> TestSummary {
        let now = chrono::Utc::now();
        TestSummary {
            test_name: "t".to_string(),
            started_at: now,
            finished_at: now,
            total_requests: 1,
            successful_requests: 1,
            failed_requests: 0,
            success_rate: 100.0,
            avg_response_ms: 12.5,
            min_response_ms: 12.5,
            max_response_ms: 12.5,
            percentiles: HashMap::new(),
            requests_per_second: 1.0,
            bytes_per_second: 0.0,
            status_distribution: HashMap::new(),
            error_distribution: HashMap::new(),
            error_details: Vec::new(),
            step_statistics: Vec::new(),
            vu_ramp_up: Vec::new(),
            timeline: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ndjson_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let sink = NdjsonFileSink::new(&path);
        sink.initialize().await.unwrap();
        sink.write_result(&make_record("a", true)).await.unwrap();
        sink.write_result(&make_record("b", false)).await.unwrap();
        sink.finalize().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["step_name"], "a");
    }

    #[tokio::test]
    async fn csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = CsvFileSink::new(&path);
        sink.initialize().await.unwrap();
        sink.write_result(&make_record("a", true)).await.unwrap();
        sink.finalize().await.unwrap();

        // Re-open: existing header must not repeat.
        let sink2 = CsvFileSink::new(&path);
        sink2.initialize().await.unwrap();
        sink2.write_result(&make_record("b", true)).await.unwrap();
        sink2.finalize().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("timestamp,scenario").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn csv_sink_escapes_embedded_commas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = CsvFileSink::new(&path);
        sink.initialize().await.unwrap();
        let mut record = make_record("a", false);
        record.error = Some("bad, very bad".to_string());
        record.success = false;
        sink.write_result(&record).await.unwrap();
        sink.finalize().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"bad, very bad\""));
    }

    #[tokio::test]
    async fn summary_lands_next_to_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ndjson");
        let sink = NdjsonFileSink::new(&path);
        sink.initialize().await.unwrap();
        sink.write_summary(&make_summary()).await.unwrap();

        let summary_file = dir.path().join("run.summary.json");
        let content = std::fs::read_to_string(summary_file).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["test_name"], "t");
    }

    #[test]
    fn build_sinks_skips_disabled_and_network_kinds() {
        let outputs = vec![
            OutputConfig {
                kind: SinkKind::Csv,
                enabled: false,
                path: None,
                url: None,
                options: HashMap::new(),
            },
            OutputConfig {
                kind: SinkKind::Webhook,
                enabled: true,
                path: None,
                url: Some("http://example.com/hook".to_string()),
                options: HashMap::new(),
            },
            OutputConfig {
                kind: SinkKind::Json,
                enabled: true,
                path: Some(PathBuf::from("r.ndjson")),
                url: None,
                options: HashMap::new(),
            },
        ];
        let sinks = build_sinks(&outputs);
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "json");
    }
}
