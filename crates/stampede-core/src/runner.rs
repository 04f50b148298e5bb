//! Test runner: composes the collector, handlers, sinks, data providers,
//! and load patterns into one test run, and owns the cancel signal that
//! fans out to every virtual user and the flush loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::sleep_cancellable;
use crate::data::DataRegistry;
use crate::error::EngineError;
use crate::executor::{StepExecutor, StepHandler};
use crate::metrics::{CollectorConfig, MetricsCollector};
use crate::patterns::run_phase;
use crate::plan::model::{StepKind, TestPlan};
use crate::plan::validate_plan;
use crate::rendezvous::RendezvousRegistry;
use crate::results::TestSummary;
use crate::sink::build_sinks;
use crate::template::TemplateEngine;
use crate::virtual_user::VuFactory;

const DEFAULT_PHASE_PAUSE: Duration = Duration::from_secs(2);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

pub struct TestRunner {
    plan: Arc<TestPlan>,
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
    cancel: CancellationToken,
    rendezvous: Arc<RendezvousRegistry>,
    collector_config: CollectorConfig,
    /// Pause between consecutive load phases.
    phase_pause: Duration,
    /// How long `Stop()` waits for virtual users before abandoning them.
    stop_grace: Duration,
}

impl TestRunner {
    pub fn new(plan: TestPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            handlers: HashMap::new(),
            cancel: CancellationToken::new(),
            rendezvous: Arc::new(RendezvousRegistry::new()),
            collector_config: CollectorConfig::default(),
            phase_pause: DEFAULT_PHASE_PAUSE,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Register the protocol driver for one step kind. Only kinds actually
    /// present in the plan are initialized at run time.
    pub fn register_handler(&mut self, kind: StepKind, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with_collector_config(mut self, config: CollectorConfig) -> Self {
        self.collector_config = config;
        self
    }

    pub fn with_phase_pause(mut self, pause: Duration) -> Self {
        self.phase_pause = pause;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The process-wide cancel signal; wire Ctrl-C to this token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Named barriers shared by this run; handlers and hooks synchronize
    /// through it.
    pub fn rendezvous(&self) -> Arc<RendezvousRegistry> {
        Arc::clone(&self.rendezvous)
    }

    /// Trigger cancellation. The in-flight `run` observes it, stops all
    /// users within the grace period, and finalizes.
    pub fn stop(&self) {
        tracing::info!("stop requested");
        self.cancel.cancel();
    }

    /// Execute the whole plan and return the final summary.
    pub async fn run(&self) -> Result<TestSummary, EngineError> {
        // 1. Validation: any config error is fatal before anything starts.
        let errors = validate_plan(&self.plan);
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::Fatal(joined));
        }

        // 2. Data providers are primed up front so file problems surface
        // before any user starts.
        let data = Arc::new(DataRegistry::new());
        if let Some(binding) = &self.plan.global.csv_data {
            data.get_or_load(binding)?;
        }
        for scenario in &self.plan.scenarios {
            if let Some(binding) = &scenario.data {
                data.get_or_load(binding)?;
            }
        }

        // 3. Handlers, only for step kinds the plan uses. An initialization
        // failure is fatal; a missing handler only fails the affected steps
        // at run time.
        let mut active_handlers: HashMap<StepKind, Arc<dyn StepHandler>> = HashMap::new();
        for kind in self.plan.step_kinds() {
            match self.handlers.get(&kind) {
                Some(handler) => {
                    handler
                        .initialize()
                        .await
                        .map_err(|e| EngineError::Fatal(format!("handler {kind}: {e}")))?;
                    active_handlers.insert(kind, Arc::clone(handler));
                }
                None if kind == StepKind::Wait => {}
                None => {
                    tracing::warn!(%kind, "no handler registered for step type in plan");
                }
            }
        }

        // 4. Fresh rendezvous state per run.
        self.rendezvous.reset();

        // 5. Sinks and collector; nothing fallible-and-fatal runs past this
        // point, so the flush loop always reaches finalize.
        let sinks = build_sinks(&self.plan.outputs);
        let mut ready_sinks = Vec::with_capacity(sinks.len());
        for sink in sinks {
            match sink.initialize().await {
                Ok(()) => ready_sinks.push(sink),
                Err(e) => tracing::warn!(sink = sink.name(), error = %e, "sink disabled"),
            }
        }
        let collector = Arc::new(MetricsCollector::new(
            self.collector_config.clone(),
            ready_sinks,
        ));
        MetricsCollector::start(&collector);

        let template = Arc::new(TemplateEngine::new(
            self.plan.global.faker.clone(),
            Arc::clone(&data),
        ));
        let executor = Arc::new(
            StepExecutor::new(
                active_handlers.clone(),
                template,
                Arc::clone(&collector),
                self.plan.debug.clone(),
            )
            .with_global(self.plan.global.clone())
            .with_rendezvous(Arc::clone(&self.rendezvous)),
        );
        let factory = VuFactory::new(
            Arc::clone(&self.plan),
            executor,
            data,
            Arc::clone(&collector),
            self.cancel.clone(),
        );

        // 6. Phases run in order with a pause in between. Once the cancel
        // signal fires, a phase gets the grace period to wind down before
        // its users are abandoned.
        let phase_count = self.plan.load.len();
        for (idx, phase) in self.plan.load.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            tracing::info!(phase = idx + 1, total = phase_count, "starting load phase");

            let grace = async {
                self.cancel.cancelled().await;
                tokio::time::sleep(self.stop_grace).await;
            };
            tokio::select! {
                result = run_phase(phase, &factory, &self.cancel) => result?,
                _ = grace => {
                    tracing::warn!("grace period elapsed, abandoning remaining virtual users");
                    break;
                }
            }

            if idx + 1 < phase_count && !self.cancel.is_cancelled() {
                sleep_cancellable(self.phase_pause, &self.cancel).await;
            }
        }

        // 7. Finalize: drain the collector, clean handlers up, fan the
        // summary out.
        collector.finalize().await;
        for (kind, handler) in &active_handlers {
            if let Err(e) = handler.cleanup().await {
                tracing::warn!(%kind, error = %e, "handler cleanup failed");
            }
        }

        let summary = collector.summary(&self.plan.name);
        collector.publish_summary(&summary).await;

        if self.plan.report.generate {
            let path = self
                .plan
                .report
                .output
                .clone()
                .unwrap_or_else(|| "report.json".into());
            match serde_json::to_vec_pretty(&summary) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        tracing::warn!(path = %path.display(), error = %e, "report write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "report serialization failed"),
            }
        }

        tracing::info!(
            total = summary.total_requests,
            success_rate = summary.success_rate,
            "test finished"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DurationSpec;
    use crate::executor::{HandlerRequest, HandlerResponse};
    use crate::plan::model::{
        Check, CheckKind, CheckOperator, LoadPhase, Scenario, Step,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct StaticHandler {
        status: u16,
        duration_ms: f64,
        calls: AtomicUsize,
    }

    impl StaticHandler {
        fn new(status: u16, duration_ms: f64) -> Arc<Self> {
            Arc::new(Self {
                status,
                duration_ms,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StepHandler for StaticHandler {
        async fn execute(&self, _request: HandlerRequest<'_>) -> HandlerResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            let mut resp = HandlerResponse::ok(self.duration_ms);
            resp.status = Some(self.status);
            resp
        }
    }

    fn basic_plan(users: u32, duration: &str, ramp_up: Option<&str>) -> TestPlan {
        let mut plan = TestPlan::new("runner test");
        plan.load.push(LoadPhase::Basic {
            users,
            duration: DurationSpec::Text(duration.to_string()),
            ramp_up: ramp_up.map(|r| DurationSpec::Text(r.to_string())),
        });
        let mut step = Step::new("ping", StepKind::Rest);
        step.payload = json!({"method": "GET", "url": "http://x/health"});
        plan.scenarios.push(Scenario::new("main", vec![step]));
        plan
    }

    fn quiet_collector() -> CollectorConfig {
        CollectorConfig {
            flush_interval: None,
            ..CollectorConfig::default()
        }
    }

    // -----------------------------------------------------------------------
    // End-to-end happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn basic_run_produces_consistent_summary() {
        let mut runner = TestRunner::new(basic_plan(3, "300ms", Some("150ms")))
            .with_collector_config(quiet_collector())
            .with_phase_pause(Duration::from_millis(10));
        runner.register_handler(StepKind::Rest, StaticHandler::new(200, 10.0));

        let summary = runner.run().await.unwrap();

        assert!(
            summary.total_requests >= 3,
            "expected iterations from 3 users, got {}",
            summary.total_requests
        );
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(summary.failed_requests, 0);
        assert_eq!(
            summary.status_distribution[&200],
            summary.total_requests
        );
        // Three ramp-up events with ascending, spaced starts (150ms / 3 = 50ms).
        assert_eq!(summary.vu_ramp_up.len(), 3);
        assert!(
            summary.vu_ramp_up[2].offset_ms >= summary.vu_ramp_up[0].offset_ms + 80,
            "ramp-up spacing too tight: {:?}",
            summary
                .vu_ramp_up
                .iter()
                .map(|e| e.offset_ms)
                .collect::<Vec<_>>()
        );
        assert!(summary.requests_per_second > 0.0);
    }

    #[tokio::test]
    async fn check_failures_surface_in_summary() {
        let mut plan = basic_plan(1, "50ms", None);
        plan.scenarios[0].steps[0].checks.push(Check {
            kind: CheckKind::Status,
            operator: CheckOperator::Eq,
            expected: json!(200),
            expression: None,
        });
        let mut runner = TestRunner::new(plan)
            .with_collector_config(quiet_collector())
            .with_phase_pause(Duration::from_millis(10));
        runner.register_handler(StepKind::Rest, StaticHandler::new(500, 20.0));

        let summary = runner.run().await.unwrap();

        assert!(summary.failed_requests >= 1);
        assert_eq!(summary.successful_requests, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert!(summary.error_details[0].error.contains("check failed"));
        assert_eq!(summary.error_details[0].status, Some(500));
    }

    // -----------------------------------------------------------------------
    // Validation / fatal errors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_plan_is_fatal_before_start() {
        let mut plan = basic_plan(0, "50ms", None);
        plan.scenarios.clear();
        let runner = TestRunner::new(plan);
        let err = runner.run().await.unwrap_err();
        match err {
            EngineError::Fatal(message) => {
                assert!(message.contains("users > 0"));
                assert!(message.contains("scenario"));
            }
            other => panic!("expected Fatal, got {other}"),
        }
    }

    #[tokio::test]
    async fn failing_handler_initialize_is_fatal() {
        struct BadInit;
        #[async_trait]
        impl StepHandler for BadInit {
            async fn execute(&self, _request: HandlerRequest<'_>) -> HandlerResponse {
                HandlerResponse::ok(1.0)
            }
            async fn initialize(&self) -> Result<(), EngineError> {
                Err(EngineError::Handler("driver missing".to_string()))
            }
        }

        let mut runner = TestRunner::new(basic_plan(1, "50ms", None))
            .with_collector_config(quiet_collector());
        runner.register_handler(StepKind::Rest, Arc::new(BadInit));
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    // -----------------------------------------------------------------------
    // Stop semantics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_ends_a_long_run_within_grace() {
        let mut runner = TestRunner::new(basic_plan(2, "30s", None))
            .with_collector_config(quiet_collector())
            .with_stop_grace(Duration::from_secs(2));
        runner.register_handler(StepKind::Rest, StaticHandler::new(200, 5.0));
        let runner = Arc::new(runner);

        let stopper = Arc::clone(&runner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.stop();
        });

        let start = Instant::now();
        let summary = runner.run().await.unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "run did not stop promptly"
        );
        // Everything recorded happened before stop + grace.
        assert!(summary.total_requests > 0);
    }

    // -----------------------------------------------------------------------
    // Phases / report
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn multiple_phases_run_in_order() {
        let mut plan = basic_plan(1, "60ms", None);
        plan.load.push(LoadPhase::Basic {
            users: 2,
            duration: DurationSpec::Text("60ms".to_string()),
            ramp_up: None,
        });
        let mut runner = TestRunner::new(plan)
            .with_collector_config(quiet_collector())
            .with_phase_pause(Duration::from_millis(20));
        runner.register_handler(StepKind::Rest, StaticHandler::new(200, 5.0));

        let summary = runner.run().await.unwrap();
        // One user in phase one, two in phase two.
        assert_eq!(summary.vu_ramp_up.len(), 3);
        let ids: Vec<u32> = summary.vu_ramp_up.iter().map(|e| e.vu_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn report_file_written_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");

        let mut plan = basic_plan(1, "50ms", None);
        plan.report.generate = true;
        plan.report.output = Some(report_path.clone());
        let mut runner = TestRunner::new(plan)
            .with_collector_config(quiet_collector())
            .with_phase_pause(Duration::from_millis(10));
        runner.register_handler(StepKind::Rest, StaticHandler::new(200, 5.0));
        runner.run().await.unwrap();

        let content = std::fs::read_to_string(&report_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["test_name"], "runner test");
        assert!(parsed["total_requests"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn sinks_receive_results_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let results_path = dir.path().join("run.ndjson");

        let mut plan = basic_plan(1, "50ms", None);
        plan.outputs.push(crate::plan::model::OutputConfig {
            kind: crate::plan::model::SinkKind::Json,
            enabled: true,
            path: Some(results_path.clone()),
            url: None,
            options: HashMap::new(),
        });
        let mut runner = TestRunner::new(plan)
            .with_collector_config(CollectorConfig {
                batch_size: 1,
                flush_interval: None,
                ..CollectorConfig::default()
            })
            .with_phase_pause(Duration::from_millis(10));
        runner.register_handler(StepKind::Rest, StaticHandler::new(200, 5.0));
        let summary = runner.run().await.unwrap();

        let results = std::fs::read_to_string(&results_path).unwrap();
        assert_eq!(results.lines().count() as u64, summary.total_requests);
        let summary_file = dir.path().join("run.summary.json");
        assert!(summary_file.exists());
    }
}
