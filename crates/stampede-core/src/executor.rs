//! Step execution: render a step, dispatch it to its protocol handler, run
//! checks and extractions, apply per-step hooks, and record the result.
//!
//! Protocol handlers live behind the [`StepHandler`] trait; the engine never
//! performs protocol I/O itself. `wait` steps are the one in-core kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::clock::sleep_cancellable;
use crate::context::{value_to_string, VuContext};
use crate::error::{EngineError, ErrorKind};
use crate::hooks::HookEngine;
use crate::metrics::MetricsCollector;
use crate::plan::model::{
    Backoff, Check, CheckKind, CheckOperator, DebugConfig, Extraction, ExtractionKind,
    GlobalConfig, Step, StepKind,
};
use crate::rendezvous::RendezvousRegistry;
use crate::results::StepRecord;
use crate::template::TemplateEngine;

/// A result at or above this fraction of the configured timeout is treated
/// as a timeout failure regardless of the handler's verdict.
const EFFECTIVE_TIMEOUT_FRACTION: f64 = 0.95;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// What a protocol handler receives for one attempt.
pub struct HandlerRequest<'a> {
    pub step_name: &'a str,
    pub kind: StepKind,
    /// Fully rendered protocol-specific payload.
    pub payload: &'a Value,
    pub timeout: Option<Duration>,
    /// Plan-wide defaults (base URL, headers, timeout), forwarded opaquely.
    pub global: &'a GlobalConfig,
    /// Capture envelope forwarded opaquely from the plan.
    pub debug: &'a DebugConfig,
    pub vu_id: u32,
}

/// What a protocol handler returns from one attempt.
#[derive(Debug, Clone, Default)]
pub struct HandlerResponse {
    pub success: bool,
    pub status: Option<u16>,
    pub duration_ms: f64,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
    pub latency_first_byte: Option<f64>,
    pub connect_time: Option<f64>,
    /// Handler-captured values (browser selector results and similar),
    /// consumed by `selector` extractions.
    pub data: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub raw_body: Option<String>,
    pub raw_headers: Option<HashMap<String, String>>,
}

impl HandlerResponse {
    pub fn ok(duration_ms: f64) -> Self {
        Self {
            success: true,
            duration_ms,
            ..Self::default()
        }
    }

    pub fn failure(duration_ms: f64, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            success: false,
            duration_ms,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Protocol driver for one step kind. Implementations live outside the core.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, request: HandlerRequest<'_>) -> HandlerResponse;

    /// One-time setup before the test starts.
    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// One-time teardown after the test ends.
    async fn cleanup(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Release per-VU resources (browser pages and similar).
    async fn cleanup_vu(&self, _vu_id: u32) {}
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What the virtual user learns about one step execution.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub skipped: bool,
    pub success: bool,
    /// Whether a result was pushed into the metrics collector.
    pub recorded: bool,
}

impl StepOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            success: true,
            recorded: false,
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
    template: Arc<TemplateEngine>,
    collector: Arc<MetricsCollector>,
    hooks: HookEngine,
    global: GlobalConfig,
    debug: DebugConfig,
    rendezvous: Option<Arc<RendezvousRegistry>>,
}

impl StepExecutor {
    pub fn new(
        handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
        template: Arc<TemplateEngine>,
        collector: Arc<MetricsCollector>,
        debug: DebugConfig,
    ) -> Self {
        let hooks = HookEngine::new(Arc::clone(&template));
        Self {
            handlers,
            template,
            collector,
            hooks,
            global: GlobalConfig::default(),
            debug,
            rendezvous: None,
        }
    }

    /// Plan-wide handler defaults forwarded with every request.
    pub fn with_global(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }

    /// Enable `wait` steps with a `rendezvous` payload to block at a named
    /// barrier instead of sleeping.
    pub fn with_rendezvous(mut self, rendezvous: Arc<RendezvousRegistry>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn handlers(&self) -> &HashMap<StepKind, Arc<dyn StepHandler>> {
        &self.handlers
    }

    pub fn hooks(&self) -> &HookEngine {
        &self.hooks
    }

    /// Release per-VU handler resources; called from the VU's `stop`.
    pub async fn cleanup_vu(&self, vu_id: u32) {
        for handler in self.handlers.values() {
            handler.cleanup_vu(vu_id).await;
        }
    }

    /// Execute one step within `scenario` against the given context.
    ///
    /// Returns `Err` only when the step failed and `continue_on_error` is
    /// false; the virtual user aborts the current scenario in that case.
    pub fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a mut VuContext,
        scenario: &'a str,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<StepOutcome, EngineError>> + Send + 'a>>
    {
        Box::pin(async move { self.execute_step_inner(step, ctx, scenario, cancel).await })
    }

    async fn execute_step_inner(
        &self,
        step: &Step,
        ctx: &mut VuContext,
        scenario: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        // 1. Skip predicate.
        if let Some(condition) = &step.condition {
            if !self.evaluate_condition(condition, ctx) {
                tracing::debug!(vu_id = ctx.vu_id, step = %step.name, "step skipped by condition");
                return Ok(StepOutcome::skipped());
            }
        }

        // 2. beforeStep hook.
        if let Some(hook) = &step.hooks.before_step {
            self.hooks.run(hook, ctx, self, scenario, cancel).await?;
        }

        // 3. Render the whole payload against the context.
        let payload = self.template.render_json(&step.payload, ctx);
        let timeout = match &step.timeout {
            Some(spec) => Some(spec.as_duration()?),
            None => None,
        };

        // 4. Attempt loop with retry backoff. Checks participate in the
        // retry decision.
        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1).max(1);
        let mut response = HandlerResponse::default();
        let mut check_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            response = self.dispatch(step, &payload, timeout, ctx, cancel).await;
            check_error = self.run_checks(&step.checks, &response, ctx);
            if response.success && check_error.is_none() {
                break;
            }
            if attempt < max_attempts {
                if let Some(retry) = &step.retry {
                    let base = retry.delay.as_duration()?;
                    let factor = match retry.backoff {
                        Backoff::Exponential => 2u32.saturating_pow(attempt - 1),
                        Backoff::Linear => attempt,
                    };
                    tracing::debug!(
                        vu_id = ctx.vu_id,
                        step = %step.name,
                        attempt,
                        "step failed, retrying"
                    );
                    if !sleep_cancellable(base * factor, cancel).await {
                        break;
                    }
                }
            }
        }

        // 5/6. Checks already folded in; apply extractions on the final
        // response.
        self.run_extractions(&step.extract, &response, ctx);

        // Resolve the final verdict.
        let mut error = response.error.clone();
        let mut error_kind = response.error_kind;
        if error.is_none() {
            if let Some(check_msg) = check_error {
                error = Some(check_msg);
                error_kind = Some(ErrorKind::Check);
            }
        }

        // Effective timeout detection on measurable steps.
        let measurable = is_measurable(step);
        if measurable {
            if let Some(timeout) = timeout {
                let limit = timeout.as_secs_f64() * 1000.0 * EFFECTIVE_TIMEOUT_FRACTION;
                if response.duration_ms >= limit {
                    error = Some("verification timeout".to_string());
                    error_kind = Some(ErrorKind::Timeout);
                }
            }
        }
        let success = error.is_none();

        // 7. onStepError on failure; teardown hook always.
        if !success {
            if let Some(hook) = &step.hooks.on_error {
                if let Err(e) = self.hooks.run(hook, ctx, self, scenario, cancel).await {
                    tracing::warn!(step = %step.name, error = %e, "onStepError hook failed");
                }
            }
        }
        if let Some(hook) = &step.hooks.after_step {
            if let Err(e) = self.hooks.run(hook, ctx, self, scenario, cancel).await {
                tracing::warn!(step = %step.name, error = %e, "afterStep hook failed");
            }
        }

        // 8. Record measurable executions.
        if measurable {
            let mut record = StepRecord::new(
                ctx.vu_id,
                ctx.iteration,
                scenario,
                &step.name,
                response.duration_ms,
                error.clone(),
                error_kind,
            );
            record.status = response.status;
            record.bytes_sent = response.bytes_sent;
            record.bytes_received = response.bytes_received;
            record.latency_first_byte = response.latency_first_byte;
            record.connect_time = response.connect_time;
            self.apply_capture_envelope(&mut record, &response, success);
            self.collector.record_result(record);
        }

        // 9. Propagate only when the step opted out of continue-on-error.
        if !success && !step.continue_on_error {
            let message = error.unwrap_or_else(|| "step failed".to_string());
            return Err(match error_kind {
                Some(ErrorKind::Check) => EngineError::CheckFailed(message),
                _ => EngineError::Handler(message),
            });
        }

        Ok(StepOutcome {
            skipped: false,
            success,
            recorded: measurable,
        })
    }

    /// Dispatch one attempt. `wait` steps sleep in-core; everything else goes
    /// through the registered handler for the step kind.
    async fn dispatch(
        &self,
        step: &Step,
        payload: &Value,
        timeout: Option<Duration>,
        ctx: &VuContext,
        cancel: &CancellationToken,
    ) -> HandlerResponse {
        if step.kind == StepKind::Wait {
            // A wait step naming a rendezvous blocks at that barrier.
            if let Some(name) = payload.get("rendezvous").and_then(|v| v.as_str()) {
                if let Some(registry) = &self.rendezvous {
                    let parties = payload
                        .get("users")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(1) as usize;
                    let start = std::time::Instant::now();
                    registry.wait(name, parties, cancel).await;
                    return HandlerResponse::ok(start.elapsed().as_secs_f64() * 1000.0);
                }
                tracing::warn!(step = %step.name, "rendezvous requested but none configured");
            }
            let duration = payload
                .get("duration")
                .and_then(|v| v.as_str())
                .and_then(|s| humantime::parse_duration(s).ok())
                .or_else(|| {
                    payload
                        .get("duration")
                        .and_then(|v| v.as_f64())
                        .map(Duration::from_secs_f64)
                })
                .unwrap_or(Duration::from_secs(1));
            let start = std::time::Instant::now();
            sleep_cancellable(duration, cancel).await;
            return HandlerResponse::ok(start.elapsed().as_secs_f64() * 1000.0);
        }

        match self.handlers.get(&step.kind) {
            Some(handler) => {
                let request = HandlerRequest {
                    step_name: &step.name,
                    kind: step.kind,
                    payload,
                    timeout,
                    global: &self.global,
                    debug: &self.debug,
                    vu_id: ctx.vu_id,
                };
                handler.execute(request).await
            }
            None => HandlerResponse::failure(
                0.0,
                format!("no handler registered for step type '{}'", step.kind),
                ErrorKind::Request,
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Condition evaluation
    // -----------------------------------------------------------------------

    /// Render the condition, then evaluate `==`/`!=` comparisons or plain
    /// truthiness. Unresolved placeholders count as false.
    fn evaluate_condition(&self, condition: &str, ctx: &VuContext) -> bool {
        let mut cache = crate::template::RowCache::new();
        let rendered = self.template.render_lenient(condition, ctx, &mut cache);
        if let Some((left, right)) = rendered.split_once("!=") {
            return left.trim() != right.trim();
        }
        if let Some((left, right)) = rendered.split_once("==") {
            return left.trim() == right.trim();
        }
        let trimmed = rendered.trim();
        !(trimmed.is_empty()
            || trimmed == "false"
            || trimmed == "0"
            || trimmed == "null"
            || trimmed.contains("{{"))
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    /// Evaluate every check; all of them run and all failures are collected
    /// into a single message.
    fn run_checks(
        &self,
        checks: &[Check],
        response: &HandlerResponse,
        ctx: &VuContext,
    ) -> Option<String> {
        if checks.is_empty() {
            return None;
        }
        let mut failures = Vec::new();
        for check in checks {
            if let Err(reason) = evaluate_check(check, response, ctx) {
                failures.push(reason);
            }
        }
        if failures.is_empty() {
            None
        } else {
            Some(format!("check failed: {}", failures.join("; ")))
        }
    }

    // -----------------------------------------------------------------------
    // Extractions
    // -----------------------------------------------------------------------

    fn run_extractions(
        &self,
        extractions: &[Extraction],
        response: &HandlerResponse,
        ctx: &mut VuContext,
    ) {
        for extraction in extractions {
            match evaluate_extraction(extraction, response) {
                Some(value) => {
                    ctx.extracted_data.insert(extraction.name.clone(), value);
                }
                None => match &extraction.default {
                    Some(default) => {
                        ctx.extracted_data
                            .insert(extraction.name.clone(), default.clone());
                    }
                    None => tracing::warn!(
                        vu_id = ctx.vu_id,
                        extraction = %extraction.name,
                        expression = %extraction.expression,
                        "extraction found nothing and has no default"
                    ),
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // Capture envelope
    // -----------------------------------------------------------------------

    fn apply_capture_envelope(
        &self,
        record: &mut StepRecord,
        response: &HandlerResponse,
        success: bool,
    ) {
        let capture = !self.debug.capture_only_failures || !success;
        if self.debug.capture_response_body && capture {
            if let Some(body) = &response.raw_body {
                let mut truncated = body.clone();
                if truncated.len() > self.debug.max_response_body_size {
                    let mut cut = self.debug.max_response_body_size;
                    while !truncated.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    truncated.truncate(cut);
                    truncated.push_str("…[truncated]");
                }
                record.response_body = Some(truncated);
            }
        }
        if self.debug.capture_response_headers && capture {
            if let Some(headers) = &response.raw_headers {
                record.response_headers = headers.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Check evaluation
// ---------------------------------------------------------------------------

/// Evaluate one check; `Err` carries the human-readable failure reason.
fn evaluate_check(
    check: &Check,
    response: &HandlerResponse,
    ctx: &VuContext,
) -> Result<(), String> {
    let actual: Value = match check.kind {
        CheckKind::Status => match response.status {
            Some(status) => Value::from(status),
            None => return Err("status: response has no status code".to_string()),
        },
        CheckKind::ResponseTime => Value::from(response.duration_ms),
        CheckKind::JsonPath => {
            let expression = check
                .expression
                .as_deref()
                .ok_or_else(|| "json_path: missing expression".to_string())?;
            let body = response.raw_body.as_deref().unwrap_or("");
            let json: Value = serde_json::from_str(body)
                .map_err(|e| format!("json_path: body is not JSON: {e}"))?;
            match navigate_json_path(&json, expression) {
                Some(value) => value.clone(),
                None => {
                    return Err(format!("json_path: \"{expression}\" not found in response"))
                }
            }
        }
        CheckKind::TextContains => {
            let body = response.raw_body.as_deref().unwrap_or("");
            let needle = value_to_string(&check.expected);
            if body.contains(&needle) {
                return Ok(());
            }
            return Err(format!("text_contains: body does not contain \"{needle}\""));
        }
        CheckKind::Regex => {
            let pattern = check
                .expression
                .as_deref()
                .map(str::to_string)
                .unwrap_or_else(|| value_to_string(&check.expected));
            let re = Regex::new(&pattern)
                .map_err(|e| format!("regex: invalid pattern \"{pattern}\": {e}"))?;
            let body = response.raw_body.as_deref().unwrap_or("");
            if re.is_match(body) {
                return Ok(());
            }
            return Err(format!("regex: \"{pattern}\" did not match the response body"));
        }
        CheckKind::Custom => {
            let expression = check
                .expression
                .as_deref()
                .ok_or_else(|| "custom: missing expression".to_string())?;
            match ctx.lookup(expression) {
                Some(value) => value,
                None => return Err(format!("custom: variable \"{expression}\" is not set")),
            }
        }
    };

    apply_operator(check.operator, &actual, &check.expected).map_err(|detail| {
        format!(
            "{:?} {} expected {}, got {}",
            check.kind,
            operator_symbol(check.operator),
            check.expected,
            detail
        )
    })
}

/// Apply a comparison operator; numbers compare numerically, everything else
/// as strings. `Err` carries the rendered actual value.
fn apply_operator(operator: CheckOperator, actual: &Value, expected: &Value) -> Result<(), String> {
    let numeric = actual.as_f64().zip(expected.as_f64()).or_else(|| {
        // Strings holding numbers still compare numerically for lt/gt.
        value_to_string(actual)
            .parse::<f64>()
            .ok()
            .zip(value_to_string(expected).parse::<f64>().ok())
    });

    let passed = match operator {
        CheckOperator::Eq => match numeric {
            Some((a, e)) => (a - e).abs() < f64::EPSILON,
            None => value_to_string(actual) == value_to_string(expected),
        },
        CheckOperator::Ne => match numeric {
            Some((a, e)) => (a - e).abs() >= f64::EPSILON,
            None => value_to_string(actual) != value_to_string(expected),
        },
        CheckOperator::Lt => numeric.map(|(a, e)| a < e).unwrap_or(false),
        CheckOperator::Le => numeric.map(|(a, e)| a <= e).unwrap_or(false),
        CheckOperator::Gt => numeric.map(|(a, e)| a > e).unwrap_or(false),
        CheckOperator::Ge => numeric.map(|(a, e)| a >= e).unwrap_or(false),
        CheckOperator::Contains => {
            value_to_string(actual).contains(&value_to_string(expected))
        }
        CheckOperator::NotContains => {
            !value_to_string(actual).contains(&value_to_string(expected))
        }
        CheckOperator::Matches => Regex::new(&value_to_string(expected))
            .map(|re| re.is_match(&value_to_string(actual)))
            .unwrap_or(false),
    };

    if passed {
        Ok(())
    } else {
        Err(value_to_string(actual))
    }
}

fn operator_symbol(operator: CheckOperator) -> &'static str {
    match operator {
        CheckOperator::Eq => "==",
        CheckOperator::Ne => "!=",
        CheckOperator::Lt => "<",
        CheckOperator::Le => "<=",
        CheckOperator::Gt => ">",
        CheckOperator::Ge => ">=",
        CheckOperator::Contains => "contains",
        CheckOperator::NotContains => "not_contains",
        CheckOperator::Matches => "matches",
    }
}

// ---------------------------------------------------------------------------
// Extraction evaluation
// ---------------------------------------------------------------------------

fn evaluate_extraction(extraction: &Extraction, response: &HandlerResponse) -> Option<Value> {
    match extraction.kind {
        ExtractionKind::JsonPath => {
            let body = response.raw_body.as_deref()?;
            let json: Value = serde_json::from_str(body).ok()?;
            navigate_json_path(&json, &extraction.expression).cloned()
        }
        ExtractionKind::Regex => {
            let body = response.raw_body.as_deref()?;
            let re = Regex::new(&extraction.expression).ok()?;
            let caps = re.captures(body)?;
            let m = caps.get(1).or_else(|| caps.get(0))?;
            Some(Value::String(m.as_str().to_string()))
        }
        ExtractionKind::Header => {
            let headers = response.raw_headers.as_ref()?;
            headers
                .get(&extraction.expression.to_lowercase())
                .map(|v| Value::String(v.clone()))
        }
        ExtractionKind::Selector => response
            .data
            .as_ref()
            .and_then(|data| data.get(&extraction.expression))
            .cloned(),
    }
}

/// Navigate a simple dot-notation JSON path.
///
/// Supports `"key"`, `"key.subkey"`, `"key[0]"`, and `"key[0].subkey"`; no
/// wildcards or filter expressions.
fn navigate_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if let Some(bracket_pos) = segment.find('[') {
            let key = &segment[..bracket_pos];
            let closing = segment.rfind(']')?;
            let idx: usize = segment[bracket_pos + 1..closing].parse().ok()?;
            if !key.is_empty() {
                current = current.get(key)?;
            }
            current = current.get(idx)?;
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current)
}

/// Whether a step execution produces a metrics record.
///
/// `rest`, `soap`, `wait`, and `custom` steps are always measurable. Browser
/// steps are measurable only for navigation, verification, and explicit
/// measurement commands; pure interactions (clicks, fills) are not, unless
/// the payload requests measurement.
pub fn is_measurable(step: &Step) -> bool {
    match step.kind {
        StepKind::Rest | StepKind::Soap | StepKind::Wait | StepKind::Custom => true,
        StepKind::Web => {
            if step.payload.get("measure").and_then(|v| v.as_bool()) == Some(true) {
                return true;
            }
            let command = step
                .payload
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            const MEASURABLE_PREFIXES: [&str; 9] = [
                "navigate",
                "goto",
                "reload",
                "back",
                "verify",
                "wait_for",
                "assert",
                "measure",
                "performance",
            ];
            MEASURABLE_PREFIXES
                .iter()
                .any(|prefix| command.starts_with(prefix))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
