//! Hook engine: user logic attached to lifecycle points.
//!
//! Inline hooks are a declarative operation list rather than interpreted
//! code; file hooks load the same list from JSON, and step-list hooks run
//! real steps through the step executor against a synthetic context. Every
//! hook runs under a hard timeout, and variables it produces are merged into
//! the caller's context after it returns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::clock::sleep_cancellable;
use crate::context::VuContext;
use crate::error::EngineError;
use crate::executor::{StepExecutor, StepOutcome};
use crate::plan::model::{Hook, HookAction, HookOp};
use crate::template::TemplateEngine;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one hook run. A failed hook with `continue_on_error` produces
/// a failure record instead of an error.
#[derive(Debug, Clone)]
pub struct HookResult {
    pub success: bool,
    pub variables: HashMap<String, Value>,
    pub error: Option<String>,
}

pub struct HookEngine {
    template: Arc<TemplateEngine>,
}

impl HookEngine {
    pub fn new(template: Arc<TemplateEngine>) -> Self {
        Self { template }
    }

    /// Run one hook against the caller's context.
    ///
    /// Returned variables are merged into `ctx.variables` after the hook
    /// completes, on top of any direct mutations the hook performed. `Err`
    /// is produced only when the hook failed and `continue_on_error` is
    /// explicitly false.
    pub async fn run(
        &self,
        hook: &Hook,
        ctx: &mut VuContext,
        executor: &StepExecutor,
        scenario: &str,
        cancel: &CancellationToken,
    ) -> Result<HookResult, EngineError> {
        let limit = match &hook.timeout {
            Some(spec) => spec.as_duration()?,
            None => DEFAULT_HOOK_TIMEOUT,
        };

        let outcome =
            tokio::time::timeout(limit, self.execute(&hook.action, ctx, executor, scenario, cancel))
                .await;

        let (variables, error) = match outcome {
            Ok(Ok(variables)) => (variables, None),
            Ok(Err(message)) => (HashMap::new(), Some(message)),
            Err(_) => (
                HashMap::new(),
                Some(format!("hook timed out after {limit:?}")),
            ),
        };

        match error {
            None => {
                ctx.merge_variables(&variables);
                Ok(HookResult {
                    success: true,
                    variables,
                    error: None,
                })
            }
            Some(message) => {
                if hook.continue_on_error {
                    tracing::warn!(vu_id = ctx.vu_id, error = %message, "hook failed");
                    Ok(HookResult {
                        success: false,
                        variables: HashMap::new(),
                        error: Some(message),
                    })
                } else {
                    Err(EngineError::Hook(message))
                }
            }
        }
    }

    async fn execute(
        &self,
        action: &HookAction,
        ctx: &mut VuContext,
        executor: &StepExecutor,
        scenario: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, String> {
        match action {
            HookAction::Inline { ops } => self.apply_ops(ops, ctx, cancel).await,
            HookAction::File { path } => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read hook file {}: {e}", path.display()))?;
                let ops: Vec<HookOp> = serde_json::from_str(&content)
                    .map_err(|e| format!("invalid hook file {}: {e}", path.display()))?;
                self.apply_ops(&ops, ctx, cancel).await
            }
            HookAction::Steps { steps } => {
                // Steps run against a synthetic copy of the caller's context;
                // extracted values propagate back afterwards.
                let mut synthetic = ctx.clone();
                for step in steps {
                    let fut: Pin<
                        Box<dyn Future<Output = Result<StepOutcome, EngineError>> + Send + '_>,
                    > = Box::pin(executor.execute_step(step, &mut synthetic, scenario, cancel));
                    let outcome = fut.await.map_err(|e| e.to_string())?;
                    if !outcome.success && !outcome.skipped {
                        tracing::debug!(step = %step.name, "hook step failed, continuing");
                    }
                }
                for (name, value) in &synthetic.extracted_data {
                    ctx.extracted_data.insert(name.clone(), value.clone());
                }
                // Variables the steps' own hooks introduced come back through
                // the merge path.
                let mut produced = HashMap::new();
                for (name, value) in &synthetic.variables {
                    if ctx.variables.get(name) != Some(value) {
                        produced.insert(name.clone(), value.clone());
                    }
                }
                Ok(produced)
            }
        }
    }

    /// Apply declarative operations in order. Each op sees the values set by
    /// earlier ops through a scratch context.
    async fn apply_ops(
        &self,
        ops: &[HookOp],
        ctx: &VuContext,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, String> {
        let mut produced: HashMap<String, Value> = HashMap::new();
        let mut scratch = ctx.clone();

        for op in ops {
            let (name, value) = match op {
                HookOp::Set { name, value } => {
                    let resolved = match value {
                        Value::String(text) => {
                            let mut cache = crate::template::RowCache::new();
                            Value::String(self.template.render_lenient(text, &scratch, &mut cache))
                        }
                        other => other.clone(),
                    };
                    (name.clone(), resolved)
                }
                HookOp::SetRandomInt { name, min, max } => {
                    if min > max {
                        return Err(format!("set_random_int {name}: min exceeds max"));
                    }
                    (name.clone(), Value::from(rand::thread_rng().gen_range(*min..=*max)))
                }
                HookOp::SetRandomChoice { name, options } => {
                    if options.is_empty() {
                        return Err(format!("set_random_choice {name}: empty options"));
                    }
                    let pick = options[rand::thread_rng().gen_range(0..options.len())].clone();
                    (name.clone(), pick)
                }
                HookOp::SetUuid { name } => {
                    (name.clone(), Value::String(uuid::Uuid::new_v4().to_string()))
                }
                HookOp::SetTimestamp { name, format } => {
                    let format = format.as_deref().unwrap_or("unix");
                    let value = crate::template::format_timestamp(format).unwrap_or_else(|| {
                        tracing::warn!(format, "unknown timestamp format, using unix");
                        crate::template::format_timestamp("unix").expect("unix format")
                    });
                    (name.clone(), Value::String(value))
                }
                HookOp::Sleep { duration } => {
                    let dur = duration.as_duration().map_err(|e| e.to_string())?;
                    if !sleep_cancellable(dur, cancel).await {
                        return Err("hook cancelled during sleep".to_string());
                    }
                    continue;
                }
            };
            scratch.variables.insert(name.clone(), value.clone());
            produced.insert(name, value);
        }

        Ok(produced)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
