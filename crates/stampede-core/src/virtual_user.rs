//! Virtual users: each owns a private context and repeatedly executes the
//! plan's scenarios: weighted selection, per-scenario data binding, loop
//! iterations with hooks, and think-time pacing between steps.
//!
//! A virtual user never panics and never aborts its siblings: step and
//! scenario failures are contained, and data exhaustion turns into a
//! graceful terminate signal for this user only.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::clock::{sleep_cancellable, ThinkTime};
use crate::context::VuContext;
use crate::data::{DataRegistry, RowOutcome};
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::metrics::MetricsCollector;
use crate::plan::model::{DataBinding, DataMode, Scenario, Step, StepKind, TestPlan};

/// Step-name prefixes that suppress the think-time pause before them.
const NO_THINK_TIME_PREFIXES: [&str; 4] =
    ["verify_", "wait_for_", "measure_web_vitals", "performance_audit"];

/// What one `execute_scenarios` pass tells the load pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuSignal {
    /// The pass completed; the pattern may schedule another.
    Continue,
    /// The user stopped itself (data exhaustion or stop signal); the pattern
    /// must not schedule it again.
    Terminated,
}

/// Shared stop control for a virtual user, usable from the load pattern
/// while the user runs in its own task.
#[derive(Clone)]
pub struct VuHandle {
    pub id: u32,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl VuHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask the user to stop. The user observes this between steps and aborts
    /// blocking waits through its cancellation token.
    pub fn signal_stop(&self) {
        self.active.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// VirtualUser
// ---------------------------------------------------------------------------

pub struct VirtualUser {
    id: u32,
    active: Arc<AtomicBool>,
    ctx: VuContext,
    plan: Arc<TestPlan>,
    executor: Arc<StepExecutor>,
    data: Arc<DataRegistry>,
    cancel: CancellationToken,
}

impl VirtualUser {
    pub fn new(
        id: u32,
        plan: Arc<TestPlan>,
        executor: Arc<StepExecutor>,
        data: Arc<DataRegistry>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            id,
            active: Arc::new(AtomicBool::new(true)),
            ctx: VuContext::new(id),
            plan,
            executor,
            data,
            cancel: parent_cancel.child_token(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub fn handle(&self) -> VuHandle {
        VuHandle {
            id: self.id,
            active: Arc::clone(&self.active),
            cancel: self.cancel.clone(),
        }
    }

    /// Stop this user: clear the active flag, abort blocking waits, and
    /// release per-VU handler resources. Returns only when cleanup finished.
    pub async fn stop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.cancel.cancel();
            self.executor.cleanup_vu(self.id).await;
        }
    }

    /// Final cleanup for the drive loop; safe to call after `stop`.
    pub async fn shutdown(&mut self) {
        self.stop().await;
    }

    /// One full execution pass: global data row, VU hooks, weighted scenario
    /// selection, and every selected scenario in declaration order.
    pub async fn execute_scenarios(&mut self) -> Result<VuSignal, EngineError> {
        if !self.is_active() {
            return Ok(VuSignal::Terminated);
        }

        // 1. Global data row feeds this pass's variables.
        if let Some(binding) = self.plan.global.csv_data.clone() {
            match self.load_row(&binding)? {
                Some(row) => {
                    self.ctx.merge_row(&row);
                    self.ctx.global_row = Some(row);
                }
                None => {
                    tracing::info!(vu_id = self.id, "VU terminated: global data exhausted");
                    self.stop().await;
                    return Ok(VuSignal::Terminated);
                }
            }
        }

        // 2. beforeVU hook.
        if let Some(hook) = self.plan.hooks.before_vu.clone() {
            let executor = Arc::clone(&self.executor);
            executor
                .hooks()
                .run(&hook, &mut self.ctx, &executor, "", &self.cancel)
                .await?;
        }

        // 3. Weighted selection, declaration order preserved.
        let selected = self.select_scenarios();

        // 4. Each scenario is isolated: a failure is logged and the next
        // scenario still runs.
        for scenario_idx in selected {
            if !self.is_active() {
                break;
            }
            let scenario = self.plan.scenarios[scenario_idx].clone();
            match self.run_scenario(&scenario).await {
                Ok(()) => {}
                Err(EngineError::DataExhausted(source)) => {
                    tracing::info!(
                        vu_id = self.id,
                        scenario = %scenario.name,
                        source = %source,
                        "VU terminated: scenario data exhausted"
                    );
                    self.stop().await;
                    return Ok(VuSignal::Terminated);
                }
                Err(e) => {
                    tracing::warn!(
                        vu_id = self.id,
                        scenario = %scenario.name,
                        error = %e,
                        "scenario failed"
                    );
                }
            }
        }

        // 5. teardownVU hook; failures only logged.
        if let Some(hook) = self.plan.hooks.after_vu.clone() {
            let executor = Arc::clone(&self.executor);
            if let Err(e) = executor
                .hooks()
                .run(&hook, &mut self.ctx, &executor, "", &self.cancel)
                .await
            {
                tracing::warn!(vu_id = self.id, error = %e, "teardownVU hook failed");
            }
        }

        if self.is_active() {
            Ok(VuSignal::Continue)
        } else {
            Ok(VuSignal::Terminated)
        }
    }

    /// Include each scenario with probability `weight/100`; an empty pick
    /// falls back to the first scenario. Returns indices in declaration
    /// order.
    fn select_scenarios(&self) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        let mut selected: Vec<usize> = self
            .plan
            .scenarios
            .iter()
            .enumerate()
            .filter(|(_, s)| rng.gen_range(0..100u32) < s.weight.min(100))
            .map(|(idx, _)| idx)
            .collect();
        if selected.is_empty() && !self.plan.scenarios.is_empty() {
            selected.push(0);
        }
        selected
    }

    async fn run_scenario(&mut self, scenario: &Scenario) -> Result<(), EngineError> {
        self.ctx.scenario_name = scenario.name.clone();
        self.ctx.merge_variables(&scenario.variables);

        // Non-unique bindings load one row per scenario execution; unique
        // bindings refetch inside the loop so every iteration consumes a
        // fresh row.
        if let Some(binding) = &scenario.data {
            if binding.mode != DataMode::Unique {
                self.load_scenario_row(binding)?;
            }
        }

        // beforeScenario hook.
        if let Some(hook) = &scenario.hooks.before_scenario {
            let executor = Arc::clone(&self.executor);
            executor
                .hooks()
                .run(hook, &mut self.ctx, &executor, &scenario.name, &self.cancel)
                .await?;
        }

        let result = self.run_loops(scenario).await;

        // teardownScenario always runs, even after a failure.
        if let Some(hook) = &scenario.hooks.after_scenario {
            let executor = Arc::clone(&self.executor);
            if let Err(e) = executor
                .hooks()
                .run(hook, &mut self.ctx, &executor, &scenario.name, &self.cancel)
                .await
            {
                tracing::warn!(scenario = %scenario.name, error = %e, "teardownScenario failed");
            }
        }

        result
    }

    async fn run_loops(&mut self, scenario: &Scenario) -> Result<(), EngineError> {
        for iteration in 0..scenario.loop_count {
            if !self.is_active() {
                return Ok(());
            }
            self.ctx.iteration = iteration as u64;

            if let Some(binding) = &scenario.data {
                if binding.mode == DataMode::Unique {
                    self.load_scenario_row(binding)?;
                }
            }

            // beforeLoop hook.
            if let Some(hook) = &scenario.hooks.before_loop {
                let executor = Arc::clone(&self.executor);
                executor
                    .hooks()
                    .run(hook, &mut self.ctx, &executor, &scenario.name, &self.cancel)
                    .await?;
            }

            let step_result = self.run_steps(scenario).await;

            // afterLoop runs even when a step errored.
            if let Some(hook) = &scenario.hooks.after_loop {
                let executor = Arc::clone(&self.executor);
                if let Err(e) = executor
                    .hooks()
                    .run(hook, &mut self.ctx, &executor, &scenario.name, &self.cancel)
                    .await
                {
                    tracing::warn!(scenario = %scenario.name, error = %e, "afterLoop hook failed");
                }
            }

            step_result?;

            // Scenario-level pacing between iterations, not after the last.
            if iteration + 1 < scenario.loop_count {
                if let Some(spec) = scenario.think_time.as_ref().or(self.plan.global.think_time.as_ref())
                {
                    let pause = ThinkTime::resolve(spec).sample();
                    if !sleep_cancellable(pause, &self.cancel).await {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_steps(&mut self, scenario: &Scenario) -> Result<(), EngineError> {
        let executor = Arc::clone(&self.executor);
        for (idx, step) in scenario.steps.iter().enumerate() {
            if !self.is_active() {
                return Ok(());
            }
            executor
                .execute_step(step, &mut self.ctx, &scenario.name, &self.cancel)
                .await?;

            // Think time between steps, suppressed before verification and
            // wait steps.
            if let Some(next) = scenario.steps.get(idx + 1) {
                if !skips_think_time(next) {
                    if let Some(think) = effective_think_time(step, scenario, &self.plan) {
                        if !sleep_cancellable(think.sample(), &self.cancel).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn load_scenario_row(&mut self, binding: &DataBinding) -> Result<(), EngineError> {
        match self.load_row(binding)? {
            Some(row) => {
                self.ctx.merge_row(&row);
                self.ctx.csv_row = Some(row);
                Ok(())
            }
            None => Err(EngineError::DataExhausted(
                binding.file.display().to_string(),
            )),
        }
    }

    /// Fetch one row per the binding's mode. `Ok(None)` signals exhaustion.
    fn load_row(&self, binding: &DataBinding) -> Result<Option<std::collections::HashMap<String, String>>, EngineError> {
        let provider = self.data.get_or_load(binding)?;
        match provider.fetch(binding.mode, self.id) {
            RowOutcome::Row(row) => Ok(Some(row)),
            RowOutcome::Exhausted => Ok(None),
        }
    }
}

/// First defined of step, scenario, and global think-time.
fn effective_think_time(step: &Step, scenario: &Scenario, plan: &TestPlan) -> Option<ThinkTime> {
    step.think_time
        .as_ref()
        .or(scenario.think_time.as_ref())
        .or(plan.global.think_time.as_ref())
        .map(ThinkTime::resolve)
}

/// Verification and wait steps begin immediately; no think-time runs before
/// them.
fn skips_think_time(next: &Step) -> bool {
    next.kind == StepKind::Wait
        || NO_THINK_TIME_PREFIXES
            .iter()
            .any(|prefix| next.name.starts_with(prefix))
}

// ---------------------------------------------------------------------------
// VuFactory
// ---------------------------------------------------------------------------

/// Creates ready virtual users for the load patterns, assigning 1-based ids
/// and recording a ramp-up event per creation.
pub struct VuFactory {
    plan: Arc<TestPlan>,
    executor: Arc<StepExecutor>,
    data: Arc<DataRegistry>,
    collector: Arc<MetricsCollector>,
    cancel: CancellationToken,
    next_id: AtomicU32,
}

impl VuFactory {
    pub fn new(
        plan: Arc<TestPlan>,
        executor: Arc<StepExecutor>,
        data: Arc<DataRegistry>,
        collector: Arc<MetricsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan,
            executor,
            data,
            collector,
            cancel,
            next_id: AtomicU32::new(1),
        }
    }

    pub fn create(&self) -> VirtualUser {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.collector.record_vu_start(id);
        VirtualUser::new(
            id,
            Arc::clone(&self.plan),
            Arc::clone(&self.executor),
            Arc::clone(&self.data),
            &self.cancel,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
