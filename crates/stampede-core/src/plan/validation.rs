use crate::error::EngineError;
use crate::plan::model::{LoadPhase, Scenario, Step, TestPlan};

/// Validate a [`TestPlan`] and return a list of configuration errors.
///
/// An empty `Vec` means the plan is valid. Validation runs before the test
/// starts; any error here is fatal.
pub fn validate_plan(plan: &TestPlan) -> Vec<EngineError> {
    let mut errors = Vec::new();

    if plan.name.trim().is_empty() {
        errors.push(EngineError::Config(
            "test plan name must not be empty".to_string(),
        ));
    }

    if plan.load.is_empty() {
        errors.push(EngineError::Config(
            "test plan must define at least one load phase".to_string(),
        ));
    }

    if plan.scenarios.is_empty() {
        errors.push(EngineError::Config(
            "test plan must define at least one scenario".to_string(),
        ));
    }

    for (idx, phase) in plan.load.iter().enumerate() {
        errors.extend(validate_phase(idx, phase));
    }

    for scenario in &plan.scenarios {
        errors.extend(validate_scenario(scenario));
    }

    errors
}

fn validate_phase(idx: usize, phase: &LoadPhase) -> Vec<EngineError> {
    let mut errors = Vec::new();

    match phase {
        LoadPhase::Basic {
            users,
            duration,
            ramp_up,
        } => {
            if *users == 0 {
                errors.push(EngineError::Config(format!(
                    "load phase {idx}: basic pattern requires users > 0"
                )));
            }
            if let Err(e) = duration.as_duration() {
                errors.push(EngineError::Config(format!("load phase {idx}: {e}")));
            }
            if let Some(ramp) = ramp_up {
                if let Err(e) = ramp.as_duration() {
                    errors.push(EngineError::Config(format!("load phase {idx}: {e}")));
                }
            }
        }
        LoadPhase::Stepping { steps } => {
            if steps.is_empty() {
                errors.push(EngineError::Config(format!(
                    "load phase {idx}: stepping pattern requires non-empty steps"
                )));
            }
            for (step_idx, step) in steps.iter().enumerate() {
                if step.users == 0 {
                    errors.push(EngineError::Config(format!(
                        "load phase {idx} step {step_idx}: users must be > 0"
                    )));
                }
                if let Err(e) = step.duration.as_duration() {
                    errors.push(EngineError::Config(format!(
                        "load phase {idx} step {step_idx}: {e}"
                    )));
                }
            }
        }
        LoadPhase::Arrivals { rate, duration, .. } => {
            if *rate <= 0.0 || !rate.is_finite() {
                errors.push(EngineError::Config(format!(
                    "load phase {idx}: arrivals pattern requires rate > 0"
                )));
            }
            if let Err(e) = duration.as_duration() {
                errors.push(EngineError::Config(format!("load phase {idx}: {e}")));
            }
        }
    }

    errors
}

fn validate_scenario(scenario: &Scenario) -> Vec<EngineError> {
    let mut errors = Vec::new();

    if scenario.name.trim().is_empty() {
        errors.push(EngineError::Config(
            "scenario name must not be empty".to_string(),
        ));
    }

    if scenario.weight > 100 {
        errors.push(EngineError::Config(format!(
            "scenario '{}': weight must be in [0, 100]",
            scenario.name
        )));
    }

    if scenario.loop_count == 0 {
        errors.push(EngineError::Config(format!(
            "scenario '{}': loop must be a positive integer",
            scenario.name
        )));
    }

    if scenario.steps.is_empty() {
        errors.push(EngineError::Config(format!(
            "scenario '{}': steps must not be empty",
            scenario.name
        )));
    }

    for step in &scenario.steps {
        errors.extend(validate_step(&scenario.name, step));
    }

    errors
}

fn validate_step(scenario_name: &str, step: &Step) -> Vec<EngineError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(EngineError::Config(format!(
            "scenario '{scenario_name}': step name must not be empty"
        )));
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            errors.push(EngineError::Config(format!(
                "step '{}': retry.max_attempts must be at least 1",
                step.name
            )));
        }
        if let Err(e) = retry.delay.as_duration() {
            errors.push(EngineError::Config(format!("step '{}': {e}", step.name)));
        }
    }

    if let Some(timeout) = &step.timeout {
        if let Err(e) = timeout.as_duration() {
            errors.push(EngineError::Config(format!("step '{}': {e}", step.name)));
        }
    }

    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DurationSpec;
    use crate::plan::model::{LoadStep, RetryPolicy, Scenario, Step, StepKind};

    fn make_valid_plan() -> TestPlan {
        let mut plan = TestPlan::new("Valid Plan");
        plan.load.push(LoadPhase::Basic {
            users: 5,
            duration: DurationSpec::Text("10s".to_string()),
            ramp_up: None,
        });
        plan.scenarios
            .push(Scenario::new("main", vec![Step::new("ping", StepKind::Rest)]));
        plan
    }

    // -----------------------------------------------------------------------
    // Plan-level validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_plan_produces_no_errors() {
        let errors = validate_plan(&make_valid_plan());
        assert!(errors.is_empty(), "Expected no errors, got: {errors:?}");
    }

    #[test]
    fn empty_plan_name_produces_error() {
        let mut plan = make_valid_plan();
        plan.name = "  ".to_string();
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("name")));
    }

    #[test]
    fn plan_without_load_phases_produces_error() {
        let mut plan = make_valid_plan();
        plan.load.clear();
        let errors = validate_plan(&plan);
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("load phase")));
    }

    #[test]
    fn plan_without_scenarios_produces_error() {
        let mut plan = make_valid_plan();
        plan.scenarios.clear();
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("scenario")));
    }

    // -----------------------------------------------------------------------
    // Phase-level validation
    // -----------------------------------------------------------------------

    #[test]
    fn basic_phase_with_zero_users_produces_error() {
        let mut plan = make_valid_plan();
        plan.load[0] = LoadPhase::Basic {
            users: 0,
            duration: DurationSpec::Seconds(10.0),
            ramp_up: None,
        };
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("users > 0")));
    }

    #[test]
    fn stepping_phase_with_no_steps_produces_error() {
        let mut plan = make_valid_plan();
        plan.load[0] = LoadPhase::Stepping { steps: vec![] };
        let errors = validate_plan(&plan);
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("non-empty steps")));
    }

    #[test]
    fn stepping_step_with_zero_users_produces_error() {
        let mut plan = make_valid_plan();
        plan.load[0] = LoadPhase::Stepping {
            steps: vec![LoadStep {
                users: 0,
                duration: DurationSpec::Seconds(1.0),
                ramp_up: None,
            }],
        };
        let errors = validate_plan(&plan);
        assert!(!errors.is_empty());
    }

    #[test]
    fn arrivals_phase_with_zero_rate_produces_error() {
        let mut plan = make_valid_plan();
        plan.load[0] = LoadPhase::Arrivals {
            rate: 0.0,
            duration: DurationSpec::Seconds(5.0),
            vu_duration: None,
        };
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("rate > 0")));
    }

    #[test]
    fn bad_duration_string_produces_error() {
        let mut plan = make_valid_plan();
        plan.load[0] = LoadPhase::Basic {
            users: 1,
            duration: DurationSpec::Text("forever".to_string()),
            ramp_up: None,
        };
        let errors = validate_plan(&plan);
        assert!(!errors.is_empty());
    }

    // -----------------------------------------------------------------------
    // Scenario-level validation
    // -----------------------------------------------------------------------

    #[test]
    fn scenario_weight_above_100_produces_error() {
        let mut plan = make_valid_plan();
        plan.scenarios[0].weight = 101;
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("weight")));
    }

    #[test]
    fn scenario_zero_loop_produces_error() {
        let mut plan = make_valid_plan();
        plan.scenarios[0].loop_count = 0;
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.to_string().contains("loop")));
    }

    #[test]
    fn scenario_without_steps_produces_error() {
        let mut plan = make_valid_plan();
        plan.scenarios[0].steps.clear();
        let errors = validate_plan(&plan);
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("steps must not be empty")));
    }

    // -----------------------------------------------------------------------
    // Step-level validation
    // -----------------------------------------------------------------------

    #[test]
    fn retry_with_zero_attempts_produces_error() {
        let mut plan = make_valid_plan();
        plan.scenarios[0].steps[0].retry = Some(RetryPolicy {
            max_attempts: 0,
            delay: DurationSpec::Text("10ms".to_string()),
            backoff: Default::default(),
        });
        let errors = validate_plan(&plan);
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("max_attempts")));
    }

    #[test]
    fn multiple_errors_accumulate_across_levels() {
        let mut plan = make_valid_plan();
        plan.name = "".to_string();
        plan.scenarios[0].weight = 250;
        plan.scenarios[0].steps[0].name = " ".to_string();
        let errors = validate_plan(&plan);
        assert!(errors.len() >= 3, "Expected >= 3 errors, got: {errors:?}");
    }
}
