use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::clock::DurationSpec;

// ---------------------------------------------------------------------------
// LoadPhase
// ---------------------------------------------------------------------------

/// One element of the load schedule, selected by its `pattern` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum LoadPhase {
    /// Ramp `users` virtual users up over `ramp_up`, then hold for `duration`.
    Basic {
        users: u32,
        duration: DurationSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_up: Option<DurationSpec>,
    },
    /// A staircase of user-count targets, each held for its own duration.
    Stepping { steps: Vec<LoadStep> },
    /// Open model: spawn new virtual users at a constant mean `rate` per
    /// second for `duration`; each spawned user runs for at most
    /// `vu_duration` before self-terminating.
    Arrivals {
        rate: f64,
        duration: DurationSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vu_duration: Option<DurationSpec>,
    },
}

/// A single stair in a stepping phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoadStep {
    pub users: u32,
    pub duration: DurationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_up: Option<DurationSpec>,
}

// ---------------------------------------------------------------------------
// Data binding
// ---------------------------------------------------------------------------

/// How rows of a shared data source are distributed across virtual users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    /// All users share one atomic cursor; rows are handed out round-robin.
    #[default]
    Next,
    /// Every row is observed by at most one user until the pool is exhausted.
    Unique,
    /// Uniformly random row on every fetch; never exhausts.
    Random,
}

/// Binds a scenario (or the whole plan) to a tabular data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DataBinding {
    pub file: PathBuf,
    #[serde(default)]
    pub mode: DataMode,
    /// Field delimiter; auto-detected from `,`, `;`, `\t` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    /// Wrap back to the first row once all rows are consumed.
    #[serde(default = "default_true")]
    pub cycle_on_exhaustion: bool,
    /// Remap of source column name to exported variable name. Columns not
    /// listed keep their own name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Compare the response status code.
    Status,
    /// Compare the measured duration in milliseconds.
    ResponseTime,
    /// Evaluate a dot-notation JSON path against the response body.
    JsonPath,
    /// Substring test against the raw response body.
    TextContains,
    /// Regular-expression test against the raw response body.
    Regex,
    /// Compare a context variable named by `expression`.
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOperator {
    #[default]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    NotContains,
    Matches,
}

/// A post-condition evaluated against a step's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Check {
    #[serde(rename = "type")]
    pub kind: CheckKind,
    #[serde(default)]
    pub operator: CheckOperator,
    pub expected: serde_json::Value,
    /// JSON path, regex pattern, or variable name, depending on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

// ---------------------------------------------------------------------------
// Extractions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    JsonPath,
    Regex,
    Header,
    /// A value captured by the handler under a named selector (browser DOM
    /// queries and similar); looked up in the handler's returned data map.
    Selector,
}

/// Captures a value from a step's response into the VU context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Extraction {
    /// Variable name written into `extracted_data`.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtractionKind,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// One declarative operation inside an inline hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HookOp {
    /// Set a variable to a (template-rendered) value.
    Set { name: String, value: serde_json::Value },
    /// Set a variable to a uniform random integer in `[min, max]`.
    SetRandomInt { name: String, min: i64, max: i64 },
    /// Set a variable to one of the listed options, chosen uniformly.
    SetRandomChoice {
        name: String,
        options: Vec<serde_json::Value>,
    },
    /// Set a variable to a fresh v4 UUID.
    SetUuid { name: String },
    /// Set a variable to the current time. `format` is one of
    /// `unix|iso|readable|file` (default `unix`).
    SetTimestamp {
        name: String,
        #[serde(default)]
        format: Option<String>,
    },
    /// Pause hook execution.
    Sleep { duration: DurationSpec },
}

/// What a hook executes when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookAction {
    /// An ordered list of declarative operations.
    Inline { ops: Vec<HookOp> },
    /// A file containing the same operation list as JSON.
    File { path: PathBuf },
    /// An ordered list of steps executed through the step executor against a
    /// synthetic context; extracted values propagate back to the caller.
    Steps { steps: Vec<Step> },
}

/// User logic attached to a lifecycle point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Hook {
    #[serde(flatten)]
    pub action: HookAction,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    /// Hard wall-clock cap; defaults to 30 seconds when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationSpec>,
}

/// Hooks attached to a single step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_step: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_step: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Hook>,
}

/// Hooks attached to a scenario's lifecycle points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScenarioHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_scenario: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_scenario: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_loop: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_loop: Option<Hook>,
}

/// Hooks attached to each virtual user's lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VuHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_vu: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_vu: Option<Hook>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Protocol kind of a step; the payload is interpreted by the registered
/// [`StepHandler`](crate::executor::StepHandler) for that kind. `Wait` steps
/// are executed in-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Rest,
    Soap,
    Web,
    Wait,
    Custom,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::Rest => "rest",
            StepKind::Soap => "soap",
            StepKind::Web => "web",
            StepKind::Wait => "wait",
            StepKind::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// Retry backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub delay: DurationSpec,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

/// One protocol operation plus its checks, extractions, and hooks.
///
/// Protocol-specific fields (URL, method, body, browser command, ...) live in
/// `payload` and are passed opaquely to the handler after template rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Skip predicate: the step runs only when this evaluates truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract: Vec<Extraction>,
    #[serde(default)]
    pub hooks: StepHooks,
}

impl Step {
    /// Minimal constructor used by tests and step-list hooks.
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            payload: serde_json::Value::Null,
            condition: None,
            continue_on_error: true,
            retry: None,
            timeout: None,
            think_time: None,
            checks: Vec::new(),
            extract: Vec::new(),
            hooks: StepHooks::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// An ordered script of steps with optional variables, loop count, and hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Scenario {
    pub name: String,
    /// Inclusion probability in percent; each execution pass includes this
    /// scenario with probability `weight/100`.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Iterations of the step list per scenario execution.
    #[serde(default = "default_loop", rename = "loop")]
    pub loop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, serde_json::Value>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub hooks: ScenarioHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataBinding>,
}

fn default_weight() -> u32 {
    100
}

fn default_loop() -> u32 {
    1
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            loop_count: default_loop(),
            think_time: None,
            variables: HashMap::new(),
            steps,
            hooks: ScenarioHooks::default(),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs / report / debug
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Csv,
    Json,
    Influxdb,
    Graphite,
    Webhook,
}

/// Descriptor for one output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: SinkKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReportConfig {
    #[serde(default)]
    pub generate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Verbosity and capture envelope forwarded to handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DebugConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub capture_response_body: bool,
    #[serde(default)]
    pub capture_response_headers: bool,
    #[serde(default)]
    pub capture_request_body: bool,
    #[serde(default)]
    pub capture_request_headers: bool,
    /// Capture raw bodies/headers only for failed steps.
    #[serde(default)]
    pub capture_only_failures: bool,
    #[serde(default = "default_max_body")]
    pub max_response_body_size: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            capture_response_body: false,
            capture_response_headers: false,
            capture_request_body: false,
            capture_request_headers: false,
            capture_only_failures: false,
            max_response_body_size: default_max_body(),
        }
    }
}

fn default_max_body() -> usize {
    4096
}

// ---------------------------------------------------------------------------
// Global config / faker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakerLocale {
    #[default]
    En,
    De,
    Fr,
    Es,
    Nl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FakerConfig {
    #[serde(default)]
    pub locale: FakerLocale,
    /// Fixed seed makes synthetic data reproducible across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_time: Option<DurationSpec>,
    #[serde(default)]
    pub faker: FakerConfig,
    /// Plan-wide data source; one row is merged into each VU's variables at
    /// the start of every execution pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_data: Option<DataBinding>,
}

// ---------------------------------------------------------------------------
// TestPlan
// ---------------------------------------------------------------------------

/// A validated, immutable test plan. Produced by the external config layer;
/// owned by the runner for the duration of one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestPlan {
    pub name: String,
    #[serde(default)]
    pub global: GlobalConfig,
    pub load: Vec<LoadPhase>,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub hooks: VuHooks,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl TestPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: GlobalConfig::default(),
            load: Vec::new(),
            scenarios: Vec::new(),
            hooks: VuHooks::default(),
            outputs: Vec::new(),
            report: ReportConfig::default(),
            debug: DebugConfig::default(),
        }
    }

    /// The set of step kinds used anywhere in the plan, including step-list
    /// hooks. The runner initializes handlers only for these.
    pub fn step_kinds(&self) -> Vec<StepKind> {
        let mut kinds = Vec::new();
        let mut push = |k: StepKind| {
            if !kinds.contains(&k) {
                kinds.push(k);
            }
        };
        for scenario in &self.scenarios {
            for step in &scenario.steps {
                push(step.kind);
                for hook in [
                    &step.hooks.before_step,
                    &step.hooks.after_step,
                    &step.hooks.on_error,
                ]
                .into_iter()
                .flatten()
                {
                    if let HookAction::Steps { steps } = &hook.action {
                        for s in steps {
                            push(s.kind);
                        }
                    }
                }
            }
        }
        kinds
    }
}

pub(crate) fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // LoadPhase
    // -----------------------------------------------------------------------

    #[test]
    fn load_phase_basic_serde() {
        let json = r#"{"pattern":"basic","users":10,"duration":"30s","ramp_up":"5s"}"#;
        let phase: LoadPhase = serde_json::from_str(json).unwrap();
        match phase {
            LoadPhase::Basic { users, .. } => assert_eq!(users, 10),
            _ => panic!("expected Basic"),
        }
    }

    #[test]
    fn load_phase_stepping_serde() {
        let json = r#"{"pattern":"stepping","steps":[{"users":2,"duration":"10s"},{"users":5,"duration":"10s"}]}"#;
        let phase: LoadPhase = serde_json::from_str(json).unwrap();
        match phase {
            LoadPhase::Stepping { steps } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].users, 5);
            }
            _ => panic!("expected Stepping"),
        }
    }

    #[test]
    fn load_phase_arrivals_serde() {
        let json = r#"{"pattern":"arrivals","rate":2.5,"duration":60}"#;
        let phase: LoadPhase = serde_json::from_str(json).unwrap();
        match phase {
            LoadPhase::Arrivals { rate, vu_duration, .. } => {
                assert!((rate - 2.5).abs() < f64::EPSILON);
                assert!(vu_duration.is_none());
            }
            _ => panic!("expected Arrivals"),
        }
    }

    // -----------------------------------------------------------------------
    // Scenario / Step defaults
    // -----------------------------------------------------------------------

    #[test]
    fn scenario_defaults() {
        let json = r#"{"name":"checkout","steps":[]}"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.weight, 100);
        assert_eq!(scenario.loop_count, 1);
        assert!(scenario.variables.is_empty());
        assert!(scenario.data.is_none());
    }

    #[test]
    fn scenario_loop_field_is_named_loop() {
        let json = r#"{"name":"s","loop":5,"steps":[]}"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.loop_count, 5);
    }

    #[test]
    fn step_defaults() {
        let json = r#"{"name":"get users","type":"rest"}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.kind, StepKind::Rest);
        assert!(step.continue_on_error);
        assert!(step.retry.is_none());
        assert!(step.checks.is_empty());
        assert!(step.extract.is_empty());
        assert!(step.payload.is_null());
    }

    #[test]
    fn step_kind_display() {
        assert_eq!(StepKind::Rest.to_string(), "rest");
        assert_eq!(StepKind::Web.to_string(), "web");
        assert_eq!(StepKind::Wait.to_string(), "wait");
    }

    #[test]
    fn retry_policy_defaults() {
        let json = r#"{"delay":"10ms"}"#;
        let retry: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.backoff, Backoff::Linear);
    }

    // -----------------------------------------------------------------------
    // Checks / extractions
    // -----------------------------------------------------------------------

    #[test]
    fn check_defaults_to_eq() {
        let json = r#"{"type":"status","expected":200}"#;
        let check: Check = serde_json::from_str(json).unwrap();
        assert_eq!(check.kind, CheckKind::Status);
        assert_eq!(check.operator, CheckOperator::Eq);
    }

    #[test]
    fn extraction_serde_roundtrip() {
        let ex = Extraction {
            name: "token".to_string(),
            kind: ExtractionKind::JsonPath,
            expression: "auth.token".to_string(),
            default: Some(serde_json::json!("anonymous")),
        };
        let json = serde_json::to_string(&ex).unwrap();
        let parsed: Extraction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "token");
        assert_eq!(parsed.kind, ExtractionKind::JsonPath);
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    #[test]
    fn hook_inline_serde() {
        let json = r#"{"type":"inline","ops":[{"op":"set_uuid","name":"request_id"}]}"#;
        let hook: Hook = serde_json::from_str(json).unwrap();
        assert!(hook.continue_on_error);
        match hook.action {
            HookAction::Inline { ops } => assert_eq!(ops.len(), 1),
            _ => panic!("expected Inline"),
        }
    }

    #[test]
    fn hook_steps_serde() {
        let json = r#"{"type":"steps","steps":[{"name":"login","type":"rest"}],"continue_on_error":false}"#;
        let hook: Hook = serde_json::from_str(json).unwrap();
        assert!(!hook.continue_on_error);
        match hook.action {
            HookAction::Steps { steps } => assert_eq!(steps[0].name, "login"),
            _ => panic!("expected Steps"),
        }
    }

    // -----------------------------------------------------------------------
    // Data binding
    // -----------------------------------------------------------------------

    #[test]
    fn data_binding_defaults() {
        let json = r#"{"file":"users.csv"}"#;
        let binding: DataBinding = serde_json::from_str(json).unwrap();
        assert_eq!(binding.mode, DataMode::Next);
        assert!(binding.cycle_on_exhaustion);
        assert!(binding.delimiter.is_none());
    }

    // -----------------------------------------------------------------------
    // Outputs / debug
    // -----------------------------------------------------------------------

    #[test]
    fn output_enabled_defaults_true() {
        let json = r#"{"type":"csv","path":"results.csv"}"#;
        let out: OutputConfig = serde_json::from_str(json).unwrap();
        assert!(out.enabled);
        assert_eq!(out.kind, SinkKind::Csv);
    }

    #[test]
    fn debug_config_default_body_cap() {
        let debug = DebugConfig::default();
        assert_eq!(debug.max_response_body_size, 4096);
        assert!(!debug.capture_response_body);
    }

    // -----------------------------------------------------------------------
    // TestPlan
    // -----------------------------------------------------------------------

    fn make_plan_with_kinds(kinds: &[StepKind]) -> TestPlan {
        let mut plan = TestPlan::new("kinds");
        let steps = kinds
            .iter()
            .map(|k| Step::new(format!("step_{k}"), *k))
            .collect();
        plan.scenarios.push(Scenario::new("main", steps));
        plan
    }

    #[test]
    fn step_kinds_deduplicates_in_declaration_order() {
        let plan =
            make_plan_with_kinds(&[StepKind::Rest, StepKind::Wait, StepKind::Rest, StepKind::Web]);
        assert_eq!(
            plan.step_kinds(),
            vec![StepKind::Rest, StepKind::Wait, StepKind::Web]
        );
    }

    #[test]
    fn step_kinds_sees_into_step_hooks() {
        let mut plan = make_plan_with_kinds(&[StepKind::Rest]);
        plan.scenarios[0].steps[0].hooks.before_step = Some(Hook {
            action: HookAction::Steps {
                steps: vec![Step::new("prime", StepKind::Soap)],
            },
            continue_on_error: true,
            timeout: None,
        });
        assert_eq!(plan.step_kinds(), vec![StepKind::Rest, StepKind::Soap]);
    }

    #[test]
    fn test_plan_serde_roundtrip() {
        let mut plan = TestPlan::new("Smoke");
        plan.load.push(LoadPhase::Basic {
            users: 3,
            duration: DurationSpec::Text("300ms".to_string()),
            ramp_up: Some(DurationSpec::Text("150ms".to_string())),
        });
        plan.scenarios
            .push(Scenario::new("main", vec![Step::new("ping", StepKind::Rest)]));

        let json = serde_json::to_string_pretty(&plan).unwrap();
        let parsed: TestPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "Smoke");
        assert_eq!(parsed.load.len(), 1);
        assert_eq!(parsed.scenarios[0].steps[0].name, "ping");
    }
}
