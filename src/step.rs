//! Workflow step definitions.
//!
//! A step is one of seven kinds (see [`StepKind`]) plus flow-control
//! decorations shared by every kind. On the wire the kind is selected by the
//! `type` field and its payload is flattened next to the common fields:
//!
//! ```yaml
//! - name: run_tests
//!   type: python
//!   action: shell
//!   kwargs:
//!     command: cargo test
//!   retry_policy:
//!     max_attempts: 3
//!     backoff: 2
//! ```

use crate::expression::Expression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Upper bound on a single retry delay, in seconds.
pub const MAX_RETRY_DELAY_SECS: f64 = 60.0;

/// Fix attempts a validate step gets when `retry` is omitted.
pub const DEFAULT_VALIDATE_RETRY: u32 = 3;

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow
    pub name: String,

    /// Kind-specific payload, tagged by `type`
    #[serde(flatten)]
    pub kind: StepKind,

    /// Run only when this evaluates truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Expression>,

    /// Re-run the step on failure. Named apart from the validate step's
    /// `retry` count since both share the flattened mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Fallback step executed when this one fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<StepDefinition>>,

    /// Record failures as skips instead of failing the workflow
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_on_error: bool,

    /// Callable invoked to compensate if a later step fails the workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,

    /// Persist a checkpoint after this step succeeds
    #[serde(default, skip_serializing_if = "is_false")]
    pub checkpoint: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The seven step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Call a registered callable.
    Python(PythonStep),
    /// Execute a registered agent.
    Agent(AgentStep),
    /// Produce text with a registered generator.
    Generate(GenerateStep),
    /// Run validation stages, fixing and re-running on failure.
    Validate(ValidateStep),
    /// Run a registered workflow as a nested run.
    Subworkflow(SubWorkflowStep),
    /// Run the first option whose condition holds.
    Branch(BranchStep),
    /// Run a group of steps concurrently.
    Parallel(ParallelStep),
}

/// Step kind without payload, used in results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Python,
    Agent,
    Generate,
    Validate,
    Subworkflow,
    Branch,
    Parallel,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Python => "python",
            StepType::Agent => "agent",
            StepType::Generate => "generate",
            StepType::Validate => "validate",
            StepType::Subworkflow => "subworkflow",
            StepType::Branch => "branch",
            StepType::Parallel => "parallel",
        };
        f.write_str(name)
    }
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Python(_) => StepType::Python,
            StepKind::Agent(_) => StepType::Agent,
            StepKind::Generate(_) => StepType::Generate,
            StepKind::Validate(_) => StepType::Validate,
            StepKind::Subworkflow(_) => StepType::Subworkflow,
            StepKind::Branch(_) => StepType::Branch,
            StepKind::Parallel(_) => StepType::Parallel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonStep {
    /// Registered callable name
    pub action: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    /// Registered agent name
    pub agent: String,

    /// Inline context, resolved before the call
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    /// Registered context builder; receives the resolved inline context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_builder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateStep {
    /// Registered generator name
    pub generator: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_builder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateStep {
    /// Callable names run in order; the first failure stops the pass
    pub stages: Vec<String>,

    /// Maximum number of fix attempts
    #[serde(default = "default_validate_retry")]
    pub retry: u32,

    /// Step run between a failed pass and the next one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<StepDefinition>>,
}

fn default_validate_retry() -> u32 {
    DEFAULT_VALIDATE_RETRY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowStep {
    /// Registered workflow name
    pub workflow: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStep {
    pub options: Vec<BranchOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOption {
    pub when: Expression,
    pub step: StepDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelStep {
    pub steps: Vec<StepDefinition>,
}

/// Retry decoration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in seconds, doubled after every failed attempt
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: f64) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Base delay after failed attempt `attempt` (1-based), without jitter.
    ///
    /// `min(backoff * 2^(attempt-1), 60)` seconds.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = (self.backoff.max(0.0) * 2f64.powi(exponent)).min(MAX_RETRY_DELAY_SECS);
        Duration::from_secs_f64(secs)
    }

    /// Delay after failed attempt `attempt`, with up to 10% jitter.
    ///
    /// `jitter` is a fraction in `[0, 1)`. The result never exceeds the base
    /// delay of the following attempt, so delays never shrink and stay
    /// under the cap.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let ceiling = self.base_delay(attempt.saturating_add(1)).as_secs_f64();
        let jittered = base + base * 0.1 * jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(jittered.min(ceiling))
    }
}

impl StepDefinition {
    fn with_kind(name: &str, kind: StepKind) -> StepBuilder {
        StepBuilder {
            step: StepDefinition {
                name: name.to_string(),
                kind,
                when: None,
                retry_policy: None,
                on_error: None,
                skip_on_error: false,
                rollback: None,
                checkpoint: false,
            },
        }
    }

    /// A step calling a registered callable.
    pub fn python(name: &str, action: &str) -> StepBuilder {
        Self::with_kind(
            name,
            StepKind::Python(PythonStep {
                action: action.to_string(),
                args: Vec::new(),
                kwargs: Map::new(),
            }),
        )
    }

    /// A step executing a registered agent.
    pub fn agent(name: &str, agent: &str) -> StepBuilder {
        Self::with_kind(
            name,
            StepKind::Agent(AgentStep {
                agent: agent.to_string(),
                context: Map::new(),
                context_builder: None,
            }),
        )
    }

    /// A step generating text with a registered generator.
    pub fn generate(name: &str, generator: &str) -> StepBuilder {
        Self::with_kind(
            name,
            StepKind::Generate(GenerateStep {
                generator: generator.to_string(),
                context: Map::new(),
                context_builder: None,
            }),
        )
    }

    /// A validate-with-retry step over the given stage callables.
    pub fn validate<I, S>(name: &str, stages: I) -> StepBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            StepKind::Validate(ValidateStep {
                stages: stages.into_iter().map(Into::into).collect(),
                retry: DEFAULT_VALIDATE_RETRY,
                on_failure: None,
            }),
        )
    }

    /// A step running a registered workflow.
    pub fn subworkflow(name: &str, workflow: &str) -> StepBuilder {
        Self::with_kind(
            name,
            StepKind::Subworkflow(SubWorkflowStep {
                workflow: workflow.to_string(),
                inputs: Map::new(),
            }),
        )
    }

    /// A branch step; add options with [`StepBuilder::option`].
    pub fn branch(name: &str) -> StepBuilder {
        Self::with_kind(name, StepKind::Branch(BranchStep { options: Vec::new() }))
    }

    /// A parallel group; add members with [`StepBuilder::step`].
    pub fn parallel(name: &str) -> StepBuilder {
        Self::with_kind(name, StepKind::Parallel(ParallelStep { steps: Vec::new() }))
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Steps nested directly inside this one (fallback, fix step, branch
    /// options, parallel members).
    pub fn nested_steps(&self) -> Vec<&StepDefinition> {
        let mut nested: Vec<&StepDefinition> = Vec::new();
        match &self.kind {
            StepKind::Validate(v) => nested.extend(v.on_failure.as_deref()),
            StepKind::Branch(b) => nested.extend(b.options.iter().map(|o| &o.step)),
            StepKind::Parallel(p) => nested.extend(p.steps.iter()),
            StepKind::Python(_)
            | StepKind::Agent(_)
            | StepKind::Generate(_)
            | StepKind::Subworkflow(_) => {}
        }
        nested.extend(self.on_error.as_deref());
        nested
    }
}

/// Builder for creating workflow steps.
///
/// Kind-specific setters are ignored for steps of another kind.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    step: StepDefinition,
}

impl StepBuilder {
    /// Append a positional argument (python steps).
    pub fn arg<V: Into<Value>>(mut self, value: V) -> Self {
        if let StepKind::Python(p) = &mut self.step.kind {
            p.args.push(value.into());
        }
        self
    }

    /// Add a keyword argument (python steps).
    pub fn kwarg<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        if let StepKind::Python(p) = &mut self.step.kind {
            p.kwargs.insert(key.to_string(), value.into());
        }
        self
    }

    /// Add a context entry (agent and generate steps).
    pub fn context<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        match &mut self.step.kind {
            StepKind::Agent(a) => {
                a.context.insert(key.to_string(), value.into());
            }
            StepKind::Generate(g) => {
                g.context.insert(key.to_string(), value.into());
            }
            _ => {}
        }
        self
    }

    /// Use a registered context builder (agent and generate steps).
    pub fn context_builder(mut self, builder: &str) -> Self {
        match &mut self.step.kind {
            StepKind::Agent(a) => a.context_builder = Some(builder.to_string()),
            StepKind::Generate(g) => g.context_builder = Some(builder.to_string()),
            _ => {}
        }
        self
    }

    /// Set the number of fix attempts (validate steps).
    pub fn fix_attempts(mut self, retry: u32) -> Self {
        if let StepKind::Validate(v) = &mut self.step.kind {
            v.retry = retry;
        }
        self
    }

    /// Set the fix step run between validation passes (validate steps).
    pub fn on_failure<S: Into<StepDefinition>>(mut self, step: S) -> Self {
        if let StepKind::Validate(v) = &mut self.step.kind {
            v.on_failure = Some(Box::new(step.into()));
        }
        self
    }

    /// Add an input value (subworkflow steps).
    pub fn input<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        if let StepKind::Subworkflow(s) = &mut self.step.kind {
            s.inputs.insert(key.to_string(), value.into());
        }
        self
    }

    /// Append a conditional option (branch steps).
    pub fn option<S: Into<StepDefinition>>(mut self, when: Expression, step: S) -> Self {
        if let StepKind::Branch(b) = &mut self.step.kind {
            b.options.push(BranchOption {
                when,
                step: step.into(),
            });
        }
        self
    }

    /// Append a member step (parallel groups).
    pub fn step<S: Into<StepDefinition>>(mut self, step: S) -> Self {
        if let StepKind::Parallel(p) = &mut self.step.kind {
            p.steps.push(step.into());
        }
        self
    }

    /// Only run when `expr` is truthy.
    pub fn when(mut self, expr: Expression) -> Self {
        self.step.when = Some(expr);
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff: f64) -> Self {
        self.step.retry_policy = Some(RetryPolicy::new(max_attempts, backoff));
        self
    }

    /// Run `fallback` if this step fails.
    pub fn on_error<S: Into<StepDefinition>>(mut self, fallback: S) -> Self {
        self.step.on_error = Some(Box::new(fallback.into()));
        self
    }

    pub fn skip_on_error(mut self) -> Self {
        self.step.skip_on_error = true;
        self
    }

    /// Compensate with the named callable if the workflow later fails.
    pub fn rollback(mut self, action: &str) -> Self {
        self.step.rollback = Some(action.to_string());
        self
    }

    pub fn checkpoint(mut self) -> Self {
        self.step.checkpoint = true;
        self
    }

    /// Build the step.
    pub fn build(self) -> StepDefinition {
        self.step
    }
}

impl From<StepBuilder> for StepDefinition {
    fn from(builder: StepBuilder) -> Self {
        builder.build()
    }
}
