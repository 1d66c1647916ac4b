//! Workflow execution engine.
//!
//! An [`Engine`] runs [`WorkflowDefinition`]s against a shared
//! [`ComponentRegistry`]. Top-level steps run in declaration order on the
//! calling task; parallel groups are polled concurrently on that same task.
//!
//! # Lifecycle
//!
//! 1. Resolve inputs (defaults applied, required inputs checked).
//! 2. Replay results restored from a checkpoint, if resuming.
//! 3. Execute the remaining steps, saving a checkpoint after each step
//!    marked `checkpoint: true`.
//! 4. On failure, run registered rollbacks newest first.
//! 5. On success, clear the run's checkpoints (configurable).

mod dispatch;
mod events;

pub use events::ProgressEvent;

use crate::checkpoint::{compute_inputs_hash, CheckpointData, CheckpointError, CheckpointStore};
use crate::config::EngineConfig;
use crate::context::WorkflowContext;
use crate::registry::{CallArgs, ComponentRegistry};
use crate::result::{RunState, StepResult, StepStatus, WorkflowResult};
use crate::step::StepDefinition;
use crate::workflow::{InputType, WorkflowDefinition};
use dispatch::PendingRollback;
use events::EventSink;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Errors that stop a run from starting or resuming.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{workflow}' requires input '{input}'")]
    MissingInput { workflow: String, input: String },

    #[error("input '{input}' of workflow '{workflow}' must be of type {expected}, got {actual}")]
    InvalidInput {
        workflow: String,
        input: String,
        expected: InputType,
        actual: Value,
    },

    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("no checkpoint store configured")]
    NoCheckpointStore,

    #[error("checkpoint belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch { expected: String, found: String },

    #[error("checkpointed step {index} is '{found}' but the workflow declares '{expected}'")]
    ResumeMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// A failed sub-workflow step.
#[derive(Debug, Error)]
pub enum SubWorkflowError {
    #[error(
        "sub-workflow '{workflow}' failed: {}",
        .result.error.as_deref().unwrap_or("unknown error")
    )]
    Failed {
        workflow: String,
        /// Result of the nested run
        result: Box<WorkflowResult>,
    },

    #[error("sub-workflow '{workflow}' could not start: {source}")]
    Rejected {
        workflow: String,
        #[source]
        source: Box<EngineError>,
    },
}

/// Why a step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Expression(#[from] crate::expression::ExpressionError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error("{component} failed: {message}")]
    Component { component: String, message: String },

    #[error("agent '{agent}' reported failure: {}", .errors.join("; "))]
    AgentFailed { agent: String, errors: Vec<String> },

    #[error("validation stage '{stage}' failed after {fix_attempts} fix attempt(s): {reason}")]
    ValidationFailed {
        stage: String,
        reason: String,
        fix_attempts: u32,
    },

    #[error("no branch option matched")]
    NoBranchMatched,

    #[error("branch option '{step}' failed: {error}")]
    OptionFailed { step: String, error: String },

    #[error("duplicate step name '{0}' in parallel group")]
    DuplicateStepName(String),

    #[error("parallel steps failed: {}", .0.join(", "))]
    ParallelFailed(Vec<String>),

    #[error("fallback '{fallback}' failed: {error} (after: {original})")]
    FallbackFailed {
        fallback: String,
        error: String,
        original: String,
    },

    #[error(transparent)]
    SubWorkflow(#[from] SubWorkflowError),

    #[error("workflow cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("cancelled")]
    Cancelled,
}

/// Where a step is running.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub workflow: String,
    pub workflow_id: String,
    /// Workflows on the active invocation stack, outermost first
    pub stack: Vec<String>,
    /// Whether this run writes checkpoints
    pub persist: bool,
}

impl Scope {
    pub(crate) fn root(workflow: &str, workflow_id: &str, persist: bool) -> Self {
        Self {
            workflow: workflow.to_string(),
            workflow_id: workflow_id.to_string(),
            stack: vec![workflow.to_string()],
            persist,
        }
    }

    fn nested(&self, workflow: &str, step: &str) -> Self {
        let mut stack = self.stack.clone();
        stack.push(workflow.to_string());
        Self {
            workflow: workflow.to_string(),
            workflow_id: format!("{}.{step}", self.workflow_id),
            stack,
            persist: false,
        }
    }
}

/// A finished run plus the compensations still owed if an enclosing run
/// fails later.
pub(crate) struct Execution {
    pub result: WorkflowResult,
    pub rollbacks: Vec<PendingRollback>,
}

/// Runs workflows.
///
/// # Example
///
/// ```rust,no_run
/// use maverick_workflow::{
///     action_fn, ComponentRegistry, Engine, StepDefinition, WorkflowDefinition,
/// };
/// use std::sync::Arc;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut registry = ComponentRegistry::new();
/// registry.register_callable("count", action_fn(|_| async { Ok(serde_json::json!(3)) }))?;
///
/// let workflow = WorkflowDefinition::builder("example")
///     .add(StepDefinition::python("count", "count"))
///     .build();
///
/// let engine = Engine::new(Arc::new(registry));
/// let result = engine.run(&workflow, Default::default()).await?;
/// assert!(result.success);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    registry: Arc<ComponentRegistry>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: EngineConfig,
    events: EventSink,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            registry,
            checkpoints: None,
            config: EngineConfig::default(),
            events: EventSink::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Send [`ProgressEvent`]s to `sender`.
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = EventSink::new(sender);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels runs of this engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. Running steps finish; the rest are recorded as
    /// cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a workflow under a fresh run id.
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow_id = Uuid::now_v7().to_string();
        self.run_with_id(workflow, &workflow_id, inputs).await
    }

    /// Run a workflow under a caller-chosen run id, which names its
    /// checkpoints.
    pub async fn run_with_id(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        let inputs = resolve_inputs(workflow, inputs)?;
        let scope = Scope::root(&workflow.name, workflow_id, self.checkpoints.is_some());
        let execution = self.execute_workflow(workflow, inputs, scope, Vec::new()).await?;
        Ok(execution.result)
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// Recorded steps are not executed again: their outputs and rollbacks
    /// are restored and execution resumes with the first step after them.
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        let store = self.checkpoints.as_ref().ok_or(EngineError::NoCheckpointStore)?;
        let inputs = resolve_inputs(workflow, inputs)?;

        let checkpoint = store
            .load_latest(workflow_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound {
                workflow_id: workflow_id.to_string(),
                checkpoint_id: None,
            })?;

        if checkpoint.workflow_name != workflow.name {
            return Err(EngineError::WorkflowMismatch {
                expected: workflow.name.clone(),
                found: checkpoint.workflow_name,
            });
        }
        let actual = compute_inputs_hash(&inputs);
        if checkpoint.inputs_hash != actual {
            return Err(CheckpointError::InputMismatch {
                workflow_id: workflow_id.to_string(),
                expected: checkpoint.inputs_hash,
                actual,
            }
            .into());
        }

        tracing::info!(
            workflow = %workflow.name,
            workflow_id,
            checkpoint = %checkpoint.checkpoint_id,
            restored = checkpoint.step_results.len(),
            "resuming workflow"
        );
        let scope = Scope::root(&workflow.name, workflow_id, true);
        let execution = self
            .execute_workflow(workflow, inputs, scope, checkpoint.step_results)
            .await?;
        Ok(execution.result)
    }

    /// Check inputs and report what would run, without executing anything.
    pub fn dry_run(
        &self,
        workflow: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        resolve_inputs(workflow, inputs)?;
        if workflow.steps.is_empty() {
            return Err(EngineError::EmptyWorkflow(workflow.name.clone()));
        }

        let step_results = workflow
            .steps
            .iter()
            .map(|step| {
                StepResult::skipped(&step.name, step.step_type(), Some("dry run".to_string()))
            })
            .collect();
        Ok(WorkflowResult {
            workflow_name: workflow.name.clone(),
            workflow_id: String::new(),
            success: true,
            step_results,
            cancelled: false,
            final_output: Value::Null,
            error: None,
            total_ms: 0,
        })
    }

    /// Run a registered workflow inside a sub-workflow step.
    pub(crate) async fn run_nested(
        &self,
        workflow: &WorkflowDefinition,
        inputs: Map<String, Value>,
        parent: &Scope,
        step: &str,
    ) -> Result<Execution, EngineError> {
        let inputs = resolve_inputs(workflow, inputs)?;
        let scope = parent.nested(&workflow.name, step);
        self.execute_workflow(workflow, inputs, scope, Vec::new()).await
    }

    fn execute_workflow<'a>(
        &'a self,
        workflow: &'a WorkflowDefinition,
        inputs: Map<String, Value>,
        scope: Scope,
        replay: Vec<StepResult>,
    ) -> BoxFuture<'a, Result<Execution, EngineError>> {
        async move {
            if workflow.steps.is_empty() {
                return Err(EngineError::EmptyWorkflow(workflow.name.clone()));
            }

            let started = Instant::now();
            let mut state = RunState::NotStarted;
            let mut ctx = WorkflowContext::with_inputs(inputs.clone(), self.config.values.clone());
            let mut results: Vec<StepResult> = Vec::with_capacity(workflow.steps.len());
            let mut rollbacks: Vec<PendingRollback> = Vec::new();

            // restore before announcing the run so a bad checkpoint fails cleanly
            for (index, recorded) in replay.into_iter().enumerate() {
                let Some(step) = workflow.steps.get(index) else {
                    return Err(EngineError::ResumeMismatch {
                        index,
                        expected: String::new(),
                        found: recorded.name,
                    });
                };
                if step.name != recorded.name {
                    return Err(EngineError::ResumeMismatch {
                        index,
                        expected: step.name.clone(),
                        found: recorded.name,
                    });
                }
                restore_outputs(&recorded, &mut ctx);
                restore_rollbacks(step, &recorded, &mut rollbacks);
                tracing::debug!(
                    workflow = %workflow.name,
                    step = %recorded.name,
                    status = %recorded.status,
                    "replayed step"
                );
                results.push(recorded);
            }
            let replayed = results.len();

            advance(&mut state, RunState::Running, &workflow.name);
            tracing::info!(
                workflow = %workflow.name,
                workflow_id = %scope.workflow_id,
                steps = workflow.steps.len(),
                replayed,
                "starting workflow"
            );
            self.events.emit(ProgressEvent::WorkflowStarted {
                workflow: workflow.name.clone(),
                workflow_id: scope.workflow_id.clone(),
                total_steps: workflow.steps.len(),
                replayed,
            });

            let mut error: Option<String> = None;
            let mut cancelled = false;

            for step in &workflow.steps[replayed..] {
                if cancelled || error.is_some() {
                    break;
                }
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }

                let outcome = self.execute_step(step, &ctx, &scope).await;
                for (name, output) in outcome.effects.outputs {
                    ctx.set_step_output(&name, output);
                }
                rollbacks.extend(outcome.effects.rollbacks);

                let status = outcome.result.status;
                let failure = outcome.result.error.clone();
                results.push(outcome.result);

                match status {
                    StepStatus::Cancelled => cancelled = true,
                    StepStatus::Failed => {
                        error = Some(format!(
                            "step '{}' failed: {}",
                            step.name,
                            failure.unwrap_or_default()
                        ));
                    }
                    StepStatus::Passed | StepStatus::Fixed => {
                        if step.checkpoint && scope.persist {
                            let saved =
                                self.save_checkpoint(workflow, &scope, &inputs, &results, step);
                            if let Err(e) = saved.await {
                                let name = &step.name;
                                error = Some(format!("checkpoint after step '{name}' failed: {e}"));
                            }
                        }
                    }
                    StepStatus::Skipped => {}
                }
            }

            // steps never reached are recorded so results line up with the definition
            if cancelled {
                for step in &workflow.steps[results.len()..] {
                    results.push(StepResult::cancelled(&step.name, step.step_type()));
                }
            }

            let success = error.is_none() && !cancelled;
            if error.is_some() {
                advance(&mut state, RunState::Failed, &workflow.name);
                self.run_rollbacks(&workflow.name, std::mem::take(&mut rollbacks)).await;
            } else if cancelled {
                advance(&mut state, RunState::Cancelled, &workflow.name);
            } else {
                advance(&mut state, RunState::Completed, &workflow.name);
                self.clear_checkpoints(&scope).await;
            }

            let final_output = results
                .iter()
                .rev()
                .find(|r| r.success() && !r.output.is_null())
                .map(|r| r.output.clone())
                .unwrap_or(Value::Null);
            let total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            tracing::info!(
                workflow = %workflow.name,
                workflow_id = %scope.workflow_id,
                state = %state,
                total_ms,
                "workflow finished"
            );
            self.events.emit(ProgressEvent::WorkflowCompleted {
                workflow: workflow.name.clone(),
                workflow_id: scope.workflow_id.clone(),
                success,
                cancelled,
                total_ms,
            });

            Ok(Execution {
                result: WorkflowResult {
                    workflow_name: workflow.name.clone(),
                    workflow_id: scope.workflow_id.clone(),
                    success,
                    step_results: results,
                    cancelled,
                    final_output,
                    error,
                    total_ms,
                },
                rollbacks,
            })
        }
        .boxed()
    }

    async fn save_checkpoint(
        &self,
        workflow: &WorkflowDefinition,
        scope: &Scope,
        inputs: &Map<String, Value>,
        results: &[StepResult],
        step: &StepDefinition,
    ) -> Result<(), CheckpointError> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        let data = CheckpointData::new(&workflow.name, inputs, results.to_vec());
        store.save(&scope.workflow_id, &data).await?;

        tracing::debug!(
            workflow = %workflow.name,
            step = %step.name,
            checkpoint = %data.checkpoint_id,
            "checkpoint saved"
        );
        self.events.emit(ProgressEvent::CheckpointSaved {
            workflow: workflow.name.clone(),
            workflow_id: scope.workflow_id.clone(),
            step: step.name.clone(),
            checkpoint_id: data.checkpoint_id,
        });
        Ok(())
    }

    async fn clear_checkpoints(&self, scope: &Scope) {
        if !scope.persist || !self.config.clear_checkpoints_on_success {
            return;
        }
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.clear(&scope.workflow_id).await {
                tracing::warn!(
                    workflow_id = %scope.workflow_id,
                    error = %e,
                    "failed to clear checkpoints"
                );
            }
        }
    }

    /// Invoke compensations newest first. Failures are logged and the
    /// remaining rollbacks still run.
    async fn run_rollbacks(&self, workflow: &str, rollbacks: Vec<PendingRollback>) {
        for rollback in rollbacks.into_iter().rev() {
            self.events.emit(ProgressEvent::RollbackStarted {
                workflow: workflow.to_string(),
                step: rollback.step.clone(),
                action: rollback.action.clone(),
            });
            tracing::info!(
                workflow,
                step = %rollback.step,
                action = %rollback.action,
                "rolling back step"
            );

            let mut kwargs = Map::new();
            kwargs.insert("output".to_string(), rollback.output);
            let outcome = match self.registry.callable(&rollback.action) {
                Ok(action) => action
                    .call(CallArgs::new(Vec::new(), kwargs))
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("{e:#}")),
                Err(e) => Err(e.to_string()),
            };

            if let Err(error) = &outcome {
                tracing::warn!(
                    workflow,
                    step = %rollback.step,
                    action = %rollback.action,
                    %error,
                    "rollback failed"
                );
            }
            self.events.emit(ProgressEvent::RollbackCompleted {
                workflow: workflow.to_string(),
                step: rollback.step,
                success: outcome.is_ok(),
                error: outcome.err(),
            });
        }
    }
}

fn advance(state: &mut RunState, next: RunState, workflow: &str) {
    if state.can_transition_to(next) {
        tracing::trace!(workflow, from = %state, to = %next, "run state");
        *state = next;
    } else {
        tracing::warn!(
            workflow,
            from = %state,
            to = %next,
            "ignoring invalid run state transition"
        );
    }
}

/// Apply defaults and check declared inputs. Undeclared inputs pass through.
pub fn resolve_inputs(
    workflow: &WorkflowDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    for (name, input) in &workflow.inputs {
        match provided.get(name) {
            Some(value) if !input.input_type.accepts(value) => {
                return Err(EngineError::InvalidInput {
                    workflow: workflow.name.clone(),
                    input: name.clone(),
                    expected: input.input_type,
                    actual: value.clone(),
                })
            }
            Some(_) => {}
            None => match &input.default {
                Some(default) => {
                    provided.insert(name.clone(), default.clone());
                }
                None if input.required => {
                    return Err(EngineError::MissingInput {
                        workflow: workflow.name.clone(),
                        input: name.clone(),
                    })
                }
                None => {}
            },
        }
    }
    Ok(provided)
}

/// Put the outputs recorded in `result` (and its successful children) back
/// into the context.
fn restore_outputs(result: &StepResult, ctx: &mut WorkflowContext) {
    if !matches!(result.status, StepStatus::Passed | StepStatus::Fixed) {
        return;
    }
    for child in &result.children {
        restore_outputs(child, ctx);
    }
    ctx.set_step_output(&result.name, result.output.clone());
}

/// Re-register the rollbacks a recorded step and its nested steps owed.
fn restore_rollbacks(
    step: &StepDefinition,
    result: &StepResult,
    rollbacks: &mut Vec<PendingRollback>,
) {
    if !matches!(result.status, StepStatus::Passed | StepStatus::Fixed) {
        return;
    }
    let nested = step.nested_steps();
    for child in &result.children {
        if let Some(def) = nested.iter().find(|s| s.name == child.name) {
            restore_rollbacks(def, child, rollbacks);
        }
    }
    if let Some(action) = &step.rollback {
        rollbacks.push(PendingRollback {
            step: step.name.clone(),
            action: action.clone(),
            output: result.output.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::expression::Expression;
    use crate::registry::{action_fn, agent_fn, AgentResult};
    use crate::workflow::InputDefinition;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Registry whose callables record every call in `log`.
    fn recording_registry(log: Arc<Mutex<Vec<String>>>) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        for name in ["load", "transform", "publish", "undo_load", "undo_transform"] {
            let log = log.clone();
            registry
                .register_callable(
                    name,
                    action_fn(move |args: CallArgs| {
                        log.lock().unwrap().push(name.to_string());
                        let kwargs = Value::Object(args.kwargs);
                        async move { Ok(json!({ "by": name, "kwargs": kwargs })) }
                    }),
                )
                .unwrap();
        }
        registry
            .register_callable("boom", action_fn(|_| async { anyhow::bail!("publish rejected") }))
            .unwrap();
        registry
    }

    fn inputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn statuses(result: &WorkflowResult) -> Vec<StepStatus> {
        result.step_results.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_four_step_scenario() {
        let stage_runs = Arc::new(AtomicU32::new(0));
        let fix_runs = Arc::new(AtomicU32::new(0));
        let mut registry = ComponentRegistry::new();
        registry
            .register_callable("load", action_fn(|_| async { Ok(json!({ "files": 2 })) }))
            .unwrap();
        registry
            .register_agent(
                "implementer",
                agent_fn(|ctx: Value| async move {
                    Ok(AgentResult::ok(json!({ "changed": ctx["files"] })))
                }),
            )
            .unwrap();
        let runs = stage_runs.clone();
        registry
            .register_callable(
                "test",
                action_fn(move |_| {
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Value::Bool(n >= 1)) }
                }),
            )
            .unwrap();
        let fixes = fix_runs.clone();
        registry
            .register_agent(
                "fixer",
                agent_fn(move |_| {
                    fixes.fetch_add(1, Ordering::SeqCst);
                    async { Ok(AgentResult::ok(Value::Null)) }
                }),
            )
            .unwrap();
        registry
            .register_callable(
                "report",
                action_fn(|args: CallArgs| async move { Ok(Value::Object(args.kwargs)) }),
            )
            .unwrap();

        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load"))
            .add(
                StepDefinition::agent("implement", "implementer")
                    .context("files", "${{ steps.load.output.files }}"),
            )
            .add(
                StepDefinition::validate("checks", ["test"])
                    .fix_attempts(3)
                    .on_failure(StepDefinition::agent("fix", "fixer")),
            )
            .add(
                StepDefinition::python("summary", "report")
                    .kwarg("changed", "${{ steps.implement.output.changed }}"),
            )
            .build();

        let engine = Engine::new(Arc::new(registry));
        let result = engine.run(&workflow, Map::new()).await.unwrap();

        assert!(result.success);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Passed, StepStatus::Passed, StepStatus::Fixed, StepStatus::Passed]
        );
        assert_eq!(result.step_results[2].attempts, 1);
        assert_eq!(fix_runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.final_output, json!({ "changed": 2 }));
        assert_eq!(result.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_missing_required_input_runs_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .input("branch", InputDefinition::new(InputType::String).required())
            .add(StepDefinition::python("load", "load"))
            .build();

        let engine = Engine::new(Arc::new(recording_registry(log.clone())));
        let err = engine.run(&workflow, Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput { ref input, .. } if input == "branch"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_inputs_defaults_and_types() {
        let workflow = WorkflowDefinition::builder("fly")
            .input("retries", InputDefinition::new(InputType::Integer).with_default(2))
            .input("label", InputDefinition::new(InputType::String))
            .add(StepDefinition::python("load", "load"))
            .build();

        let resolved = resolve_inputs(&workflow, Map::new()).unwrap();
        assert_eq!(resolved.get("retries"), Some(&json!(2)));
        assert!(!resolved.contains_key("label"));

        let err = resolve_inputs(&workflow, inputs(json!({ "retries": "two" }))).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_failure_runs_rollbacks_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").rollback("undo_load"))
            .add(StepDefinition::python("transform", "transform").rollback("undo_transform"))
            .add(StepDefinition::python("publish", "boom"))
            .add(StepDefinition::python("after", "load"))
            .build();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Engine::new(Arc::new(recording_registry(log.clone()))).with_progress(tx);
        let result = engine.run(&workflow, Map::new()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.state(), RunState::Failed);
        assert_eq!(result.step_results.len(), 3);
        assert!(result.error.as_deref().unwrap().contains("publish rejected"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["load", "transform", "undo_transform", "undo_load"]
        );

        let mut rolled_back = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::RollbackCompleted { step, success, .. } = event {
                assert!(success);
                rolled_back.push(step);
            }
        }
        assert_eq!(rolled_back, vec!["transform", "load"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").rollback("undo_load"))
            .add(StepDefinition::python("transform", "transform").rollback("boom"))
            .add(StepDefinition::python("publish", "boom"))
            .build();

        let engine = Engine::new(Arc::new(recording_registry(log.clone())));
        let result = engine.run(&workflow, Map::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(*log.lock().unwrap(), vec!["load", "transform", "undo_load"]);
    }

    #[tokio::test]
    async fn test_rollback_receives_step_output() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let mut registry = ComponentRegistry::new();
        registry
            .register_callable("create", action_fn(|_| async { Ok(json!({ "id": 42 })) }))
            .unwrap();
        let captured = seen.clone();
        registry
            .register_callable(
                "delete",
                action_fn(move |args: CallArgs| {
                    *captured.lock().unwrap() = args.kwarg("output").cloned().unwrap_or_default();
                    async { Ok(Value::Null) }
                }),
            )
            .unwrap();
        registry
            .register_callable("boom", action_fn(|_| async { anyhow::bail!("nope") }))
            .unwrap();

        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("create", "create").rollback("delete"))
            .add(StepDefinition::python("fail", "boom"))
            .build();
        let engine = Engine::new(Arc::new(registry));
        engine.run(&workflow, Map::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), json!({ "id": 42 }));
    }

    #[tokio::test]
    async fn test_cancellation_marks_remaining_steps() {
        let mut registry = ComponentRegistry::new();
        let engine_token = CancellationToken::new();
        let token = engine_token.clone();
        registry
            .register_callable(
                "stop",
                action_fn(move |_| {
                    token.cancel();
                    async { Ok(json!("stopped")) }
                }),
            )
            .unwrap();
        registry
            .register_callable(
                "never",
                action_fn(|_| async { Err(anyhow::anyhow!("must not run")) }),
            )
            .unwrap();

        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("first", "stop"))
            .add(StepDefinition::python("second", "never"))
            .add(StepDefinition::python("third", "never"))
            .build();
        let engine = Engine::new(Arc::new(registry)).with_cancellation(engine_token);
        let result = engine.run(&workflow, Map::new()).await.unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.state(), RunState::Cancelled);
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Passed, StepStatus::Cancelled, StepStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_progress_events_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").checkpoint())
            .build();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Engine::new(Arc::new(recording_registry(log)))
            .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
            .with_progress(tx);
        engine.run_with_id(&workflow, "run-1", Map::new()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                ProgressEvent::WorkflowStarted { .. } => "workflow_started",
                ProgressEvent::StepStarted { .. } => "step_started",
                ProgressEvent::StepCompleted { .. } => "step_completed",
                ProgressEvent::CheckpointSaved { .. } => "checkpoint_saved",
                ProgressEvent::RollbackStarted { .. } => "rollback_started",
                ProgressEvent::RollbackCompleted { .. } => "rollback_completed",
                ProgressEvent::WorkflowCompleted { .. } => "workflow_completed",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "step_started",
                "step_completed",
                "checkpoint_saved",
                "workflow_completed"
            ]
        );
    }

    /// Workflow whose third step fails until `healthy` is set.
    fn resumable(
        calls: Arc<Mutex<Vec<String>>>,
        healthy: Arc<AtomicU32>,
    ) -> (WorkflowDefinition, ComponentRegistry) {
        let mut registry = recording_registry(calls.clone());
        registry
            .register_callable(
                "flaky_publish",
                action_fn(move |_| {
                    calls.lock().unwrap().push("flaky_publish".to_string());
                    let ok = healthy.load(Ordering::SeqCst) > 0;
                    async move {
                        if !ok {
                            anyhow::bail!("registry unavailable")
                        }
                        Ok(json!("published"))
                    }
                }),
            )
            .unwrap();

        let workflow = WorkflowDefinition::builder("release")
            .input("version", InputDefinition::new(InputType::String).required())
            .add(
                StepDefinition::python("load", "load")
                    .kwarg("v", "${{ inputs.version }}")
                    .checkpoint(),
            )
            .add(
                StepDefinition::python("transform", "transform")
                    .kwarg("from", "${{ steps.load.output.by }}")
                    .checkpoint(),
            )
            .add(StepDefinition::python("publish", "flaky_publish"))
            .build();
        (workflow, registry)
    }

    #[tokio::test]
    async fn test_resume_skips_recorded_steps() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let healthy = Arc::new(AtomicU32::new(0));
        let (workflow, registry) = resumable(calls.clone(), healthy.clone());
        let store = Arc::new(MemoryCheckpointStore::new());
        let engine = Engine::new(Arc::new(registry)).with_checkpoint_store(store.clone());
        let args = inputs(json!({ "version": "1.2.0" }));

        let first = engine.run_with_id(&workflow, "rel-1", args.clone()).await.unwrap();
        assert!(!first.success);
        assert_eq!(store.list_checkpoints("rel-1").await.unwrap().len(), 2);

        healthy.store(1, Ordering::SeqCst);
        calls.lock().unwrap().clear();
        let resumed = engine.resume(&workflow, "rel-1", args.clone()).await.unwrap();

        assert!(resumed.success);
        assert_eq!(*calls.lock().unwrap(), vec!["flaky_publish"]);
        assert_eq!(
            statuses(&resumed),
            vec![StepStatus::Passed, StepStatus::Passed, StepStatus::Passed]
        );
        // cleared after success
        assert!(store.list_checkpoints("rel-1").await.unwrap().is_empty());

        // an uninterrupted run produces the same outcome
        let fresh = engine.run_with_id(&workflow, "rel-2", args).await.unwrap();
        assert!(fresh.same_outcome(&resumed));
    }

    #[tokio::test]
    async fn test_resume_restores_outputs_for_later_steps() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = recording_registry(calls.clone());
        let fail = Arc::new(AtomicU32::new(1));
        let gate = fail.clone();
        registry
            .register_callable(
                "use_load",
                action_fn(move |args: CallArgs| {
                    let failing = gate.load(Ordering::SeqCst) > 0;
                    async move {
                        if failing {
                            anyhow::bail!("not yet")
                        }
                        Ok(Value::Object(args.kwargs))
                    }
                }),
            )
            .unwrap();
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").kwarg("x", 1).checkpoint())
            .add(
                StepDefinition::python("use", "use_load")
                    .kwarg("from", "${{ steps.load.output.kwargs.x }}"),
            )
            .build();
        let store = Arc::new(MemoryCheckpointStore::new());
        let engine = Engine::new(Arc::new(registry)).with_checkpoint_store(store);

        assert!(!engine.run_with_id(&workflow, "r", Map::new()).await.unwrap().success);
        fail.store(0, Ordering::SeqCst);
        let resumed = engine.resume(&workflow, "r", Map::new()).await.unwrap();
        assert_eq!(resumed.final_output, json!({ "from": 1 }));
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_inputs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (workflow, registry) = resumable(calls, Arc::new(AtomicU32::new(0)));
        let engine = Engine::new(Arc::new(registry))
            .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));

        engine
            .run_with_id(&workflow, "rel-1", inputs(json!({ "version": "1.2.0" })))
            .await
            .unwrap();
        let err = engine
            .resume(&workflow, "rel-1", inputs(json!({ "version": "1.3.0" })))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(CheckpointError::InputMismatch { .. })));
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (workflow, registry) = resumable(calls, Arc::new(AtomicU32::new(0)));
        let engine = Engine::new(Arc::new(registry))
            .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));

        let err = engine
            .resume(&workflow, "unknown", inputs(json!({ "version": "1.0.0" })))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(CheckpointError::NotFound { .. })));

        let bare = Engine::new(Arc::new(ComponentRegistry::new()));
        assert!(matches!(
            bare.resume(&workflow, "unknown", Map::new()).await,
            Err(EngineError::NoCheckpointStore)
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_reordered_workflow() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (workflow, registry) = resumable(calls, Arc::new(AtomicU32::new(0)));
        let engine = Engine::new(Arc::new(registry))
            .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));
        let args = inputs(json!({ "version": "1.2.0" }));
        engine.run_with_id(&workflow, "rel-1", args.clone()).await.unwrap();

        let mut reordered = workflow.clone();
        reordered.steps.swap(0, 1);
        let err = engine.resume(&reordered, "rel-1", args).await.unwrap_err();
        assert!(matches!(err, EngineError::ResumeMismatch { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_resume_restores_rollbacks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").rollback("undo_load").checkpoint())
            .add(StepDefinition::python("publish", "boom"))
            .build();
        let engine = Engine::new(Arc::new(recording_registry(calls.clone())))
            .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new()));

        engine.run_with_id(&workflow, "r", Map::new()).await.unwrap();
        calls.lock().unwrap().clear();

        let resumed = engine.resume(&workflow, "r", Map::new()).await.unwrap();
        assert!(!resumed.success);
        // load was replayed, not re-run, but its rollback still fires
        assert_eq!(*calls.lock().unwrap(), vec!["undo_load"]);
    }

    #[tokio::test]
    async fn test_checkpoints_kept_when_configured() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").checkpoint())
            .build();
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = EngineConfig {
            clear_checkpoints_on_success: false,
            ..EngineConfig::default()
        };
        let engine = Engine::new(Arc::new(recording_registry(log)))
            .with_checkpoint_store(store.clone())
            .with_config(config);

        engine.run_with_id(&workflow, "keep", Map::new()).await.unwrap();
        assert_eq!(store.list_checkpoints("keep").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_checkpoint_steps_write_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .input("go", InputDefinition::new(InputType::Boolean))
            .add(
                StepDefinition::python("load", "load")
                    .when(Expression::parse("${{ inputs.go }}").unwrap())
                    .checkpoint(),
            )
            .add(StepDefinition::python("ping_remote", "boom").skip_on_error().checkpoint())
            .build();
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = EngineConfig {
            clear_checkpoints_on_success: false,
            ..EngineConfig::default()
        };
        let engine = Engine::new(Arc::new(recording_registry(log.clone())))
            .with_checkpoint_store(store.clone())
            .with_config(config);

        let result = engine
            .run_with_id(&workflow, "skips", inputs(json!({ "go": false })))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(statuses(&result), vec![StepStatus::Skipped, StepStatus::Skipped]);
        assert!(store.list_checkpoints("skips").await.unwrap().is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_values_visible_to_expressions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = EngineConfig::default();
        config.values.insert("model".into(), json!("sonnet"));

        let workflow = WorkflowDefinition::builder("fly")
            .add(StepDefinition::python("load", "load").kwarg("model", "${{ config.model }}"))
            .build();
        let engine = Engine::new(Arc::new(recording_registry(log))).with_config(config);
        let result = engine.run(&workflow, Map::new()).await.unwrap();
        assert_eq!(result.final_output["kwargs"]["model"], json!("sonnet"));
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowDefinition::builder("fly")
            .input("branch", InputDefinition::new(InputType::String).required())
            .add(StepDefinition::python("load", "load"))
            .build();
        let engine = Engine::new(Arc::new(recording_registry(log.clone())));

        assert!(engine.dry_run(&workflow, Map::new()).is_err());
        let result = engine.dry_run(&workflow, inputs(json!({ "branch": "main" }))).unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::Skipped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_placeholder_workflow_refused() {
        let workflow = WorkflowDefinition::builder("placeholder").build();
        let engine = Engine::new(Arc::new(ComponentRegistry::new()));
        assert!(matches!(
            engine.run(&workflow, Map::new()).await,
            Err(EngineError::EmptyWorkflow(_))
        ));
    }
}
