//! Step execution.
//!
//! Decorations wrap the kind dispatch in a fixed order, outermost first:
//! `when`, `skip_on_error`, `on_error`, retry, then the kind itself. A
//! successful step records its output and registers its rollback.

use super::events::ProgressEvent;
use super::{Engine, Scope, StepError, SubWorkflowError};
use crate::context::WorkflowContext;
use crate::registry::CallArgs;
use crate::result::{StepResult, StepStatus};
use crate::step::{
    AgentStep, BranchStep, GenerateStep, ParallelStep, PythonStep, RetryPolicy, StepDefinition,
    StepKind, StepType, SubWorkflowStep, ValidateStep,
};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A compensation registered by a successful step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingRollback {
    pub step: String,
    pub action: String,
    pub output: Value,
}

/// What a step leaves behind for the enclosing run, in completion order.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub outputs: Vec<(String, Value)>,
    pub rollbacks: Vec<PendingRollback>,
}

impl Effects {
    pub(crate) fn absorb(&mut self, other: Effects) {
        self.outputs.extend(other.outputs);
        self.rollbacks.extend(other.rollbacks);
    }
}

pub(crate) struct StepOutcome {
    pub result: StepResult,
    pub effects: Effects,
}

/// One pass through a step kind.
struct Attempt {
    outcome: Result<Value, StepError>,
    /// Fix attempts made by a validate step
    fixes: u32,
    children: Vec<StepResult>,
    effects: Effects,
}

impl Attempt {
    fn new(outcome: Result<Value, StepError>) -> Self {
        Self {
            outcome,
            fixes: 0,
            children: Vec::new(),
            effects: Effects::default(),
        }
    }

    fn with_nested(mut self, children: Vec<StepResult>, effects: Effects) -> Self {
        self.children = children;
        self.effects = effects;
        self
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A fraction in `[0, 1)` drawn from the clock.
fn jitter() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| f64::from(d.subsec_nanos()) / 1e9)
        .unwrap_or(0.0)
}

/// Why a validation stage failed, if it did.
fn stage_failure(outcome: anyhow::Result<Value>) -> Option<String> {
    match outcome {
        Err(e) => Some(format!("{e:#}")),
        Ok(Value::Bool(false)) => Some("stage returned false".to_string()),
        Ok(Value::Object(map)) if map.get("passed") == Some(&Value::Bool(false)) => Some(
            map.get("error")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("stage reported failure")
                .to_string(),
        ),
        Ok(_) => None,
    }
}

fn component_error(component: &str) -> impl FnOnce(anyhow::Error) -> StepError + '_ {
    move |e| StepError::Component {
        component: component.to_string(),
        message: format!("{e:#}"),
    }
}

impl Engine {
    /// Execute one step with all of its decorations.
    pub(crate) fn execute_step<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a WorkflowContext,
        scope: &'a Scope,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            let started = Instant::now();
            let step_type = step.step_type();

            if let Some(when) = &step.when {
                match when.evaluate_bool(ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            workflow = %scope.workflow,
                            step = %step.name,
                            "condition false, skipping"
                        );
                        let result = StepResult::skipped(&step.name, step_type, None);
                        return self.finish(scope, started, result, Effects::default());
                    }
                    Err(e) => {
                        tracing::warn!(
                            workflow = %scope.workflow,
                            step = %step.name,
                            error = %e,
                            "condition could not be evaluated, skipping"
                        );
                        let reason = Some(e.to_string());
                        let result = StepResult::skipped(&step.name, step_type, reason);
                        return self.finish(scope, started, result, Effects::default());
                    }
                }
            }

            if self.cancel.is_cancelled() {
                let result = StepResult::cancelled(&step.name, step_type);
                return self.finish(scope, started, result, Effects::default());
            }

            self.events.emit(ProgressEvent::StepStarted {
                workflow: scope.workflow.clone(),
                step: step.name.clone(),
                step_type,
            });
            tracing::debug!(
                workflow = %scope.workflow,
                step = %step.name,
                %step_type,
                "executing step"
            );

            let (mut attempt, tries) = self.run_with_retry(step, ctx, scope).await;

            if let (Err(error), Some(fallback)) = (&attempt.outcome, &step.on_error) {
                if !matches!(error, StepError::Cancelled) {
                    let original = error.to_string();
                    tracing::warn!(
                        workflow = %scope.workflow,
                        step = %step.name,
                        fallback = %fallback.name,
                        error = %original,
                        "step failed, running fallback"
                    );

                    let fb = self.execute_step(fallback, ctx, scope).await;
                    attempt.effects.absorb(fb.effects);
                    attempt.outcome = match fb.result.status {
                        StepStatus::Cancelled => Err(StepError::Cancelled),
                        status if status.is_success() => Ok(fb.result.output.clone()),
                        _ => Err(StepError::FallbackFailed {
                            fallback: fallback.name.clone(),
                            error: fb.result.error.clone().unwrap_or_default(),
                            original,
                        }),
                    };
                    attempt.children.push(fb.result);
                }
            }

            let attempts = if step_type == StepType::Validate {
                attempt.fixes
            } else {
                tries
            };
            let mut effects = attempt.effects;
            let result = match attempt.outcome {
                Ok(output) => {
                    effects.outputs.push((step.name.clone(), output.clone()));
                    if let Some(action) = &step.rollback {
                        effects.rollbacks.push(PendingRollback {
                            step: step.name.clone(),
                            action: action.clone(),
                            output: output.clone(),
                        });
                    }
                    let mut result = StepResult::passed(&step.name, step_type, output);
                    if attempt.fixes > 0 {
                        result.status = StepStatus::Fixed;
                    }
                    result
                }
                Err(StepError::Cancelled) => StepResult::cancelled(&step.name, step_type),
                Err(e) if step.skip_on_error => {
                    tracing::warn!(
                        workflow = %scope.workflow,
                        step = %step.name,
                        error = %e,
                        "step failed, skipping"
                    );
                    StepResult::skipped(&step.name, step_type, Some(e.to_string()))
                }
                Err(e) => StepResult::failed(&step.name, step_type, e.to_string()),
            };

            let result = result.with_attempts(attempts).with_children(attempt.children);
            self.finish(scope, started, result, effects)
        }
        .boxed()
    }

    fn finish(
        &self,
        scope: &Scope,
        started: Instant,
        mut result: StepResult,
        effects: Effects,
    ) -> StepOutcome {
        result.duration_ms = elapsed_ms(started);
        tracing::debug!(
            workflow = %scope.workflow,
            step = %result.name,
            status = %result.status,
            duration_ms = result.duration_ms,
            "step finished"
        );
        self.events.emit(ProgressEvent::StepCompleted {
            workflow: scope.workflow.clone(),
            result: result.clone(),
        });
        StepOutcome { result, effects }
    }

    /// Dispatch until success, a cancellation or the retry policy runs out.
    /// Returns the last attempt and the number of tries made.
    async fn run_with_retry(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> (Attempt, u32) {
        let max_attempts = step.retry_policy.as_ref().map_or(1, |p| p.max_attempts.max(1));
        let mut effects = Effects::default();
        let mut tries = 0;

        loop {
            tries += 1;
            let mut attempt = self.dispatch(step, ctx, scope).await;
            effects.absorb(std::mem::take(&mut attempt.effects));

            let policy = match (&attempt.outcome, &step.retry_policy) {
                (Err(StepError::Cancelled), _) | (Ok(_), _) | (Err(_), None) => None,
                (Err(_), Some(policy)) if tries < max_attempts => Some(policy),
                (Err(_), Some(_)) => None,
            };
            let Some(policy) = policy else {
                attempt.effects = effects;
                return (attempt, tries);
            };

            let delay = self.retry_delay(policy, tries);
            if let Err(e) = &attempt.outcome {
                tracing::warn!(
                    workflow = %scope.workflow,
                    step = %step.name,
                    attempt = tries,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "step failed, retrying"
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let cancelled = Attempt::new(Err(StepError::Cancelled))
                        .with_nested(attempt.children, effects);
                    return (cancelled, tries);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn retry_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        policy.delay(attempt, jitter()).min(self.config.max_retry_delay())
    }

    async fn dispatch(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> Attempt {
        match &step.kind {
            StepKind::Python(p) => Attempt::new(self.call_action(p, ctx).await),
            StepKind::Agent(a) => Attempt::new(self.run_agent(a, ctx).await),
            StepKind::Generate(g) => Attempt::new(self.run_generator(g, ctx).await),
            StepKind::Validate(v) => self.run_validation(step, v, ctx, scope).await,
            StepKind::Subworkflow(s) => self.run_subworkflow(step, s, ctx, scope).await,
            StepKind::Branch(b) => self.run_branch(b, ctx, scope).await,
            StepKind::Parallel(p) => self.run_parallel(p, ctx, scope).await,
        }
    }

    async fn call_action(
        &self,
        step: &PythonStep,
        ctx: &WorkflowContext,
    ) -> Result<Value, StepError> {
        let action = self.registry.callable(&step.action)?;
        let args = step
            .args
            .iter()
            .map(|arg| ctx.resolve(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = ctx.resolve_map(&step.kwargs)?;

        action
            .call(CallArgs::new(args, kwargs))
            .await
            .map_err(component_error(&step.action))
    }

    async fn build_context(
        &self,
        inline: &Map<String, Value>,
        builder: Option<&str>,
        ctx: &WorkflowContext,
    ) -> Result<Value, StepError> {
        let seed = ctx.resolve_map(inline)?;
        match builder {
            Some(name) => {
                let builder = self.registry.context_builder(name)?;
                builder.build(seed, ctx).await.map_err(component_error(name))
            }
            None => Ok(Value::Object(seed)),
        }
    }

    async fn run_agent(&self, step: &AgentStep, ctx: &WorkflowContext) -> Result<Value, StepError> {
        let agent = self.registry.agent(&step.agent)?;
        let context = self
            .build_context(&step.context, step.context_builder.as_deref(), ctx)
            .await?;

        let result = agent.execute(context).await.map_err(component_error(&step.agent))?;
        if !result.success {
            return Err(StepError::AgentFailed {
                agent: step.agent.clone(),
                errors: result.errors,
            });
        }
        Ok(result.output)
    }

    async fn run_generator(
        &self,
        step: &GenerateStep,
        ctx: &WorkflowContext,
    ) -> Result<Value, StepError> {
        let generator = self.registry.generator(&step.generator)?;
        let context = self
            .build_context(&step.context, step.context_builder.as_deref(), ctx)
            .await?;

        let text = generator
            .generate(context)
            .await
            .map_err(component_error(&step.generator))?;
        Ok(Value::String(text))
    }

    /// Run every stage in order. `Ok(Some(..))` names the first failing
    /// stage and why it failed.
    async fn run_stages(&self, stages: &[String]) -> Result<Option<(String, String)>, StepError> {
        for stage in stages {
            let action = self.registry.callable(stage)?;
            if let Some(reason) = stage_failure(action.call(CallArgs::default()).await) {
                return Ok(Some((stage.clone(), reason)));
            }
        }
        Ok(None)
    }

    async fn run_validation(
        &self,
        step: &StepDefinition,
        validate: &ValidateStep,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> Attempt {
        let mut fixes = 0;
        let mut children = Vec::new();
        let mut effects = Effects::default();

        loop {
            let (stage, reason) = match self.run_stages(&validate.stages).await {
                Ok(None) => {
                    let output = json!({ "passed": true, "fix_attempts": fixes });
                    let mut attempt = Attempt::new(Ok(output)).with_nested(children, effects);
                    attempt.fixes = fixes;
                    return attempt;
                }
                Ok(Some(failure)) => failure,
                Err(e) => return Attempt::new(Err(e)).with_nested(children, effects),
            };

            if fixes >= validate.retry {
                let error = StepError::ValidationFailed {
                    stage,
                    reason,
                    fix_attempts: fixes,
                };
                let mut attempt = Attempt::new(Err(error)).with_nested(children, effects);
                attempt.fixes = fixes;
                return attempt;
            }
            if self.cancel.is_cancelled() {
                return Attempt::new(Err(StepError::Cancelled)).with_nested(children, effects);
            }

            fixes += 1;
            tracing::info!(
                workflow = %scope.workflow,
                step = %step.name,
                %stage,
                %reason,
                fix_attempt = fixes,
                "validation failed"
            );

            if let Some(fix) = &validate.on_failure {
                let outcome = self.execute_step(fix, ctx, scope).await;
                let status = outcome.result.status;
                effects.absorb(outcome.effects);
                children.push(outcome.result);
                match status {
                    StepStatus::Cancelled => {
                        let cancelled = Attempt::new(Err(StepError::Cancelled));
                        return cancelled.with_nested(children, effects);
                    }
                    StepStatus::Failed => {
                        tracing::warn!(
                            workflow = %scope.workflow,
                            step = %step.name,
                            fix = %fix.name,
                            "fix step failed, re-validating anyway"
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    async fn run_subworkflow(
        &self,
        step: &StepDefinition,
        sub: &SubWorkflowStep,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> Attempt {
        let child = match self.registry.workflow(&sub.workflow) {
            Ok(child) => child,
            Err(e) => return Attempt::new(Err(e.into())),
        };
        if scope.stack.iter().any(|name| *name == child.name) {
            let mut chain = scope.stack.clone();
            chain.push(child.name.clone());
            return Attempt::new(Err(StepError::Cycle(chain)));
        }
        let inputs = match ctx.resolve_map(&sub.inputs) {
            Ok(inputs) => inputs,
            Err(e) => return Attempt::new(Err(e.into())),
        };

        let execution = match self.run_nested(&child, inputs, scope, &step.name).await {
            Ok(execution) => execution,
            Err(source) => {
                let error = SubWorkflowError::Rejected {
                    workflow: child.name.clone(),
                    source: Box::new(source),
                };
                return Attempt::new(Err(error.into()));
            }
        };

        let result = execution.result;
        let children = result.step_results.clone();
        let effects = Effects {
            outputs: Vec::new(),
            rollbacks: execution.rollbacks,
        };
        let outcome = if result.success {
            Ok(result.final_output.clone())
        } else if result.cancelled {
            Err(StepError::Cancelled)
        } else {
            Err(SubWorkflowError::Failed {
                workflow: child.name.clone(),
                result: Box::new(result),
            }
            .into())
        };
        Attempt::new(outcome).with_nested(children, effects)
    }

    async fn run_branch(
        &self,
        branch: &BranchStep,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> Attempt {
        for option in &branch.options {
            match option.when.evaluate_bool(ctx) {
                Ok(true) => {
                    tracing::debug!(
                        workflow = %scope.workflow,
                        option = %option.step.name,
                        "branch option selected"
                    );
                    let outcome = self.execute_step(&option.step, ctx, scope).await;
                    let result = match outcome.result.status {
                        StepStatus::Cancelled => Err(StepError::Cancelled),
                        status if status.is_success() => Ok(outcome.result.output.clone()),
                        _ => Err(StepError::OptionFailed {
                            step: option.step.name.clone(),
                            error: outcome.result.error.clone().unwrap_or_default(),
                        }),
                    };
                    return Attempt::new(result).with_nested(vec![outcome.result], outcome.effects);
                }
                Ok(false) => {}
                Err(e) => return Attempt::new(Err(StepError::Expression(e.into()))),
            }
        }
        Attempt::new(Err(StepError::NoBranchMatched))
    }

    async fn run_parallel(
        &self,
        group: &ParallelStep,
        ctx: &WorkflowContext,
        scope: &Scope,
    ) -> Attempt {
        let mut seen = HashSet::new();
        if let Some(dup) = group.steps.iter().find(|s| !seen.insert(s.name.as_str())) {
            return Attempt::new(Err(StepError::DuplicateStepName(dup.name.clone())));
        }

        let children = group.steps.iter().map(|child| self.execute_step(child, ctx, scope));
        let outcomes = join_all(children).await;

        let mut output = Map::new();
        let mut failed = Vec::new();
        let mut cancelled = false;
        let mut children = Vec::with_capacity(outcomes.len());
        let mut effects = Effects::default();
        for outcome in outcomes {
            match outcome.result.status {
                StepStatus::Failed => failed.push(outcome.result.name.clone()),
                StepStatus::Cancelled => cancelled = true,
                _ => {}
            }
            output.insert(outcome.result.name.clone(), outcome.result.output.clone());
            effects.absorb(outcome.effects);
            children.push(outcome.result);
        }

        let result = if !failed.is_empty() {
            Err(StepError::ParallelFailed(failed))
        } else if cancelled {
            Err(StepError::Cancelled)
        } else {
            Ok(Value::Object(output))
        };
        Attempt::new(result).with_nested(children, effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use crate::registry::{
        action_fn, agent_fn, generator_fn, AgentResult, ComponentRegistry, ContextBuilder,
    };
    use crate::step::MAX_RETRY_DELAY_SECS;
    use crate::workflow::{InputDefinition, InputType, WorkflowDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn expr(text: &str) -> Expression {
        Expression::parse(text).unwrap()
    }

    fn scope() -> Scope {
        Scope::root("test", "run-1", false)
    }

    /// Callable that fails until it has been called `fail_times` times.
    fn flaky(counter: Arc<AtomicU32>, fail_times: u32) -> Arc<dyn crate::registry::Action> {
        action_fn(move |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_times {
                    anyhow::bail!("attempt {n} failed")
                }
                Ok(json!({ "attempt": n }))
            }
        })
    }

    fn engine(registry: ComponentRegistry) -> Engine {
        Engine::new(Arc::new(registry))
    }

    fn base_registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry
            .register_callable(
                "echo",
                action_fn(|args: CallArgs| async move { Ok(Value::Object(args.kwargs)) }),
            )
            .unwrap();
        registry
            .register_callable("boom", action_fn(|_| async { anyhow::bail!("boom") }))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_python_step_resolves_arguments() {
        let engine = engine(base_registry());
        let mut ctx = WorkflowContext::new();
        ctx.set_input("path", json!("src/lib.rs"));

        let step = StepDefinition::python("load", "echo")
            .kwarg("path", "${{ inputs.path }}")
            .kwarg("note", "reading ${{ inputs.path }}")
            .build();
        let outcome = engine.execute_step(&step, &ctx, &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(outcome.result.attempts, 1);
        assert_eq!(
            outcome.result.output,
            json!({ "path": "src/lib.rs", "note": "reading src/lib.rs" })
        );
        assert_eq!(outcome.effects.outputs[0].0, "load");
    }

    #[tokio::test]
    async fn test_when_false_skips() {
        let engine = engine(base_registry());
        let mut ctx = WorkflowContext::new();
        ctx.set_input("enabled", json!(false));

        let step = StepDefinition::python("maybe", "boom")
            .when(expr("${{ inputs.enabled }}"))
            .build();
        let outcome = engine.execute_step(&step, &ctx, &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Skipped);
        assert!(outcome.result.error.is_none());
        assert!(outcome.effects.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_when_error_skips_with_reason() {
        let engine = engine(base_registry());
        let step = StepDefinition::python("maybe", "echo")
            .when(expr("${{ steps.never.output }}"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Skipped);
        assert!(outcome.result.error.unwrap().contains("steps.never.output"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        registry.register_callable("flaky", flaky(counter.clone(), 2)).unwrap();
        let engine = engine(registry);

        let step = StepDefinition::python("fetch", "flaky").retry(5, 1.0).build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(outcome.result.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.result.output, json!({ "attempt": 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        registry.register_callable("flaky", flaky(counter.clone(), 10)).unwrap();
        let engine = engine(registry);

        let step = StepDefinition::python("fetch", "flaky").retry(3, 0.5).build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(outcome.result.error.unwrap().contains("attempt 3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_grow_and_stop_at_max_attempts() {
        let calls: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = base_registry();
        let seen = calls.clone();
        registry
            .register_callable(
                "down",
                action_fn(move |_| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(tokio::time::Instant::now());
                        anyhow::bail!("service unavailable")
                    }
                }),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::python("fetch", "down").retry(5, 20.0).build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.attempts, 5);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);

        let waits: Vec<f64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs_f64()).collect();
        assert!(waits.windows(2).all(|w| w[0] <= w[1]), "{waits:?}");
        assert!(waits.iter().all(|w| *w <= MAX_RETRY_DELAY_SECS + 0.01), "{waits:?}");
        // 20s doubling, capped at 60s
        assert!((20.0..=22.01).contains(&waits[0]), "{waits:?}");
        assert!((40.0..=44.01).contains(&waits[1]), "{waits:?}");
        assert!((59.99..=60.01).contains(&waits[3]), "{waits:?}");
    }

    #[tokio::test]
    async fn test_retry_cancelled_between_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        registry.register_callable("flaky", flaky(counter.clone(), 10)).unwrap();
        let engine = engine(registry);
        let token = engine.cancellation_token();

        let step = StepDefinition::python("fetch", "flaky").retry(5, 30.0).build();
        let ctx = WorkflowContext::new();
        let scope = scope();
        let run = engine.execute_step(&step, &ctx, &scope);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (outcome, ()) = tokio::join!(run, cancel);

        assert_eq!(outcome.result.status, StepStatus::Cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_error_fallback_output() {
        let engine = engine(base_registry());
        let step = StepDefinition::python("primary", "boom")
            .on_error(StepDefinition::python("backup", "echo").kwarg("source", "backup"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(outcome.result.output, json!({ "source": "backup" }));
        assert_eq!(outcome.result.children[0].name, "backup");
        let names: Vec<&str> = outcome.effects.outputs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["backup", "primary"]);
    }

    #[tokio::test]
    async fn test_on_error_fallback_failure_fails_step() {
        let engine = engine(base_registry());
        let step = StepDefinition::python("primary", "boom")
            .on_error(StepDefinition::python("backup", "boom"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert!(outcome.result.error.unwrap().contains("fallback 'backup' failed"));
    }

    #[tokio::test]
    async fn test_skip_on_error_keeps_error() {
        let engine = engine(base_registry());
        let step = StepDefinition::python("optional", "boom").skip_on_error().build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Skipped);
        assert!(outcome.result.error.as_ref().unwrap().contains("boom"));
        assert!(outcome.result.success());
    }

    #[tokio::test]
    async fn test_rollback_registered_on_success() {
        let engine = engine(base_registry());
        let step = StepDefinition::python("create", "echo")
            .kwarg("id", 7)
            .rollback("delete")
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(
            outcome.effects.rollbacks,
            vec![PendingRollback {
                step: "create".into(),
                action: "delete".into(),
                output: json!({ "id": 7 }),
            }]
        );
    }

    #[tokio::test]
    async fn test_agent_failure_joins_errors() {
        let mut registry = base_registry();
        registry
            .register_agent(
                "reviewer",
                agent_fn(|_| async { Ok(AgentResult::failed(["missing tests", "bad naming"])) }),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::agent("review", "reviewer").build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert!(outcome.result.error.unwrap().contains("missing tests; bad naming"));
    }

    struct PrefixBuilder;

    #[async_trait]
    impl ContextBuilder for PrefixBuilder {
        async fn build(
            &self,
            mut seed: Map<String, Value>,
            workflow: &WorkflowContext,
        ) -> anyhow::Result<Value> {
            seed.insert("branch".into(), workflow.input("branch").cloned().unwrap_or(Value::Null));
            Ok(Value::Object(seed))
        }
    }

    #[tokio::test]
    async fn test_generate_with_context_builder() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let mut registry = base_registry();
        registry
            .register_context_builder("pr_context", Arc::new(PrefixBuilder))
            .unwrap();
        let captured = seen.clone();
        registry
            .register_generator(
                "describer",
                generator_fn(move |context: Value| {
                    let captured = captured.clone();
                    async move {
                        *captured.lock().unwrap() = context;
                        Ok("PR description".to_string())
                    }
                }),
            )
            .unwrap();
        let engine = engine(registry);

        let mut ctx = WorkflowContext::new();
        ctx.set_input("branch", json!("feature/x"));
        let step = StepDefinition::generate("describe", "describer")
            .context("title", "Add x")
            .context_builder("pr_context")
            .build();
        let outcome = engine.execute_step(&step, &ctx, &scope()).await;

        assert_eq!(outcome.result.output, json!("PR description"));
        assert_eq!(*seen.lock().unwrap(), json!({ "title": "Add x", "branch": "feature/x" }));
    }

    #[tokio::test]
    async fn test_validate_fixed_after_one_fix() {
        let runs = Arc::new(AtomicU32::new(0));
        let fixes = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        let stage_runs = runs.clone();
        registry
            .register_callable(
                "lint",
                action_fn(move |_| {
                    let n = stage_runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!({ "passed": n > 0, "error": "unused import" })) }
                }),
            )
            .unwrap();
        let fix_count = fixes.clone();
        registry
            .register_agent(
                "fixer",
                agent_fn(move |_| {
                    fix_count.fetch_add(1, Ordering::SeqCst);
                    async { Ok(AgentResult::ok(json!("fixed"))) }
                }),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::validate("checks", ["lint"])
            .fix_attempts(3)
            .on_failure(StepDefinition::agent("fix", "fixer"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Fixed);
        assert_eq!(outcome.result.attempts, 1);
        assert_eq!(fixes.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.result.children.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_stops_at_first_failing_stage() {
        let later = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        registry
            .register_callable("format", action_fn(|_| async { Ok(Value::Bool(false)) }))
            .unwrap();
        let later_runs = later.clone();
        registry
            .register_callable(
                "test",
                action_fn(move |_| {
                    later_runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Bool(true)) }
                }),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::validate("checks", ["format", "test"]).fix_attempts(2).build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.attempts, 2);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert!(outcome.result.error.unwrap().contains("'format'"));
    }

    #[tokio::test]
    async fn test_fix_failure_still_revalidates() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        let stage_runs = runs.clone();
        registry
            .register_callable(
                "lint",
                action_fn(move |_| {
                    let n = stage_runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Value::Bool(n > 0)) }
                }),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::validate("checks", ["lint"])
            .on_failure(StepDefinition::python("fix", "boom"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Fixed);
        assert_eq!(outcome.result.children[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_branch_first_match_only() {
        let engine = engine(base_registry());
        let mut ctx = WorkflowContext::new();
        ctx.set_input("mode", json!("fast"));
        ctx.set_input("fast", json!(true));

        // the last option would fail to evaluate if it were ever reached
        let step = StepDefinition::branch("route")
            .option(expr("${{ not inputs.fast }}"), StepDefinition::python("slow", "boom"))
            .option(
                expr("${{ inputs.fast }}"),
                StepDefinition::python("quick", "echo").kwarg("mode", "${{ inputs.mode }}"),
            )
            .option(expr("${{ steps.missing.output }}"), StepDefinition::python("never", "boom"))
            .build();
        let outcome = engine.execute_step(&step, &ctx, &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(outcome.result.output, json!({ "mode": "fast" }));
        assert_eq!(outcome.result.children.len(), 1);
        assert_eq!(outcome.result.children[0].name, "quick");
    }

    #[tokio::test]
    async fn test_branch_without_match_fails() {
        let engine = engine(base_registry());
        let step = StepDefinition::branch("route")
            .option(expr("${{ inputs.never }}"), StepDefinition::python("a", "echo"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert!(outcome.result.error.unwrap().contains("no branch option matched"));
    }

    #[tokio::test]
    async fn test_parallel_collects_outputs_by_name() {
        let engine = engine(base_registry());
        let step = StepDefinition::parallel("checks")
            .step(StepDefinition::python("lint", "echo").kwarg("ok", true))
            .step(StepDefinition::python("test", "echo").kwarg("ok", 1))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(
            outcome.result.output,
            json!({ "lint": { "ok": true }, "test": { "ok": 1 } })
        );
        let names: Vec<&str> = outcome.result.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["lint", "test"]);
    }

    #[tokio::test]
    async fn test_parallel_child_failure_keeps_all_results() {
        let engine = engine(base_registry());
        let step = StepDefinition::parallel("checks")
            .step(StepDefinition::python("lint", "boom"))
            .step(StepDefinition::python("test", "echo").rollback("undo_test"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.children.len(), 2);
        assert_eq!(outcome.result.children[1].status, StepStatus::Passed);
        assert!(outcome.result.error.unwrap().contains("lint"));
        // the sibling that succeeded still needs compensating
        assert_eq!(outcome.effects.rollbacks.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_duplicate_names_rejected_before_dispatch() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = base_registry();
        registry.register_callable("count", flaky(counter.clone(), 0)).unwrap();
        let engine = engine(registry);

        let step = StepDefinition::parallel("checks")
            .step(StepDefinition::python("same", "count"))
            .step(StepDefinition::python("same", "count"))
            .build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subworkflow_runs_with_resolved_inputs() {
        let mut registry = base_registry();
        registry
            .register_workflow(
                WorkflowDefinition::builder("child")
                    .input("target", InputDefinition::new(InputType::String).required())
                    .add(
                        StepDefinition::python("greet", "echo")
                            .kwarg("hello", "${{ inputs.target }}"),
                    )
                    .build(),
            )
            .unwrap();
        let engine = engine(registry);

        let mut ctx = WorkflowContext::new();
        ctx.set_input("name", json!("world"));
        let step = StepDefinition::subworkflow("nested", "child")
            .input("target", "${{ inputs.name }}")
            .build();
        let outcome = engine.execute_step(&step, &ctx, &scope()).await;

        assert_eq!(outcome.result.status, StepStatus::Passed);
        assert_eq!(outcome.result.output, json!({ "hello": "world" }));
        assert_eq!(outcome.result.children[0].name, "greet");
    }

    #[tokio::test]
    async fn test_subworkflow_cycle_fails_fast() {
        let mut registry = base_registry();
        registry
            .register_workflow(
                WorkflowDefinition::builder("ping")
                    .add(StepDefinition::subworkflow("call", "pong"))
                    .build(),
            )
            .unwrap();
        registry
            .register_workflow(
                WorkflowDefinition::builder("pong")
                    .add(StepDefinition::subworkflow("call", "ping"))
                    .build(),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::subworkflow("start", "ping").build();
        let root = Scope::root("ping-caller", "run-1", false);
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &root).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        let error = outcome.result.error.unwrap();
        assert!(error.contains("sub-workflow 'ping' failed"), "{error}");

        let nested = &outcome.result.children[0];
        assert_eq!(nested.status, StepStatus::Failed);
        assert!(nested.error.as_deref().unwrap().contains("sub-workflow 'pong' failed"));
        let innermost = &nested.children[0];
        assert!(innermost
            .error
            .as_deref()
            .unwrap()
            .contains("ping-caller -> ping -> pong -> ping"));
    }

    #[tokio::test]
    async fn test_subworkflow_missing_required_input() {
        let mut registry = base_registry();
        registry
            .register_workflow(
                WorkflowDefinition::builder("child")
                    .input("target", InputDefinition::new(InputType::String).required())
                    .add(StepDefinition::python("greet", "echo"))
                    .build(),
            )
            .unwrap();
        let engine = engine(registry);

        let step = StepDefinition::subworkflow("nested", "child").build();
        let outcome = engine.execute_step(&step, &WorkflowContext::new(), &scope()).await;
        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert!(outcome.result.error.unwrap().contains("target"));
    }

    #[test]
    fn test_stage_failure_interpretation() {
        assert_eq!(stage_failure(Ok(json!(true))), None);
        assert_eq!(stage_failure(Ok(json!({ "passed": true }))), None);
        assert_eq!(stage_failure(Ok(json!("output"))), None);
        assert!(stage_failure(Ok(json!(false))).is_some());
        assert_eq!(
            stage_failure(Ok(json!({ "passed": false, "error": "3 warnings" }))).as_deref(),
            Some("3 warnings")
        );
        assert_eq!(stage_failure(Err(anyhow::anyhow!("exit 1"))).as_deref(), Some("exit 1"));
    }

    #[test]
    fn test_jitter_in_range() {
        let j = jitter();
        assert!((0.0..1.0).contains(&j));
    }
}
