//! Name → implementation resolution for step collaborators.
//!
//! A [`ComponentRegistry`] is filled once at startup and then shared
//! read-only (usually behind an `Arc`) with the parser, discovery and the
//! engine. Each component kind has its own [`Namespace`].
//!
//! In lenient mode a failed lookup hands back a placeholder that errors when
//! used and records a deferred [`RegistryError`]. That mode exists for
//! editing and partial registration; execution should use a strict registry.

use crate::context::WorkflowContext;
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Arguments passed to a callable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Keyword argument lookup.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// A named callable (`python` steps, validation stages, rollbacks).
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, args: CallArgs) -> anyhow::Result<Value>;
}

/// Outcome reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,

    #[serde(default)]
    pub output: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl AgentResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            errors: Vec::new(),
        }
    }

    pub fn failed<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            success: false,
            output: Value::Null,
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }
}

/// An agent invoked by `agent` steps.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(&self, context: Value) -> anyhow::Result<AgentResult>;
}

/// A text generator invoked by `generate` steps.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: Value) -> anyhow::Result<String>;
}

/// Builds the context handed to an agent or generator.
///
/// Receives the step's resolved inline context and the current workflow
/// context.
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build(&self, seed: Map<String, Value>, workflow: &WorkflowContext)
        -> anyhow::Result<Value>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(CallArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: CallArgs) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

struct FnAgent<F>(F);

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send,
{
    async fn execute(&self, context: Value) -> anyhow::Result<AgentResult> {
        (self.0)(context).await
    }
}

struct FnGenerator<F>(F);

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn generate(&self, context: Value) -> anyhow::Result<String> {
        (self.0)(context).await
    }
}

/// Wrap an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Wrap an async closure as an [`Agent`].
pub fn agent_fn<F, Fut>(f: F) -> Arc<dyn Agent>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send + 'static,
{
    Arc::new(FnAgent(f))
}

/// Wrap an async closure as a [`Generator`].
pub fn generator_fn<F, Fut>(f: F) -> Arc<dyn Generator>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnGenerator(f))
}

/// Stand-in returned by lenient lookups; fails whenever it is used.
struct Unresolved {
    namespace: NamespaceKind,
    name: String,
}

impl Unresolved {
    fn error(&self) -> anyhow::Error {
        anyhow::anyhow!("{} '{}' is not registered", self.namespace.singular(), self.name)
    }
}

#[async_trait]
impl Action for Unresolved {
    async fn call(&self, _args: CallArgs) -> anyhow::Result<Value> {
        Err(self.error())
    }
}

#[async_trait]
impl Agent for Unresolved {
    async fn execute(&self, _context: Value) -> anyhow::Result<AgentResult> {
        Err(self.error())
    }
}

#[async_trait]
impl Generator for Unresolved {
    async fn generate(&self, _context: Value) -> anyhow::Result<String> {
        Err(self.error())
    }
}

#[async_trait]
impl ContextBuilder for Unresolved {
    async fn build(
        &self,
        _seed: Map<String, Value>,
        _workflow: &WorkflowContext,
    ) -> anyhow::Result<Value> {
        Err(self.error())
    }
}

/// The five component namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    Callables,
    Agents,
    Generators,
    ContextBuilders,
    Workflows,
}

impl NamespaceKind {
    fn singular(self) -> &'static str {
        match self {
            NamespaceKind::Callables => "callable",
            NamespaceKind::Agents => "agent",
            NamespaceKind::Generators => "generator",
            NamespaceKind::ContextBuilders => "context builder",
            NamespaceKind::Workflows => "workflow",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NamespaceKind::Callables => "callables",
            NamespaceKind::Agents => "agents",
            NamespaceKind::Generators => "generators",
            NamespaceKind::ContextBuilders => "context_builders",
            NamespaceKind::Workflows => "workflows",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// A second registration under an existing name.
    Duplicate,
    /// Lookup of a name that was never registered.
    NotFound,
    /// A not-found lookup recorded by a lenient registry.
    Deferred,
}

/// Registration or lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RegistryError {
    pub kind: RegistryErrorKind,
    pub namespace: NamespaceKind,
    pub name: String,
    /// Where the reference appeared, e.g. `steps[2].action`
    pub location: Option<String>,
}

impl RegistryError {
    fn new(
        kind: RegistryErrorKind,
        namespace: NamespaceKind,
        name: &str,
        location: Option<&str>,
    ) -> Self {
        Self {
            kind,
            namespace,
            name: name.to_string(),
            location: location.map(str::to_string),
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = self.namespace.singular();
        match self.kind {
            RegistryErrorKind::Duplicate => {
                write!(f, "{what} '{}' is already registered", self.name)?
            }
            RegistryErrorKind::NotFound => write!(f, "{what} '{}' is not registered", self.name)?,
            RegistryErrorKind::Deferred => {
                write!(f, "{what} '{}' is not registered (deferred)", self.name)?
            }
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

/// One name → component map.
pub struct Namespace<T> {
    kind: NamespaceKind,
    entries: BTreeMap<String, T>,
}

impl<T: Clone> Namespace<T> {
    fn new(kind: NamespaceKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    /// Add a component. Fails if the name is taken.
    pub fn register(&mut self, name: &str, component: T) -> Result<(), RegistryError> {
        if self.entries.contains_key(name) {
            return Err(RegistryError::new(
                RegistryErrorKind::Duplicate,
                self.kind,
                name,
                None,
            ));
        }
        self.entries.insert(name.to_string(), component);
        Ok(())
    }

    /// Strict lookup.
    pub fn get(&self, name: &str) -> Result<T, RegistryError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::new(RegistryErrorKind::NotFound, self.kind, name, None))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry of every component a workflow can reference by name.
pub struct ComponentRegistry {
    callables: Namespace<Arc<dyn Action>>,
    agents: Namespace<Arc<dyn Agent>>,
    generators: Namespace<Arc<dyn Generator>>,
    context_builders: Namespace<Arc<dyn ContextBuilder>>,
    workflows: Namespace<Arc<WorkflowDefinition>>,
    lenient: bool,
    deferred: Mutex<Vec<RegistryError>>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("callables", &self.callables.list_names())
            .field("agents", &self.agents.list_names())
            .field("generators", &self.generators.list_names())
            .field("context_builders", &self.context_builders.list_names())
            .field("workflows", &self.workflows.list_names())
            .field("lenient", &self.lenient)
            .finish()
    }
}

impl ComponentRegistry {
    /// A strict registry: unknown names fail immediately.
    pub fn new() -> Self {
        Self {
            callables: Namespace::new(NamespaceKind::Callables),
            agents: Namespace::new(NamespaceKind::Agents),
            generators: Namespace::new(NamespaceKind::Generators),
            context_builders: Namespace::new(NamespaceKind::ContextBuilders),
            workflows: Namespace::new(NamespaceKind::Workflows),
            lenient: false,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// A lenient registry: unknown names yield placeholders and deferred errors.
    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::new()
        }
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    pub fn register_callable(
        &mut self,
        name: &str,
        action: Arc<dyn Action>,
    ) -> Result<(), RegistryError> {
        self.callables.register(name, action)
    }

    pub fn register_agent(
        &mut self,
        name: &str,
        agent: Arc<dyn Agent>,
    ) -> Result<(), RegistryError> {
        self.agents.register(name, agent)
    }

    pub fn register_generator(
        &mut self,
        name: &str,
        generator: Arc<dyn Generator>,
    ) -> Result<(), RegistryError> {
        self.generators.register(name, generator)
    }

    pub fn register_context_builder(
        &mut self,
        name: &str,
        builder: Arc<dyn ContextBuilder>,
    ) -> Result<(), RegistryError> {
        self.context_builders.register(name, builder)
    }

    /// Register a workflow under its own name.
    pub fn register_workflow(&mut self, workflow: WorkflowDefinition) -> Result<(), RegistryError> {
        let name = workflow.name.clone();
        self.workflows.register(&name, Arc::new(workflow))
    }

    pub fn callables(&self) -> &Namespace<Arc<dyn Action>> {
        &self.callables
    }

    pub fn agents(&self) -> &Namespace<Arc<dyn Agent>> {
        &self.agents
    }

    pub fn generators(&self) -> &Namespace<Arc<dyn Generator>> {
        &self.generators
    }

    pub fn context_builders(&self) -> &Namespace<Arc<dyn ContextBuilder>> {
        &self.context_builders
    }

    pub fn workflows(&self) -> &Namespace<Arc<WorkflowDefinition>> {
        &self.workflows
    }

    pub fn callable(&self, name: &str) -> Result<Arc<dyn Action>, RegistryError> {
        self.lookup(&self.callables, name, |ns, n| -> Arc<dyn Action> {
            Arc::new(Unresolved::named(ns, n))
        })
    }

    pub fn agent(&self, name: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.lookup(&self.agents, name, |ns, n| -> Arc<dyn Agent> {
            Arc::new(Unresolved::named(ns, n))
        })
    }

    pub fn generator(&self, name: &str) -> Result<Arc<dyn Generator>, RegistryError> {
        self.lookup(&self.generators, name, |ns, n| -> Arc<dyn Generator> {
            Arc::new(Unresolved::named(ns, n))
        })
    }

    pub fn context_builder(&self, name: &str) -> Result<Arc<dyn ContextBuilder>, RegistryError> {
        self.lookup(&self.context_builders, name, |ns, n| -> Arc<dyn ContextBuilder> {
            Arc::new(Unresolved::named(ns, n))
        })
    }

    /// Look up a nested workflow. The lenient placeholder has no steps,
    /// which the engine refuses to run.
    pub fn workflow(&self, name: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.lookup(&self.workflows, name, |_, n| {
            Arc::new(
                WorkflowDefinition::builder(n)
                    .description("unresolved workflow placeholder")
                    .build(),
            )
        })
    }

    /// The error a reference to `name` at `location` would raise, without
    /// recording it. Lenient registries report it as deferred.
    pub fn reference_error(
        &self,
        namespace: NamespaceKind,
        name: &str,
        location: &str,
    ) -> Option<RegistryError> {
        let known = match namespace {
            NamespaceKind::Callables => self.callables.has(name),
            NamespaceKind::Agents => self.agents.has(name),
            NamespaceKind::Generators => self.generators.has(name),
            NamespaceKind::ContextBuilders => self.context_builders.has(name),
            NamespaceKind::Workflows => self.workflows.has(name),
        };
        if known {
            return None;
        }
        let kind = if self.lenient {
            RegistryErrorKind::Deferred
        } else {
            RegistryErrorKind::NotFound
        };
        Some(RegistryError::new(kind, namespace, name, Some(location)))
    }

    /// Check that `name` resolves in `namespace`, recording `location` on
    /// failure. Lenient registries defer the error and return `Ok`.
    pub fn check_reference(
        &self,
        namespace: NamespaceKind,
        name: &str,
        location: &str,
    ) -> Result<(), RegistryError> {
        match self.reference_error(namespace, name, location) {
            None => Ok(()),
            Some(error) if error.kind == RegistryErrorKind::Deferred => {
                self.defer(error);
                Ok(())
            }
            Some(error) => Err(error),
        }
    }

    /// Errors recorded by lenient lookups so far.
    pub fn deferred_errors(&self) -> Vec<RegistryError> {
        self.deferred
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }

    /// Drain the errors recorded by lenient lookups.
    pub fn take_deferred_errors(&self) -> Vec<RegistryError> {
        self.deferred
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default()
    }

    fn lookup<T: Clone>(
        &self,
        namespace: &Namespace<T>,
        name: &str,
        placeholder: impl FnOnce(NamespaceKind, &str) -> T,
    ) -> Result<T, RegistryError> {
        match namespace.get(name) {
            Ok(component) => Ok(component),
            Err(err) if self.lenient => {
                tracing::debug!(
                    namespace = %namespace.kind(),
                    name,
                    "deferring unresolved component"
                );
                self.defer(RegistryError {
                    kind: RegistryErrorKind::Deferred,
                    ..err
                });
                Ok(placeholder(namespace.kind(), name))
            }
            Err(err) => Err(err),
        }
    }

    fn defer(&self, error: RegistryError) {
        if let Ok(mut errors) = self.deferred.lock() {
            errors.push(error);
        }
    }
}

impl Unresolved {
    fn named(namespace: NamespaceKind, name: &str) -> Self {
        Self {
            namespace,
            name: name.to_string(),
        }
    }
}
