//! # maverick-workflow
//!
//! Declarative multi-step workflows with branching, parallel fan-out,
//! retries, rollback compensation and resumable checkpoints.
//!
//! Steps delegate real work to components registered by name in a
//! [`ComponentRegistry`]: callables, agents, generators, context builders and
//! other workflows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use maverick_workflow::{
//!     action_fn, ComponentRegistry, Engine, StepDefinition, WorkflowDefinition,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut registry = ComponentRegistry::new();
//! registry.register_callable(
//!     "fetch",
//!     action_fn(|_| async { Ok(serde_json::json!({ "url": "https://example.com" })) }),
//! )?;
//! maverick_workflow::actions::register_builtins(&mut registry)?;
//!
//! let workflow = WorkflowDefinition::builder("my-workflow")
//!     .add(StepDefinition::python("fetch", "fetch").retry(3, 1.0))
//!     .add(StepDefinition::python("show", "echo").arg("${{ steps.fetch.output.url }}"))
//!     .build();
//!
//! let result = Engine::new(Arc::new(registry)).run(&workflow, Default::default()).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## YAML Definition
//!
//! ```yaml
//! version: "1.0"
//! name: my-workflow
//! steps:
//!   - name: fetch
//!     type: python
//!     action: fetch
//!     retry_policy: { max_attempts: 3, backoff: 1.0 }
//!   - name: show
//!     type: python
//!     action: echo
//!     args: ["${{ steps.fetch.output.url }}"]
//! ```

pub mod actions;
pub mod checkpoint;
pub mod config;
mod context;
pub mod discovery;
pub mod engine;
mod error;
pub mod expression;
pub mod registry;
mod result;
pub mod serialization;
mod step;
pub mod viz;
mod workflow;

pub use checkpoint::{
    CheckpointData, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::EngineConfig;
pub use context::WorkflowContext;
pub use discovery::{
    DiscoveredWorkflow, DiscoveryError, DiscoveryResult, SkippedWorkflow, WorkflowConflict,
    WorkflowDiscovery, WorkflowSource,
};
pub use engine::{Engine, EngineError, ProgressEvent, StepError, SubWorkflowError};
pub use error::{Error, Result};
pub use expression::{Expression, ExpressionError, ExpressionEvaluationError, ExpressionSyntaxError};
pub use registry::{
    action_fn, agent_fn, generator_fn, Action, Agent, AgentResult, CallArgs, ComponentRegistry,
    ContextBuilder, Generator, RegistryError,
};
pub use result::{RunState, StepResult, StepStatus, WorkflowResult};
pub use serialization::{ParseError, ValidationReport, WorkflowParser};
pub use step::{
    AgentStep, BranchOption, BranchStep, GenerateStep, ParallelStep, PythonStep, RetryPolicy,
    StepBuilder, StepDefinition, StepKind, StepType, SubWorkflowStep, ValidateStep,
};
pub use workflow::{InputDefinition, InputType, WorkflowBuilder, WorkflowDefinition};

/// Re-export common types
pub use serde_json::Value;
