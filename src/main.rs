//! `maverick-workflow` command-line interface.
//!
//! Lists, inspects, validates, renders and runs workflow documents found by
//! discovery or given as file paths.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use maverick_workflow::registry::RegistryErrorKind;
use maverick_workflow::serialization::{resolve_references, ValidationIssue};
use maverick_workflow::viz::{self, VizFormat};
use maverick_workflow::{
    actions, ComponentRegistry, DiscoveryResult, Engine, EngineConfig, FileCheckpointStore,
    ParseError, ProgressEvent, RunState, StepStatus, WorkflowDefinition, WorkflowDiscovery,
    WorkflowParser, WorkflowResult,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Define, inspect and run workflows.
#[derive(Parser)]
#[command(name = "maverick-workflow", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Defer unknown component references instead of rejecting the workflow.
    #[arg(long, global = true)]
    lenient: bool,

    /// Directory of builtin workflows (lowest precedence).
    #[arg(long, env = "MAVERICK_BUILTIN_WORKFLOWS", global = true)]
    builtin_dir: Option<PathBuf>,

    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow's metadata, inputs and steps.
    Show {
        /// Workflow name or file.
        workflow: String,
    },

    /// Check a workflow document without running it.
    Validate {
        /// Workflow file.
        file: PathBuf,
    },

    /// Render the step graph.
    Viz {
        /// Workflow name or file.
        workflow: String,

        #[arg(long, value_enum, default_value_t = Format::Ascii)]
        format: Format,
    },

    /// Run a workflow.
    Run {
        /// Workflow name or file.
        workflow: String,

        /// Input as key=value (repeatable).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Check inputs and list the steps without executing them.
        #[arg(long)]
        dry_run: bool,

        /// Resume the run with this id from its latest checkpoint.
        #[arg(long, value_name = "WORKFLOW_ID")]
        resume: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Ascii,
    Mermaid,
}

impl From<Format> for VizFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Ascii => VizFormat::Ascii,
            Format::Mermaid => VizFormat::Mermaid,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info,maverick_workflow=debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Shared state built from the global flags.
struct Session {
    project_root: PathBuf,
    discovery: WorkflowDiscovery,
    json: bool,
    lenient: bool,
}

impl Session {
    fn new(cli: &Cli) -> Result<Self> {
        let project_root = match &cli.project {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("cannot determine current directory")?,
        };
        let mut discovery = WorkflowDiscovery::for_project(&project_root);
        if let Some(dir) = &cli.builtin_dir {
            discovery = discovery.with_builtin_dir(dir);
        }
        Ok(Self {
            project_root,
            discovery,
            json: cli.json,
            lenient: cli.lenient,
        })
    }

    fn discover(&self) -> Result<DiscoveryResult> {
        let found = self.discovery.discover().context("workflow discovery failed")?;
        for skipped in found.skipped() {
            eprintln!(
                "warning: skipped {} ({}): {}",
                skipped.file_path.display(),
                skipped.source,
                skipped.error
            );
        }
        Ok(found)
    }

    /// Builtin callables plus every discovered workflow.
    fn registry(&self, found: &DiscoveryResult) -> Result<ComponentRegistry> {
        let mut registry = if self.lenient {
            ComponentRegistry::lenient()
        } else {
            ComponentRegistry::new()
        };
        actions::register_builtins(&mut registry)?;
        for discovered in found.workflows() {
            registry.register_workflow(discovered.workflow.as_ref().clone())?;
        }
        Ok(registry)
    }

    /// Resolve a workflow given as a file path or a discovered name.
    fn load(
        &self,
        target: &str,
        found: &DiscoveryResult,
        registry: &ComponentRegistry,
    ) -> Result<Arc<WorkflowDefinition>> {
        let path = Path::new(target);
        if path.is_file() {
            return WorkflowParser::new(registry)
                .parse_file(path)
                .with_context(|| format!("cannot load {}", path.display()));
        }

        let Some(discovered) = found.get_workflow(target) else {
            bail!("no workflow named '{target}' (see `maverick-workflow list`)");
        };
        let unresolved: Vec<_> = resolve_references(&discovered.workflow, registry)
            .into_iter()
            .filter(|e| e.kind != RegistryErrorKind::Deferred)
            .collect();
        if !unresolved.is_empty() {
            return Err(ParseError::ReferenceResolution(unresolved))
                .with_context(|| format!("cannot load {}", discovered.file_path.display()));
        }
        Ok(discovered.workflow.clone())
    }
}

async fn dispatch(cli: Cli) -> Result<bool> {
    let session = Session::new(&cli)?;
    match cli.command {
        Commands::List => list(&session),
        Commands::Show { workflow } => show(&session, &workflow),
        Commands::Validate { file } => validate(&session, &file),
        Commands::Viz { workflow, format } => {
            let found = session.discover()?;
            let workflow = session.load(&workflow, &found, &ComponentRegistry::lenient())?;
            print!("{}", viz::render(&workflow, format.into()));
            Ok(true)
        }
        Commands::Run {
            workflow,
            inputs,
            dry_run,
            resume,
        } => run(&session, &workflow, &inputs, dry_run, resume.as_deref()).await,
    }
}

fn list(session: &Session) -> Result<bool> {
    let found = session.discover()?;
    if session.json {
        let entries: Vec<Value> = found
            .workflows()
            .map(|w| {
                json!({
                    "name": w.metadata.name,
                    "version": w.metadata.version,
                    "description": w.metadata.description,
                    "source": w.source,
                    "path": w.file_path,
                    "overrides": w.overrides,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(true);
    }

    if found.is_empty() {
        println!("No workflows found in:");
        for (source, dir) in found.locations() {
            println!("  {source:<8} {}", dir.display());
        }
        return Ok(true);
    }
    for w in found.workflows() {
        let shadowed = if w.overrides.is_empty() {
            String::new()
        } else {
            format!(" (overrides {})", w.overrides.len())
        };
        println!("{:<24} {:<8} {}{}", w.metadata.name, w.source, w.metadata.description, shadowed);
    }
    Ok(true)
}

fn show(session: &Session, target: &str) -> Result<bool> {
    let found = session.discover()?;
    let registry = ComponentRegistry::lenient();
    let workflow = session.load(target, &found, &registry)?;

    if session.json {
        println!("{}", serde_json::to_string_pretty(workflow.as_ref())?);
        return Ok(true);
    }

    println!("{} (version {})", workflow.name, workflow.version);
    if let Some(discovered) = found.get_workflow(&workflow.name) {
        println!("source: {} ({})", discovered.source, discovered.file_path.display());
        for path in &discovered.overrides {
            println!("overrides: {}", path.display());
        }
    }
    if !workflow.description.is_empty() {
        println!("{}", workflow.description);
    }
    if !workflow.inputs.is_empty() {
        println!("\ninputs:");
        for (name, input) in &workflow.inputs {
            let mut line = format!("  {name}: {}", input.input_type);
            if input.required {
                line.push_str(" (required)");
            }
            if let Some(default) = &input.default {
                line.push_str(&format!(" = {default}"));
            }
            if !input.description.is_empty() {
                line.push_str(&format!("  {}", input.description));
            }
            println!("{line}");
        }
    }
    println!("\nsteps:");
    print!("{}", viz::render(&workflow, VizFormat::Ascii));
    Ok(true)
}

fn validate(session: &Session, file: &Path) -> Result<bool> {
    let found = session.discover()?;
    let registry = session.registry(&found)?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let report = WorkflowParser::new(&registry)
        .validate_only(&text)
        .with_context(|| format!("cannot decode {}", file.display()))?;

    let (errors, warnings) = (report.issues, report.warnings);

    if session.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "valid": errors.is_empty(),
                "errors": issues_json(&errors),
                "warnings": issues_json(&warnings),
            }))?
        );
        return Ok(errors.is_empty());
    }

    for issue in &warnings {
        println!("warning: {issue}");
    }
    for issue in &errors {
        println!("error: {issue}");
    }
    if errors.is_empty() {
        println!("{} is valid", file.display());
    } else {
        println!("{}: {} problem(s)", file.display(), errors.len());
    }
    Ok(errors.is_empty())
}

fn issues_json(issues: &[ValidationIssue]) -> Vec<Value> {
    issues
        .iter()
        .map(|i| json!({ "location": i.location, "message": i.message }))
        .collect()
}

async fn run(
    session: &Session,
    target: &str,
    raw_inputs: &[String],
    dry_run: bool,
    resume: Option<&str>,
) -> Result<bool> {
    let found = session.discover()?;
    let registry = session.registry(&found)?;
    let workflow = session.load(target, &found, &registry)?;
    let inputs = parse_inputs(&workflow, raw_inputs)?;

    let config = EngineConfig::load_for_project(&session.project_root)?;
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(Arc::new(registry))
        .with_config(config)
        .with_checkpoint_store(store)
        .with_progress(tx);

    if dry_run {
        let result = engine.dry_run(&workflow, inputs)?;
        report(session, &result)?;
        return Ok(true);
    }

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current step...");
            token.cancel();
        }
    });
    let printer = tokio::spawn(print_progress(rx, session.json));

    let result = match resume {
        Some(id) => engine.resume(&workflow, id, inputs).await,
        None => engine.run(&workflow, inputs).await,
    };
    // closes the progress channel
    drop(engine);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "progress printer stopped");
    }

    let result = result?;
    report(session, &result)?;
    Ok(result.success)
}

/// Convert `key=value` pairs using the declared input types.
fn parse_inputs(workflow: &WorkflowDefinition, raw: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{pair}' is not of the form key=value");
        };
        let parsed = match workflow.inputs.get(key) {
            Some(input) => input
                .input_type
                .parse_str(value)
                .with_context(|| {
                    format!("input '{key}' expects a {} value, got '{value}'", input.input_type)
                })?,
            None => Value::String(value.to_string()),
        };
        inputs.insert(key.to_string(), parsed);
    }
    Ok(inputs)
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            continue;
        }
        match event {
            ProgressEvent::WorkflowStarted {
                workflow,
                workflow_id,
                replayed,
                ..
            } => {
                println!("workflow {workflow} ({workflow_id})");
                if replayed > 0 {
                    println!("  restored {replayed} step(s) from checkpoint");
                }
            }
            ProgressEvent::StepStarted { step, step_type, .. } => {
                println!("  > {step} [{step_type}]")
            }
            ProgressEvent::StepCompleted { result, .. } => {
                let detail = result.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default();
                let mark = status_mark(result.status);
                println!("  {mark} {} ({} ms){detail}", result.name, result.duration_ms);
            }
            ProgressEvent::CheckpointSaved { step, .. } => {
                println!("  checkpoint saved after {step}")
            }
            ProgressEvent::RollbackStarted { step, action, .. } => {
                println!("  rolling back {step} with {action}")
            }
            ProgressEvent::RollbackCompleted { step, success, error, .. } => {
                if !success {
                    println!("  rollback of {step} failed: {}", error.unwrap_or_default());
                }
            }
            ProgressEvent::WorkflowCompleted { .. } => {}
        }
    }
}

fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Passed => "ok",
        StepStatus::Fixed => "fixed",
        StepStatus::Skipped => "skip",
        StepStatus::Failed => "FAIL",
        StepStatus::Cancelled => "cancelled",
    }
}

fn report(session: &Session, result: &WorkflowResult) -> Result<()> {
    if session.json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if result.workflow_id.is_empty() {
        for step in &result.step_results {
            println!("  would run {} [{}]", step.name, step.step_type);
        }
        return Ok(());
    }
    match result.state() {
        RunState::Completed => println!("completed in {} ms", result.total_ms),
        RunState::Cancelled => {
            println!("cancelled; resume with --resume {}", result.workflow_id)
        }
        _ => {
            println!("failed: {}", result.error.as_deref().unwrap_or("unknown error"));
            println!("resume with --resume {}", result.workflow_id);
        }
    }
    Ok(())
}
