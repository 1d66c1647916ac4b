//! Static checks over a decoded workflow.
//!
//! Every check appends to a [`ValidationReport`] instead of returning early so
//! that `validate` can show every problem at once. Locations use the document
//! path, e.g. `steps[2].options[0].step.kwargs.path`.

use crate::expression::{self, Expression, ExpressionKind};
use crate::registry::{ComponentRegistry, NamespaceKind, RegistryError};
use crate::step::{StepDefinition, StepKind};
use crate::workflow::{parse_version, WorkflowDefinition};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::RangeInclusive;

/// Major schema versions this crate can execute.
pub const SUPPORTED_MAJOR_VERSIONS: RangeInclusive<u32> = 1..=1;

const MAX_NAME_LEN: usize = 64;

/// One problem found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub location: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Every problem found in a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// References a lenient registry deferred; they fail only when used
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn push(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            location: location.into(),
            message: message.into(),
        });
    }

    pub fn warn(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            location: location.into(),
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.issues.extend(other.issues);
        self.warnings.extend(other.warnings);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Workflow names: lowercase letter, then lowercase letters, digits or `-`,
/// at most 64 characters.
pub fn is_valid_workflow_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name.len() <= MAX_NAME_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Whether the major version of `version` is supported. `None` if the
/// version is malformed.
pub fn version_supported(version: &str) -> Option<bool> {
    parse_version(version).map(|(major, _)| SUPPORTED_MAJOR_VERSIONS.contains(&major))
}

/// Structural and expression checks. Registry references are not resolved.
pub fn validate_definition(def: &WorkflowDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    if parse_version(&def.version).is_none() {
        report.push("version", format!("'{}' is not a major.minor version", def.version));
    }

    if !is_valid_workflow_name(&def.name) {
        report.push(
            "name",
            format!(
                "'{}' must start with a lowercase letter and contain only lowercase letters, \
                 digits and '-' (max {MAX_NAME_LEN})",
                def.name
            ),
        );
    }

    for (name, input) in &def.inputs {
        let location = format!("inputs.{name}");
        let allowed = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
        if name.is_empty() || !name.chars().all(allowed) {
            report.push(&location, "input names may contain only letters, digits, '_' and '-'");
        }
        if let Some(default) = &input.default {
            if !input.input_type.accepts(default) {
                report.push(
                    format!("{location}.default"),
                    format!("default {default} is not of type {}", input.input_type),
                );
            }
        }
    }

    if def.steps.is_empty() {
        report.push("steps", "workflow must have at least one step");
    }

    check_unique_names(&def.steps, &mut report);

    let mut checker = StepChecker {
        workflow: def,
        report: &mut report,
    };

    let mut available: BTreeSet<String> = BTreeSet::new();
    for (i, step) in def.steps.iter().enumerate() {
        let location = format!("steps[{i}]");
        checker.check_step(step, &location, &available, true);
        collect_names(step, &mut available);
    }

    report
}

/// Resolve every component name against `registry`.
///
/// A lenient registry yields
/// [`Deferred`](crate::registry::RegistryErrorKind::Deferred) errors, which do
/// not stop a parse. Nothing is recorded on the registry.
pub fn resolve_references(
    def: &WorkflowDefinition,
    registry: &ComponentRegistry,
) -> Vec<RegistryError> {
    let mut errors = Vec::new();
    for (i, step) in def.steps.iter().enumerate() {
        resolve_step(step, &format!("steps[{i}]"), registry, &mut errors);
    }
    errors
}

fn resolve_step(
    step: &StepDefinition,
    location: &str,
    registry: &ComponentRegistry,
    errors: &mut Vec<RegistryError>,
) {
    let mut check = |namespace: NamespaceKind, name: &str, field: String| {
        errors.extend(registry.reference_error(namespace, name, &field));
    };

    match &step.kind {
        StepKind::Python(p) => {
            check(NamespaceKind::Callables, &p.action, format!("{location}.action"))
        }
        StepKind::Agent(a) => {
            check(NamespaceKind::Agents, &a.agent, format!("{location}.agent"));
            if let Some(builder) = &a.context_builder {
                let field = format!("{location}.context_builder");
                check(NamespaceKind::ContextBuilders, builder, field);
            }
        }
        StepKind::Generate(g) => {
            check(NamespaceKind::Generators, &g.generator, format!("{location}.generator"));
            if let Some(builder) = &g.context_builder {
                let field = format!("{location}.context_builder");
                check(NamespaceKind::ContextBuilders, builder, field);
            }
        }
        StepKind::Validate(v) => {
            for (i, stage) in v.stages.iter().enumerate() {
                check(NamespaceKind::Callables, stage, format!("{location}.stages[{i}]"));
            }
        }
        StepKind::Subworkflow(s) => {
            check(NamespaceKind::Workflows, &s.workflow, format!("{location}.workflow"))
        }
        StepKind::Branch(_) | StepKind::Parallel(_) => {}
    }
    if let Some(rollback) = &step.rollback {
        check(NamespaceKind::Callables, rollback, format!("{location}.rollback"));
    }

    for (child, child_location) in nested_with_locations(step, location) {
        resolve_step(child, &child_location, registry, errors);
    }
}

/// Nested steps paired with their document locations.
fn nested_with_locations<'a>(
    step: &'a StepDefinition,
    location: &str,
) -> Vec<(&'a StepDefinition, String)> {
    let mut nested = Vec::new();
    match &step.kind {
        StepKind::Validate(v) => {
            if let Some(fix) = &v.on_failure {
                nested.push((fix.as_ref(), format!("{location}.on_failure")));
            }
        }
        StepKind::Branch(b) => {
            for (i, option) in b.options.iter().enumerate() {
                nested.push((&option.step, format!("{location}.options[{i}].step")));
            }
        }
        StepKind::Parallel(p) => {
            for (i, child) in p.steps.iter().enumerate() {
                nested.push((child, format!("{location}.steps[{i}]")));
            }
        }
        StepKind::Python(_)
        | StepKind::Agent(_)
        | StepKind::Generate(_)
        | StepKind::Subworkflow(_) => {}
    }
    if let Some(fallback) = &step.on_error {
        nested.push((fallback.as_ref(), format!("{location}.on_error")));
    }
    nested
}

/// Every step name in `step`'s subtree, including its own.
fn collect_names(step: &StepDefinition, names: &mut BTreeSet<String>) {
    names.insert(step.name.clone());
    for child in step.nested_steps() {
        collect_names(child, names);
    }
}

const WORKFLOW_FIELDS: &[&str] = &["version", "name", "description", "inputs", "steps"];
const INPUT_FIELDS: &[&str] = &["type", "required", "default", "description"];
const STEP_FIELDS: &[&str] = &[
    "name",
    "type",
    "when",
    "retry_policy",
    "on_error",
    "skip_on_error",
    "rollback",
    "checkpoint",
];
const RETRY_FIELDS: &[&str] = &["max_attempts", "backoff"];
const OPTION_FIELDS: &[&str] = &["when", "step"];

/// Payload keys of each step `type`.
fn kind_fields(kind: &str) -> &'static [&'static str] {
    match kind {
        "python" => &["action", "args", "kwargs"],
        "agent" => &["agent", "context", "context_builder"],
        "generate" => &["generator", "context", "context_builder"],
        "validate" => &["stages", "retry", "on_failure"],
        "subworkflow" => &["workflow", "inputs"],
        "branch" => &["options"],
        "parallel" => &["steps"],
        _ => &[],
    }
}

/// Report keys of the undecoded document that the workflow model would
/// silently ignore, such as a misspelled decoration or a field belonging to
/// another step type.
pub fn check_unknown_fields(document: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(root) = document.as_object() else {
        return report;
    };
    unknown_keys(root, WORKFLOW_FIELDS, None, &mut report);

    if let Some(inputs) = root.get("inputs").and_then(Value::as_object) {
        for (name, input) in inputs {
            if let Some(input) = input.as_object() {
                let location = format!("inputs.{name}");
                unknown_keys(input, INPUT_FIELDS, Some(location.as_str()), &mut report);
            }
        }
    }
    if let Some(steps) = root.get("steps").and_then(Value::as_array) {
        for (i, step) in steps.iter().enumerate() {
            step_fields(step, &format!("steps[{i}]"), &mut report);
        }
    }
    report
}

fn unknown_keys(
    map: &Map<String, Value>,
    known: &[&str],
    location: Option<&str>,
    report: &mut ValidationReport,
) {
    for key in map.keys().filter(|k| !known.contains(&k.as_str())) {
        let field = match location {
            Some(location) => format!("{location}.{key}"),
            None => key.clone(),
        };
        report.push(field, format!("unknown field '{key}'"));
    }
}

fn step_fields(step: &Value, location: &str, report: &mut ValidationReport) {
    let Some(map) = step.as_object() else {
        return;
    };
    // an unknown `type` already fails decoding
    let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
    let payload = kind_fields(kind);
    for key in map.keys() {
        if !STEP_FIELDS.contains(&key.as_str()) && !payload.contains(&key.as_str()) {
            report.push(
                format!("{location}.{key}"),
                format!("unknown field '{key}' for step type '{kind}'"),
            );
        }
    }

    if let Some(policy) = map.get("retry_policy").and_then(Value::as_object) {
        let policy_location = format!("{location}.retry_policy");
        unknown_keys(policy, RETRY_FIELDS, Some(policy_location.as_str()), report);
    }
    if let Some(fallback) = map.get("on_error") {
        step_fields(fallback, &format!("{location}.on_error"), report);
    }
    match kind {
        "validate" => {
            if let Some(fix) = map.get("on_failure") {
                step_fields(fix, &format!("{location}.on_failure"), report);
            }
        }
        "branch" => {
            let options = map.get("options").and_then(Value::as_array).map(Vec::as_slice);
            for (i, option) in options.unwrap_or_default().iter().enumerate() {
                let option_location = format!("{location}.options[{i}]");
                if let Some(option) = option.as_object() {
                    unknown_keys(option, OPTION_FIELDS, Some(option_location.as_str()), report);
                    if let Some(child) = option.get("step") {
                        step_fields(child, &format!("{option_location}.step"), report);
                    }
                }
            }
        }
        "parallel" => {
            let steps = map.get("steps").and_then(Value::as_array).map(Vec::as_slice);
            for (i, child) in steps.unwrap_or_default().iter().enumerate() {
                step_fields(child, &format!("{location}.steps[{i}]"), report);
            }
        }
        _ => {}
    }
}

/// Step names must be unique across the whole step tree, since outputs are
/// addressed as `steps.<name>` regardless of nesting.
fn check_unique_names(steps: &[StepDefinition], report: &mut ValidationReport) {
    let mut seen: HashMap<&str, String> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        record_name(step, &format!("steps[{i}]"), &mut seen, report);
    }
}

fn record_name<'a>(
    step: &'a StepDefinition,
    location: &str,
    seen: &mut HashMap<&'a str, String>,
    report: &mut ValidationReport,
) {
    if !step.name.is_empty() {
        match seen.get(step.name.as_str()) {
            Some(first) => report.push(
                format!("{location}.name"),
                format!("duplicate step name '{}' (first used at {first})", step.name),
            ),
            None => {
                seen.insert(&step.name, location.to_string());
            }
        }
    }
    for (child, child_location) in nested_with_locations(step, location) {
        record_name(child, &child_location, seen, report);
    }
}

struct StepChecker<'a> {
    workflow: &'a WorkflowDefinition,
    report: &'a mut ValidationReport,
}

impl StepChecker<'_> {
    /// `available` holds step names whose outputs exist before this step runs.
    fn check_step(
        &mut self,
        step: &StepDefinition,
        location: &str,
        available: &BTreeSet<String>,
        top_level: bool,
    ) {
        if step.name.is_empty() {
            self.report.push(format!("{location}.name"), "step name must not be empty");
        }

        if let Some(when) = &step.when {
            self.check_expression(when, &format!("{location}.when"), available);
        }

        if let Some(policy) = &step.retry_policy {
            if policy.max_attempts == 0 {
                let field = format!("{location}.retry_policy.max_attempts");
                self.report.push(field, "must be at least 1");
            }
            if !policy.backoff.is_finite() || policy.backoff < 0.0 {
                self.report.push(
                    format!("{location}.retry_policy.backoff"),
                    "must be a non-negative number of seconds",
                );
            }
        }

        if step.checkpoint && !top_level {
            self.report.push(
                format!("{location}.checkpoint"),
                "checkpoints are only supported on top-level steps",
            );
        }

        match &step.kind {
            StepKind::Python(p) => {
                self.check_non_empty(&p.action, &format!("{location}.action"));
                for (i, arg) in p.args.iter().enumerate() {
                    self.check_value(arg, &format!("{location}.args[{i}]"), available);
                }
                for (key, value) in &p.kwargs {
                    self.check_value(value, &format!("{location}.kwargs.{key}"), available);
                }
            }
            StepKind::Agent(a) => {
                self.check_non_empty(&a.agent, &format!("{location}.agent"));
                for (key, value) in &a.context {
                    self.check_value(value, &format!("{location}.context.{key}"), available);
                }
            }
            StepKind::Generate(g) => {
                self.check_non_empty(&g.generator, &format!("{location}.generator"));
                for (key, value) in &g.context {
                    self.check_value(value, &format!("{location}.context.{key}"), available);
                }
            }
            StepKind::Validate(v) => {
                if v.stages.is_empty() {
                    let field = format!("{location}.stages");
                    self.report.push(field, "at least one stage is required");
                }
                for (i, stage) in v.stages.iter().enumerate() {
                    self.check_non_empty(stage, &format!("{location}.stages[{i}]"));
                }
            }
            StepKind::Subworkflow(s) => {
                self.check_non_empty(&s.workflow, &format!("{location}.workflow"));
                if s.workflow == self.workflow.name {
                    self.report.push(
                        format!("{location}.workflow"),
                        format!("workflow '{}' cannot invoke itself", s.workflow),
                    );
                }
                for (key, value) in &s.inputs {
                    self.check_value(value, &format!("{location}.inputs.{key}"), available);
                }
            }
            StepKind::Branch(b) => {
                if b.options.is_empty() {
                    let field = format!("{location}.options");
                    self.report.push(field, "at least one option is required");
                }
                for (i, option) in b.options.iter().enumerate() {
                    let field = format!("{location}.options[{i}].when");
                    self.check_expression(&option.when, &field, available);
                }
            }
            StepKind::Parallel(p) => {
                if p.steps.is_empty() {
                    self.report.push(format!("{location}.steps"), "at least one step is required");
                }
            }
        }

        for (child, child_location) in nested_with_locations(step, location) {
            self.check_step(child, &child_location, available, false);
        }
    }

    fn check_non_empty(&mut self, value: &str, location: &str) {
        if value.trim().is_empty() {
            self.report.push(location, "must not be empty");
        }
    }

    fn check_value(&mut self, value: &Value, location: &str, available: &BTreeSet<String>) {
        match value {
            Value::String(s) if expression::contains_expression(s) => {
                match expression::extract_expressions(s) {
                    Ok(found) => {
                        for expr in found {
                            self.check_expression(&expr, location, available);
                        }
                    }
                    Err(e) => self.report.push(location, e.to_string()),
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_value(item, &format!("{location}[{i}]"), available);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.check_value(item, &format!("{location}.{key}"), available);
                }
            }
            _ => {}
        }
    }

    fn check_expression(
        &mut self,
        expr: &Expression,
        location: &str,
        available: &BTreeSet<String>,
    ) {
        let name = expr.root_name();
        match expr.kind() {
            ExpressionKind::Input => {
                if !self.workflow.inputs.contains_key(name) {
                    self.report.push(
                        location,
                        format!("'{}' references undeclared input '{name}'", expr.raw()),
                    );
                }
            }
            ExpressionKind::StepOutput => {
                if !available.contains(name) {
                    self.report.push(
                        location,
                        format!(
                            "'{}' references step '{name}', which does not run before this point",
                            expr.raw()
                        ),
                    );
                }
            }
            // config values are supplied at run time
            ExpressionKind::Config => {}
        }
    }
}
