//! Text renderings of a workflow's step graph.

use crate::step::{StepDefinition, StepKind};
use crate::workflow::WorkflowDefinition;
use std::fmt::Write;

/// Output format for [`render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VizFormat {
    Ascii,
    Mermaid,
}

pub fn render(workflow: &WorkflowDefinition, format: VizFormat) -> String {
    match format {
        VizFormat::Ascii => ascii(workflow),
        VizFormat::Mermaid => mermaid(workflow),
    }
}

fn summary(step: &StepDefinition) -> String {
    match &step.kind {
        StepKind::Python(p) => format!("python: {}", p.action),
        StepKind::Agent(a) => format!("agent: {}", a.agent),
        StepKind::Generate(g) => format!("generate: {}", g.generator),
        StepKind::Validate(v) => format!("validate: {}", v.stages.join(", ")),
        StepKind::Subworkflow(s) => format!("subworkflow: {}", s.workflow),
        StepKind::Branch(_) => "branch".to_string(),
        StepKind::Parallel(_) => "parallel".to_string(),
    }
}

fn decorations(step: &StepDefinition) -> String {
    let mut parts = Vec::new();
    if let Some(when) = &step.when {
        parts.push(format!("when {when}"));
    }
    if let Some(retry) = &step.retry_policy {
        parts.push(format!("retry x{}", retry.max_attempts));
    }
    if step.skip_on_error {
        parts.push("skip on error".to_string());
    }
    if let Some(rollback) = &step.rollback {
        parts.push(format!("rollback {rollback}"));
    }
    if step.checkpoint {
        parts.push("checkpoint".to_string());
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join("; "))
    }
}

fn ascii(workflow: &WorkflowDefinition) -> String {
    let mut out = format!("{} v{}\n", workflow.name, workflow.version);
    let count = workflow.steps.len();
    for (i, step) in workflow.steps.iter().enumerate() {
        ascii_step(&mut out, step, "", i + 1 == count, None);
    }
    out
}

fn ascii_step(
    out: &mut String,
    step: &StepDefinition,
    prefix: &str,
    last: bool,
    label: Option<&str>,
) {
    let branch = if last { "└── " } else { "├── " };
    let label = label.map(|l| format!("{l} ")).unwrap_or_default();
    let _ = writeln!(
        out,
        "{prefix}{branch}{label}{} [{}]{}",
        step.name,
        summary(step),
        decorations(step)
    );

    let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
    let mut children: Vec<(Option<String>, &StepDefinition)> = Vec::new();
    match &step.kind {
        StepKind::Validate(v) => {
            let fix = v.on_failure.as_deref();
            children.extend(fix.map(|fix| (Some(format!("fix x{}:", v.retry)), fix)));
        }
        StepKind::Branch(b) => {
            children.extend(b.options.iter().map(|o| (Some(format!("{} ->", o.when)), &o.step)));
        }
        StepKind::Parallel(p) => children.extend(p.steps.iter().map(|s| (None, s))),
        StepKind::Python(_)
        | StepKind::Agent(_)
        | StepKind::Generate(_)
        | StepKind::Subworkflow(_) => {}
    }
    children.extend(step.on_error.as_deref().map(|f| (Some("on error:".to_string()), f)));

    let count = children.len();
    for (i, (label, child)) in children.into_iter().enumerate() {
        ascii_step(out, child, &child_prefix, i + 1 == count, label.as_deref());
    }
}

fn mermaid(workflow: &WorkflowDefinition) -> String {
    let mut graph = Mermaid::default();
    let _ = writeln!(graph.out, "flowchart TD");
    let start = graph.node(&format!("([\"{}\"])", escape(&workflow.name)));

    let mut exits = vec![start];
    for step in &workflow.steps {
        let (entry, next) = graph.step(step);
        for exit in &exits {
            graph.edge(exit, &entry, None, false);
        }
        exits = next;
    }
    let end = graph.node("((\"end\"))");
    for exit in &exits {
        graph.edge(exit, &end, None, false);
    }
    graph.out
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
}

#[derive(Default)]
struct Mermaid {
    out: String,
    next_id: usize,
}

impl Mermaid {
    /// Declare a node with the given shape and return its id.
    fn node(&mut self, shape: &str) -> String {
        let id = format!("n{}", self.next_id);
        self.next_id += 1;
        let _ = writeln!(self.out, "    {id}{shape}");
        id
    }

    fn edge(&mut self, from: &str, to: &str, label: Option<&str>, dotted: bool) {
        let arrow = if dotted { "-.->" } else { "-->" };
        match label {
            Some(label) => {
                let _ = writeln!(self.out, "    {from} {arrow}|\"{}\"| {to}", escape(label));
            }
            None => {
                let _ = writeln!(self.out, "    {from} {arrow} {to}");
            }
        }
    }

    /// Render a step and return its entry node and exit nodes.
    fn step(&mut self, step: &StepDefinition) -> (String, Vec<String>) {
        let label = format!("{}<br/>{}{}", step.name, summary(step), decorations(step));
        let (entry, mut exits) = match &step.kind {
            StepKind::Branch(b) => {
                let id = self.node(&format!("{{\"{}\"}}", escape(&label)));
                let mut exits = Vec::new();
                for option in &b.options {
                    let (child, child_exits) = self.step(&option.step);
                    self.edge(&id, &child, Some(&option.when.to_string()), false);
                    exits.extend(child_exits);
                }
                (id, exits)
            }
            StepKind::Parallel(p) => {
                let id = self.node(&format!("[/\"{}\"/]", escape(&label)));
                let mut exits = Vec::new();
                for child in &p.steps {
                    let (entry, child_exits) = self.step(child);
                    self.edge(&id, &entry, None, false);
                    exits.extend(child_exits);
                }
                (id, exits)
            }
            StepKind::Validate(v) => {
                let id = self.node(&format!("[\"{}\"]", escape(&label)));
                if let Some(fix) = v.on_failure.as_deref() {
                    let (fix_entry, fix_exits) = self.step(fix);
                    self.edge(&id, &fix_entry, Some("fail"), true);
                    for exit in &fix_exits {
                        self.edge(exit, &id, Some("re-validate"), true);
                    }
                }
                (id.clone(), vec![id])
            }
            StepKind::Python(_)
            | StepKind::Agent(_)
            | StepKind::Generate(_)
            | StepKind::Subworkflow(_) => {
                let id = self.node(&format!("[\"{}\"]", escape(&label)));
                (id.clone(), vec![id])
            }
        };

        if let Some(fallback) = step.on_error.as_deref() {
            let (fallback_entry, fallback_exits) = self.step(fallback);
            self.edge(&entry, &fallback_entry, Some("error"), true);
            exits.extend(fallback_exits);
        }
        (entry, exits)
    }
}
