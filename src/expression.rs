//! `${{ ... }}` reference expressions.
//!
//! Expressions are deliberately small: a root (`inputs`, `steps` or
//! `config`), a dotted path with optional integer indexing, and an optional
//! leading `not`. There are no operators.
//!
//! ```
//! use maverick_workflow::{Expression, WorkflowContext};
//! use serde_json::json;
//!
//! let mut ctx = WorkflowContext::new();
//! ctx.set_input("target", json!("main"));
//!
//! let expr = Expression::parse("${{ inputs.target }}").unwrap();
//! assert_eq!(expr.evaluate(&ctx).unwrap(), json!("main"));
//! ```

use crate::context::WorkflowContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Raised when an expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid expression '{expression}': {message}")]
pub struct ExpressionSyntaxError {
    pub expression: String,
    pub message: String,
}

impl ExpressionSyntaxError {
    fn new(expression: &str, message: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

/// Raised when a well-formed expression cannot be resolved at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resolve '{path}': {message}")]
pub struct ExpressionEvaluationError {
    /// Full dotted path of the reference, e.g. `steps.load.output.count`.
    pub path: String,
    pub message: String,
}

/// Either kind of expression failure, for operations that parse and evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error(transparent)]
    Syntax(#[from] ExpressionSyntaxError),
    #[error(transparent)]
    Evaluation(#[from] ExpressionEvaluationError),
}

/// What an expression refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionKind {
    Input,
    StepOutput,
    Config,
}

impl ExpressionKind {
    fn root(self) -> &'static str {
        match self {
            ExpressionKind::Input => "inputs",
            ExpressionKind::StepOutput => "steps",
            ExpressionKind::Config => "config",
        }
    }
}

/// One segment of a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A parsed `${{ ... }}` reference.
///
/// For [`ExpressionKind::StepOutput`] the path starts with the step name
/// followed by `output`; for the other kinds it starts with the input or
/// config key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    raw: String,
    kind: ExpressionKind,
    path: Vec<PathSegment>,
    negated: bool,
}

impl Expression {
    /// Parse a complete `${{ ... }}` expression.
    pub fn parse(text: &str) -> Result<Self, ExpressionSyntaxError> {
        let trimmed = text.trim();
        let inner = trimmed
            .strip_prefix(OPEN)
            .and_then(|rest| rest.strip_suffix(CLOSE))
            .ok_or_else(|| ExpressionSyntaxError::new(text, "expected '${{ ... }}'"))?
            .trim();

        let (negated, body) = match inner.strip_prefix("not") {
            Some(rest) if rest.starts_with(char::is_whitespace) => (true, rest.trim_start()),
            _ => (false, inner),
        };

        if body.is_empty() {
            return Err(ExpressionSyntaxError::new(text, "empty reference"));
        }

        let mut segments = Vec::new();
        for part in body.split('.') {
            parse_segment(text, part, &mut segments)?;
        }

        let (root, path) = match segments.split_first() {
            Some((PathSegment::Field(root), rest)) => (root.clone(), rest.to_vec()),
            _ => return Err(ExpressionSyntaxError::new(text, "missing root")),
        };

        let kind = match root.as_str() {
            "inputs" => ExpressionKind::Input,
            "steps" => ExpressionKind::StepOutput,
            "config" => ExpressionKind::Config,
            other => {
                return Err(ExpressionSyntaxError::new(
                    text,
                    format!("unknown root '{other}' (expected inputs, steps or config)"),
                ))
            }
        };

        match path.first() {
            Some(PathSegment::Field(_)) => {}
            Some(PathSegment::Index(_)) => {
                return Err(ExpressionSyntaxError::new(
                    text,
                    format!("'{root}' must be followed by a name, not an index"),
                ))
            }
            None => {
                return Err(ExpressionSyntaxError::new(
                    text,
                    format!("'{root}' must be followed by a name"),
                ))
            }
        }

        if kind == ExpressionKind::StepOutput
            && path.get(1) != Some(&PathSegment::Field("output".to_string()))
        {
            return Err(ExpressionSyntaxError::new(
                text,
                "step references must have the form steps.<name>.output[.<field>...]",
            ));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            kind,
            path,
            negated,
        })
    }

    /// The source text, as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> ExpressionKind {
        self.kind
    }

    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Name of the referenced input, config key, or step.
    pub fn root_name(&self) -> &str {
        match self.path.first() {
            Some(PathSegment::Field(name)) => name,
            _ => "",
        }
    }

    /// Step name for step-output references.
    pub fn step_name(&self) -> Option<&str> {
        (self.kind == ExpressionKind::StepOutput).then(|| self.root_name())
    }

    /// Full dotted path, e.g. `steps.load.output.count`.
    pub fn dotted_path(&self) -> String {
        dotted(self.kind.root(), &self.path)
    }

    /// Resolve this reference against `ctx`.
    pub fn evaluate(&self, ctx: &WorkflowContext) -> Result<Value, ExpressionEvaluationError> {
        let name = self.root_name();
        let value = match self.kind {
            ExpressionKind::Input => match ctx.input(name) {
                // optional inputs without a default resolve to null
                None => Value::Null,
                Some(value) => walk(value, self.kind.root(), &self.path, 1)?,
            },
            ExpressionKind::Config => {
                let value = ctx.config_value(name).ok_or_else(|| ExpressionEvaluationError {
                    path: self.dotted_path(),
                    message: format!("config key '{name}' is not set"),
                })?;
                walk(value, self.kind.root(), &self.path, 1)?
            }
            ExpressionKind::StepOutput => {
                let output = ctx.step_output(name).ok_or_else(|| ExpressionEvaluationError {
                    path: self.dotted_path(),
                    message: format!("step '{name}' has no recorded output"),
                })?;
                walk(output, self.kind.root(), &self.path, 2)?
            }
        };

        if self.negated {
            Ok(Value::Bool(!is_truthy(&value)))
        } else {
            Ok(value)
        }
    }

    /// Evaluate and reduce to a boolean using [`is_truthy`].
    pub fn evaluate_bool(&self, ctx: &WorkflowContext) -> Result<bool, ExpressionEvaluationError> {
        self.evaluate(ctx).map(|v| is_truthy(&v))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Expression {
    type Error = ExpressionSyntaxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Expression::parse(&value)
    }
}

impl From<Expression> for String {
    fn from(expr: Expression) -> Self {
        expr.raw
    }
}

fn parse_segment(
    text: &str,
    part: &str,
    out: &mut Vec<PathSegment>,
) -> Result<(), ExpressionSyntaxError> {
    let part = part.trim();
    if part.is_empty() {
        return Err(ExpressionSyntaxError::new(text, "empty path segment"));
    }

    // `items[0][1]` style indexing
    let (head, mut rest) = match part.find('[') {
        Some(pos) => (&part[..pos], &part[pos..]),
        None => (part, ""),
    };

    if !head.is_empty() {
        if head.chars().all(|c| c.is_ascii_digit()) {
            let index = head
                .parse()
                .map_err(|_| ExpressionSyntaxError::new(text, format!("bad index '{head}'")))?;
            out.push(PathSegment::Index(index));
        } else if head
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            out.push(PathSegment::Field(head.to_string()));
        } else {
            return Err(ExpressionSyntaxError::new(
                text,
                format!("invalid path segment '{head}'"),
            ));
        }
    } else if rest.is_empty() {
        return Err(ExpressionSyntaxError::new(text, "empty path segment"));
    }

    while !rest.is_empty() {
        let close = rest
            .find(']')
            .ok_or_else(|| ExpressionSyntaxError::new(text, "unclosed '['"))?;
        let digits = &rest[1..close];
        let index = digits.trim().parse().map_err(|_| {
            ExpressionSyntaxError::new(text, format!("index '{digits}' is not an integer"))
        })?;
        out.push(PathSegment::Index(index));
        rest = &rest[close + 1..];
        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(ExpressionSyntaxError::new(
                text,
                format!("unexpected '{rest}' after index"),
            ));
        }
    }

    Ok(())
}

fn dotted(root: &str, path: &[PathSegment]) -> String {
    let mut out = root.to_string();
    for segment in path {
        out.push('.');
        out.push_str(&segment.to_string());
    }
    out
}

/// Walk `path[start..]` into `value`. Errors name the full path.
fn walk(
    value: &Value,
    root: &str,
    path: &[PathSegment],
    start: usize,
) -> Result<Value, ExpressionEvaluationError> {
    let mut current = value;
    for (i, segment) in path.iter().enumerate().skip(start) {
        let next = match segment {
            PathSegment::Field(name) => current.as_object().and_then(|map| map.get(name)),
            PathSegment::Index(index) => current.as_array().and_then(|items| items.get(*index)),
        };
        current = next.ok_or_else(|| ExpressionEvaluationError {
            path: dotted(root, path),
            message: format!("'{}' not found in {}", segment, dotted(root, &path[..i])),
        })?;
    }
    Ok(current.clone())
}

/// Truthiness used by `when`, `not` and branch conditions.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Find every embedded expression in `text`.
pub fn extract_expressions(text: &str) -> Result<Vec<Expression>, ExpressionSyntaxError> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| ExpressionSyntaxError::new(after, "unterminated expression"))?;
        found.push(Expression::parse(&after[..end + CLOSE.len()])?);
        rest = &after[end + CLOSE.len()..];
    }
    Ok(found)
}

/// Whether `text` contains at least one `${{` marker.
pub fn contains_expression(text: &str) -> bool {
    text.contains(OPEN)
}

/// Substitute every embedded expression in `text`.
///
/// A string that is exactly one expression resolves to the referenced value
/// with its JSON type intact. Otherwise strings are inserted verbatim and
/// other values as compact JSON.
pub fn evaluate_string(text: &str, ctx: &WorkflowContext) -> Result<Value, ExpressionError> {
    let trimmed = text.trim();
    if trimmed.starts_with(OPEN)
        && trimmed.ends_with(CLOSE)
        && trimmed[OPEN.len()..].find(OPEN).is_none()
    {
        let expr = Expression::parse(trimmed)?;
        return Ok(expr.evaluate(ctx)?);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| ExpressionSyntaxError::new(after, "unterminated expression"))?;
        let expr = Expression::parse(&after[..end + CLOSE.len()])?;
        match expr.evaluate(ctx)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}
