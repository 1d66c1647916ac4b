//! Workflow document parser.

use super::validation::{
    check_unknown_fields, resolve_references, validate_definition, version_supported,
    ValidationReport,
};
use super::{supported_versions, ParseError};
use crate::registry::{ComponentRegistry, RegistryErrorKind};
use crate::workflow::WorkflowDefinition;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Decode a YAML or JSON document without validating it.
pub fn decode(text: &str) -> Result<WorkflowDefinition, ParseError> {
    decode_as(text)
}

fn decode_as<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| ParseError::Decode(e.to_string()))
    } else {
        serde_yaml::from_str(text).map_err(|e| ParseError::Decode(e.to_string()))
    }
}

/// The typed workflow plus checks that need the undecoded tree.
fn decode_checked(text: &str) -> Result<(WorkflowDefinition, ValidationReport), ParseError> {
    let workflow = decode(text)?;
    let document: Value = decode_as(text)?;
    Ok((workflow, check_unknown_fields(&document)))
}

/// Decode and validate a document without resolving component names.
pub fn parse_unresolved(text: &str) -> Result<WorkflowDefinition, ParseError> {
    let (workflow, mut report) = decode_checked(text)?;
    check_version(&workflow)?;

    report.extend(validate_definition(&workflow));
    if !report.is_valid() {
        return Err(ParseError::Invalid(report));
    }
    Ok(workflow)
}

fn check_version(workflow: &WorkflowDefinition) -> Result<(), ParseError> {
    match version_supported(&workflow.version) {
        Some(false) => Err(ParseError::UnsupportedVersion {
            found: workflow.version.clone(),
            supported: supported_versions(),
        }),
        // malformed versions are reported by validation
        Some(true) | None => Ok(()),
    }
}

/// Parses workflow documents against a component registry.
///
/// # Example
///
/// ```rust
/// use maverick_workflow::{action_fn, ComponentRegistry, WorkflowParser};
///
/// let mut registry = ComponentRegistry::new();
/// registry
///     .register_callable("load", action_fn(|_| async { Ok(serde_json::json!([1, 2])) }))
///     .unwrap();
///
/// let yaml = r#"
/// version: "1.0"
/// name: my-workflow
/// steps:
///   - name: load
///     type: python
///     action: load
/// "#;
///
/// let workflow = WorkflowParser::new(&registry).parse(yaml).unwrap();
/// assert_eq!(workflow.name, "my-workflow");
/// assert_eq!(workflow.steps.len(), 1);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WorkflowParser<'a> {
    registry: &'a ComponentRegistry,
}

impl<'a> WorkflowParser<'a> {
    pub fn new(registry: &'a ComponentRegistry) -> Self {
        Self { registry }
    }

    /// Parse a document into an executable workflow, stopping at the first
    /// failing phase.
    pub fn parse(&self, text: &str) -> Result<Arc<WorkflowDefinition>, ParseError> {
        let workflow = parse_unresolved(text)?;

        let (deferred, unresolved): (Vec<_>, Vec<_>) = resolve_references(&workflow, self.registry)
            .into_iter()
            .partition(|e| e.kind == RegistryErrorKind::Deferred);
        if !unresolved.is_empty() {
            return Err(ParseError::ReferenceResolution(unresolved));
        }
        for error in &deferred {
            tracing::warn!(workflow = %workflow.name, %error, "unresolved reference deferred");
        }

        tracing::debug!(workflow = %workflow.name, steps = workflow.steps.len(), "parsed workflow");
        Ok(Arc::new(workflow))
    }

    /// Load and parse a workflow file.
    pub fn parse_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<WorkflowDefinition>, ParseError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(&text)
    }

    /// Run every check and collect all issues.
    ///
    /// Only a document that cannot be decoded at all is an error; everything
    /// else ends up in the report. References a lenient registry defers are
    /// reported as warnings.
    pub fn validate_only(&self, text: &str) -> Result<ValidationReport, ParseError> {
        let (workflow, unknown) = decode_checked(text)?;
        let mut report = ValidationReport::default();

        if version_supported(&workflow.version) == Some(false) {
            report.push(
                "version",
                format!(
                    "unsupported schema version '{}' (supported: {})",
                    workflow.version,
                    supported_versions()
                ),
            );
        }
        report.extend(unknown);
        report.extend(validate_definition(&workflow));

        for error in resolve_references(&workflow, self.registry) {
            let location = error.location.clone().unwrap_or_else(|| "steps".to_string());
            if error.kind == RegistryErrorKind::Deferred {
                report.warn(location, error.to_string());
            } else {
                report.push(location, error.to_string());
            }
        }

        Ok(report)
    }
}
