//! Workflow documents.
//!
//! Documents are YAML (JSON is accepted too) shaped like:
//!
//! ```yaml
//! version: "1.0"
//! name: fly
//! inputs:
//!   branch: { type: string, required: true }
//! steps:
//!   - name: implement
//!     type: agent
//!     agent: implementer
//!     context:
//!       branch: ${{ inputs.branch }}
//!   - name: checks
//!     type: validate
//!     stages: [format, lint, test]
//!     retry: 3
//!     on_failure: { name: fix, type: agent, agent: fixer }
//! ```

mod parser;
mod validation;
mod writer;

pub use parser::{decode, parse_unresolved, WorkflowParser};
pub use validation::{
    check_unknown_fields, is_valid_workflow_name, resolve_references, validate_definition,
    version_supported, ValidationIssue, ValidationReport, SUPPORTED_MAJOR_VERSIONS,
};
pub use writer::{to_json, to_yaml, write_file};

use crate::registry::RegistryError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading a workflow document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to decode workflow document: {0}")]
    Decode(String),

    #[error("unsupported workflow schema version '{found}' (supported: {supported})")]
    UnsupportedVersion { found: String, supported: String },

    #[error("invalid workflow:\n{0}")]
    Invalid(ValidationReport),

    #[error("unresolved references:\n{}", join_lines(.0))]
    ReferenceResolution(Vec<RegistryError>),

    #[error("failed to read workflow file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while writing a workflow document.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to encode workflow as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to encode workflow as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write workflow file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn join_lines(errors: &[RegistryError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn supported_versions() -> String {
    let (start, end) = (
        *SUPPORTED_MAJOR_VERSIONS.start(),
        *SUPPORTED_MAJOR_VERSIONS.end(),
    );
    if start == end {
        format!("{start}.x")
    } else {
        format!("{start}.x-{end}.x")
    }
}
