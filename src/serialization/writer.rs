//! Workflow document writer.

use super::WriteError;
use crate::workflow::WorkflowDefinition;
use std::path::Path;

/// Serialize a workflow as a YAML document.
pub fn to_yaml(workflow: &WorkflowDefinition) -> Result<String, WriteError> {
    Ok(serde_yaml::to_string(workflow)?)
}

/// Serialize a workflow as pretty-printed JSON.
pub fn to_json(workflow: &WorkflowDefinition) -> Result<String, WriteError> {
    Ok(serde_json::to_string_pretty(workflow)?)
}

/// Write a workflow to `path`, as JSON for `.json` files and YAML otherwise.
pub fn write_file(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), WriteError> {
    let path = path.as_ref();
    let text = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => to_json(workflow)?,
        _ => to_yaml(workflow)?,
    };
    std::fs::write(path, text).map_err(|source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use crate::serialization::parse_unresolved;
    use crate::step::StepDefinition;
    use crate::workflow::{InputDefinition, InputType};

    fn sample() -> WorkflowDefinition {
        WorkflowDefinition::builder("fly")
            .description("Implement, validate, review")
            .input("branch", InputDefinition::new(InputType::String).required())
            .input(
                "dry",
                InputDefinition::new(InputType::Boolean)
                    .with_default(false)
                    .describe("skip publishing"),
            )
            .add(
                StepDefinition::agent("implement", "implementer")
                    .context("branch", "${{ inputs.branch }}")
                    .retry(2, 0.5)
                    .rollback("reset_branch")
                    .checkpoint(),
            )
            .add(
                StepDefinition::validate("checks", ["format", "lint", "test"])
                    .fix_attempts(2)
                    .on_failure(StepDefinition::agent("fix", "fixer")),
            )
            .add(
                StepDefinition::parallel("reviews")
                    .step(
                        StepDefinition::agent("security", "reviewer")
                            .context("focus", "security"),
                    )
                    .step(
                        StepDefinition::generate("summary", "summarizer")
                            .context_builder("diff"),
                    )
                    .skip_on_error(),
            )
            .add(
                StepDefinition::branch("publish")
                    .option(
                        Expression::parse("${{ not inputs.dry }}").unwrap(),
                        StepDefinition::subworkflow("pr", "open-pr")
                            .input("branch", "${{ inputs.branch }}"),
                    )
                    .option(
                        Expression::parse("${{ inputs.dry }}").unwrap(),
                        StepDefinition::python("report", "echo").arg("dry run"),
                    )
                    .on_error(
                        StepDefinition::python("notify", "echo")
                            .kwarg("message", "publish failed"),
                    ),
            )
            .build()
    }

    #[test]
    fn test_yaml_round_trip() {
        let workflow = sample();
        let yaml = to_yaml(&workflow).unwrap();
        let parsed = parse_unresolved(&yaml).unwrap();
        assert_eq!(parsed, workflow);
    }

    #[test]
    fn test_json_round_trip() {
        let workflow = sample();
        let json = to_json(&workflow).unwrap();
        let parsed = parse_unresolved(&json).unwrap();
        assert_eq!(parsed, workflow);
    }

    #[test]
    fn test_yaml_omits_unset_decorations() {
        let workflow = WorkflowDefinition::builder("small")
            .add(StepDefinition::python("a", "echo"))
            .build();
        let yaml = to_yaml(&workflow).unwrap();
        assert!(yaml.contains("type: python"));
        assert!(!yaml.contains("retry_policy"));
        assert!(!yaml.contains("skip_on_error"));
        assert!(!yaml.contains("inputs"));
    }

    #[test]
    fn test_write_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = sample();

        let json_path = dir.path().join("fly.json");
        write_file(&workflow, &json_path).unwrap();
        assert!(std::fs::read_to_string(&json_path).unwrap().starts_with('{'));

        let yaml_path = dir.path().join("fly.yaml");
        write_file(&workflow, &yaml_path).unwrap();
        let parsed = parse_unresolved(&std::fs::read_to_string(&yaml_path).unwrap()).unwrap();
        assert_eq!(parsed, workflow);
    }
}
