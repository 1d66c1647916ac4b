//! Workflow definition and builder.

use crate::step::{StepBuilder, StepDefinition};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Schema version written by this crate.
pub const CURRENT_VERSION: &str = "1.0";

/// A workflow consisting of declared inputs and ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Schema version, `major.minor`
    #[serde(deserialize_with = "deserialize_version")]
    pub version: String,

    /// Workflow name
    pub name: String,

    /// Description of what this workflow does
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Declared inputs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDefinition>,

    /// Steps to execute
    pub steps: Vec<StepDefinition>,
}

/// Accept `version: 1.0` as well as `version: "1.0"`.
pub(crate) fn deserialize_version<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(text) => text,
        RawVersion::Number(number) => number.to_string(),
    })
}

/// Declared type of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Integer,
    Boolean,
    Float,
    Object,
    Array,
}

impl InputType {
    /// Whether `value` has this type. Integers are accepted as floats.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::Float => value.is_number(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
        }
    }

    /// Parse a command-line string into a value of this type.
    pub fn parse_str(self, raw: &str) -> Option<Value> {
        match self {
            InputType::String => Some(Value::String(raw.to_string())),
            InputType::Integer => raw.parse::<i64>().ok().map(Value::from),
            InputType::Float => raw.parse::<f64>().ok().map(Value::from),
            InputType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            InputType::Object | InputType::Array => serde_json::from_str::<Value>(raw)
                .ok()
                .filter(|v| self.accepts(v)),
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::String => "string",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::Float => "float",
            InputType::Object => "object",
            InputType::Array => "array",
        };
        f.write_str(name)
    }
}

/// One declared input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(rename = "type")]
    pub input_type: InputType,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl InputDefinition {
    pub fn new(input_type: InputType) -> Self {
        Self {
            input_type,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default<V: Into<Value>>(mut self, value: V) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

impl WorkflowDefinition {
    /// Create a new workflow with a name.
    pub fn builder(name: &str) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Major and minor version numbers, if `version` is well formed.
    pub fn version_parts(&self) -> Option<(u32, u32)> {
        parse_version(&self.version)
    }

    /// Look up a top-level step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Split a `major.minor` version string.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    if major.is_empty()
        || minor.is_empty()
        || !major.chars().all(|c| c.is_ascii_digit())
        || !minor.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Builder for creating workflows.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    workflow: WorkflowDefinition,
}

impl WorkflowBuilder {
    /// Create a new workflow builder.
    pub fn new(name: &str) -> Self {
        Self {
            workflow: WorkflowDefinition {
                version: CURRENT_VERSION.to_string(),
                name: name.to_string(),
                description: String::new(),
                inputs: BTreeMap::new(),
                steps: Vec::new(),
            },
        }
    }

    /// Set the workflow description.
    pub fn description(mut self, desc: &str) -> Self {
        self.workflow.description = desc.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.workflow.version = version.to_string();
        self
    }

    /// Declare an input.
    pub fn input(mut self, name: &str, input: InputDefinition) -> Self {
        self.workflow.inputs.insert(name.to_string(), input);
        self
    }

    /// Add a step to the workflow.
    pub fn add<S: Into<StepDefinition>>(mut self, step: S) -> Self {
        self.workflow.steps.push(step.into());
        self
    }

    /// Add a step builder (convenience).
    pub fn step(self, step: StepBuilder) -> Self {
        self.add(step.build())
    }

    /// Build the workflow.
    pub fn build(self) -> WorkflowDefinition {
        self.workflow
    }
}

impl From<WorkflowBuilder> for WorkflowDefinition {
    fn from(builder: WorkflowBuilder) -> Self {
        builder.build()
    }
}
