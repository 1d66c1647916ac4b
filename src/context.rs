//! Run-time context for expression resolution.

use crate::expression::{self, ExpressionError};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Inputs, step outputs and config visible to `${{ }}` references.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    /// Workflow inputs after defaults are applied
    inputs: Map<String, Value>,

    /// Outputs of steps that have run, keyed by step name
    step_outputs: HashMap<String, Value>,

    /// Values exposed under `config.*`
    config: Map<String, Value>,
}

impl WorkflowContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from inputs and config values.
    pub fn with_inputs(inputs: Map<String, Value>, config: Map<String, Value>) -> Self {
        Self {
            inputs,
            step_outputs: HashMap::new(),
            config,
        }
    }

    pub fn set_input(&mut self, name: &str, value: Value) {
        self.inputs.insert(name.to_string(), value);
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn set_config(&mut self, key: &str, value: Value) {
        self.config.insert(key.to_string(), value);
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    /// Record a step's output.
    pub fn set_step_output(&mut self, step: &str, value: Value) {
        self.step_outputs.insert(step.to_string(), value);
    }

    pub fn step_output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }

    /// Resolve a value, substituting embedded expressions.
    ///
    /// Objects and arrays are walked recursively; only strings containing
    /// `${{` are evaluated.
    pub fn resolve(&self, value: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::Object(map) => {
                let mut result = Map::new();
                for (k, v) in map {
                    result.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(result))
            }
            Value::Array(arr) => {
                let resolved: Result<Vec<Value>, _> = arr.iter().map(|v| self.resolve(v)).collect();
                Ok(Value::Array(resolved?))
            }
            Value::String(s) if expression::contains_expression(s) => {
                expression::evaluate_string(s, self)
            }
            _ => Ok(value.clone()),
        }
    }

    /// Resolve every value of a keyword map.
    pub fn resolve_map(
        &self,
        map: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ExpressionError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }

    /// Snapshot as a JSON object with `inputs`, `steps` and `config` keys.
    pub fn as_json(&self) -> Value {
        let steps: Map<String, Value> = self
            .step_outputs
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!({ "output": v })))
            .collect();

        serde_json::json!({
            "inputs": self.inputs,
            "steps": steps,
            "config": self.config,
        })
    }
}
