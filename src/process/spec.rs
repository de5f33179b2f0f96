//! Per-class description of accepted inputs and permissible outputs.
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub type ValueMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    Any,
    Null,
    Bool,
    Number,
    Integer,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Null => value.is_null(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::String => value.is_string(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required input `{0}`")]
    MissingInput(String),
    #[error("unexpected input `{0}`: the process does not accept dynamic inputs")]
    UnexpectedInput(String),
    #[error("input `{name}` expects {expected}, got {found}")]
    InvalidInputType { name: String, expected: ValueType, found: String },
    #[error("output `{0}` is not declared and the process does not accept dynamic outputs")]
    UndeclaredOutput(String),
    #[error("output `{name}` expects {expected}, got {found}")]
    InvalidOutputType { name: String, expected: ValueType, found: String },
    #[error("output `{0}` was already emitted")]
    DuplicateOutput(String),
    #[error("cannot emit `{name}` while the process is {state}")]
    OutputsFrozen { name: String, state: String },
    #[error("{given} positional arguments given but only {declared} inputs are declared")]
    TooManyArguments { given: usize, declared: usize },
    #[error("input `{0}` given both positionally and by keyword")]
    ConflictingArgument(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputPort {
    pub name: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub valid_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl InputPort {
    /// A required input accepting any value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            valid_type: ValueType::Any,
            help: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// A default makes the input optional.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }

    pub fn valid_type(mut self, valid_type: ValueType) -> Self {
        self.valid_type = valid_type;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputPort {
    pub name: String,
    pub valid_type: ValueType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessSpec {
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    dynamic_inputs: bool,
    dynamic_outputs: bool,
    description: String,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn has_dynamic_inputs(&self) -> bool {
        self.dynamic_inputs
    }

    pub fn has_dynamic_outputs(&self) -> bool {
        self.dynamic_outputs
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Check raw inputs against the declared ports, filling in defaults.
    pub fn validate_inputs(&self, raw: ValueMap) -> Result<ValueMap, ValidationError> {
        if !self.dynamic_inputs {
            if let Some(name) = raw.keys().find(|k| self.input(k).is_none()) {
                return Err(ValidationError::UnexpectedInput(name.clone()));
            }
        }

        let mut validated = raw;
        for port in &self.inputs {
            match validated.get(&port.name) {
                Some(value) => {
                    if !port.valid_type.accepts(value) {
                        return Err(ValidationError::InvalidInputType {
                            name: port.name.clone(),
                            expected: port.valid_type,
                            found: describe(value).to_string(),
                        });
                    }
                }
                None => match &port.default {
                    Some(default) => {
                        validated.insert(port.name.clone(), default.clone());
                    }
                    None if port.required => {
                        return Err(ValidationError::MissingInput(port.name.clone()));
                    }
                    None => {}
                },
            }
        }
        Ok(validated)
    }

    /// Check a single output emission against the declared outputs.
    pub fn validate_output(&self, name: &str, value: &Value) -> Result<(), ValidationError> {
        match self.output(name) {
            Some(port) if !port.valid_type.accepts(value) => Err(ValidationError::InvalidOutputType {
                name: name.to_string(),
                expected: port.valid_type,
                found: describe(value).to_string(),
            }),
            Some(_) => Ok(()),
            None if self.dynamic_outputs => Ok(()),
            None => Err(ValidationError::UndeclaredOutput(name.to_string())),
        }
    }

    /// Map positional launch arguments onto the declared inputs, in declaration
    /// order, and merge the keyword arguments.
    pub fn bind_arguments(&self, args: Vec<Value>, kwargs: ValueMap) -> Result<ValueMap, ValidationError> {
        if args.len() > self.inputs.len() {
            return Err(ValidationError::TooManyArguments {
                given: args.len(),
                declared: self.inputs.len(),
            });
        }
        let mut bound = ValueMap::new();
        for (port, value) in self.inputs.iter().zip(args) {
            bound.insert(port.name.clone(), value);
        }
        for (name, value) in kwargs {
            if bound.contains_key(&name) {
                return Err(ValidationError::ConflictingArgument(name));
            }
            bound.insert(name, value);
        }
        Ok(bound)
    }
}

#[derive(Debug, Default)]
pub struct ProcessSpecBuilder {
    spec: ProcessSpec,
}

impl ProcessSpecBuilder {
    pub fn input(self, name: impl Into<String>) -> Self {
        self.input_port(InputPort::new(name))
    }

    pub fn input_port(mut self, port: InputPort) -> Self {
        self.spec.inputs.retain(|p| p.name != port.name);
        self.spec.inputs.push(port);
        self
    }

    pub fn dynamic_input(mut self) -> Self {
        self.spec.dynamic_inputs = true;
        self
    }

    pub fn output(self, name: impl Into<String>) -> Self {
        self.output_port(name, ValueType::Any)
    }

    pub fn output_port(mut self, name: impl Into<String>, valid_type: ValueType) -> Self {
        let name = name.into();
        self.spec.outputs.retain(|p| p.name != name);
        self.spec.outputs.push(OutputPort { name, valid_type });
        self
    }

    pub fn dynamic_output(mut self) -> Self {
        self.spec.dynamic_outputs = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    pub fn build(self) -> Arc<ProcessSpec> {
        Arc::new(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> ValueMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_fill_missing_optional_inputs() {
        let spec = ProcessSpec::builder()
            .input_port(InputPort::new("input").with_default(json!(5)))
            .build();
        assert_eq!(spec.validate_inputs(map(json!({"input": 2}))).unwrap()["input"], json!(2));
        assert_eq!(spec.validate_inputs(ValueMap::new()).unwrap()["input"], json!(5));
    }

    #[test]
    fn dynamic_inputs_must_be_declared() {
        let closed = ProcessSpec::builder().build();
        assert_eq!(
            closed.validate_inputs(map(json!({"a": 5}))),
            Err(ValidationError::UnexpectedInput("a".into()))
        );
        let open = ProcessSpec::builder().dynamic_input().build();
        assert!(open.validate_inputs(map(json!({"a": 5}))).is_ok());
    }

    #[test]
    fn required_and_typed_inputs() {
        let spec = ProcessSpec::builder()
            .input_port(InputPort::new("forget_on").valid_type(ValueType::String))
            .build();
        assert_eq!(
            spec.validate_inputs(ValueMap::new()),
            Err(ValidationError::MissingInput("forget_on".into()))
        );
        assert!(matches!(
            spec.validate_inputs(map(json!({"forget_on": 3}))),
            Err(ValidationError::InvalidInputType { .. })
        ));
    }

    #[test]
    fn outputs_must_be_declared_unless_dynamic() {
        let spec = ProcessSpec::builder().output_port("default", ValueType::Integer).build();
        assert!(spec.validate_output("default", &json!(5)).is_ok());
        assert!(matches!(
            spec.validate_output("default", &json!("five")),
            Err(ValidationError::InvalidOutputType { .. })
        ));
        assert_eq!(
            spec.validate_output("other", &json!(1)),
            Err(ValidationError::UndeclaredOutput("other".into()))
        );
        let dynamic = ProcessSpec::builder().dynamic_output().build();
        assert!(dynamic.validate_output("anything", &json!(1)).is_ok());
    }

    #[test]
    fn positional_arguments_follow_declaration_order() {
        let spec = ProcessSpec::builder().input("a").input("b").build();
        let bound = spec.bind_arguments(vec![json!(1)], map(json!({"b": 2}))).unwrap();
        assert_eq!(bound, map(json!({"a": 1, "b": 2})));
        assert_eq!(
            spec.bind_arguments(vec![json!(1)], map(json!({"a": 2}))),
            Err(ValidationError::ConflictingArgument("a".into()))
        );
        assert!(matches!(
            spec.bind_arguments(vec![json!(1), json!(2), json!(3)], ValueMap::new()),
            Err(ValidationError::TooManyArguments { given: 3, declared: 2 })
        ));
    }
}
