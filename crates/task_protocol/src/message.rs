use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

fn default_play() -> bool {
    true
}

/// The body of a task placed on the shared task queue.
///
/// The `kind` tag and the fields of each variant are the whole contract a
/// worker relies on: nothing else in the delivery is inspected.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskBody {
    /// Create a new process of `process_class` and optionally start it.
    Launch {
        process_class: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default = "default_play")]
        play: bool,
    },
    /// Pick up a previously persisted process by pid, optionally at a tagged checkpoint.
    Continue {
        pid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default = "default_play")]
        play: bool,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PayloadError {
    #[error("launch task is missing a process class")]
    MissingProcessClass,
    #[error("continue task is missing a pid")]
    MissingPid,
    #[error("checkpoint tag must not be empty")]
    EmptyTag,
    #[error("kwargs must be a mapping, got {0}")]
    KwargsNotMapping(String),
    #[error("malformed task payload: {0}")]
    Malformed(String),
}

impl TaskBody {
    /// Build a launch task. `kwargs` must be a JSON object (or null for none).
    pub fn launch(
        process_class: impl Into<String>,
        args: Vec<Value>,
        kwargs: Value,
        play: bool,
    ) -> Result<Self, PayloadError> {
        let kwargs = match kwargs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(PayloadError::KwargsNotMapping(type_name(&other).to_string())),
        };
        let body = TaskBody::Launch {
            process_class: process_class.into(),
            args,
            kwargs,
            play,
        };
        body.validate()?;
        Ok(body)
    }

    /// Build a continue task for a persisted process.
    pub fn continue_process(
        pid: impl Into<String>,
        tag: Option<String>,
        play: bool,
    ) -> Result<Self, PayloadError> {
        let body = TaskBody::Continue {
            pid: pid.into(),
            tag,
            play,
        };
        body.validate()?;
        Ok(body)
    }

    /// Structural checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            TaskBody::Launch { process_class, .. } => {
                if process_class.trim().is_empty() {
                    return Err(PayloadError::MissingProcessClass);
                }
            }
            TaskBody::Continue { pid, tag, .. } => {
                if pid.trim().is_empty() {
                    return Err(PayloadError::MissingPid);
                }
                if matches!(tag, Some(t) if t.trim().is_empty()) {
                    return Err(PayloadError::EmptyTag);
                }
            }
        }
        Ok(())
    }

    /// Decode and validate a task from its structural value.
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        let body: TaskBody =
            serde_json::from_value(value).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        body.validate()?;
        Ok(body)
    }

    pub fn to_value(&self) -> Value {
        // A TaskBody only holds strings, bools and JSON values, so this cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskBody::Launch { .. } => "launch",
            TaskBody::Continue { .. } => "continue",
        }
    }

    pub fn play(&self) -> bool {
        match self {
            TaskBody::Launch { play, .. } | TaskBody::Continue { play, .. } => *play,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Result,
    Exception,
}

/// A failure as it travels across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ExceptionDescription {
    pub kind: String,
    pub message: String,
}

impl ExceptionDescription {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Who answered a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HostInfo {
    pub hostname: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl HostInfo {
    pub fn current(worker: Option<String>) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname,
            pid: std::process::id(),
            worker,
            responded_at: Utc::now(),
        }
    }
}

/// The response a worker sends back to the reply destination of a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TaskResponse {
    pub outcome: Outcome,
    pub value: Value,
    pub responder_host: HostInfo,
}

impl TaskResponse {
    pub fn result(value: Value, host: HostInfo) -> Self {
        Self {
            outcome: Outcome::Result,
            value,
            responder_host: host,
        }
    }

    pub fn exception(exception: ExceptionDescription, host: HostInfo) -> Self {
        Self {
            outcome: Outcome::Exception,
            value: serde_json::to_value(&exception).unwrap_or(Value::Null),
            responder_host: host,
        }
    }

    /// Split the response into the remote value or the remote exception.
    pub fn into_result(self) -> Result<Value, ExceptionDescription> {
        match self.outcome {
            Outcome::Result => Ok(self.value),
            Outcome::Exception => Err(serde_json::from_value(self.value.clone()).unwrap_or_else(
                |_| ExceptionDescription::new("RemoteException", self.value.to_string()),
            )),
        }
    }
}
