use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of a process.
///
/// ```text
/// CREATED -> RUNNING <-> WAITING
///               |           |
///               v           v
///        FINISHED | FAILED  (abort)
///               \     |     /
///                 STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Waiting,
    Finished,
    Failed,
    Stopped,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped)
    }

    /// States in which outputs may still be emitted.
    pub fn accepts_outputs(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Waiting)
    }
}

/// How a stopped process came to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Termination {
    Finished,
    Aborted,
    Failed,
}

/// Lifecycle hooks a process class may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Hook {
    #[strum(serialize = "on_start")]
    Start,
    #[strum(serialize = "on_run")]
    Run,
    #[strum(serialize = "on_fail")]
    Fail,
    #[strum(serialize = "on_finish")]
    Finish,
    #[strum(serialize = "on_stop")]
    Stop,
}

/// The signal that woke a waiting process, handed to the next run step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Resume {
    pub tag: String,
    pub signal: Value,
}

/// Where execution picks up next. Persisted so a restored process neither
/// repeats nor skips a run step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Continuation {
    /// Enter RUNNING: the `on_run` hook is due, then the run step.
    Enter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<Resume>,
    },
    /// Invoke the run step, optionally with the signal that resumed it.
    Step {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<Resume>,
    },
    /// Suspended until the awaited event named `tag` settles.
    Await { tag: String },
    /// The run step returned; only the terminal transitions remain.
    Complete,
}

impl Default for Continuation {
    fn default() -> Self {
        Continuation::Enter { resume: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(ProcessState::Waiting.to_string(), "waiting");
        assert_eq!("stopped".parse::<ProcessState>().unwrap(), ProcessState::Stopped);
        assert_eq!(serde_json::to_value(Termination::Aborted).unwrap(), json!("aborted"));
        assert_eq!(Hook::Finish.to_string(), "on_finish");
    }

    #[test]
    fn continuation_serializes_with_kind_tag() {
        let cont = Continuation::Step {
            resume: Some(Resume {
                tag: "s2".into(),
                signal: json!(null),
            }),
        };
        let value = serde_json::to_value(&cont).unwrap();
        assert_eq!(value, json!({"kind": "step", "resume": {"tag": "s2", "signal": null}}));
        assert_eq!(
            serde_json::to_value(Continuation::default()).unwrap(),
            json!({"kind": "enter"})
        );
        let back: Continuation = serde_json::from_value(json!({"kind": "await", "tag": "x"})).unwrap();
        assert_eq!(back, Continuation::Await { tag: "x".into() });
    }

    #[test]
    fn only_stopped_is_terminal() {
        assert!(ProcessState::Stopped.is_terminal());
        assert!(!ProcessState::Finished.is_terminal());
        assert!(ProcessState::Waiting.accepts_outputs());
        assert!(!ProcessState::Created.accepts_outputs());
    }
}
