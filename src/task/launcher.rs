use async_trait::async_trait;
use serde_json::{Value, json};
use task_protocol::TaskBody;
use tracing::{debug, info};

use super::subscriber::{Received, TaskReceiver};
use crate::process::{ProcessError, ProcessHost, ProcessState};
use crate::promise::TaskError;

/// Task receiver that launches and continues processes on a [`ProcessHost`].
///
/// Launch tasks for classes the host does not know, and continue tasks for
/// pids it has no checkpoint of, are declined so another worker can take them.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    host: ProcessHost,
}

impl ProcessLauncher {
    pub fn new(host: ProcessHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &ProcessHost {
        &self.host
    }

    fn launch(&self, class: &str, args: &[Value], kwargs: &serde_json::Map<String, Value>, play: bool) -> Received {
        if !self.host.registry().contains(class) {
            debug!(class, "declining launch of an unknown class");
            return Received::Declined;
        }
        let process = match self.host.create_from_args(class, args.to_vec(), kwargs.clone()) {
            Ok(process) => process,
            Err(err) => return Received::failed(TaskError::from(&err)),
        };
        let pid = process.pid().to_string();
        if play {
            info!(pid = %pid, class, "launching process for task");
            return Received::pending(self.host.launch(process));
        }
        match self.host.persist(&process) {
            Ok(()) => {
                info!(pid = %pid, class, "created process without playing it");
                Received::value(json!({ "pid": pid }))
            }
            Err(err) => Received::failed(TaskError::from(&err)),
        }
    }

    fn continue_process(&self, pid: &str, tag: Option<&str>, play: bool) -> Received {
        if !play {
            return self.peek(pid, tag);
        }
        match self.host.continue_process(pid, tag) {
            Ok(Some(completion)) => {
                info!(pid, tag, "continuing process for task");
                Received::pending(completion)
            }
            Ok(None) => {
                debug!(pid, "declining continue of an unknown pid");
                Received::Declined
            }
            Err(err) => Received::failed(TaskError::from(&err)),
        }
    }

    /// Report on a process without running it.
    fn peek(&self, pid: &str, tag: Option<&str>) -> Received {
        if tag.is_none() && self.host.is_live(pid) {
            return Received::value(json!({ "pid": pid, "state": ProcessState::Running }));
        }
        match self.host.load(pid, tag) {
            Ok(Some(process)) => Received::value(json!({ "pid": pid, "state": process.state() })),
            Ok(None) => Received::Declined,
            Err(ProcessError::UnknownClass(class)) => {
                debug!(pid, class = %class, "declining continue of a process whose class is unknown here");
                Received::Declined
            }
            Err(err) => Received::failed(TaskError::from(&err)),
        }
    }
}

#[async_trait]
impl TaskReceiver for ProcessLauncher {
    async fn on_task_received(&self, task: &TaskBody) -> Received {
        match task {
            TaskBody::Launch {
                process_class,
                args,
                kwargs,
                play,
            } => self.launch(process_class, args, kwargs, *play),
            TaskBody::Continue { pid, tag, play } => self.continue_process(pid, tag.as_deref(), *play),
        }
    }

    fn name(&self) -> &str {
        "process-launcher"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use crate::task::subscriber::TaskOutcome;

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(ProcessHost::new(ProcessRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn unknown_class_and_pid_are_declined() {
        let l = launcher();
        let launch = TaskBody::launch("nope", vec![], Value::Null, true).unwrap();
        assert!(matches!(l.on_task_received(&launch).await, Received::Declined));
        let cont = TaskBody::continue_process("missing", None, true).unwrap();
        assert!(matches!(l.on_task_received(&cont).await, Received::Declined));
    }

    #[tokio::test]
    async fn invalid_inputs_fail_the_task() {
        let l = launcher();
        let task = TaskBody::launch("dummy", vec![], json!({"a": 1}), true).unwrap();
        match l.on_task_received(&task).await {
            Received::Accepted(TaskOutcome::Failed(err)) => assert_eq!(err.kind(), "ValidationError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_without_play_persists_the_process() {
        let l = launcher();
        let task = TaskBody::launch("dummy_with_output", vec![], Value::Null, false).unwrap();
        let pid = match l.on_task_received(&task).await {
            Received::Accepted(TaskOutcome::Value(v)) => v["pid"].as_str().unwrap().to_string(),
            other => panic!("unexpected {other:?}"),
        };
        let peek = TaskBody::continue_process(pid.clone(), None, false).unwrap();
        match l.on_task_received(&peek).await {
            Received::Accepted(TaskOutcome::Value(v)) => assert_eq!(v["state"], json!("created")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
