use serde_json::Value;
use task_protocol::{PayloadError, TaskBody};
use uuid::Uuid;

use super::publisher::{PublishError, TaskPublisher};
use crate::promise::Promise;

/// A task together with the correlation id its response will carry and the
/// promise that response settles.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub correlation_id: String,
    pub body: TaskBody,
    pub future: Promise,
}

impl TaskMessage {
    pub fn new(body: TaskBody) -> Self {
        Self::with_correlation_id(body, Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(body: TaskBody, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body,
            future: Promise::new(),
        }
    }

    /// A task asking a worker to create, and optionally run, a process.
    pub fn create_launch(
        process_class: impl Into<String>,
        args: Vec<Value>,
        kwargs: Value,
        play: bool,
    ) -> Result<Self, PayloadError> {
        TaskBody::launch(process_class, args, kwargs, play).map(Self::new)
    }

    /// A task asking a worker to pick a persisted process back up.
    pub fn create_continue(pid: impl Into<String>, tag: Option<String>, play: bool) -> Result<Self, PayloadError> {
        TaskBody::continue_process(pid, tag, play).map(Self::new)
    }

    pub async fn send(self, publisher: &TaskPublisher) -> Result<Promise, PublishError> {
        publisher.send(self).await
    }
}
