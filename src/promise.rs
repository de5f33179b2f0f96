//! Single-assignment result cells.
//!
//! A [`Promise`] is settled exactly once: with a value, with a [`TaskError`], or
//! by cancellation. It is used both for a process waiting on an external event
//! and for the remote result of a task sent through the queue. Continuations
//! registered with [`Promise::add_done_callback`] run exactly once, synchronously
//! if the promise has already settled. Async callers can [`Promise::wait`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use task_protocol::ExceptionDescription;
use thiserror::Error;
use tokio::sync::watch;

/// What a failed promise carries. Local and remote execution failures share the
/// `Failed` shape so callers handle both the same way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
    #[error("message could not be delivered: {0}")]
    DeliveryFailed(String),
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            TaskError::Failed { kind, .. } => kind,
            TaskError::DeliveryFailed(_) => "DeliveryFailed",
            TaskError::Cancelled => "Cancelled",
        }
    }
}

impl From<ExceptionDescription> for TaskError {
    fn from(desc: ExceptionDescription) -> Self {
        match desc.kind.as_str() {
            "Cancelled" => TaskError::Cancelled,
            "DeliveryFailed" => TaskError::DeliveryFailed(desc.message),
            _ => TaskError::Failed {
                kind: desc.kind,
                message: desc.message,
            },
        }
    }
}

impl From<&TaskError> for ExceptionDescription {
    fn from(err: &TaskError) -> Self {
        match err {
            TaskError::Failed { kind, message } => ExceptionDescription::new(kind.clone(), message.clone()),
            TaskError::DeliveryFailed(reason) => ExceptionDescription::new("DeliveryFailed", reason.clone()),
            TaskError::Cancelled => ExceptionDescription::new("Cancelled", "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PromiseError {
    #[error("promise was already settled ({0})")]
    AlreadySettled(&'static str),
}

/// Terminal disposition of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Value(Value),
    Failed(TaskError),
    Cancelled,
}

impl Settled {
    fn label(&self) -> &'static str {
        match self {
            Settled::Value(_) => "value",
            Settled::Failed(_) => "exception",
            Settled::Cancelled => "cancelled",
        }
    }

    pub fn into_result(self) -> Result<Value, TaskError> {
        match self {
            Settled::Value(v) => Ok(v),
            Settled::Failed(e) => Err(e),
            Settled::Cancelled => Err(TaskError::Cancelled),
        }
    }
}

type Callback = Box<dyn FnOnce(&Promise) + Send>;

struct Inner {
    settled: Option<Settled>,
    callbacks: Vec<Callback>,
}

#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<Inner>>,
    done: Arc<watch::Sender<bool>>,
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.lock().settled)
            .finish()
    }
}

impl Promise {
    /// A pending promise.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                settled: None,
                callbacks: Vec::new(),
            })),
            done: Arc::new(done),
        }
    }

    pub fn resolved(value: Value) -> Self {
        let p = Self::new();
        let _ = p.settle(Settled::Value(value));
        p
    }

    pub fn failed(error: TaskError) -> Self {
        let p = Self::new();
        let _ = p.settle(Settled::Failed(error));
        p
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Two handles refer to the same cell.
    pub fn same_as(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_result(&self, value: Value) -> Result<(), PromiseError> {
        self.settle(Settled::Value(value))
    }

    pub fn set_exception(&self, error: TaskError) -> Result<(), PromiseError> {
        self.settle(Settled::Failed(error))
    }

    /// Cancel a pending promise. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        self.settle(Settled::Cancelled).is_ok()
    }

    pub fn settle(&self, outcome: Settled) -> Result<(), PromiseError> {
        let callbacks = {
            let mut inner = self.lock();
            if let Some(existing) = &inner.settled {
                return Err(PromiseError::AlreadySettled(existing.label()));
            }
            inner.settled = Some(outcome);
            std::mem::take(&mut inner.callbacks)
        };
        self.done.send_replace(true);
        for cb in callbacks {
            cb(self);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.lock().settled.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock().settled, Some(Settled::Cancelled))
    }

    /// The outcome, if settled.
    pub fn settled(&self) -> Option<Settled> {
        self.lock().settled.clone()
    }

    pub fn result(&self) -> Option<Result<Value, TaskError>> {
        self.settled().map(Settled::into_result)
    }

    /// Register a continuation fired exactly once when the promise settles.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Promise) + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if inner.settled.is_none() {
                inner.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Copy this promise's eventual outcome into `target`.
    pub fn forward_to(&self, target: &Promise) {
        let target = target.clone();
        self.add_done_callback(move |done| {
            if let Some(outcome) = done.settled() {
                if let Err(err) = target.settle(outcome) {
                    tracing::debug!("forward target already settled: {err}");
                }
            }
        });
    }

    /// Wait until the promise settles.
    pub async fn wait(&self) -> Result<Value, TaskError> {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|done| *done).await;
        self.settled()
            .map(Settled::into_result)
            .unwrap_or(Err(TaskError::Cancelled))
    }
}
