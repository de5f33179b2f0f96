use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::process::{Process, ProcessError};
use super::state::Termination;

/// Lifecycle notifications delivered to every registered listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started,
    Running,
    Waiting { tag: String },
    OutputEmitted { name: String, value: Value },
    Finished,
    Failed { error: ProcessError },
    Stopped { termination: Termination },
    Terminated,
}

impl ProcessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEvent::Started => "started",
            ProcessEvent::Running => "running",
            ProcessEvent::Waiting { .. } => "waiting",
            ProcessEvent::OutputEmitted { .. } => "output_emitted",
            ProcessEvent::Finished => "finished",
            ProcessEvent::Failed { .. } => "failed",
            ProcessEvent::Stopped { .. } => "stopped",
            ProcessEvent::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observer of a process's lifecycle.
///
/// Listeners are invoked synchronously, in registration order, with the
/// process in the state the event describes. A returned error is logged and
/// never disturbs the process or the listeners after it.
pub trait ProcessListener: Send + Sync {
    fn on_process_event(&self, process: &Process, event: &ProcessEvent) -> anyhow::Result<()>;
}

impl<F> ProcessListener for F
where
    F: Fn(&Process, &ProcessEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_process_event(&self, process: &Process, event: &ProcessEvent) -> anyhow::Result<()> {
        self(process, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn ProcessListener>)>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn add(&mut self, listener: Arc<dyn ProcessListener>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        before != self.listeners.len()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Copy of the current listeners, so delivery is unaffected by listeners
    /// added or removed while it runs.
    pub fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn ProcessListener>)> {
        self.listeners.clone()
    }
}
