//! ProcessRegistry: the process classes a worker can instantiate.
//! ProcessHost: creates, restores, launches and tracks live processes.
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info};

use super::builtin;
use super::listener::{ProcessEvent, ProcessListener};
use super::process::{Process, ProcessClass, ProcessControl, ProcessError, panic_message};
use super::spec::ValueMap;
use super::state::{ProcessState, Termination};
use crate::bundle::{BundleStore, InMemoryBundleStore};
use crate::promise::{Promise, TaskError};

/// Process classes by id.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    classes: Arc<DashMap<String, ProcessClass>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in class.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for class in builtin::classes() {
            registry.register(class);
        }
        registry
    }

    /// Register a class, replacing any class with the same id.
    pub fn register(&self, class: ProcessClass) {
        debug!(class = class.id(), "registered process class");
        self.classes.insert(class.id().to_string(), class);
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.classes.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<ProcessClass> {
        self.classes.get(id).map(|c| c.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.classes.contains_key(id)
    }

    /// Registered class ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.classes.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Checkpoints a process into a [`BundleStore`] as it moves through its
/// lifecycle. Waiting processes are also saved under their await tag.
pub struct ProcessPersister {
    store: Arc<dyn BundleStore>,
    keep_finished: bool,
}

impl ProcessPersister {
    pub fn new(store: Arc<dyn BundleStore>, keep_finished: bool) -> Self {
        Self { store, keep_finished }
    }
}

impl ProcessListener for ProcessPersister {
    fn on_process_event(&self, process: &Process, event: &ProcessEvent) -> anyhow::Result<()> {
        match event {
            ProcessEvent::Started | ProcessEvent::Running | ProcessEvent::Stopped { .. } => {
                self.store.save(process.pid(), None, &process.snapshot()?)?;
            }
            ProcessEvent::Waiting { tag } => {
                let bundle = process.snapshot()?;
                self.store.save(process.pid(), None, &bundle)?;
                self.store.save(process.pid(), Some(tag), &bundle)?;
            }
            ProcessEvent::Terminated => {
                if process.termination() == Some(Termination::Finished) && !self.keep_finished {
                    self.store.delete(process.pid())?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

struct LiveProcess {
    control: ProcessControl,
    completion: Promise,
}

struct HostInner {
    registry: ProcessRegistry,
    store: Arc<dyn BundleStore>,
    live: DashMap<String, LiveProcess>,
    keep_finished: bool,
}

/// Owns the processes of one worker. Cheap to clone.
#[derive(Clone)]
pub struct ProcessHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for ProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHost")
            .field("classes", &self.inner.registry.list())
            .field("store", &self.inner.store)
            .field("live", &self.inner.live.len())
            .finish()
    }
}

impl ProcessHost {
    /// A host checkpointing into memory.
    pub fn new(registry: ProcessRegistry) -> Self {
        Self::with_store(registry, InMemoryBundleStore::new(), false)
    }

    pub fn with_store(registry: ProcessRegistry, store: Arc<dyn BundleStore>, keep_finished: bool) -> Self {
        Self {
            inner: Arc::new(HostInner {
                registry,
                store,
                live: DashMap::new(),
                keep_finished,
            }),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn BundleStore> {
        &self.inner.store
    }

    fn class(&self, id: &str) -> Result<ProcessClass, ProcessError> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| ProcessError::UnknownClass(id.to_string()))
    }

    fn attach_persister(&self, process: &mut Process) {
        process.add_process_listener(Arc::new(ProcessPersister::new(
            self.inner.store.clone(),
            self.inner.keep_finished,
        )));
    }

    /// Create a checkpointed process from validated inputs.
    pub fn create(&self, class_id: &str, inputs: ValueMap) -> Result<Process, ProcessError> {
        let class = self.class(class_id)?;
        let mut process = Process::new(&class, inputs, None)?;
        self.attach_persister(&mut process);
        Ok(process)
    }

    /// Create a process from launch arguments: positional `args` bind to the
    /// declared inputs in order, then `kwargs` are merged.
    pub fn create_from_args(
        &self,
        class_id: &str,
        args: Vec<Value>,
        kwargs: ValueMap,
    ) -> Result<Process, ProcessError> {
        let class = self.class(class_id)?;
        let inputs = class.spec().bind_arguments(args, kwargs)?;
        let mut process = Process::new(&class, inputs, None)?;
        self.attach_persister(&mut process);
        Ok(process)
    }

    /// Restore a process from its checkpoint in the store.
    pub fn load(&self, pid: &str, tag: Option<&str>) -> Result<Option<Process>, ProcessError> {
        let Some(bundle) = self.inner.store.load(pid, tag)? else {
            return Ok(None);
        };
        let class_id: String = bundle.get_as("class")?;
        let class = self.class(&class_id)?;
        let mut process = Process::restore(&class, &bundle)?;
        self.attach_persister(&mut process);
        Ok(Some(process))
    }

    /// Persist a process as it stands, without playing it.
    pub fn persist(&self, process: &Process) -> Result<(), ProcessError> {
        self.inner.store.save(process.pid(), None, &process.snapshot()?)?;
        Ok(())
    }

    /// Drive `process` to termination on the runtime. The returned promise
    /// settles with the process's outputs, failure or cancellation.
    pub fn launch(&self, mut process: Process) -> Promise {
        let pid = process.pid().to_string();
        let completion = process.completion();
        self.inner.live.insert(
            pid.clone(),
            LiveProcess {
                control: process.control(),
                completion: completion.clone(),
            },
        );
        info!(pid = %pid, class = process.class_id(), "launching process");
        let host = self.clone();
        let settled = completion.clone();
        let run = tokio::spawn(async move { process.execute().await });
        tokio::spawn(async move {
            match run.await {
                Ok(Ok(outputs)) => debug!(pid = %pid, outputs = outputs.len(), "process finished"),
                Ok(Err(err)) => debug!(pid = %pid, "process ended without finishing: {err}"),
                Err(err) => {
                    let message = if err.is_panic() {
                        panic_message(err.into_panic().as_ref())
                    } else {
                        err.to_string()
                    };
                    error!(pid = %pid, "process task ended abnormally: {message}");
                    if settled.set_exception(TaskError::failed("Panic", message)).is_err() {
                        debug!(pid = %pid, "completion was already settled");
                    }
                }
            }
            host.inner.live.remove(&pid);
        });
        completion
    }

    pub fn is_live(&self, pid: &str) -> bool {
        self.inner.live.contains_key(pid)
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    pub fn control(&self, pid: &str) -> Option<ProcessControl> {
        self.inner.live.get(pid).map(|l| l.control.clone())
    }

    pub fn completion(&self, pid: &str) -> Option<Promise> {
        self.inner.live.get(pid).map(|l| l.completion.clone())
    }

    /// Continue a process by pid. A live process waiting on an event is
    /// signalled with `null`; otherwise the process is restored from its
    /// checkpoint (at `tag` if given) and launched. `Ok(None)` means no such
    /// process is known here.
    pub fn continue_process(&self, pid: &str, tag: Option<&str>) -> Result<Option<Promise>, ProcessError> {
        if tag.is_none() {
            if let Some(live) = self.inner.live.get(pid) {
                if live.control.is_waiting() {
                    live.control.continue_with(Value::Null)?;
                }
                return Ok(Some(live.completion.clone()));
            }
        }

        let Some(mut process) = self.load(pid, tag)? else {
            return Ok(None);
        };
        match process.state() {
            ProcessState::Stopped => return Ok(Some(process.completion())),
            ProcessState::Waiting => process.control().continue_with(Value::Null)?,
            _ => {}
        }
        if self.is_live(pid) {
            error!(pid = %pid, "refusing to launch a second copy of a live process");
            return Err(ProcessError::InvalidTransition {
                action: "relaunch",
                state: ProcessState::Running,
            });
        }
        Ok(Some(self.launch(process)))
    }

    /// Abort a live process.
    pub fn abort(&self, pid: &str) -> bool {
        match self.inner.live.get(pid) {
            Some(live) => live.control.abort(),
            None => false,
        }
    }
}
