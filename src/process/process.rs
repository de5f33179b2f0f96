//! The process engine: lifecycle state machine, output emission, listener
//! fan-out and checkpointing.
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use task_protocol::ExceptionDescription;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::listener::{ListenerId, ListenerRegistry, ProcessEvent, ProcessListener};
use super::spec::{ProcessSpec, ValidationError, ValueMap};
use super::state::{Continuation, Hook, ProcessState, Resume, Termination};
use crate::bundle::{Bundle, BundleError, BundleKey};
use crate::promise::{Promise, Settled, TaskError};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{hook} did not invoke the base lifecycle behaviour")]
    LifecycleViolation { hook: Hook },
    #[error("{kind}: {message}")]
    Execution { kind: String, message: String },
    #[error("awaited event failed: {0}")]
    Awaited(TaskError),
    #[error("process {0} was aborted")]
    Aborted(String),
    #[error("process {0} is not waiting")]
    NotWaiting(String),
    #[error("unknown process class `{0}`")]
    UnknownClass(String),
    #[error("cannot {action} a process that is {state}")]
    InvalidTransition { action: &'static str, state: ProcessState },
    #[error("bundle error: {0}")]
    Bundle(String),
}

impl From<BundleError> for ProcessError {
    fn from(err: BundleError) -> Self {
        ProcessError::Bundle(err.to_string())
    }
}

impl ProcessError {
    pub fn execution(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessError::Execution {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ProcessError::Validation(_) => "ValidationError",
            ProcessError::LifecycleViolation { .. } => "LifecycleViolation",
            ProcessError::Execution { kind, .. } => kind,
            ProcessError::Awaited(TaskError::Failed { kind, .. }) => kind,
            ProcessError::Awaited(other) => other.kind(),
            ProcessError::Aborted(_) => "Aborted",
            ProcessError::NotWaiting(_) => "NotWaiting",
            ProcessError::UnknownClass(_) => "UnknownClass",
            ProcessError::InvalidTransition { .. } => "InvalidTransition",
            ProcessError::Bundle(_) => "BundleError",
        }
    }

    /// Wire form, also used when the failure is checkpointed.
    pub fn describe(&self) -> ExceptionDescription {
        match self {
            ProcessError::Execution { kind, message }
            | ProcessError::Awaited(TaskError::Failed { kind, message }) => {
                ExceptionDescription::new(kind.clone(), message.clone())
            }
            other => ExceptionDescription::new(other.kind(), other.to_string()),
        }
    }

    /// Map an error returned from a run step onto a process failure. Typed
    /// errors survive; anything else becomes an `ExecutionError`.
    pub fn from_run_error(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ProcessError>() {
            return e.clone();
        }
        if let Some(e) = err.downcast_ref::<ValidationError>() {
            return ProcessError::Validation(e.clone());
        }
        if let Some(e) = err.downcast_ref::<TaskError>() {
            return ProcessError::Awaited(e.clone());
        }
        ProcessError::execution("ExecutionError", format!("{err:#}"))
    }
}

/// Text carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panicked without a message".to_string()
    }
}

impl From<ExceptionDescription> for ProcessError {
    fn from(desc: ExceptionDescription) -> Self {
        ProcessError::Execution {
            kind: desc.kind,
            message: desc.message,
        }
    }
}

impl From<&ProcessError> for TaskError {
    fn from(err: &ProcessError) -> Self {
        match err {
            ProcessError::Awaited(inner) => inner.clone(),
            other => TaskError::from(other.describe()),
        }
    }
}

/// What a run step asks the engine to do next.
#[derive(Debug, Clone)]
pub enum Step {
    /// The process has nothing left to do.
    Done,
    /// Suspend until an external `continue` supplies a signal.
    Wait { tag: String },
    /// Suspend until `promise` settles; its value becomes the resume signal.
    WaitOn { tag: String, promise: Promise },
}

impl Step {
    pub fn wait(tag: impl Into<String>) -> Self {
        Step::Wait { tag: tag.into() }
    }

    pub fn wait_on(tag: impl Into<String>, promise: Promise) -> Self {
        Step::WaitOn {
            tag: tag.into(),
            promise,
        }
    }
}

/// View handed to a run step.
pub struct RunContext<'a> {
    pid: &'a str,
    inputs: &'a ValueMap,
    outputs: &'a ValueMap,
    spec: &'a ProcessSpec,
    emitted: Vec<(String, Value)>,
}

impl<'a> RunContext<'a> {
    pub fn pid(&self) -> &str {
        self.pid
    }

    pub fn inputs(&self) -> &ValueMap {
        self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Outputs committed by earlier steps.
    pub fn outputs(&self) -> &ValueMap {
        self.outputs
    }

    /// Emit an output. Emissions are committed together when the step returns.
    pub fn emit(&mut self, name: impl Into<String>, value: Value) -> Result<(), ValidationError> {
        let name = name.into();
        self.spec.validate_output(&name, &value)?;
        if self.outputs.contains_key(&name) || self.emitted.iter().any(|(n, _)| *n == name) {
            return Err(ValidationError::DuplicateOutput(name));
        }
        self.emitted.push((name, value));
        Ok(())
    }
}

/// View handed to a lifecycle hook. An override must call
/// [`HookContext::call_base`] or the process fails with a lifecycle violation.
pub struct HookContext<'a> {
    hook: Hook,
    pid: &'a str,
    inputs: &'a ValueMap,
    outputs: &'a ValueMap,
    state: ProcessState,
    base_called: bool,
}

impl<'a> HookContext<'a> {
    pub fn call_base(&mut self) {
        self.base_called = true;
    }

    pub fn hook(&self) -> Hook {
        self.hook
    }

    pub fn pid(&self) -> &str {
        self.pid
    }

    pub fn inputs(&self) -> &ValueMap {
        self.inputs
    }

    pub fn outputs(&self) -> &ValueMap {
        self.outputs
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }
}

/// The behaviour of a process class.
pub trait ProcessLogic: Send {
    /// Execute the next step. `resume` carries the signal of the awaited event
    /// when the step follows a wait.
    fn run(&mut self, ctx: &mut RunContext<'_>, resume: Option<Resume>) -> anyhow::Result<Step>;

    /// Persist class-specific state next to the engine's own entries.
    fn save_state(&self, _ext: &mut Bundle) -> Result<(), BundleError> {
        Ok(())
    }

    fn load_state(&mut self, _ext: &Bundle) -> Result<(), BundleError> {
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut HookContext<'_>) {
        ctx.call_base();
    }

    fn on_run(&mut self, ctx: &mut HookContext<'_>) {
        ctx.call_base();
    }

    fn on_fail(&mut self, ctx: &mut HookContext<'_>) {
        ctx.call_base();
    }

    fn on_finish(&mut self, ctx: &mut HookContext<'_>) {
        ctx.call_base();
    }

    fn on_stop(&mut self, ctx: &mut HookContext<'_>) {
        ctx.call_base();
    }
}

pub type LogicFactory = Arc<dyn Fn(&ValueMap) -> Box<dyn ProcessLogic> + Send + Sync>;

/// A named process class: its spec plus a factory for its logic.
#[derive(Clone)]
pub struct ProcessClass {
    id: String,
    spec: Arc<ProcessSpec>,
    factory: LogicFactory,
}

impl fmt::Debug for ProcessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessClass")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .finish()
    }
}

impl ProcessClass {
    pub fn new<F>(id: impl Into<String>, spec: Arc<ProcessSpec>, factory: F) -> Self
    where
        F: Fn(&ValueMap) -> Box<dyn ProcessLogic> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            spec,
            factory: Arc::new(factory),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub fn description(&self) -> &str {
        self.spec.description()
    }

    fn instantiate(&self, inputs: &ValueMap) -> Box<dyn ProcessLogic> {
        (self.factory)(inputs)
    }
}

#[derive(Default)]
struct ControlShared {
    awaiting: Mutex<Option<Promise>>,
    abort_requested: AtomicBool,
}

/// Cloneable handle for signalling a process that is owned elsewhere,
/// typically by a task driving [`Process::execute`].
#[derive(Clone)]
pub struct ProcessControl {
    pid: String,
    shared: Arc<ControlShared>,
}

impl fmt::Debug for ProcessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessControl")
            .field("pid", &self.pid)
            .field("waiting", &self.is_waiting())
            .field("abort_requested", &self.abort_requested())
            .finish()
    }
}

impl ProcessControl {
    fn new(pid: &str) -> Self {
        Self {
            pid: pid.to_string(),
            shared: Arc::new(ControlShared::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Promise>> {
        self.shared.awaiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_awaiting(&self, promise: Option<Promise>) {
        *self.slot() = promise;
    }

    fn take_awaiting(&self) -> Option<Promise> {
        self.slot().take()
    }

    fn awaiting(&self) -> Option<Promise> {
        self.slot().clone()
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// The process is suspended on an event that has not settled yet.
    pub fn is_waiting(&self) -> bool {
        self.slot().as_ref().is_some_and(|p| !p.is_done())
    }

    pub fn abort_requested(&self) -> bool {
        self.shared.abort_requested.load(Ordering::SeqCst)
    }

    /// Settle the awaited event with `signal`.
    pub fn continue_with(&self, signal: Value) -> Result<(), ProcessError> {
        match self.awaiting() {
            Some(promise) => promise
                .set_result(signal)
                .map_err(|_| ProcessError::NotWaiting(self.pid.clone())),
            None => Err(ProcessError::NotWaiting(self.pid.clone())),
        }
    }

    /// Request an abort. Returns `false` if one was already requested.
    pub fn abort(&self) -> bool {
        let first = !self.shared.abort_requested.swap(true, Ordering::SeqCst);
        if let Some(promise) = self.awaiting() {
            promise.cancel();
        }
        first
    }
}

/// A running instance of a process class.
pub struct Process {
    pid: String,
    class: ProcessClass,
    logic: Box<dyn ProcessLogic>,
    state: ProcessState,
    inputs: ValueMap,
    outputs: ValueMap,
    continuation: Continuation,
    termination: Option<Termination>,
    exception: Option<ProcessError>,
    listeners: ListenerRegistry,
    control: ProcessControl,
    completion: Promise,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("class", &self.class.id)
            .field("state", &self.state)
            .field("outputs", &self.outputs)
            .field("termination", &self.termination)
            .field("exception", &self.exception)
            .finish()
    }
}

impl Process {
    /// Create a process in the CREATED state. Inputs are validated against the
    /// class spec; a fresh pid is generated unless one is given.
    pub fn new(class: &ProcessClass, inputs: ValueMap, pid: Option<String>) -> Result<Self, ProcessError> {
        let inputs = class.spec().validate_inputs(inputs)?;
        let pid = pid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let logic = class.instantiate(&inputs);
        debug!(pid = %pid, class = class.id(), "process created");
        Ok(Self::assemble(pid, class.clone(), logic, inputs))
    }

    fn assemble(pid: String, class: ProcessClass, logic: Box<dyn ProcessLogic>, inputs: ValueMap) -> Self {
        let control = ProcessControl::new(&pid);
        Self {
            pid,
            class,
            logic,
            state: ProcessState::Created,
            inputs,
            outputs: ValueMap::new(),
            continuation: Continuation::default(),
            termination: None,
            exception: None,
            listeners: ListenerRegistry::default(),
            control,
            completion: Promise::new(),
        }
    }

    /// Rebuild a process from a checkpoint. No hooks run and no events fire;
    /// a process restored while waiting stays suspended until continued.
    pub fn restore(class: &ProcessClass, bundle: &Bundle) -> Result<Self, ProcessError> {
        let class_id: String = bundle.get_as(BundleKey::Class.as_ref())?;
        if class_id != class.id() {
            return Err(ProcessError::Bundle(format!(
                "bundle belongs to `{class_id}`, not `{}`",
                class.id()
            )));
        }
        let pid: String = bundle.get_as(BundleKey::Pid.as_ref())?;
        let state: ProcessState = bundle.get_as(BundleKey::State.as_ref())?;
        let raw_inputs: Option<ValueMap> = match bundle.get_opt(BundleKey::Inputs.as_ref())? {
            Some(inputs) => Some(inputs),
            None => bundle.get_opt(BundleKey::ProcessInputs.as_ref())?,
        };
        let inputs = match raw_inputs {
            Some(raw) => class.spec().validate_inputs(raw)?,
            None => ValueMap::new(),
        };
        let outputs: ValueMap = bundle.get_opt(BundleKey::Outputs.as_ref())?.unwrap_or_default();
        for (name, value) in &outputs {
            class.spec().validate_output(name, value)?;
        }

        let mut logic = class.instantiate(&inputs);
        if let Some(ext) = bundle.nested(BundleKey::Ext.as_ref()) {
            logic.load_state(&ext)?;
        }

        let mut process = Self::assemble(pid, class.clone(), logic, inputs);
        process.state = state;
        process.outputs = outputs;
        process.continuation = bundle
            .get_opt(BundleKey::Continuation.as_ref())?
            .unwrap_or_default();
        process.termination = bundle.get_opt(BundleKey::Termination.as_ref())?;
        process.exception = bundle
            .get_opt::<ExceptionDescription>(BundleKey::Exception.as_ref())?
            .map(ProcessError::from);

        match state {
            ProcessState::Waiting => process.control.set_awaiting(Some(Promise::new())),
            ProcessState::Stopped => process.settle_completion(),
            _ => {}
        }
        debug!(pid = %process.pid, class = class.id(), state = %state, "process restored");
        Ok(process)
    }

    /// Write the process into `bundle`. `inputs` is written only while the
    /// process is CREATED; once started they move to `process_inputs`.
    pub fn save_instance_state(&self, bundle: &mut Bundle) -> Result<(), BundleError> {
        bundle.put(BundleKey::Class.as_ref(), &self.class.id)?;
        bundle.put(BundleKey::Pid.as_ref(), &self.pid)?;
        bundle.put(BundleKey::State.as_ref(), &self.state)?;
        let (current, stale) = if self.state == ProcessState::Created {
            (BundleKey::Inputs, BundleKey::ProcessInputs)
        } else {
            (BundleKey::ProcessInputs, BundleKey::Inputs)
        };
        bundle.put(current.as_ref(), &self.inputs)?;
        bundle.remove(stale.as_ref());
        bundle.put(BundleKey::Outputs.as_ref(), &self.outputs)?;
        bundle.put(BundleKey::Continuation.as_ref(), &self.continuation)?;
        bundle.put(BundleKey::Termination.as_ref(), &self.termination)?;
        bundle.put(
            BundleKey::Exception.as_ref(),
            &self.exception.as_ref().map(ProcessError::describe),
        )?;
        let mut ext = Bundle::new();
        self.logic.save_state(&mut ext)?;
        bundle.set_nested(BundleKey::Ext.as_ref(), ext);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Bundle, BundleError> {
        let mut bundle = Bundle::new();
        self.save_instance_state(&mut bundle)?;
        Ok(bundle)
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn class(&self) -> &ProcessClass {
        &self.class
    }

    pub fn class_id(&self) -> &str {
        &self.class.id
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        self.class.spec()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn inputs(&self) -> &ValueMap {
        &self.inputs
    }

    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    pub fn continuation(&self) -> &Continuation {
        &self.continuation
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn exception(&self) -> Option<&ProcessError> {
        self.exception.as_ref()
    }

    /// Tag of the event the process is suspended on.
    pub fn awaiting_tag(&self) -> Option<&str> {
        match (&self.state, &self.continuation) {
            (ProcessState::Waiting, Continuation::Await { tag }) => Some(tag),
            _ => None,
        }
    }

    pub fn has_finished(&self) -> bool {
        self.termination == Some(Termination::Finished)
    }

    pub fn has_aborted(&self) -> bool {
        self.termination == Some(Termination::Aborted)
    }

    pub fn has_failed(&self) -> bool {
        self.state == ProcessState::Failed || self.termination == Some(Termination::Failed)
    }

    pub fn has_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// Settles when the process stops: outputs on a normal finish, the failure
    /// otherwise, cancelled on abort.
    pub fn completion(&self) -> Promise {
        self.completion.clone()
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    pub fn add_process_listener(&mut self, listener: Arc<dyn ProcessListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_process_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drive the process synchronously until it waits or stops.
    pub fn play(&mut self) -> ProcessState {
        loop {
            if self.state.is_terminal() {
                return self.state;
            }
            if self.control.abort_requested() {
                self.do_abort();
                continue;
            }
            match self.state {
                ProcessState::Created => self.begin(),
                ProcessState::Running => match self.continuation.clone() {
                    Continuation::Enter { resume } => self.enter(resume),
                    Continuation::Step { resume } => self.run_step(resume),
                    Continuation::Complete => self.finish(),
                    Continuation::Await { tag } => self.suspend(tag, None),
                },
                ProcessState::Waiting => match self.control.awaiting() {
                    Some(awaiting) => match awaiting.settled() {
                        Some(outcome) => self.wake(outcome),
                        None => return ProcessState::Waiting,
                    },
                    None => {
                        self.control.set_awaiting(Some(Promise::new()));
                        return ProcessState::Waiting;
                    }
                },
                ProcessState::Finished => self.stop(Termination::Finished),
                ProcessState::Failed => self.stop(Termination::Failed),
                ProcessState::Stopped => return ProcessState::Stopped,
            }
        }
    }

    /// Drive the process to termination, awaiting whatever it waits on.
    pub async fn execute(&mut self) -> Result<ValueMap, ProcessError> {
        loop {
            if self.play() == ProcessState::Stopped {
                return self.result();
            }
            if let Some(awaiting) = self.control.awaiting() {
                // The outcome is picked up by the next play.
                let _ = awaiting.wait().await;
            }
        }
    }

    /// Resume a waiting process with `signal` and play it.
    pub fn continue_with(&mut self, signal: Value) -> Result<ProcessState, ProcessError> {
        if self.state != ProcessState::Waiting {
            return Err(ProcessError::InvalidTransition {
                action: "continue",
                state: self.state,
            });
        }
        self.control.continue_with(signal)?;
        Ok(self.play())
    }

    pub fn resume(&mut self) -> Result<ProcessState, ProcessError> {
        self.continue_with(Value::Null)
    }

    /// Abort the process. Returns `false` if it had already terminated.
    pub fn abort(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.do_abort();
        true
    }

    /// Emit an output outside a run step.
    pub fn emit(&mut self, name: impl Into<String>, value: Value) -> Result<(), ProcessError> {
        let name = name.into();
        if !self.state.accepts_outputs() {
            return Err(ValidationError::OutputsFrozen {
                name,
                state: self.state.to_string(),
            }
            .into());
        }
        self.spec().validate_output(&name, &value)?;
        if self.outputs.contains_key(&name) {
            return Err(ValidationError::DuplicateOutput(name).into());
        }
        self.outputs.insert(name.clone(), value.clone());
        self.fire(ProcessEvent::OutputEmitted { name, value });
        Ok(())
    }

    /// Outputs of a finished process, or why it did not finish.
    pub fn result(&self) -> Result<ValueMap, ProcessError> {
        match (self.state, self.termination) {
            (ProcessState::Stopped, Some(Termination::Finished)) => Ok(self.outputs.clone()),
            (ProcessState::Stopped, Some(Termination::Aborted)) => Err(ProcessError::Aborted(self.pid.clone())),
            (ProcessState::Stopped, _) => Err(self
                .exception
                .clone()
                .unwrap_or_else(|| ProcessError::execution("ProcessFailed", "process failed"))),
            (state, _) => Err(ProcessError::InvalidTransition {
                action: "read the result of",
                state,
            }),
        }
    }

    fn begin(&mut self) {
        self.state = ProcessState::Running;
        self.continuation = Continuation::Enter { resume: None };
        info!(pid = %self.pid, class = %self.class.id, "process started");
        if let Err(err) = self.call_hook(Hook::Start) {
            self.fail(err);
        }
    }

    fn enter(&mut self, resume: Option<Resume>) {
        self.continuation = Continuation::Step { resume };
        if let Err(err) = self.call_hook(Hook::Run) {
            self.fail(err);
        }
    }

    fn run_step(&mut self, resume: Option<Resume>) {
        let (result, emitted) = {
            let mut ctx = RunContext {
                pid: &self.pid,
                inputs: &self.inputs,
                outputs: &self.outputs,
                spec: &self.class.spec,
                emitted: Vec::new(),
            };
            let logic = &mut self.logic;
            let result = match catch_unwind(AssertUnwindSafe(|| logic.run(&mut ctx, resume))) {
                Ok(result) => result,
                Err(payload) => Err(ProcessError::execution("Panic", panic_message(payload.as_ref())).into()),
            };
            (result, ctx.emitted)
        };

        // Commit outputs and the next continuation before anyone hears about
        // them, so a checkpoint taken by a listener never replays this step.
        for (name, value) in &emitted {
            self.outputs.insert(name.clone(), value.clone());
        }
        let (next, awaiting) = match &result {
            Ok(Step::Done) => (Some(Continuation::Complete), None),
            Ok(Step::Wait { tag }) => (Some(Continuation::Await { tag: tag.clone() }), None),
            Ok(Step::WaitOn { tag, promise }) => {
                (Some(Continuation::Await { tag: tag.clone() }), Some(promise.clone()))
            }
            Err(_) => (None, None),
        };
        if let Some(next) = next {
            self.continuation = next;
        }
        for (name, value) in emitted {
            self.fire(ProcessEvent::OutputEmitted { name, value });
        }

        match result {
            Ok(Step::Done) => {}
            Ok(Step::Wait { tag }) | Ok(Step::WaitOn { tag, .. }) => self.suspend(tag, awaiting),
            Err(err) => self.fail(ProcessError::from_run_error(err)),
        }
    }

    fn suspend(&mut self, tag: String, awaiting: Option<Promise>) {
        self.control.set_awaiting(Some(awaiting.unwrap_or_default()));
        self.state = ProcessState::Waiting;
        debug!(pid = %self.pid, tag = %tag, "process waiting");
        self.fire(ProcessEvent::Waiting { tag });
    }

    fn wake(&mut self, outcome: Settled) {
        let tag = match &self.continuation {
            Continuation::Await { tag } => tag.clone(),
            _ => String::new(),
        };
        self.control.set_awaiting(None);
        match outcome {
            Settled::Value(signal) => {
                self.continuation = Continuation::Enter {
                    resume: Some(Resume { tag, signal }),
                };
                self.state = ProcessState::Running;
            }
            Settled::Failed(error) => self.fail(ProcessError::Awaited(error)),
            Settled::Cancelled if self.control.abort_requested() => self.do_abort(),
            Settled::Cancelled => self.fail(ProcessError::Awaited(TaskError::Cancelled)),
        }
    }

    fn finish(&mut self) {
        self.state = ProcessState::Finished;
        if let Err(err) = self.call_hook(Hook::Finish) {
            self.fail(err);
        }
    }

    fn fail(&mut self, error: ProcessError) {
        warn!(pid = %self.pid, class = %self.class.id, kind = error.kind(), "process failed: {error}");
        self.exception = Some(error);
        self.state = ProcessState::Failed;
        if let Err(violation) = self.call_hook(Hook::Fail) {
            self.exception = Some(violation);
        }
    }

    fn do_abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.control.shared.abort_requested.store(true, Ordering::SeqCst);
        if let Some(awaiting) = self.control.take_awaiting() {
            awaiting.cancel();
        }
        info!(pid = %self.pid, "process aborted");
        self.stop(Termination::Aborted);
    }

    fn stop(&mut self, termination: Termination) {
        self.state = ProcessState::Stopped;
        self.termination = Some(termination);
        self.control.set_awaiting(None);
        if let Err(violation) = self.call_hook(Hook::Stop) {
            warn!(pid = %self.pid, "process failed while stopping: {violation}");
            self.exception = Some(violation);
            self.termination = Some(Termination::Failed);
        }
        info!(pid = %self.pid, termination = %self.termination.unwrap_or(termination), "process terminated");
        self.fire(ProcessEvent::Terminated);
        self.listeners.clear();
        self.settle_completion();
    }

    fn settle_completion(&self) {
        let outcome = match self.termination {
            Some(Termination::Finished) => Settled::Value(Value::Object(self.outputs.clone())),
            Some(Termination::Aborted) => Settled::Cancelled,
            _ => Settled::Failed(
                self.exception
                    .as_ref()
                    .map(TaskError::from)
                    .unwrap_or_else(|| TaskError::failed("ProcessFailed", "process failed")),
            ),
        };
        if let Err(err) = self.completion.settle(outcome) {
            debug!(pid = %self.pid, "completion already settled: {err}");
        }
    }

    fn call_hook(&mut self, hook: Hook) -> Result<(), ProcessError> {
        let base_called = {
            let mut ctx = HookContext {
                hook,
                pid: &self.pid,
                inputs: &self.inputs,
                outputs: &self.outputs,
                state: self.state,
                base_called: false,
            };
            let logic = &mut self.logic;
            let called = catch_unwind(AssertUnwindSafe(|| {
                match hook {
                    Hook::Start => logic.on_start(&mut ctx),
                    Hook::Run => logic.on_run(&mut ctx),
                    Hook::Fail => logic.on_fail(&mut ctx),
                    Hook::Finish => logic.on_finish(&mut ctx),
                    Hook::Stop => logic.on_stop(&mut ctx),
                }
                ctx.base_called
            }));
            match called {
                Ok(called) => called,
                Err(payload) => {
                    return Err(ProcessError::execution("Panic", panic_message(payload.as_ref())));
                }
            }
        };
        if !base_called {
            return Err(ProcessError::LifecycleViolation { hook });
        }

        let event = match hook {
            Hook::Start => ProcessEvent::Started,
            Hook::Run => ProcessEvent::Running,
            Hook::Finish => ProcessEvent::Finished,
            Hook::Fail => ProcessEvent::Failed {
                error: self
                    .exception
                    .clone()
                    .unwrap_or_else(|| ProcessError::execution("ProcessFailed", "process failed")),
            },
            Hook::Stop => ProcessEvent::Stopped {
                termination: self.termination.unwrap_or(Termination::Finished),
            },
        };
        self.fire(event);
        Ok(())
    }

    fn fire(&self, event: ProcessEvent) {
        for (id, listener) in self.listeners.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_process_event(self, &event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    pid = %self.pid,
                    listener = ?id,
                    event = event.name(),
                    "process listener failed: {err:#}"
                ),
                Err(payload) => warn!(
                    pid = %self.pid,
                    listener = ?id,
                    event = event.name(),
                    "process listener panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }
    }
}
