pub mod builtin;
pub mod listener;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod process;
pub mod spec;
pub mod state;

pub use listener::{ListenerId, ProcessEvent, ProcessListener};
pub use manager::{ProcessHost, ProcessPersister, ProcessRegistry};
pub use process::{
    HookContext, Process, ProcessClass, ProcessControl, ProcessError, ProcessLogic, RunContext, Step,
};
pub use spec::{InputPort, OutputPort, ProcessSpec, ValidationError, ValueMap, ValueType};
pub use state::{Continuation, Hook, ProcessState, Resume, Termination};
