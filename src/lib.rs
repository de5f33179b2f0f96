pub mod broker;
pub mod bundle;
pub mod config;
pub mod logger;
pub mod process;
pub mod promise;
pub mod schema;
pub mod task;
pub mod test_utils;

pub use bundle::{Bundle, BundleStore, FileBundleStore, InMemoryBundleStore};
pub use process::{Process, ProcessClass, ProcessError, ProcessHost, ProcessRegistry, ProcessState};
pub use promise::{Promise, TaskError};
pub use task::{ProcessLauncher, TaskMessage, TaskPublisher, TaskSubscriber};
