pub mod launcher;
pub mod message;
pub mod publisher;
pub mod subscriber;

pub use launcher::ProcessLauncher;
pub use message::TaskMessage;
pub use publisher::{CorrelationRegistry, PublishError, TaskPublisher};
pub use subscriber::{Received, ReceiverId, TaskOutcome, TaskReceiver, TaskSubscriber};
