pub mod codec;
pub mod message;

pub use codec::{Codec, CodecError, JsonCodec, YamlCodec};
pub use message::{ExceptionDescription, HostInfo, Outcome, PayloadError, TaskBody, TaskResponse};
