use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use serde_yaml_bw as serde_yaml;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    #[error("could not encode {codec} body: {reason}")]
    Encode { codec: &'static str, reason: String },
    #[error("could not decode {codec} body: {reason}")]
    Decode { codec: &'static str, reason: String },
}

/// Encoder/decoder pair for message and bundle bodies.
///
/// Implementations must be symmetric: `decode(encode(x)) == x` for every
/// payload, response and bundle shape.
pub trait Codec: Send + Sync + Debug {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Encode any serializable value through a codec.
pub fn encode_as<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encode {
        codec: codec.name(),
        reason: e.to_string(),
    })?;
    codec.encode(&value)
}

/// Decode bytes through a codec into a concrete type.
pub fn decode_as<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, CodecError> {
    let value = codec.decode(bytes)?;
    serde_json::from_value(value).map_err(|e| CodecError::Decode {
        codec: codec.name(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| CodecError::Encode {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_yaml::from_slice(bytes).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}
