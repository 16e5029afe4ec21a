//! Versioned, typed checkpoints.
//!
//! A task record stores its checkpoint as an opaque JSON object. Each task
//! definition reads and writes it through a concrete type implementing
//! [`Checkpoint`], so resumption stays type-checked across invocations.
//!
//! Encoded checkpoints carry a `version` key next to the checkpoint's own
//! fields. Inputs supplied by a caller when creating a task usually omit it
//! and are accepted as the current version.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key holding the checkpoint version in an encoded checkpoint.
pub const VERSION_KEY: &str = "version";

/// Errors that can occur while encoding or decoding a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored checkpoint was written by an incompatible definition version.
    #[error("Checkpoint version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: Value, expected: u32 },

    /// The checkpoint is not a JSON object.
    #[error("Checkpoint must be a JSON object")]
    NotAnObject,

    /// The checkpoint does not match the definition's input shape.
    #[error("Failed to decode checkpoint: {0}")]
    Decode(#[source] serde_json::Error),

    /// The checkpoint could not be serialized.
    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Typed checkpoint of a task definition.
pub trait Checkpoint: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Version written into every encoded checkpoint.
    const VERSION: u32 = 1;

    /// Encode into the JSON object persisted on the task record.
    fn to_checkpoint(&self) -> Result<Value, CheckpointError> {
        let mut value = serde_json::to_value(self).map_err(CheckpointError::Encode)?;
        let map = value.as_object_mut().ok_or(CheckpointError::NotAnObject)?;
        map.insert(VERSION_KEY.to_string(), Value::from(Self::VERSION));
        Ok(value)
    }

    /// Decode from the JSON persisted on the task record.
    ///
    /// A `null` input decodes as an empty object.
    fn from_checkpoint(value: &Value) -> Result<Self, CheckpointError> {
        let mut map = match value {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(CheckpointError::NotAnObject),
        };

        if let Some(found) = map.remove(VERSION_KEY) {
            if found.as_u64() != Some(u64::from(Self::VERSION)) {
                return Err(CheckpointError::UnsupportedVersion {
                    found,
                    expected: Self::VERSION,
                });
            }
        }

        serde_json::from_value(Value::Object(map)).map_err(CheckpointError::Decode)
    }
}
