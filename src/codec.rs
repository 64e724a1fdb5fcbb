//! Event payload encoding.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire format for event payloads.
///
/// Publishers and subscribers of one event type must agree on the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Codec {
    #[default]
    MessagePack,
    Json,
}

impl Codec {
    /// Serialize a value into a payload.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            // Named encoding keeps struct fields addressable by name across versions.
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserialize a payload produced by [`Codec::encode`].
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        match self {
            Codec::MessagePack => Ok(rmp_serde::from_slice(payload)?),
            Codec::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}
