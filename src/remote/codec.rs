//! Per-type payload codec registry (no generic
//! object-serialization fallback; a payload with no registered codec fails
//! the send locally and is never put on the wire).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::Payload;
use crate::error::RaceError;

pub trait Codec: Send + Sync {
    fn type_id(&self) -> &str;
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, RaceError>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload, RaceError>;
}

struct BincodeCodec<T> {
    type_id: String,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn type_id(&self) -> &str {
        &self.type_id
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, RaceError> {
        let value = payload.downcast_ref::<T>().ok_or_else(|| RaceError::Serialization {
            type_id: self.type_id.clone(),
            reason: "payload does not match the type registered under this type id".into(),
        })?;
        bincode::serialize(value).map_err(|e| RaceError::Serialization {
            type_id: self.type_id.clone(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, RaceError> {
        let value: T = bincode::deserialize(bytes).map_err(|e| RaceError::Serialization {
            type_id: self.type_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(value) as Payload)
    }
}

/// Maps a payload type identifier (an application-chosen string, not
/// `std::any::type_name` — those are not stable across compilations) to the
/// codec that knows how to (de)serialize it.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: Arc<HashMap<String, Arc<dyn Codec>>>,
}

pub struct CodecRegistryBuilder {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistryBuilder {
    pub fn new() -> Self {
        CodecRegistryBuilder { codecs: HashMap::new() }
    }

    pub fn register<T>(mut self, type_id: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let type_id = type_id.into();
        let codec = BincodeCodec::<T> {
            type_id: type_id.clone(),
            _marker: std::marker::PhantomData,
        };
        self.codecs.insert(type_id, Arc::new(codec));
        self
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            codecs: Arc::new(self.codecs),
        }
    }
}

impl CodecRegistry {
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::new()
    }

    pub fn encode(&self, type_id: &str, payload: &Payload) -> Result<Vec<u8>, RaceError> {
        let codec = self.codecs.get(type_id).ok_or_else(|| RaceError::Serialization {
            type_id: type_id.to_string(),
            reason: "no codec registered for this payload type".into(),
        })?;
        codec.encode(payload)
    }

    pub fn decode(&self, type_id: &str, bytes: &[u8]) -> Result<Payload, RaceError> {
        let codec = self.codecs.get(type_id).ok_or_else(|| RaceError::Serialization {
            type_id: type_id.to_string(),
            reason: "no codec registered for this payload type".into(),
        })?;
        codec.decode(bytes)
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.codecs.contains_key(type_id)
    }
}

#[allow(dead_code)]
fn assert_payload_is_any<T: Any>() {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Position {
        lat: f64,
        lon: f64,
    }

    #[test]
    fn registered_type_round_trips() {
        let registry = CodecRegistry::builder().register::<Position>("flight.Position").build();
        let payload: Payload = Arc::new(Position { lat: 1.0, lon: 2.0 });

        let bytes = registry.encode("flight.Position", &payload).unwrap();
        let decoded = registry.decode("flight.Position", &bytes).unwrap();
        let decoded: &Position = decoded.downcast_ref().unwrap();
        assert_eq!(decoded, &Position { lat: 1.0, lon: 2.0 });
    }

    #[test]
    fn unregistered_type_fails_locally() {
        let registry = CodecRegistry::builder().build();
        let payload: Payload = Arc::new(Position { lat: 1.0, lon: 2.0 });
        let err = registry.encode("flight.Position", &payload).unwrap_err();
        assert!(matches!(err, RaceError::Serialization { .. }));
    }
}
