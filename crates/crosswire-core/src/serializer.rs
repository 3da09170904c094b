//! Registry-checked binary serializer.
//!
//! A thin wrapper over bincode that refuses any type outside the closed
//! [`TypeRegistry`](crate::TypeRegistry). Stateless after construction;
//! shared as one `Arc<Serializer>` across every engine and thread.

use crate::registry::{TypeRegistry, WireType};

/// Serialization failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializeError {
    /// Configuration error: the type was never listed in the registry.
    #[error("type `{type_name}` is not in the wire type registry")]
    Unregistered { type_name: &'static str },
    #[error("encoding `{type_name}` failed: {message}")]
    Encode {
        type_name: &'static str,
        message: String,
    },
    #[error("decoding `{type_name}` failed: {message}")]
    Decode {
        type_name: &'static str,
        message: String,
    },
}

/// Binary serializer over the closed type set.
#[derive(Debug)]
pub struct Serializer {
    registry: TypeRegistry,
}

impl Serializer {
    pub fn new(registry: TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn serialize<T: WireType>(&self, value: &T) -> Result<Vec<u8>, SerializeError> {
        self.registry.ensure::<T>()?;
        bincode::serialize(value).map_err(|e| SerializeError::Encode {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    pub fn deserialize<T: WireType>(&self, bytes: &[u8]) -> Result<T, SerializeError> {
        self.registry.ensure::<T>()?;
        bincode::deserialize(bytes).map_err(|e| SerializeError::Decode {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    /// Encode a parameter list. An empty list yields no payload at all — a
    /// wire-size optimization, not an error.
    pub fn serialize_parameters(
        &self,
        parameters: &Parameters,
    ) -> Result<Option<Vec<u8>>, SerializeError> {
        if parameters.is_empty() {
            return Ok(None);
        }
        bincode::serialize(&parameters.slots)
            .map(Some)
            .map_err(|e| SerializeError::Encode {
                type_name: "Parameters",
                message: e.to_string(),
            })
    }

    /// Decode a parameter payload. "No payload" yields `None`, which is
    /// distinguishable from a present list containing a single null slot.
    pub fn deserialize_parameters(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<Parameters>, SerializeError> {
        let Some(bytes) = payload else {
            return Ok(None);
        };
        let slots: Vec<Option<Vec<u8>>> =
            bincode::deserialize(bytes).map_err(|e| SerializeError::Decode {
                type_name: "Parameters",
                message: e.to_string(),
            })?;
        Ok(Some(Parameters { slots }))
    }
}

/// An ordered list of call parameters.
///
/// Each slot holds one pre-encoded value, or null. Values are encoded and
/// decoded through the registry-checked serializer, so pushing an unlisted
/// type fails loudly at the call site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    slots: Vec<Option<Vec<u8>>>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: WireType>(
        &mut self,
        serializer: &Serializer,
        value: &T,
    ) -> Result<&mut Self, SerializeError> {
        self.slots.push(Some(serializer.serialize(value)?));
        Ok(self)
    }

    /// Push an explicit null slot.
    pub fn push_null(&mut self) -> &mut Self {
        self.slots.push(None);
        self
    }

    /// Decode the parameter at `index`. Null slots and missing indices are
    /// decode errors; use [`Parameters::is_null`] to probe first.
    pub fn get<T: WireType>(
        &self,
        serializer: &Serializer,
        index: usize,
    ) -> Result<T, SerializeError> {
        match self.slots.get(index) {
            Some(Some(bytes)) => serializer.deserialize(bytes),
            Some(None) => Err(SerializeError::Decode {
                type_name: std::any::type_name::<T>(),
                message: format!("parameter {index} is null"),
            }),
            None => Err(SerializeError::Decode {
                type_name: std::any::type_name::<T>(),
                message: format!("parameter {index} is missing (got {})", self.slots.len()),
            }),
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(None))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
