//! Closed wire-type registry.
//!
//! The serializer only handles types that were explicitly listed here at
//! startup. The registry is built once, validated eagerly, and shared
//! read-only afterwards; there is no runtime discovery. Attempting to encode
//! a type that was never registered is a configuration error, not a per-call
//! condition.

use crate::wire::{Request, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use std::collections::HashMap;

/// A value type that may cross the wire.
pub trait WireType: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> WireType for T {}

/// Immutable set of types the serializer will accept.
#[derive(Debug)]
pub struct TypeRegistry {
    names: HashMap<TypeId, &'static str>,
}

impl TypeRegistry {
    pub fn contains<T: 'static>(&self) -> bool {
        self.names.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Error validating the registry at build time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("wire type `{0}` registered twice")]
    Duplicate(&'static str),
    #[error("registry is missing the protocol message shapes")]
    MissingMessageShapes,
}

/// Builder for the closed type set.
///
/// The protocol message shapes and the primitive types are pre-registered;
/// applications add every DTO that may appear as a parameter or result.
pub struct RegistryBuilder {
    names: HashMap<TypeId, &'static str>,
    duplicate: Option<&'static str>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            names: HashMap::new(),
            duplicate: None,
        };
        builder.add::<Request>();
        builder.add::<Response>();
        builder.add::<()>();
        builder.add::<bool>();
        builder.add::<u8>();
        builder.add::<u16>();
        builder.add::<u32>();
        builder.add::<u64>();
        builder.add::<i8>();
        builder.add::<i16>();
        builder.add::<i32>();
        builder.add::<i64>();
        builder.add::<f32>();
        builder.add::<f64>();
        builder.add::<String>();
        builder.add::<Vec<u8>>();
        builder
    }

    fn add<T: WireType>(&mut self) {
        let name = std::any::type_name::<T>();
        if self.names.insert(TypeId::of::<T>(), name).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
    }

    /// Register an application type.
    pub fn register<T: WireType>(mut self) -> Self {
        self.add::<T>();
        self
    }

    /// Validate and freeze the set.
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        if let Some(name) = self.duplicate {
            return Err(RegistryError::Duplicate(name));
        }
        let registry = TypeRegistry { names: self.names };
        if !registry.contains::<Request>() || !registry.contains::<Response>() {
            return Err(RegistryError::MissingMessageShapes);
        }
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub(crate) fn ensure<T: 'static>(&self) -> Result<(), crate::serializer::SerializeError> {
        if self.contains::<T>() {
            Ok(())
        } else {
            Err(crate::serializer::SerializeError::Unregistered {
                type_name: std::any::type_name::<T>(),
            })
        }
    }
}
