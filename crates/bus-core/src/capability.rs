use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BusError;

/// External capability: bytes ⇄ object. JSON serialization, schema
/// registries, and wire-format concerns live entirely behind this trait —
/// the bus never inspects payload bytes beyond the envelope header.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BusError>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BusError>;
}

/// Default JSON serializer, provided so the core is testable standalone.
/// Production deployments may swap in any other wire format without
/// touching the bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(value).map_err(|e| BusError::SerializationFailed(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::SerializationFailed(e.to_string()))
    }
}

/// External capability: type → instance. Replaces a global/process-wide
/// service-locator with explicit injection — the bus accepts a `Resolver`
/// at construction and hands it to processors; there is no module-level
/// mutable state.
pub trait Resolver: Send + Sync {
    fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>>;
}

/// Simple map-backed resolver, sufficient for tests and small deployments.
/// A production resolver might instead delegate to a DI container; the
/// bus doesn't care as long as the trait above is satisfied.
#[derive(Default, Clone)]
pub struct MapResolver {
    instances: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

pub struct MapResolverBuilder {
    instances: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MapResolverBuilder {
    pub fn new() -> Self {
        Self { instances: HashMap::new() }
    }

    pub fn register<H: Send + Sync + 'static>(mut self, instance: Arc<H>) -> Self {
        self.instances.insert(TypeId::of::<H>(), instance);
        self
    }

    pub fn build(self) -> MapResolver {
        MapResolver { instances: Arc::new(self.instances) }
    }
}

impl Default for MapResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for MapResolver {
    fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        self.instances
            .get(&TypeId::of::<H>())
            .and_then(|instance| instance.clone().downcast::<H>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn json_serializer_round_trips() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&Payload { value: 7 }).unwrap();
        let restored: Payload = serializer.deserialize(&bytes).unwrap();
        assert_eq!(restored, Payload { value: 7 });
    }

    struct Greeter;

    #[test]
    fn map_resolver_resolves_registered_type() {
        let resolver = MapResolverBuilder::new().register(Arc::new(Greeter)).build();
        assert!(resolver.resolve::<Greeter>().is_some());
    }

    struct Unregistered;

    #[test]
    fn map_resolver_returns_none_for_unregistered_type() {
        let resolver = MapResolverBuilder::new().register(Arc::new(Greeter)).build();
        assert!(resolver.resolve::<Unregistered>().is_none());
    }
}
