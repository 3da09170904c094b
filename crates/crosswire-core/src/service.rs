//! Service invocation registry.
//!
//! Maps `(service, method)` to a callable bound once at registration time;
//! dispatch is a pair of map lookups, never runtime introspection. The
//! registry is built during the startup registration phase and treated as
//! read-only afterwards.

use crate::serializer::{Parameters, Serializer};
use crate::wire::{Request, Response};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Identifies the peer that issued the call being dispatched.
///
/// Supplied by the engine, never taken from the wire payload. On the server
/// this is the peer's `client_id`; the application can resolve it back to a
/// peer handle to call the peer in return.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    id: String,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Error type method bodies may return; its message text travels back to the
/// caller unchanged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, HandlerError>> + Send>>;
type Handler = Box<dyn Fn(Caller, Option<Parameters>) -> HandlerFuture + Send + Sync>;

/// Dispatch failure, distinguishable by the caller so it can tell which RPC
/// name space is missing. Both lookup misses are raised before any user code
/// runs; `Application` propagates the method body's own error.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Service '{service}' not found")]
    ServiceNotFound { service: String },
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("{0}")]
    Application(HandlerError),
}

/// One registered service: a wire name and its bound method table.
struct Service {
    methods: HashMap<String, Handler>,
}

/// Builder for one service's method table.
///
/// The service name chosen here is the wire identifier; renaming the
/// implementing type never breaks compatibility.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Handler>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Bind a method body. The closure receives the caller context and the
    /// decoded parameter list (`None` when the request carried no payload),
    /// and returns the encoded result — `Ok(None)` for void methods, which
    /// is never serialized as a placeholder value.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Caller, Option<Parameters>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<u8>>, HandlerError>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Box::new(move |caller, params| Box::pin(body(caller, params))));
        self
    }

    /// Bind a synchronous method body.
    pub fn sync_method<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Caller, Option<Parameters>) -> Result<Option<Vec<u8>>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.method(name, move |caller, params| {
            std::future::ready(body(caller, params))
        })
    }
}

/// Read-only table of every service exposed by this role.
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registration error: two services claimed the same wire name. Raised at
/// build time, like the wire-type registry's duplicate check.
#[derive(Debug, Clone, thiserror::Error)]
#[error("service '{0}' registered twice")]
pub struct DuplicateService(pub String);

/// Builder for the whole registry; one per engine role, built at startup.
#[derive(Default)]
pub struct ServiceRegistryBuilder {
    services: HashMap<String, Service>,
    duplicate: Option<String>,
}

impl ServiceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, builder: ServiceBuilder) -> Self {
        let name = builder.name;
        if self
            .services
            .insert(
                name.clone(),
                Service {
                    methods: builder.methods,
                },
            )
            .is_some()
            && self.duplicate.is_none()
        {
            self.duplicate = Some(name);
        }
        self
    }

    /// Validate and freeze the table.
    pub fn build(self) -> Result<Arc<ServiceRegistry>, DuplicateService> {
        if let Some(name) = self.duplicate {
            return Err(DuplicateService(name));
        }
        Ok(Arc::new(ServiceRegistry {
            services: self.services,
        }))
    }
}

impl ServiceRegistry {
    /// An empty registry, for a role that exposes no services.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            services: HashMap::new(),
        })
    }

    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new()
    }

    /// Dispatch one call. Lookup misses are raised before the method body
    /// runs; an asynchronously-completing body is driven to completion and
    /// its result unwrapped.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        caller: Caller,
        parameters: Option<Parameters>,
    ) -> Result<Option<Vec<u8>>, InvokeError> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| InvokeError::ServiceNotFound {
                service: service.to_string(),
            })?;
        let handler = entry
            .methods
            .get(method)
            .ok_or_else(|| InvokeError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;
        handler(caller, parameters)
            .await
            .map_err(InvokeError::Application)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Dispatch an inbound [`Request`] and compose the wire frame of its
/// [`Response`], carrying the same id.
///
/// Returns `None` when the request's parameter payload is malformed: such
/// messages are logged and dropped without a response, isolated from every
/// other call on the connection.
pub async fn handle_request(
    serializer: &Serializer,
    services: &ServiceRegistry,
    caller: Caller,
    request: Request,
) -> Option<Vec<u8>> {
    let parameters = match serializer.deserialize_parameters(request.parameters.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                "dropping request {} ({}/{}): malformed parameters: {}",
                request.id,
                request.service,
                request.method,
                e
            );
            return None;
        }
    };

    let response = match services
        .invoke(&request.service, &request.method, caller, parameters)
        .await
    {
        Ok(result) => Response::ok(request.id, result),
        Err(e) => {
            tracing::debug!(
                "request {} ({}/{}) failed: {}",
                request.id,
                request.service,
                request.method,
                e
            );
            Response::failure(request.id, e.to_string())
        }
    };

    match crate::wire::encode_response(serializer, &response) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!("failed to encode response {}: {}", response.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::wire::{Inbound, decode};

    fn serializer() -> Arc<Serializer> {
        Arc::new(Serializer::new(RegistryBuilder::new().build().unwrap()))
    }

    fn inventory(serializer: Arc<Serializer>) -> Arc<ServiceRegistry> {
        let s = Arc::clone(&serializer);
        ServiceRegistry::builder()
            .service(ServiceBuilder::new("Inventory").method("AddItem", move |_caller, params| {
                let s = Arc::clone(&s);
                async move {
                    let params = params.ok_or("AddItem requires parameters")?;
                    let _name: String = params.get(&s, 0)?;
                    let qty: i32 = params.get(&s, 1)?;
                    Ok(Some(s.serialize(&(qty + 1))?))
                }
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn bound_method_dispatches_with_caller_context() {
        let s = serializer();
        let services = inventory(Arc::clone(&s));
        let mut params = Parameters::new();
        params.push(&s, &"apple".to_string()).unwrap();
        params.push(&s, &2i32).unwrap();
        let result = services
            .invoke("Inventory", "AddItem", Caller::new("peer-1"), Some(params))
            .await
            .unwrap();
        assert_eq!(s.deserialize::<i32>(&result.unwrap()).unwrap(), 3);
    }

    #[tokio::test]
    async fn lookup_misses_are_distinguishable_and_precede_user_code() {
        let s = serializer();
        let services = inventory(Arc::clone(&s));

        let err = services
            .invoke("Bank", "Deposit", Caller::new("peer-1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Service 'Bank' not found");

        let err = services
            .invoke("Inventory", "RemoveItem", Caller::new("peer-1"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Method 'RemoveItem' not found in service 'Inventory'"
        );
    }

    #[tokio::test]
    async fn application_error_text_is_preserved_unwrapped() {
        let services = ServiceRegistry::builder()
            .service(
                ServiceBuilder::new("Inventory").sync_method("Explode", |_caller, _params| {
                    Err("inventory is full".into())
                }),
            )
            .build()
            .unwrap();
        let err = services
            .invoke("Inventory", "Explode", Caller::new("peer-1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "inventory is full");
    }

    #[tokio::test]
    async fn handle_request_echoes_the_id_and_normalizes_void() {
        let s = serializer();
        let services = ServiceRegistry::builder()
            .service(ServiceBuilder::new("Inventory").method("Clear", |_caller, _params| async {
                Ok(None)
            }))
            .build()
            .unwrap();
        let request = Request {
            id: 41,
            service: "Inventory".into(),
            method: "Clear".into(),
            parameters: None,
        };
        let frame = handle_request(&s, &services, Caller::new("peer-1"), request)
            .await
            .unwrap();
        match decode(&s, &frame).unwrap() {
            Inbound::Response(resp) => {
                assert_eq!(resp.id, 41);
                assert!(resp.success);
                assert_eq!(resp.result, None);
                assert_eq!(resp.error, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn duplicate_service_name_fails_at_build_time() {
        let err = ServiceRegistry::builder()
            .service(ServiceBuilder::new("Inventory").sync_method("A", |_c, _p| Ok(None)))
            .service(ServiceBuilder::new("Inventory").sync_method("B", |_c, _p| Ok(None)))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "service 'Inventory' registered twice");
    }

    #[tokio::test]
    async fn malformed_parameters_are_dropped_without_a_response() {
        let s = serializer();
        let services = inventory(Arc::clone(&s));
        let request = Request {
            id: 5,
            service: "Inventory".into(),
            method: "AddItem".into(),
            parameters: Some(vec![0xFF; 3]),
        };
        assert!(
            handle_request(&s, &services, Caller::new("peer-1"), request)
                .await
                .is_none()
        );
    }
}
