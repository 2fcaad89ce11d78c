//! Worker services and their operation handler tables.
//!
//! A `Service` is a long-running subsystem that exposes a fixed set of named
//! operations. Each operation maps to an async handler taking JSON
//! parameters and returning a JSON result. Because the table is built up
//! front, an unknown operation name is rejected when it is enqueued rather
//! than when it is dispatched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Identifier of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an operation exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationName(pub String);

impl OperationName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for OperationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Async operation handler.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Async lifecycle hook (initialization or liveness probe).
pub type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A worker service with its operation handler table.
///
/// # Example
///
/// ```
/// use autopilot::orchestration::Service;
/// use serde_json::json;
///
/// let service = Service::new("search", "Search Worker")
///     .essential(true)
///     .operation("research", |params| async move {
///         Ok(json!({ "query": params["description"] }))
///     });
///
/// assert!(service.supports(&"research".into()));
/// assert!(!service.supports(&"delete_everything".into()));
/// ```
#[derive(Clone)]
pub struct Service {
    id: ServiceId,
    name: String,
    essential: bool,
    dependencies: Vec<ServiceId>,
    timeout: Option<Duration>,
    handlers: HashMap<OperationName, Handler>,
    initializer: Option<LifecycleHook>,
    probe: Option<LifecycleHook>,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            essential: false,
            dependencies: Vec::new(),
            timeout: None,
            handlers: HashMap::new(),
            initializer: None,
            probe: None,
        }
    }

    /// Mark the service as essential for orchestrator startup.
    pub fn essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    pub fn depends_on(mut self, id: impl Into<ServiceId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Override the configured operation timeout for this service.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register an operation handler.
    ///
    /// Registering the same name twice replaces the earlier handler.
    ///
    /// # Arguments
    ///
    /// * `name` - Operation name callers enqueue against
    /// * `handler` - Async function from JSON parameters to a JSON result
    pub fn operation<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.handlers.insert(OperationName::from(name), handler);
        self
    }

    /// Set the initialization entry point, also used for re-initialization
    /// during auto-recovery.
    pub fn on_initialize<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.initializer = Some(Arc::new(move || init().boxed()));
        self
    }

    /// Set a liveness probe run on every health check.
    pub fn with_probe<F, Fut>(mut self, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.probe = Some(Arc::new(move || probe().boxed()));
        self
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_essential(&self) -> bool {
        self.essential
    }

    pub fn dependencies(&self) -> &[ServiceId] {
        &self.dependencies
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn handler(&self, operation: &OperationName) -> Option<Handler> {
        self.handlers.get(operation).cloned()
    }

    pub fn supports(&self, operation: &OperationName) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Operation names, sorted.
    pub fn operations(&self) -> Vec<&OperationName> {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        names
    }

    /// Run the initialization entry point. Services without one always succeed.
    pub async fn initialize(&self) -> Result<()> {
        match &self.initializer {
            Some(init) => init().await,
            None => Ok(()),
        }
    }

    /// Run the liveness probe, if the service has one.
    pub async fn probe(&self) -> Option<Result<()>> {
        match &self.probe {
            Some(probe) => Some(probe().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("essential", &self.essential)
            .field("operations", &self.operations())
            .finish()
    }
}

/// All registered services, keyed by id.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: HashMap<ServiceId, Arc<Service>>,
    /// Registration order.
    order: Vec<ServiceId>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service.
    ///
    /// # Errors
    /// Returns `Validation` if a service with the same id is registered.
    pub fn register(&mut self, service: Service) -> Result<Arc<Service>> {
        if self.services.contains_key(service.id()) {
            return Err(Error::Validation(format!(
                "service {} is already registered",
                service.id()
            )));
        }
        let id = service.id().clone();
        let service = Arc::new(service);
        self.services.insert(id.clone(), Arc::clone(&service));
        self.order.push(id);
        Ok(service)
    }

    pub fn get(&self, id: &ServiceId) -> Option<Arc<Service>> {
        self.services.get(id).cloned()
    }

    /// Look up the handler for an operation.
    ///
    /// # Errors
    /// `ServiceNotFound` for an unknown service, `OperationNotSupported` for
    /// an operation the service does not expose.
    pub fn resolve(&self, id: &ServiceId, operation: &OperationName) -> Result<Handler> {
        let service = self
            .services
            .get(id)
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))?;
        service
            .handler(operation)
            .ok_or_else(|| Error::OperationNotSupported {
                service: id.clone(),
                operation: operation.clone(),
            })
    }

    /// Services in registration order.
    pub fn all(&self) -> Vec<Arc<Service>> {
        self.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Services ordered so that each comes after the services it depends on.
    ///
    /// Dependencies on unregistered services are ignored; services caught
    /// in a dependency cycle keep their registration order at the end.
    pub fn startup_order(&self) -> Vec<Arc<Service>> {
        let mut ordered: Vec<ServiceId> = Vec::with_capacity(self.order.len());
        let mut remaining: Vec<ServiceId> = self.order.clone();

        loop {
            let before = remaining.len();
            remaining.retain(|id| {
                let ready = self.services[id]
                    .dependencies()
                    .iter()
                    .all(|dep| !self.services.contains_key(dep) || ordered.contains(dep));
                if ready {
                    ordered.push(id.clone());
                }
                !ready
            });
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }
        ordered.extend(remaining);
        ordered.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
