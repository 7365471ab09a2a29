//! URL routing.
//!
//! A [`Router`] tries its services in registration order and the first one
//! that resolves the url wins. A [`ServiceTable`] resolves by exact,
//! case-sensitive url. Registration happens before serving starts; routers
//! are read-only afterwards.

use crate::error::CoreError;
use crate::operation::{BeginOperation, EndOperation, TypedBeginOperation, TypedEndOperation};
use fabricrpc_protocol::{Message, Status};
use fabricrpc_transport::{CallbackRef, Context};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The operation pair a url resolves to.
#[derive(Clone)]
pub struct Route {
    pub begin: Arc<dyn BeginOperation>,
    pub end: Arc<dyn EndOperation>,
}

/// Resolves urls to operations.
pub trait MiddleWare: Send + Sync {
    fn route(&self, url: &str) -> Result<Route, Status>;
}

/// Ordered set of services; first match wins.
#[derive(Default)]
pub struct Router {
    services: Vec<Arc<dyn MiddleWare>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Arc<dyn MiddleWare>) -> Self {
        self.services.push(service);
        self
    }

    pub fn add_service(&mut self, service: Arc<dyn MiddleWare>) {
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl MiddleWare for Router {
    fn route(&self, url: &str) -> Result<Route, Status> {
        self.services
            .iter()
            .find_map(|service| service.route(url).ok())
            .ok_or_else(|| Status::not_found(format!("method not found: {}", url)))
    }
}

/// A service's methods keyed by full url, e.g. `/pkg.Echo/Say`.
pub struct ServiceTable {
    name: String,
    methods: HashMap<String, Route>,
}

impl ServiceTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Registers a type-erased operation pair.
    pub fn register_route(&mut self, url: impl Into<String>, route: Route) -> Result<(), CoreError> {
        let url = url.into();
        if !url.starts_with('/') {
            return Err(CoreError::InvalidUrl(url));
        }
        if self.methods.contains_key(&url) {
            return Err(CoreError::DuplicateMethod(url));
        }
        tracing::debug!("Registered method {} on service {}", url, self.name);
        self.methods.insert(url, route);
        Ok(())
    }

    /// Registers a typed begin/end handler pair.
    pub fn register<Req, Resp, B, E>(
        &mut self,
        url: impl Into<String>,
        begin: B,
        end: E,
    ) -> Result<(), CoreError>
    where
        Req: Message,
        Resp: Message,
        B: Fn(Req, Duration, CallbackRef) -> Result<Context, Status> + Send + Sync + 'static,
        E: Fn(&Context) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        let route = Route {
            begin: Arc::new(TypedBeginOperation::new(begin)),
            end: Arc::new(TypedEndOperation::new(end)),
        };
        self.register_route(url, route)
    }
}

impl MiddleWare for ServiceTable {
    fn route(&self, url: &str) -> Result<Route, Status> {
        self.methods
            .get(url)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("method not found: {}", url)))
    }
}
