//! Request routing: map methods and URL patterns to handler functions.
//!
//! Routes are registered on a [`RouterBuilder`] during startup and compiled
//! once into an immutable [`Router`]. Compilation rejects malformed and
//! ambiguous patterns, so a server never starts with a route table it cannot
//! resolve deterministically. See [`matcher`] for the pattern syntax and the
//! specificity rules.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::BoxFuture;
use crate::context::{PathParams, RequestContext, RouteInfo};
use crate::error::HandlerError;
use crate::http::{Method, Response};

pub mod matcher;

pub use matcher::{Match, ParamKind, ParamSpec, PathMatcher, Pattern, RouteError};

/// Type-erased async application handler.
///
/// The handler gets read access to the request context and returns either a
/// response descriptor or a [`HandlerError`]. You never build one directly:
/// the registration methods on [`RouterBuilder`] accept any async function
/// of the right shape and erase it with [`boxed`].
pub type Handler = Arc<
    dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, Result<Response, HandlerError>>
        + Send
        + Sync
        + 'static,
>;

/// Erases the concrete handler type.
pub fn boxed<H, F>(handler: H) -> Handler
where
    H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(
        move |ctx: Arc<RequestContext>| -> BoxFuture<'static, Result<Response, HandlerError>> {
            Box::pin(handler(ctx))
        },
    )
}

/// A route as registered, before compilation.
pub struct RouteDef {
    method: Method,
    pattern: String,
    handler: Handler,
    protected: bool,
}

impl RouteDef {
    /// Requires a verified bearer token for this route.
    pub fn protected(&mut self) -> &mut Self {
        self.protected = true;
        self
    }
}

/// Collects routes during startup.
///
/// # Examples
///
/// ```rust
/// use portico::{Response, Router, StatusCode};
///
/// let mut routes = Router::builder();
/// routes.get("/ping", |_ctx| async { Ok(Response::new(StatusCode::Ok)) });
/// routes
///     .delete("/users/{id:int}", |_ctx| async { Ok(Response::new(StatusCode::NoContent)) })
///     .protected();
///
/// let router = routes.compile().unwrap();
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct RouterBuilder {
    defs: Vec<RouteDef>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn patch<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    pub fn delete<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn head<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Head, pattern, handler)
    }

    pub fn options<H, F>(&mut self, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    /// Registers `handler` for `method` requests matching `pattern`.
    pub fn route<H, F>(&mut self, method: Method, pattern: &str, handler: H) -> &mut RouteDef
    where
        H: Fn(Arc<RequestContext>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let handler = boxed(handler);
        let index = self.defs.len();
        self.defs.push(RouteDef {
            method,
            pattern: pattern.to_owned(),
            handler,
            protected: false,
        });
        &mut self.defs[index]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn has_protected(&self) -> bool {
        self.defs.iter().any(|d| d.protected)
    }

    /// Compiles the registered routes into an immutable table.
    ///
    /// # Errors
    ///
    /// The first [`RouteError`] found, in registration order.
    pub fn compile(self) -> Result<Router, RouteError> {
        let mut matcher = PathMatcher::new();
        let mut routes = Vec::with_capacity(self.defs.len());

        for def in self.defs {
            let pattern = Pattern::parse(&def.pattern)?;
            let route = Arc::new(Route {
                info: RouteInfo {
                    pattern: pattern.raw(),
                    protected: def.protected,
                },
                method: def.method.clone(),
                pattern,
                handler: def.handler,
            });
            matcher.insert(def.method, &route.pattern, Arc::clone(&route))?;
            routes.push(route);
        }

        tracing::debug!(routes = routes.len(), "route table compiled");
        Ok(Router { matcher, routes })
    }
}

/// A compiled route.
pub struct Route {
    method: Method,
    pattern: Pattern,
    info: RouteInfo,
    handler: Handler,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn is_protected(&self) -> bool {
        self.info.protected
    }

    pub fn info(&self) -> &RouteInfo {
        &self.info
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .field("protected", &self.info.protected)
            .finish_non_exhaustive()
    }
}

/// How a request resolved against the table.
#[derive(Debug)]
pub enum Resolution {
    Matched { route: Arc<Route>, params: PathParams },
    NotFound,
    MethodNotAllowed { allowed: Vec<Method> },
}

/// Machine-readable description of one route, as served by the routes
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDescriptor {
    pub method: String,
    pub pattern: String,
    pub params: Vec<ParamSpec>,
    pub protected: bool,
}

/// The immutable dispatch table. Shared read-only across connections.
pub struct Router {
    matcher: PathMatcher<Arc<Route>>,
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        match self.matcher.resolve(method, path) {
            Match::Found { value, params, .. } => Resolution::Matched {
                route: Arc::clone(value),
                params,
            },
            Match::NotFound => Resolution::NotFound,
            Match::MethodNotAllowed { allowed } => Resolution::MethodNotAllowed { allowed },
        }
    }

    /// Every route, in registration order.
    pub fn describe(&self) -> Vec<RouteDescriptor> {
        self.routes
            .iter()
            .map(|route| RouteDescriptor {
                method: route.method.to_string(),
                pattern: route.pattern.as_str().to_owned(),
                params: route.pattern.params().cloned().collect(),
                protected: route.info.protected,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
