//! Per-request context: the state threaded through the pipeline.
//!
//! A [`RequestContext`] is created by the connection task for every parsed
//! request head and is exclusively owned by that task. Before-hooks see it
//! mutably; the handler and the after-hooks see it read-only.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use serde::{Serialize, Serializer, ser::SerializeMap};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::http::{Body, Headers, Method, Request};
use crate::middleware::Interrupt;

/// Type-erased request extensions map, used by stages to hand per-request
/// state to later stages and to handlers without knowing each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A typed path parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamValue::String(s) => serializer.serialize_str(s),
            ParamValue::Int(n) => serializer.serialize_i64(*n),
            ParamValue::Float(x) => serializer.serialize_f64(*x),
            ParamValue::Bool(b) => serializer.serialize_bool(*b),
        }
    }
}

/// Path parameters extracted from the matched route, in pattern order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathParams {
    entries: Vec<(String, ParamValue)>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    /// The value of a `string` (or wildcard) parameter.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value of an `int` parameter.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParamValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PathParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// The authenticated caller, decoded from a verified bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    claims: Map<String, Value>,
}

impl Identity {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// The `sub` claim, when it is a string.
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// What the router knows about the route a request resolved to.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub(crate) pattern: Arc<str>,
    pub(crate) protected: bool,
}

impl RouteInfo {
    /// The pattern as it was registered, e.g. `/users/{id:int}`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

/// Per-request state threaded through the middleware pipeline.
///
/// # Examples
///
/// ```
/// use portico::context::RequestContext;
/// use portico::http::{Body, Request};
///
/// let (head, _) = Request::parse(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
/// let ctx = RequestContext::new(head, "127.0.0.1:9000".parse().unwrap(), Body::Empty);
///
/// assert_eq!(ctx.path(), "/ping");
/// assert!(ctx.identity().is_none());
/// ```
#[derive(Debug)]
pub struct RequestContext {
    request: Request,
    peer: SocketAddr,
    body: Body,
    params: PathParams,
    route: Option<RouteInfo>,
    identity: Option<Identity>,
    started_at: Instant,
    marks: Vec<(&'static str, Instant)>,
    extensions: Extensions,
    interrupted: OnceLock<Interrupt>,
}

impl RequestContext {
    pub fn new(request: Request, peer: SocketAddr, body: Body) -> Self {
        Self {
            request,
            peer,
            body,
            params: PathParams::new(),
            route: None,
            identity: None,
            started_at: Instant::now(),
            marks: Vec::new(),
            extensions: Extensions::new(),
            interrupted: OnceLock::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.path()
    }

    pub fn headers(&self) -> &Headers {
        self.request.headers()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// The buffered body bytes. Empty while the body is still unread.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_bytes().map_or(&[], |b| &b[..])
    }

    /// Deserializes the buffered body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.body_bytes())
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub(crate) fn set_route(&mut self, route: RouteInfo, params: PathParams) {
        self.route = Some(route);
        self.params = params;
    }

    /// The matched route, `None` for engine-generated responses such as 404.
    pub fn route(&self) -> Option<&RouteInfo> {
        self.route.as_ref()
    }

    pub fn is_protected(&self) -> bool {
        self.route.as_ref().is_some_and(RouteInfo::is_protected)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Records a named point in time.
    pub fn mark(&mut self, name: &'static str) {
        self.marks.push((name, Instant::now()));
    }

    /// The most recent instant recorded under `name`.
    pub fn mark_at(&self, name: &str) -> Option<Instant> {
        self.marks
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, at)| *at)
    }

    /// Set before the after-hooks run when the request was cut short by a
    /// timeout or the drain deadline.
    pub fn interrupted(&self) -> Option<Interrupt> {
        self.interrupted.get().copied()
    }

    pub(crate) fn set_interrupted(&self, reason: Interrupt) {
        let _ = self.interrupted.set(reason);
    }

    /// When the request head finished parsing.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) const PEER: &str = "10.0.0.7:41000";

    /// Context for `method path` with the given extra header lines.
    pub(crate) fn context(method: &str, path: &str, headers: &[(&str, &str)]) -> RequestContext {
        let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        RequestContext::new(request, PEER.parse().unwrap(), Body::Empty)
    }
}
