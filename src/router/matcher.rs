//! Route pattern compilation and path matching.
//!
//! | Pattern                 | Example match            | Captured params               |
//! |-------------------------|--------------------------|-------------------------------|
//! | `/users`                | `/users`                 | *(none)*                      |
//! | `/users/{id}`           | `/users/ada`             | `id → "ada"`                  |
//! | `/users/{id:int}`       | `/users/42`              | `id → 42`                     |
//! | `/price/{p:float}`      | `/price/19.99`           | `p → 19.99`                   |
//! | `/flags/{on:bool}`      | `/flags/yes`             | `on → true`                   |
//! | `/files/{*path}`        | `/files/docs/readme.txt` | `path → "docs/readme.txt"`    |
//! | `/assets/*`             | `/assets/css/site.css`   | `wildcard → "css/site.css"`   |
//!
//! Patterns are compiled into one segment trie per method. At every segment
//! the candidates are tried most-specific first: a static segment, then the
//! typed parameters in the order `int`, `float`, `bool` (each only when the
//! segment parses), then a `string` parameter, then a wildcard tail. A
//! candidate that fails further down falls through to the next one, so a
//! type mismatch is a non-match rather than an error.
//!
//! Type names accept the usual aliases: `integer`/`i64` for `int`,
//! `f64`/`number` for `float`, `boolean` for `bool`. A `float` must be
//! finite. A `bool` is `true`/`false`, `1`/`0` or `yes`/`no`, in any case.
//!
//! Trailing slashes are normalized on both patterns and paths. Empty interior
//! segments (`/a//b`) never bind a parameter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::context::{ParamValue, PathParams};
use crate::http::Method;

/// Name given to a bare trailing `*`.
pub const DEFAULT_WILDCARD: &str = "wildcard";

/// Errors raised while building the route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route `{method} {pattern}` is ambiguous with `{method} {existing}`")]
    Conflict {
        method: Method,
        pattern: String,
        existing: String,
    },

    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// The declared type of a path parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Int,
    Float,
    Bool,
    Wildcard,
}

/// A parameter as declared in a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(ParamSpec),
}

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: Arc<str>,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a pattern such as `/users/{id:int}/files/{*rest}`.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidPattern`] when the pattern does not start with
    /// `/`, has an empty interior segment, an unknown parameter type, a
    /// repeated parameter name, or a wildcard anywhere but the last position.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let Some(body) = raw.strip_prefix('/') else {
            return Err(invalid("must start with `/`"));
        };
        let body = body.strip_suffix('/').unwrap_or(body);

        let parts: Vec<&str> = if body.is_empty() {
            Vec::new()
        } else {
            body.split('/').collect()
        };

        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            let segment = parse_segment(part).map_err(|reason| invalid(&reason))?;

            if let Segment::Param(spec) = &segment {
                if spec.kind == ParamKind::Wildcard && !last {
                    return Err(invalid("a wildcard must be the final segment"));
                }
                let duplicate = segments.iter().any(|s| {
                    matches!(s, Segment::Param(existing) if existing.name == spec.name)
                });
                if duplicate {
                    return Err(invalid(&format!("parameter `{}` appears twice", spec.name)));
                }
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: Arc::from(raw),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub(crate) fn raw(&self) -> Arc<str> {
        Arc::clone(&self.raw)
    }

    /// Declared parameters, in order.
    pub fn params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(spec) => Some(spec),
            Segment::Static(_) => None,
        })
    }
}

fn parse_segment(part: &str) -> Result<Segment, String> {
    if part.is_empty() {
        return Err("empty path segment".into());
    }
    if part == "*" {
        return Ok(Segment::Param(ParamSpec {
            name: DEFAULT_WILDCARD.into(),
            kind: ParamKind::Wildcard,
        }));
    }

    let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) else {
        if part.contains(['{', '}', '*']) {
            return Err(format!("malformed segment `{part}`"));
        }
        return Ok(Segment::Static(part.to_owned()));
    };

    let (name, kind) = if let Some(name) = inner.strip_prefix('*') {
        (name, ParamKind::Wildcard)
    } else {
        match inner.split_once(':') {
            None => (inner, ParamKind::String),
            Some((name, ty)) => match ty.to_ascii_lowercase().as_str() {
                "string" | "str" => (name, ParamKind::String),
                "int" | "integer" | "i64" => (name, ParamKind::Int),
                "float" | "f64" | "number" => (name, ParamKind::Float),
                "bool" | "boolean" => (name, ParamKind::Bool),
                _ => return Err(format!("unknown parameter type `{ty}`")),
            },
        }
    };

    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("invalid parameter name in `{part}`"));
    }
    Ok(Segment::Param(ParamSpec {
        name: name.to_owned(),
        kind,
    }))
}

// A matched endpoint: the parameter names in pattern order plus the value.
struct Leaf<T> {
    pattern: Arc<str>,
    names: Vec<String>,
    value: T,
}

fn parse_float(segment: &str) -> Option<f64> {
    segment.parse::<f64>().ok().filter(|x| x.is_finite())
}

fn parse_bool(segment: &str) -> Option<bool> {
    match segment.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

struct Node<T> {
    statics: HashMap<String, Node<T>>,
    int: Option<Box<Node<T>>>,
    float: Option<Box<Node<T>>>,
    boolean: Option<Box<Node<T>>>,
    string: Option<Box<Node<T>>>,
    tail: Option<Leaf<T>>,
    leaf: Option<Leaf<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            statics: HashMap::new(),
            int: None,
            float: None,
            boolean: None,
            string: None,
            tail: None,
            leaf: None,
        }
    }
}

impl<T> Node<T> {
    fn find<'a>(&'a self, segments: &[&str], values: &mut Vec<ParamValue>) -> Option<&'a Leaf<T>> {
        let Some((first, rest)) = segments.split_first() else {
            return self.leaf.as_ref();
        };

        if let Some(leaf) = self.statics.get(*first).and_then(|child| child.find(rest, values)) {
            return Some(leaf);
        }
        if first.is_empty() {
            return None;
        }

        let typed = [
            (&self.int, first.parse::<i64>().ok().map(ParamValue::Int)),
            (&self.float, parse_float(first).map(ParamValue::Float)),
            (&self.boolean, parse_bool(first).map(ParamValue::Bool)),
            (&self.string, Some(ParamValue::String((*first).to_owned()))),
        ];
        for (child, value) in typed {
            let (Some(child), Some(value)) = (child, value) else {
                continue;
            };
            values.push(value);
            if let Some(leaf) = child.find(rest, values) {
                return Some(leaf);
            }
            values.pop();
        }

        if let Some(leaf) = &self.tail {
            values.push(ParamValue::String(segments.join("/")));
            return Some(leaf);
        }
        None
    }
}

/// The outcome of resolving a request against the table.
#[derive(Debug)]
pub enum Match<'a, T> {
    Found {
        value: &'a T,
        pattern: &'a Arc<str>,
        params: PathParams,
    },
    NotFound,
    MethodNotAllowed {
        allowed: Vec<Method>,
    },
}

/// Per-method segment tries.
pub struct PathMatcher<T> {
    trees: BTreeMap<Method, Node<T>>,
}

impl<T> Default for PathMatcher<T> {
    fn default() -> Self {
        Self {
            trees: BTreeMap::new(),
        }
    }
}

impl<T> PathMatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route.
    ///
    /// # Errors
    ///
    /// [`RouteError::Conflict`] when `pattern` has the same shape as a
    /// pattern already registered for `method`: the same static segments and
    /// parameter types at every position, differing at most in names.
    pub fn insert(&mut self, method: Method, pattern: &Pattern, value: T) -> Result<(), RouteError> {
        let mut node = self.trees.entry(method.clone()).or_default();
        let mut names = Vec::new();

        for segment in &pattern.segments {
            match segment {
                Segment::Static(s) => {
                    node = node.statics.entry(s.clone()).or_default();
                }
                Segment::Param(spec) => {
                    names.push(spec.name.clone());
                    node = match spec.kind {
                        ParamKind::Int => node.int.get_or_insert_with(Box::default).as_mut(),
                        ParamKind::Float => node.float.get_or_insert_with(Box::default).as_mut(),
                        ParamKind::Bool => node.boolean.get_or_insert_with(Box::default).as_mut(),
                        ParamKind::String => node.string.get_or_insert_with(Box::default).as_mut(),
                        ParamKind::Wildcard => {
                            return place(&mut node.tail, method, pattern, names, value);
                        }
                    };
                }
            }
        }
        place(&mut node.leaf, method, pattern, names, value)
    }

    /// Resolves `method path`.
    ///
    /// A `HEAD` request with no `HEAD` route for the path resolves against
    /// the `GET` route. When the path matches only under other methods the
    /// result lists them (with `HEAD` implied by `GET`).
    pub fn resolve(&self, method: &Method, path: &str) -> Match<'_, T> {
        let segments = split_path(path);

        if let Some(found) = self.find_in(method, &segments) {
            return found;
        }
        if *method == Method::Head {
            if let Some(found) = self.find_in(&Method::Get, &segments) {
                return found;
            }
        }

        let mut allowed: Vec<Method> = self
            .trees
            .iter()
            .filter(|(_, tree)| tree.find(&segments, &mut Vec::new()).is_some())
            .map(|(m, _)| m.clone())
            .collect();

        if allowed.contains(&Method::Get) && !allowed.contains(&Method::Head) {
            allowed.push(Method::Head);
            allowed.sort();
        }

        if allowed.is_empty() {
            Match::NotFound
        } else {
            Match::MethodNotAllowed { allowed }
        }
    }

    fn find_in(&self, method: &Method, segments: &[&str]) -> Option<Match<'_, T>> {
        let tree = self.trees.get(method)?;
        let mut values = Vec::new();
        let leaf = tree.find(segments, &mut values)?;

        let mut params = PathParams::new();
        for (name, value) in leaf.names.iter().zip(values) {
            params.insert(name.clone(), value);
        }
        Some(Match::Found {
            value: &leaf.value,
            pattern: &leaf.pattern,
            params,
        })
    }
}

fn place<T>(
    slot: &mut Option<Leaf<T>>,
    method: Method,
    pattern: &Pattern,
    names: Vec<String>,
    value: T,
) -> Result<(), RouteError> {
    if let Some(existing) = slot {
        return Err(RouteError::Conflict {
            method,
            pattern: pattern.as_str().to_owned(),
            existing: existing.pattern.to_string(),
        });
    }
    *slot = Some(Leaf {
        pattern: pattern.raw(),
        names,
        value,
    });
    Ok(())
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}
