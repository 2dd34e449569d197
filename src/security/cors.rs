//! Cross-Origin Resource Sharing.

use crate::BoxFuture;
use crate::config::CorsConfig;
use crate::context::RequestContext;
use crate::http::{Method, Response, StatusCode};
use crate::middleware::{Flow, Stage, StageError};

/// CORS stage: validates the `Origin` header, answers preflight requests
/// and adds `Access-Control-*` headers to actual responses.
///
/// # Behavior
///
/// - Requests without an `Origin` header, or from an origin not on the
///   allow-list, pass through untouched.
/// - A preflight (`OPTIONS` carrying `Access-Control-Request-Method`) is
///   answered with `204 No Content` right away, so guards ordered after this
///   stage (rate limit, auth) never see it.
/// - Other requests run normally and get the CORS headers on the way out.
/// - `Vary: Origin` is added whenever a specific origin is echoed back.
///
/// # Examples
///
/// ```rust
/// use portico::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://app.example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-Id");
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age_secs: u64,
}

impl Default for Cors {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
            max_age_secs: 3600,
        }
    }
}

impl Cors {
    /// No origins allowed yet; common methods and headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every origin allowed (`Access-Control-Allow-Origin: *`).
    pub fn permissive() -> Self {
        Self::new().allow_origin("*")
    }

    pub fn from_config(config: &CorsConfig) -> Self {
        let defaults = Self::default();
        Self {
            allowed_origins: config.origin.to_vec(),
            allowed_methods: config.methods.clone().unwrap_or(defaults.allowed_methods),
            allowed_headers: config.headers.clone().unwrap_or(defaults.allowed_headers),
            max_age_secs: config.max_age_secs,
        }
    }

    /// Adds an allowed origin. `"*"` allows all of them.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    // The `Access-Control-Allow-Origin` value for this request, if any.
    fn allowed_origin(&self, ctx: &RequestContext) -> Option<String> {
        let origin = ctx.headers().get("origin")?;
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        response.set_header("Access-Control-Allow-Origin", allow_origin);
        response.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
        response.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

fn is_preflight(ctx: &RequestContext) -> bool {
    *ctx.method() == Method::Options && ctx.headers().contains("access-control-request-method")
}

impl Stage for Cors {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        let flow = match self.allowed_origin(ctx) {
            Some(allow_origin) if is_preflight(ctx) => {
                let mut response = Response::new(StatusCode::NoContent)
                    .header("Access-Control-Max-Age", self.max_age_secs.to_string());
                self.decorate(&mut response, &allow_origin);
                Flow::Respond(response)
            }
            _ => Flow::Continue,
        };
        Box::pin(async move { Ok(flow) })
    }

    fn after<'a>(
        &'a self,
        ctx: &'a RequestContext,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        // Preflight answers were decorated in `before`.
        if !is_preflight(ctx) {
            if let Some(allow_origin) = self.allowed_origin(ctx) {
                self.decorate(response, &allow_origin);
            }
        }
        Box::pin(async { Ok(()) })
    }
}
