//! Request-level failure taxonomy.
//!
//! Everything that can stop a request short of a handler-produced response is
//! a [`Rejection`]. Rejections never escape the pipeline as errors: each one
//! renders to a structured response carrying a machine-readable code, so the
//! client always gets an answer instead of a dropped connection. The one
//! exception is [`Rejection::DrainTimeout`], whose connection is closed
//! without writing anything.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::http::{BodyError, Method, Response, StatusCode};
use crate::security::AuthFailure;

/// A terminal outcome produced by the engine rather than by the application.
#[derive(Debug, Clone, Error)]
pub enum Rejection {
    #[error("no route matches this path")]
    NotFound,

    #[error("method not allowed; this path accepts {}", join_methods(.allowed))]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Unauthorized(AuthFailure),

    #[error("middleware stage `{stage}` failed")]
    InternalMiddlewareError { stage: &'static str },

    #[error("the request handler failed")]
    HandlerFailed,

    #[error("request did not complete within {}ms", .after.as_millis())]
    RequestTimeout { after: Duration },

    #[error("server shut down before the request completed")]
    DrainTimeout,

    #[error("malformed request: {detail}")]
    BadRequest { detail: String },

    #[error("request head too large")]
    HeadTooLarge,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    message: String,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NotFound,
            Self::MethodNotAllowed { .. } => StatusCode::MethodNotAllowed,
            Self::PayloadTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::RateLimited { .. } => StatusCode::TooManyRequests,
            Self::Unauthorized(_) => StatusCode::Unauthorized,
            Self::InternalMiddlewareError { .. } | Self::HandlerFailed => {
                StatusCode::InternalServerError
            }
            Self::RequestTimeout { .. } | Self::DrainTimeout => StatusCode::ServiceUnavailable,
            Self::BadRequest { .. } => StatusCode::BadRequest,
            Self::HeadTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
        }
    }

    /// Machine-readable code written as the `error` field of the body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::InternalMiddlewareError { .. } => "internal_middleware_error",
            Self::HandlerFailed => "handler_failed",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::DrainTimeout => "drain_timeout",
            Self::BadRequest { .. } => "bad_request",
            Self::HeadTooLarge => "head_too_large",
        }
    }

    /// Finer-grained reason, where a code has more than one cause.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized(failure) => Some(failure.reason()),
            _ => None,
        }
    }

    /// Renders the rejection as a JSON response with the matching protocol
    /// headers (`Allow`, `Retry-After`, `WWW-Authenticate`).
    pub fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            reason: self.reason(),
            message: self.to_string(),
        };
        let mut response = Response::json(self.status(), &body);

        match &self {
            Self::MethodNotAllowed { allowed } => {
                response.set_header("Allow", join_methods(allowed));
            }
            Self::RateLimited {
                retry_after: Some(wait),
            } => {
                response.set_header("Retry-After", retry_after_secs(*wait).to_string());
            }
            Self::Unauthorized(failure) => {
                response.set_header("WWW-Authenticate", failure.challenge());
            }
            Self::PayloadTooLarge { .. } | Self::BadRequest { .. } | Self::HeadTooLarge => {
                response = response.keep_alive(false);
            }
            _ => {}
        }
        response
    }
}

impl From<Rejection> for Response {
    fn from(rejection: Rejection) -> Self {
        rejection.into_response()
    }
}

impl From<BodyError> for Rejection {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::TooLarge { limit, .. } => Rejection::PayloadTooLarge { limit },
            BodyError::Io(err) => Rejection::BadRequest {
                detail: format!("unreadable body: {err}"),
            },
        }
    }
}

fn join_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Opaque failure returned by an application handler.
///
/// Any `std::error::Error` converts into it with `?`; plain messages go
/// through [`HandlerError::msg`]. The engine logs the cause and answers with
/// a generic [`Rejection::HandlerFailed`].
pub struct HandlerError {
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl HandlerError {
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            inner: message.to_string().into(),
        }
    }

    /// The underlying cause.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            inner: Box::new(err),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}
