//! Bearer-token authentication.
//!
//! Protected routes require an `Authorization: Bearer <jwt>` header signed
//! with the server's HS256 secret. Verification failures are classified so
//! that clients can tell an expired token (refresh it) from a forged or
//! malformed one (don't).

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::context::{Identity, RequestContext};
use crate::error::Rejection;
use crate::http::Headers;
use crate::middleware::{Flow, Stage, StageError};

const REALM: &str = "portico";

/// Why a request failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
}

impl AuthFailure {
    /// Stable machine-readable reason, reported in 401 bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::MissingToken => "missing_token",
            AuthFailure::InvalidSignature => "invalid_signature",
            AuthFailure::Expired => "expired",
        }
    }

    /// `WWW-Authenticate` value (RFC 6750 section 3).
    pub fn challenge(&self) -> String {
        match self {
            AuthFailure::MissingToken => format!("Bearer realm=\"{REALM}\""),
            other => format!(
                "Bearer realm=\"{REALM}\", error=\"invalid_token\", error_description=\"{other}\""
            ),
        }
    }
}

/// Verifies HS256 bearer tokens on routes marked protected.
///
/// Unprotected routes pass through untouched. On success the token's claims
/// are attached to the context as an [`Identity`]; on failure the request is
/// answered with `401 Unauthorized` and the handler never runs.
pub struct AuthGuard {
    key: DecodingKey,
    validation: Validation,
}

impl AuthGuard {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // A token is expired at `exp`, not a minute later.
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Checks a raw token. Anything other than an expired but otherwise
    /// valid token is reported as [`AuthFailure::InvalidSignature`].
    pub fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        match decode::<Map<String, Value>>(token, &self.key, &self.validation) {
            Ok(data) => Ok(Identity::new(data.claims)),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(AuthFailure::Expired),
                kind => {
                    debug!(error = ?kind, "token rejected");
                    Err(AuthFailure::InvalidSignature)
                }
            },
        }
    }

    /// Extracts the bearer token from `headers` and verifies it.
    pub fn authenticate(&self, headers: &Headers) -> Result<Identity, AuthFailure> {
        let token = bearer_token(headers).ok_or(AuthFailure::MissingToken)?;
        self.verify(token)
    }
}

fn bearer_token(headers: &Headers) -> Option<&str> {
    let value = headers.get("authorization")?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

impl Stage for AuthGuard {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        let flow = if !ctx.is_protected() {
            Flow::Continue
        } else {
            match self.authenticate(ctx.headers()) {
                Ok(identity) => {
                    debug!(subject = identity.subject().unwrap_or("-"), "authenticated");
                    ctx.set_identity(identity);
                    Flow::Continue
                }
                Err(failure) => {
                    warn!(path = ctx.path(), reason = failure.reason(), "authentication failed");
                    Flow::Respond(Rejection::Unauthorized(failure).into_response())
                }
            }
        };
        Box::pin(async move { Ok(flow) })
    }
}
