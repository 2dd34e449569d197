//! Guards and cross-origin policy.
//!
//! - [`Cors`]: `Access-Control-*` headers and preflight short-circuiting.
//! - [`BodyLimitGuard`]: streaming request-body size enforcement.
//! - [`RateLimitStage`]: per-key token buckets ([`RateLimiter`]).
//! - [`AuthGuard`]: bearer-token verification for protected routes.

pub mod auth;
pub mod body_limit;
pub mod cors;
pub mod rate_limit;

pub use auth::{AuthFailure, AuthGuard};
pub use body_limit::BodyLimitGuard;
pub use cors::Cors;
pub use rate_limit::{Decision, KeyStrategy, RateLimitStage, RateLimiter};
