//! # portico
//!
//! An async HTTP/1.1 request-serving engine: typed path routing, an ordered
//! middleware pipeline with before/after hooks, CORS, rate-limit, body-size
//! and bearer-token guards, and a server that drains in-flight work on
//! shutdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use portico::{Config, RequestContext, Response, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut routes = Router::builder();
//!     routes.get("/hello/{name}", |ctx: Arc<RequestContext>| async move {
//!         let name = ctx.params().get_str("name").unwrap_or("stranger").to_owned();
//!         Ok(Response::new(StatusCode::Ok).body(format!("Hello, {name}!")))
//!     });
//!
//!     let server = Server::builder(Config::default()).routes(routes).bind().await?;
//!     server.serve(portico::server::shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

/// Heap-allocated, `Send` future used at every dynamic-dispatch seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use config::Config;
pub use context::{Identity, PathParams, ParamValue, RequestContext};
pub use error::{HandlerError, Rejection};
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use middleware::{Flow, MiddlewareStage, Pipeline, Stage, StageError};
pub use router::{Router, RouterBuilder};
pub use server::{ServeReport, Server, ServerError, ServerState};
