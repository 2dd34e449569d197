//! Minimal portico server.
//!
//! ```text
//! cargo run --example hello
//! curl localhost:8000/hello/Ada
//! curl localhost:8000/routes
//! ```
//!
//! Set `RUST_LOG=portico=debug` for per-stage logging, or pass a TOML config
//! path as the first argument.

use std::sync::Arc;

use portico::{Config, HandlerError, RequestContext, Response, Router, Server, StatusCode};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portico=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut routes = Router::builder();
    routes.get("/hello/{name}", |ctx: Arc<RequestContext>| async move {
        let name = ctx.params().get_str("name").unwrap_or("stranger").to_owned();
        Ok(Response::new(StatusCode::Ok).body(format!("Hello, {name}!")))
    });
    routes.get("/users/{id:int}", |ctx: Arc<RequestContext>| async move {
        let id = ctx.params().get_int("id").unwrap_or_default();
        Ok(Response::json(StatusCode::Ok, &json!({ "id": id })))
    });
    routes.post("/echo", |ctx: Arc<RequestContext>| async move {
        let value: serde_json::Value = ctx.json().map_err(HandlerError::from)?;
        Ok(Response::json(StatusCode::Ok, &value))
    });
    if config.jwt_secret.is_some() {
        routes
            .get("/me", |ctx: Arc<RequestContext>| async move {
                let claims = ctx.identity().map(|identity| identity.claims().clone());
                Ok(Response::json(StatusCode::Ok, &claims))
            })
            .protected();
    }

    let server = Server::builder(config).routes(routes).bind().await?;
    println!("listening on http://{}", server.local_addr());

    let report = server.serve(portico::server::shutdown_signal()).await?;
    println!(
        "served {} connections ({} forced)",
        report.served_connections, report.forced_connections
    );
    Ok(())
}
