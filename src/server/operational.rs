//! Built-in health and route-listing endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use super::lifecycle::{Lifecycle, ServerState};
use crate::config::OperationalConfig;
use crate::context::RequestContext;
use crate::http::{Response, StatusCode};
use crate::router::{Router, RouterBuilder};

#[derive(Debug, Serialize)]
struct Health {
    status: ServerState,
    active_connections: usize,
}

/// The route listing, filled in once the table is compiled.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouteListing(Arc<OnceLock<String>>);

impl RouteListing {
    pub(crate) fn publish(&self, router: &Router) {
        let listing = serde_json::to_string(&router.describe()).unwrap_or_else(|_| "[]".to_owned());
        let _ = self.0.set(listing);
    }
}

/// Adds the health and route-listing routes to `routes`.
pub(crate) fn register(
    routes: &mut RouterBuilder,
    config: &OperationalConfig,
    lifecycle: Lifecycle,
    active: Arc<AtomicUsize>,
) -> RouteListing {
    routes.get(&config.health_path, move |_ctx: Arc<RequestContext>| {
        let health = Health {
            status: lifecycle.state(),
            active_connections: active.load(Ordering::Relaxed),
        };
        async move {
            let status = if health.status == ServerState::Ready {
                StatusCode::Ok
            } else {
                StatusCode::ServiceUnavailable
            };
            Ok(Response::json(status, &health))
        }
    });

    let listing = RouteListing::default();
    let published = listing.clone();
    routes.get(&config.routes_path, move |_ctx: Arc<RequestContext>| {
        let body = published.0.get().cloned().unwrap_or_else(|| "[]".to_owned());
        async move {
            Ok(Response::new(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body(body))
        }
    });
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::http::Method;
    use crate::router::Resolution;

    async fn call(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let Resolution::Matched { route, params } = router.resolve(&Method::Get, path) else {
            panic!("{path} did not resolve");
        };
        let mut ctx = context("GET", path, &[]);
        ctx.set_route(route.info().clone(), params);
        let response = (route.handler())(Arc::new(ctx)).await.unwrap();
        let body = serde_json::from_slice(response.body_ref()).unwrap();
        (response.status(), body)
    }

    #[tokio::test]
    async fn health_tracks_lifecycle() {
        let lifecycle = Lifecycle::new();
        let active = Arc::new(AtomicUsize::new(3));
        let mut routes = RouterBuilder::new();
        let listing = register(
            &mut routes,
            &OperationalConfig::default(),
            lifecycle.clone(),
            Arc::clone(&active),
        );
        let router = routes.compile().unwrap();
        listing.publish(&router);

        let (status, body) = call(&router, "/health").await;
        assert_eq!(status, StatusCode::ServiceUnavailable);
        assert_eq!(body, serde_json::json!({"status": "starting", "active_connections": 3}));

        lifecycle.advance(ServerState::Ready);
        let (status, body) = call(&router, "/health").await;
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn routes_lists_compiled_table() {
        let mut routes = RouterBuilder::new();
        routes
            .delete("/users/{id:int}", |_ctx: Arc<RequestContext>| async {
                Ok(Response::new(StatusCode::NoContent))
            })
            .protected();
        let listing = register(
            &mut routes,
            &OperationalConfig::default(),
            Lifecycle::new(),
            Arc::default(),
        );
        let router = routes.compile().unwrap();
        listing.publish(&router);

        let (status, body) = call(&router, "/routes").await;
        assert_eq!(status, StatusCode::Ok);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            serde_json::json!({
                "method": "DELETE",
                "pattern": "/users/{id:int}",
                "params": [{"name": "id", "type": "int"}],
                "protected": true
            })
        );
        assert_eq!(entries[1]["pattern"], "/health");
        assert_eq!(entries[2]["pattern"], "/routes");
    }
}
