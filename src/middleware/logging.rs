//! Request logging and response timing stages.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Flow, Interrupt, Stage, StageError};
use crate::BoxFuture;
use crate::context::RequestContext;
use crate::http::Response;

/// Header carrying the request correlation id, in both directions.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the current request, stored in the context extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Logs every request on arrival and every response on departure.
///
/// Reuses the client's `X-Request-Id` when it sent a usable one, otherwise
/// generates a UUID, and echoes the id back on the response. With
/// `log_headers` set, request headers are logged at `debug` with credentials
/// masked.
#[derive(Debug, Clone, Default)]
pub struct LoggingStage {
    log_headers: bool,
}

impl LoggingStage {
    pub fn new(log_headers: bool) -> Self {
        Self { log_headers }
    }
}

fn incoming_request_id(ctx: &RequestContext) -> Option<String> {
    let id = ctx.headers().get(REQUEST_ID_HEADER)?.trim();
    let usable = !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| b.is_ascii_graphic());
    usable.then(|| id.to_owned())
}

impl Stage for LoggingStage {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        Box::pin(async move {
            let id = incoming_request_id(ctx).unwrap_or_else(|| Uuid::new_v4().to_string());

            info!(
                request_id = %id,
                method = %ctx.method(),
                path = ctx.path(),
                peer = %ctx.peer_addr(),
                "request received"
            );
            if self.log_headers {
                debug!(
                    request_id = %id,
                    headers = ?ctx.headers().redacted(),
                    "request headers"
                );
            }

            ctx.extensions_mut().insert(RequestId(id));
            Ok(Flow::Continue)
        })
    }

    fn after<'a>(
        &'a self,
        ctx: &'a RequestContext,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            let id = ctx
                .extensions()
                .get::<RequestId>()
                .map(|r| r.0.as_str())
                .unwrap_or("-");
            let elapsed = ctx.started_at().elapsed();

            response.set_header(REQUEST_ID_HEADER, id);
            if ctx.interrupted() == Some(Interrupt::Drain) {
                warn!(
                    request_id = %id,
                    method = %ctx.method(),
                    path = ctx.path(),
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "request abandoned at drain deadline, no response sent"
                );
            } else {
                info!(
                    request_id = %id,
                    method = %ctx.method(),
                    path = ctx.path(),
                    status = response.status().as_u16(),
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "response sent"
                );
            }
            Ok(())
        })
    }
}

/// Measures time spent inside the pipeline and reports it as
/// `X-Response-Time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStage;

const TIMING_MARK: &str = "timing.start";

impl Stage for TimingStage {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        ctx.mark(TIMING_MARK);
        Box::pin(async { Ok(Flow::Continue) })
    }

    fn after<'a>(
        &'a self,
        ctx: &'a RequestContext,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        let start = ctx.mark_at(TIMING_MARK).unwrap_or_else(|| ctx.started_at());
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        response.set_header("X-Response-Time", format!("{elapsed_ms:.3}ms"));
        debug!(path = ctx.path(), elapsed_ms, "request timed");
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::context::testing::context;
    use crate::http::StatusCode;
    use crate::middleware::{MiddlewareStage, Pipeline, Target, order};
    use crate::router::boxed;

    fn pipeline() -> Pipeline {
        Pipeline::builder()
            .stage(MiddlewareStage::new("logging", order::LOGGING, LoggingStage::new(true)))
            .stage(MiddlewareStage::new("timing", order::TIMING, TimingStage))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn echoes_client_request_id() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in_handler = Arc::clone(&seen);
        let handler = boxed(move |ctx: Arc<RequestContext>| {
            let seen = Arc::clone(&seen_in_handler);
            async move {
                *seen.lock().unwrap() = ctx.extensions().get::<RequestId>().cloned();
                Ok(Response::new(StatusCode::Ok))
            }
        });

        let ctx = context("GET", "/", &[("X-Request-Id", "abc-123")]);
        let outcome = pipeline()
            .execute(ctx, Target::Handler(handler), std::future::pending())
            .await;

        assert_eq!(outcome.response.headers().get("x-request-id"), Some("abc-123"));
        assert_eq!(*seen.lock().unwrap(), Some(RequestId("abc-123".into())));
    }

    #[tokio::test]
    async fn generates_request_id_when_missing_or_unusable() {
        for headers in [vec![], vec![("X-Request-Id", "has spaces in it")]] {
            let ctx = context("GET", "/", &headers);
            let outcome = pipeline()
                .execute(
                    ctx,
                    Target::Respond(Response::new(StatusCode::NoContent)),
                    std::future::pending(),
                )
                .await;
            let id = outcome.response.headers().get("x-request-id").unwrap();
            assert!(Uuid::parse_str(id).is_ok(), "{id} is not a uuid");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn response_time_covers_handler() {
        let handler = boxed(|_ctx: Arc<RequestContext>| async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(Response::new(StatusCode::Ok))
        });
        let outcome = pipeline()
            .execute(context("GET", "/", &[]), Target::Handler(handler), std::future::pending())
            .await;

        let header = outcome.response.headers().get("x-response-time").unwrap();
        let ms: f64 = header.trim_end_matches("ms").parse().unwrap();
        assert!(ms >= 250.0, "{header}");
    }

    #[tokio::test]
    async fn timing_runs_on_short_circuit() {
        struct Deny;
        impl Stage for Deny {
            fn before<'a>(
                &'a self,
                _ctx: &'a mut RequestContext,
            ) -> BoxFuture<'a, Result<Flow, StageError>> {
                Box::pin(async { Ok(Flow::Respond(Response::new(StatusCode::Forbidden))) })
            }
        }

        let pipeline = Pipeline::builder()
            .stage(MiddlewareStage::new("timing", order::TIMING, TimingStage))
            .stage(MiddlewareStage::new("deny", 99, Deny))
            .build()
            .unwrap();
        let outcome = pipeline
            .execute(
                context("GET", "/", &[]),
                Target::Respond(Response::new(StatusCode::Ok)),
                std::future::pending(),
            )
            .await;

        assert_eq!(outcome.response.status(), StatusCode::Forbidden);
        assert!(outcome.response.headers().contains("x-response-time"));
    }
}
