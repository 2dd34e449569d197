//! Request body size enforcement.

use tracing::warn;

use crate::BoxFuture;
use crate::context::RequestContext;
use crate::error::Rejection;
use crate::http::BodyError;
use crate::middleware::{Flow, Stage, StageError};

/// Buffers the request body, refusing it once it grows past `limit` bytes.
///
/// The body is pulled from the connection chunk by chunk, so an oversized
/// upload is cut off after at most one chunk beyond the limit rather than
/// read to the end. A `Content-Length` above the limit is refused without
/// reading anything. Either way the client gets `413 Payload Too Large` and
/// the connection is closed, because the rest of the body is still unread.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimitGuard {
    limit: usize,
}

impl BodyLimitGuard {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Stage for BodyLimitGuard {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        Box::pin(async move {
            let limit = self.limit;
            match ctx.body_mut().collect(limit).await {
                Ok(_) => Ok(Flow::Continue),
                Err(BodyError::TooLarge { received, .. }) => {
                    warn!(path = ctx.path(), limit, received, "request body too large");
                    Ok(Flow::Respond(Rejection::PayloadTooLarge { limit }.into_response()))
                }
                Err(err) => Ok(Flow::Respond(Rejection::from(err).into_response())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::http::body::testing::ScriptedBody;
    use crate::http::{Body, Request, Response, StatusCode};
    use crate::middleware::{MiddlewareStage, Pipeline, Target};
    use crate::router::boxed;

    const MIB: usize = 1024 * 1024;

    fn upload(body: Body) -> RequestContext {
        let (request, _) = Request::parse(b"POST /upload HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        RequestContext::new(request, peer, body)
    }

    fn pipeline() -> Pipeline {
        Pipeline::builder()
            .stage(MiddlewareStage::new("body-limit", 40, BodyLimitGuard::new(MIB)))
            .build()
            .unwrap()
    }

    fn counting_handler(called: Arc<AtomicBool>) -> Target {
        Target::Handler(boxed(move |ctx: Arc<RequestContext>| {
            let called = Arc::clone(&called);
            async move {
                called.store(true, Ordering::SeqCst);
                Ok(Response::new(StatusCode::Ok).body(ctx.body_bytes().len().to_string()))
            }
        }))
    }

    #[tokio::test]
    async fn oversized_stream_is_cut_off_before_handler() {
        let chunk = 16 * 1024;
        let source = ScriptedBody::sized(2 * MIB, chunk);
        let pulled = Arc::clone(&source.pulled);
        let called = Arc::new(AtomicBool::new(false));

        let outcome = pipeline()
            .execute(
                upload(Body::stream(source)),
                counting_handler(Arc::clone(&called)),
                std::future::pending(),
            )
            .await;

        assert_eq!(outcome.response.status(), StatusCode::PayloadTooLarge);
        assert!(!outcome.response.is_keep_alive());
        assert!(!called.load(Ordering::SeqCst));
        assert!(pulled.load(Ordering::SeqCst) <= (MIB + chunk) as u64);
    }

    #[tokio::test]
    async fn declared_oversize_reads_nothing() {
        let source = ScriptedBody::new(vec![vec![0; 64]], Some(2 * MIB as u64));
        let pulled = Arc::clone(&source.pulled);

        let outcome = pipeline()
            .execute(
                upload(Body::stream(source)),
                counting_handler(Arc::new(AtomicBool::new(false))),
                std::future::pending(),
            )
            .await;

        assert_eq!(outcome.response.status(), StatusCode::PayloadTooLarge);
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_within_limit_reaches_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let outcome = pipeline()
            .execute(
                upload(Body::stream(ScriptedBody::sized(MIB, 64 * 1024))),
                counting_handler(Arc::clone(&called)),
                std::future::pending(),
            )
            .await;

        assert_eq!(outcome.response.status(), StatusCode::Ok);
        assert_eq!(outcome.response.body_ref(), MIB.to_string().as_bytes());
        assert!(called.load(Ordering::SeqCst));
    }
}
