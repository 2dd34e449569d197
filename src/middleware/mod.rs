//! Middleware pipeline: ordered before/after hooks around handler dispatch.
//!
//! A [`Pipeline`] is an ordered list of [`MiddlewareStage`] descriptors. For
//! every request it:
//!
//! 1. runs the before-hooks in ascending `order`; any of them may answer the
//!    request itself with [`Flow::Respond`], which skips the remaining
//!    before-hooks and the handler;
//! 2. buffers the request body (if nothing did already) and calls the
//!    handler, or uses the canned response for unrouted requests;
//! 3. runs the after-hooks of every stage whose before-hook *started*, in
//!    reverse order, against whatever response came out of steps 1 and 2.
//!
//! A stage that returns an error or panics is isolated: in the default
//! [`FailureMode::Isolate`] its failure becomes an `internal_middleware_error`
//! response and unwinding continues normally through the stages that already
//! ran. A failing stage never takes the connection down.
//!
//! ## Built-in stage order
//!
//! | order | stage        |
//! |-------|--------------|
//! | 10    | logging      |
//! | 20    | timing       |
//! | 30    | cors         |
//! | 40    | body-limit   |
//! | 50    | rate-limit   |
//! | 60    | auth         |

use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::BoxFuture;
use crate::context::RequestContext;
use crate::error::Rejection;
use crate::http::Response;
use crate::router::Handler;

pub mod logging;

pub use logging::{LoggingStage, RequestId, TimingStage};

/// Bodies are buffered under this ceiling when no body-limit stage ran.
pub const MAX_BUFFERED_BODY: usize = 8 * 1024 * 1024;

/// Default positions of the built-in stages.
pub mod order {
    pub const LOGGING: i32 = 10;
    pub const TIMING: i32 = 20;
    pub const CORS: i32 = 30;
    pub const BODY_LIMIT: i32 = 40;
    pub const RATE_LIMIT: i32 = 50;
    pub const AUTH: i32 = 60;
}

/// What a before-hook decided.
#[derive(Debug)]
pub enum Flow {
    /// Hand the request to the next stage.
    Continue,
    /// Answer now. Later before-hooks and the handler are skipped.
    Respond(Response),
}

/// Failure inside a stage hook.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source("I/O error", err)
    }
}

/// A before/after hook pair.
///
/// Both hooks default to doing nothing, so a stage only implements the side
/// it cares about.
///
/// # Examples
///
/// ```rust,no_run
/// use portico::BoxFuture;
/// use portico::middleware::{Flow, Stage, StageError};
/// use portico::{RequestContext, Response, StatusCode};
///
/// struct Maintenance;
///
/// impl Stage for Maintenance {
///     fn before<'a>(
///         &'a self,
///         _ctx: &'a mut RequestContext,
///     ) -> BoxFuture<'a, Result<Flow, StageError>> {
///         Box::pin(async {
///             Ok(Flow::Respond(Response::new(StatusCode::ServiceUnavailable)))
///         })
///     }
/// }
/// ```
pub trait Stage: Send + Sync + 'static {
    fn before<'a>(&'a self, _ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
        Box::pin(async { Ok(Flow::Continue) })
    }

    fn after<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        _response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async { Ok(()) })
    }
}

/// How a stage's own failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Replace the response with `internal_middleware_error`.
    #[default]
    Isolate,
    /// Log the failure and carry on as if the hook had succeeded.
    Ignore,
}

/// A stage registered at a position in the pipeline.
#[derive(Clone)]
pub struct MiddlewareStage {
    name: &'static str,
    order: i32,
    stage: Arc<dyn Stage>,
    mode: FailureMode,
}

impl MiddlewareStage {
    pub fn new(name: &'static str, order: i32, stage: impl Stage) -> Self {
        Self {
            name,
            order,
            stage: Arc::new(stage),
            mode: FailureMode::default(),
        }
    }

    #[must_use]
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn order(&self) -> i32 {
        self.order
    }
}

impl std::fmt::Debug for MiddlewareStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStage")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stages `{first}` and `{second}` share order {order}")]
    DuplicateOrder {
        order: i32,
        first: &'static str,
        second: &'static str,
    },
}

/// What runs once the before-hooks let the request through.
pub enum Target {
    Handler(Handler),
    /// An engine-generated answer, e.g. 404 or 405.
    Respond(Response),
}

/// Why a request was cut short from outside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The per-request timeout elapsed.
    Timeout(Duration),
    /// The server's drain deadline passed.
    Drain,
}

impl Interrupt {
    pub fn rejection(self) -> Rejection {
        match self {
            Interrupt::Timeout(after) => Rejection::RequestTimeout { after },
            Interrupt::Drain => Rejection::DrainTimeout,
        }
    }
}

/// The result of running one request through the pipeline.
#[derive(Debug)]
pub struct Outcome {
    pub response: Response,
    pub interrupted: Option<Interrupt>,
}

#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<MiddlewareStage>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn stage(mut self, stage: MiddlewareStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sorts the stages by order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateOrder`] when two stages claim one position.
    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        self.stages.sort_by_key(MiddlewareStage::order);
        for pair in self.stages.windows(2) {
            if pair[0].order == pair[1].order {
                return Err(PipelineError::DuplicateOrder {
                    order: pair[0].order,
                    first: pair[0].name,
                    second: pair[1].name,
                });
            }
        }
        Ok(Pipeline {
            stages: self.stages.into(),
        })
    }
}

/// An immutable, ordered stack of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Arc<[MiddlewareStage]>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stages(&self) -> &[MiddlewareStage] {
        &self.stages
    }

    /// Runs `ctx` through the stages and `target`.
    ///
    /// `interrupt` resolves when the request must be abandoned. Whatever
    /// phase is running at that moment is cancelled, the after-hooks of the
    /// stages already entered still run, and the outcome records the cause.
    pub async fn execute<I>(&self, mut ctx: RequestContext, target: Target, interrupt: I) -> Outcome
    where
        I: Future<Output = Interrupt> + Send,
    {
        tokio::pin!(interrupt);
        let mut entered = 0;
        let buffer_body = matches!(target, Target::Handler(_));

        let forward = {
            let before = self.run_before(&mut ctx, &mut entered, buffer_body);
            tokio::select! {
                biased;
                reason = &mut interrupt => Err(reason),
                early = before => Ok(early),
            }
        };

        let ctx = Arc::new(ctx);
        let (mut response, interrupted) = match forward {
            Err(reason) => (reason.rejection().into_response(), Some(reason)),
            Ok(Some(early)) => (early, None),
            Ok(None) => match target {
                Target::Respond(response) => (response, None),
                Target::Handler(handler) => {
                    // Deferred so a panic before the handler's first await is caught too.
                    let call = AssertUnwindSafe(async { handler(Arc::clone(&ctx)).await })
                        .catch_unwind();
                    tokio::select! {
                        biased;
                        reason = &mut interrupt => (reason.rejection().into_response(), Some(reason)),
                        result = call => (handler_response(result, &ctx), None),
                    }
                }
            },
        };

        if let Some(reason) = interrupted {
            ctx.set_interrupted(reason);
        }
        self.run_after(&ctx, &mut response, entered).await;
        Outcome {
            response,
            interrupted,
        }
    }

    // `entered` counts every stage whose before-hook was started, so that a
    // cancelled or failed hook still gets its after-hook.
    async fn run_before(
        &self,
        ctx: &mut RequestContext,
        entered: &mut usize,
        buffer_body: bool,
    ) -> Option<Response> {
        for stage in self.stages.iter() {
            *entered += 1;
            let result = AssertUnwindSafe(async { stage.stage.before(&mut *ctx).await })
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(Flow::Continue)) => continue,
                Ok(Ok(Flow::Respond(response))) => {
                    debug!(
                        stage = stage.name,
                        status = response.status().as_u16(),
                        "request short-circuited"
                    );
                    return Some(response);
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => "before-hook panicked".to_owned(),
            };

            match stage.mode {
                FailureMode::Isolate => {
                    error!(stage = stage.name, error = %failure, "middleware stage failed");
                    return Some(
                        Rejection::InternalMiddlewareError { stage: stage.name }.into_response(),
                    );
                }
                FailureMode::Ignore => {
                    warn!(stage = stage.name, error = %failure, "ignoring middleware failure");
                }
            }
        }

        if buffer_body && !ctx.body().is_buffered() {
            if let Err(err) = ctx.body_mut().collect(MAX_BUFFERED_BODY).await {
                debug!(error = %err, "request body rejected");
                return Some(Rejection::from(err).into_response());
            }
        }
        None
    }

    async fn run_after(&self, ctx: &RequestContext, response: &mut Response, entered: usize) {
        for stage in self.stages[..entered].iter().rev() {
            let result = AssertUnwindSafe(async { stage.stage.after(ctx, &mut *response).await })
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "after-hook panicked".to_owned(),
            };

            match stage.mode {
                FailureMode::Isolate => {
                    error!(stage = stage.name, error = %failure, "middleware after-hook failed");
                    *response =
                        Rejection::InternalMiddlewareError { stage: stage.name }.into_response();
                }
                FailureMode::Ignore => {
                    warn!(stage = stage.name, error = %failure, "ignoring middleware failure");
                }
            }
        }
    }
}

fn handler_response(
    result: std::thread::Result<Result<Response, crate::error::HandlerError>>,
    ctx: &RequestContext,
) -> Response {
    match result {
        Ok(Ok(response)) => response,
        Ok(Err(cause)) => {
            error!(
                method = %ctx.method(),
                path = ctx.path(),
                error = %cause,
                "handler failed"
            );
            Rejection::HandlerFailed.into_response()
        }
        Err(_) => {
            error!(method = %ctx.method(), path = ctx.path(), "handler panicked");
            Rejection::HandlerFailed.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::context::testing::context;
    use crate::error::HandlerError;
    use crate::http::body::testing::ScriptedBody;
    use crate::http::{Body, StatusCode};
    use crate::router::boxed;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Before {
        Continue,
        Respond,
        Fail,
        Panic,
        Hang,
    }

    struct Recorder {
        name: &'static str,
        log: Log,
        before: Before,
        fail_after: bool,
    }

    impl Stage for Recorder {
        fn before<'a>(&'a self, _ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, StageError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("before:{}", self.name));
                match self.before {
                    Before::Continue => Ok(Flow::Continue),
                    Before::Respond => Ok(Flow::Respond(Response::new(StatusCode::Forbidden))),
                    Before::Fail => Err(StageError::new("boom")),
                    Before::Panic => panic!("stage {} exploded", self.name),
                    Before::Hang => std::future::pending().await,
                }
            })
        }

        fn after<'a>(
            &'a self,
            _ctx: &'a RequestContext,
            response: &'a mut Response,
        ) -> BoxFuture<'a, Result<(), StageError>> {
            Box::pin(async move {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("after:{}:{}", self.name, response.status().as_u16()));
                if self.fail_after {
                    return Err(StageError::new("after boom"));
                }
                Ok(())
            })
        }
    }

    fn stage(log: &Log, name: &'static str, order: i32, before: Before) -> MiddlewareStage {
        MiddlewareStage::new(
            name,
            order,
            Recorder {
                name,
                log: Arc::clone(log),
                before,
                fail_after: false,
            },
        )
    }

    fn handler(log: &Log) -> Target {
        let log = Arc::clone(log);
        Target::Handler(boxed(move |_ctx: Arc<RequestContext>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push("handler".into());
                Ok(Response::new(StatusCode::Ok))
            }
        }))
    }

    fn never() -> std::future::Pending<Interrupt> {
        std::future::pending()
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn hooks_follow_stack_discipline() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "c", 30, Before::Continue))
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 20, Before::Continue))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::Ok);
        assert_eq!(
            entries(&log),
            [
                "before:a", "before:b", "before:c", "handler", "after:c:200", "after:b:200",
                "after:a:200"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_later_stages_and_handler() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 20, Before::Respond))
            .stage(stage(&log, "c", 30, Before::Continue))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::Forbidden);
        assert_eq!(
            entries(&log),
            ["before:a", "before:b", "after:b:403", "after:a:403"]
        );
    }

    #[tokio::test]
    async fn failing_stage_is_isolated() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 20, Before::Fail))
            .stage(stage(&log, "c", 30, Before::Continue))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::InternalServerError);
        let body: serde_json::Value = serde_json::from_slice(outcome.response.body_ref()).unwrap();
        assert_eq!(body["error"], "internal_middleware_error");
        assert_eq!(
            entries(&log),
            ["before:a", "before:b", "after:b:500", "after:a:500"]
        );
    }

    #[tokio::test]
    async fn panicking_stage_is_isolated() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 20, Before::Panic))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::InternalServerError);
        assert_eq!(entries(&log), ["before:a", "before:b", "after:b:500", "after:a:500"]);
    }

    #[tokio::test]
    async fn ignored_failure_continues() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Fail).failure_mode(FailureMode::Ignore))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::Ok);
        assert_eq!(entries(&log), ["before:a", "handler", "after:a:200"]);
    }

    #[tokio::test]
    async fn failing_after_hook_still_unwinds_outer_stages() {
        let log = Log::default();
        let inner = MiddlewareStage::new(
            "inner",
            20,
            Recorder {
                name: "inner",
                log: Arc::clone(&log),
                before: Before::Continue,
                fail_after: true,
            },
        );
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "outer", 10, Before::Continue))
            .stage(inner)
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), never())
            .await;

        assert_eq!(outcome.response.status(), StatusCode::InternalServerError);
        assert_eq!(
            entries(&log),
            ["before:outer", "before:inner", "handler", "after:inner:200", "after:outer:500"]
        );
    }

    #[tokio::test]
    async fn handler_error_and_panic_map_to_handler_failed() {
        let pipeline = Pipeline::default();

        let failing = boxed(|_ctx: Arc<RequestContext>| async {
            Err(HandlerError::msg("database unreachable"))
        });
        let outcome = pipeline
            .execute(context("GET", "/", &[]), Target::Handler(failing), never())
            .await;
        assert_eq!(outcome.response.status(), StatusCode::InternalServerError);

        let panicking = boxed(|_ctx: Arc<RequestContext>| async { panic!("handler bug") });
        let outcome = pipeline
            .execute(context("GET", "/", &[]), Target::Handler(panicking), never())
            .await;
        let body: serde_json::Value = serde_json::from_slice(outcome.response.body_ref()).unwrap();
        assert_eq!(body["error"], "handler_failed");
    }

    #[tokio::test]
    async fn canned_target_runs_through_stages() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .build()
            .unwrap();

        let outcome = pipeline
            .execute(
                context("GET", "/missing", &[]),
                Target::Respond(Rejection::NotFound.into_response()),
                never(),
            )
            .await;

        assert_eq!(outcome.response.status(), StatusCode::NotFound);
        assert_eq!(entries(&log), ["before:a", "after:a:404"]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_handler_but_runs_after_hooks() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .build()
            .unwrap();

        let slow = boxed(|_ctx: Arc<RequestContext>| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Response::new(StatusCode::Ok))
        });
        let timeout = Duration::from_secs(1);
        let interrupt = async move {
            tokio::time::sleep(timeout).await;
            Interrupt::Timeout(timeout)
        };

        let outcome = pipeline
            .execute(context("GET", "/", &[]), Target::Handler(slow), interrupt)
            .await;

        assert_eq!(outcome.interrupted, Some(Interrupt::Timeout(timeout)));
        assert_eq!(outcome.response.status(), StatusCode::ServiceUnavailable);
        assert_eq!(entries(&log), ["before:a", "after:a:503"]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_before_hook_unwinds_entered_stages() {
        let log = Log::default();
        let pipeline = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 20, Before::Hang))
            .stage(stage(&log, "c", 30, Before::Continue))
            .build()
            .unwrap();

        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Interrupt::Drain
        };
        let outcome = pipeline
            .execute(context("GET", "/", &[]), handler(&log), interrupt)
            .await;

        assert_eq!(outcome.interrupted, Some(Interrupt::Drain));
        assert_eq!(entries(&log), ["before:a", "before:b", "after:b:503", "after:a:503"]);
    }

    #[tokio::test(start_paused = true)]
    async fn after_hooks_see_why_the_request_was_cut_short() {
        struct Witness(Arc<Mutex<Option<Option<Interrupt>>>>);
        impl Stage for Witness {
            fn after<'a>(
                &'a self,
                ctx: &'a RequestContext,
                _response: &'a mut Response,
            ) -> BoxFuture<'a, Result<(), StageError>> {
                *self.0.lock().unwrap() = Some(ctx.interrupted());
                Box::pin(async { Ok(()) })
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let pipeline = Pipeline::builder()
            .stage(MiddlewareStage::new("witness", 10, Witness(Arc::clone(&seen))))
            .build()
            .unwrap();
        let stuck = boxed(|_ctx: Arc<RequestContext>| async {
            std::future::pending::<()>().await;
            Ok(Response::new(StatusCode::Ok))
        });
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Interrupt::Drain
        };
        pipeline
            .execute(context("GET", "/", &[]), Target::Handler(stuck), interrupt)
            .await;
        assert_eq!(*seen.lock().unwrap(), Some(Some(Interrupt::Drain)));

        pipeline
            .execute(
                context("GET", "/", &[]),
                Target::Respond(Response::new(StatusCode::Ok)),
                never(),
            )
            .await;
        assert_eq!(*seen.lock().unwrap(), Some(None));
    }

    #[tokio::test]
    async fn body_is_buffered_before_handler() {
        let mut ctx = context("POST", "/echo", &[]);
        *ctx.body_mut() = Body::stream(ScriptedBody::new(vec![b"ping".to_vec()], Some(4)));

        let echo = boxed(|ctx: Arc<RequestContext>| async move {
            Ok(Response::new(StatusCode::Ok).body_bytes(ctx.body_bytes().to_vec()))
        });
        let outcome = Pipeline::default()
            .execute(ctx, Target::Handler(echo), never())
            .await;
        assert_eq!(outcome.response.body_ref(), b"ping");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_a_guard() {
        let log = Log::default();
        let mut ctx = context("POST", "/upload", &[]);
        *ctx.body_mut() = Body::stream(ScriptedBody::sized(MAX_BUFFERED_BODY + 1, 64 * 1024));

        let outcome = Pipeline::default()
            .execute(ctx, handler(&log), never())
            .await;
        assert_eq!(outcome.response.status(), StatusCode::PayloadTooLarge);
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn duplicate_order_is_rejected() {
        let log = Log::default();
        let err = Pipeline::builder()
            .stage(stage(&log, "a", 10, Before::Continue))
            .stage(stage(&log, "b", 10, Before::Continue))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateOrder { order: 10, .. }));
    }
}
