//! Async TCP server using Tokio.
//!
//! [`Server::builder`] validates the configuration, compiles the route table,
//! assembles the middleware pipeline and binds the listener; any problem is
//! reported before a single connection is accepted. [`Server::serve`] then
//! runs the accept loop until the shutdown future resolves, drains in-flight
//! requests, and reports what happened.
//!
//! Each connection runs in its own task. HTTP/1.1 connections are persistent
//! by default; a connection is closed when the client asks, when a body was
//! left unread, or when the server starts draining.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::middleware::{
    LoggingStage, MiddlewareStage, Pipeline, PipelineError, TimingStage, order,
};
use crate::router::{RouteError, RouterBuilder};
use crate::security::{AuthGuard, BodyLimitGuard, Cors, RateLimitStage, RateLimiter};

mod connection;
mod lifecycle;
mod operational;

use connection::{Closed, Shared, serve_connection};
pub use lifecycle::{Lifecycle, ServerState};

/// How long aborted-by-deadline connections get to unwind before their
/// tasks are killed outright.
const FORCE_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) doesn't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors produced while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("routes are marked protected but no jwt_secret is configured")]
    MissingJwtSecret,
}

/// Summary of a finished [`Server::serve`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServeReport {
    /// Connections accepted over the server's life.
    pub served_connections: u64,
    /// Connections cut off because the drain deadline passed.
    pub forced_connections: u64,
}

/// Collects everything needed to start a [`Server`].
pub struct ServerBuilder {
    config: Config,
    routes: RouterBuilder,
    stages: Vec<MiddlewareStage>,
}

impl ServerBuilder {
    #[must_use]
    pub fn routes(mut self, routes: RouterBuilder) -> Self {
        self.routes = routes;
        self
    }

    /// Adds an application stage next to the built-in ones. Its order must
    /// not collide with another stage's.
    #[must_use]
    pub fn stage(mut self, stage: MiddlewareStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates, compiles and binds.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] for invalid configuration.
    /// - [`ServerError::MissingJwtSecret`] when a route is protected but no
    ///   secret is configured.
    /// - [`ServerError::Route`] for malformed or conflicting patterns.
    /// - [`ServerError::Pipeline`] when two stages share an order.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(self) -> Result<Server, ServerError> {
        let ServerBuilder {
            config,
            mut routes,
            stages,
        } = self;
        config.validate()?;

        if routes.has_protected() && config.jwt_secret.is_none() {
            return Err(ServerError::MissingJwtSecret);
        }

        let lifecycle = Lifecycle::new();
        let active = Arc::new(AtomicUsize::new(0));
        let listing = config.operational.enabled.then(|| {
            operational::register(
                &mut routes,
                &config.operational,
                lifecycle.clone(),
                Arc::clone(&active),
            )
        });
        let router = routes.compile()?;
        if let Some(listing) = listing {
            listing.publish(&router);
        }

        let (pipeline, sweeper) = build_pipeline(&config, stages)?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            address = %local_addr,
            routes = router.len(),
            stages = pipeline.stages().len(),
            "server bound"
        );

        Ok(Server {
            listener,
            local_addr,
            router,
            pipeline,
            lifecycle,
            active,
            sweeper,
            drain_timeout: config.drain_timeout(),
            request_timeout: config.request_timeout(),
        })
    }
}

struct Sweeper {
    limiter: Arc<RateLimiter>,
    stale_after: Duration,
}

fn build_pipeline(
    config: &Config,
    stages: Vec<MiddlewareStage>,
) -> Result<(Pipeline, Option<Sweeper>), PipelineError> {
    let mut builder = Pipeline::builder()
        .stage(MiddlewareStage::new(
            "logging",
            order::LOGGING,
            LoggingStage::new(config.log_headers),
        ))
        .stage(MiddlewareStage::new("timing", order::TIMING, TimingStage));

    if let Some(cors) = &config.cors {
        builder = builder.stage(MiddlewareStage::new(
            "cors",
            order::CORS,
            Cors::from_config(cors),
        ));
    }
    if let Some(limit) = config.body_limit_bytes {
        builder = builder.stage(MiddlewareStage::new(
            "body-limit",
            order::BODY_LIMIT,
            BodyLimitGuard::new(limit),
        ));
    }

    let mut sweeper = None;
    if let Some(rate_limit) = &config.rate_limit {
        let limiter = Arc::new(RateLimiter::new(rate_limit.capacity, rate_limit.refill_per_sec));
        sweeper = Some(Sweeper {
            limiter: Arc::clone(&limiter),
            stale_after: Duration::from_secs(rate_limit.stale_after_secs),
        });
        builder = builder.stage(MiddlewareStage::new(
            "rate-limit",
            order::RATE_LIMIT,
            RateLimitStage::new(limiter, rate_limit.key.clone()),
        ));
    }
    if let Some(secret) = &config.jwt_secret {
        builder = builder.stage(MiddlewareStage::new("auth", order::AUTH, AuthGuard::new(secret)));
    }

    for stage in stages {
        builder = builder.stage(stage);
    }
    Ok((builder.build()?, sweeper))
}

/// A bound server, ready to [`serve`](Server::serve).
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use portico::{Config, RequestContext, Response, Router, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut routes = Router::builder();
///     routes.get("/", |_ctx: Arc<RequestContext>| async {
///         Ok(Response::new(StatusCode::Ok).body("Hello!"))
///     });
///
///     let server = Server::builder(Config::default()).routes(routes).bind().await?;
///     let report = server.serve(portico::server::shutdown_signal()).await?;
///     println!("served {} connections", report.served_connections);
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: crate::router::Router,
    pipeline: Pipeline,
    lifecycle: Lifecycle,
    active: Arc<AtomicUsize>,
    sweeper: Option<Sweeper>,
    drain_timeout: Duration,
    request_timeout: Option<Duration>,
}

/// Counts a connection as active for as long as it lives.
struct ActiveConnection(Arc<AtomicUsize>);

impl ActiveConnection {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            routes: RouterBuilder::new(),
            stages: Vec::new(),
        }
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle on the server's lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Accepts connections until `shutdown` resolves, then drains.
    ///
    /// Draining stops accepting, closes idle connections, and waits up to the
    /// configured drain timeout for in-flight requests. Requests still running
    /// after that are cancelled: their connections close without a response.
    ///
    /// # Errors
    ///
    /// Currently none once bound; accept failures are logged and retried.
    pub async fn serve<S>(self, shutdown: S) -> Result<ServeReport, ServerError>
    where
        S: Future<Output = ()>,
    {
        let Server {
            listener,
            local_addr,
            router,
            pipeline,
            lifecycle,
            active,
            sweeper,
            drain_timeout,
            request_timeout,
        } = self;

        let (force_tx, force_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            router,
            pipeline,
            state: lifecycle.subscribe(),
            force: force_rx,
            request_timeout,
        });
        let sweeper = sweeper.map(|sweeper| tokio::spawn(sweep(sweeper)));

        let mut connections: JoinSet<Closed> = JoinSet::new();
        let mut report = ServeReport::default();

        lifecycle.advance(ServerState::Ready);
        info!(address = %local_addr, "accepting connections");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "connection accepted");
                        report.served_connections += 1;
                        let guard = ActiveConnection::new(&active);
                        let shared = Arc::clone(&shared);
                        connections.spawn(async move {
                            let _guard = guard;
                            serve_connection(stream, peer, shared)
                                .await
                                .unwrap_or_else(|err| {
                                    debug!(peer = %peer, error = %err, "connection closed with error");
                                    Closed::Normally
                                })
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    settle(joined, &mut report);
                }
            }
        }

        // Closing the listener refuses new connections from here on.
        drop(listener);
        lifecycle.advance(ServerState::Draining);
        info!(
            in_flight = connections.len(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "draining connections"
        );

        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = connections.join_next().await {
                settle(joined, &mut report);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = connections.len(),
                "drain timeout exceeded, cancelling in-flight requests"
            );
            let _ = force_tx.send(true);

            let unwound = tokio::time::timeout(FORCE_GRACE, async {
                while let Some(joined) = connections.join_next().await {
                    settle(joined, &mut report);
                }
            })
            .await
            .is_ok();

            if !unwound {
                let stuck = connections.len() as u64;
                error!(connections = stuck, "aborting connection tasks that ignored cancellation");
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                report.forced_connections += stuck;
            }
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        lifecycle.advance(ServerState::Stopped);
        info!(
            served = report.served_connections,
            forced = report.forced_connections,
            "server stopped"
        );
        Ok(report)
    }
}

fn settle(joined: Result<Closed, JoinError>, report: &mut ServeReport) {
    match joined {
        Ok(Closed::Normally) => {}
        Ok(Closed::Forced) => report.forced_connections += 1,
        Err(err) if err.is_panic() => error!(error = %err, "connection task panicked"),
        Err(err) => debug!(error = %err, "connection task cancelled"),
    }
}

async fn sweep(sweeper: Sweeper) {
    let period = (sweeper.stale_after / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = sweeper
            .limiter
            .evict_stale(tokio::time::Instant::now(), sweeper.stale_after);
        if evicted > 0 {
            debug!(evicted, remaining = sweeper.limiter.len(), "evicted idle rate-limit buckets");
        }
    }
}

/// Resolves when the process receives Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn protected_route_without_secret_fails_to_start() {
        let mut routes = RouterBuilder::new();
        routes
            .get("/admin", |_ctx: Arc<crate::RequestContext>| async {
                Ok(crate::Response::new(crate::StatusCode::Ok))
            })
            .protected();
        let result = Server::builder(config()).routes(routes).bind().await;
        assert!(matches!(result, Err(ServerError::MissingJwtSecret)));
    }

    #[tokio::test]
    async fn conflicting_routes_fail_to_start() {
        let mut routes = RouterBuilder::new();
        routes.get("/health", |_ctx: Arc<crate::RequestContext>| async {
            Ok(crate::Response::new(crate::StatusCode::Ok))
        });
        let result = Server::builder(config()).routes(routes).bind().await;
        assert!(matches!(result, Err(ServerError::Route(RouteError::Conflict { .. }))));
    }

    #[tokio::test]
    async fn invalid_config_fails_to_start() {
        let config = Config {
            drain_timeout_ms: 0,
            ..config()
        };
        let result = Server::builder(config).bind().await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn stage_order_collision_fails_to_start() {
        struct Noop;
        impl crate::Stage for Noop {}

        let result = Server::builder(config())
            .stage(MiddlewareStage::new("mine", order::LOGGING, Noop))
            .bind()
            .await;
        assert!(matches!(result, Err(ServerError::Pipeline(_))));
    }

    #[tokio::test]
    async fn idle_server_stops_cleanly() {
        let server = Server::builder(config()).bind().await.unwrap();
        let lifecycle = server.lifecycle();
        assert_eq!(lifecycle.state(), ServerState::Starting);

        let report = server.serve(async {}).await.unwrap();
        assert_eq!(report, ServeReport::default());
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }
}
