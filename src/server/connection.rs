//! One TCP connection: read heads, stream bodies, run the pipeline, write
//! responses, repeat while the connection stays alive.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use super::lifecycle::{ServerState, draining};
use crate::BoxFuture;
use crate::context::RequestContext;
use crate::error::Rejection;
use crate::http::{Body, BodySource, Framing, Method, Request, RequestError, Response};
use crate::middleware::{Interrupt, Pipeline, Target};
use crate::router::{Resolution, Router};

/// Largest request head accepted before answering 431.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

/// Longest chunk-size line (with extensions) or trailer line accepted.
const MAX_LINE: usize = 4096;

/// Everything a connection task needs from the server.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) pipeline: Pipeline,
    pub(crate) state: watch::Receiver<ServerState>,
    pub(crate) force: watch::Receiver<bool>,
    pub(crate) request_timeout: Option<Duration>,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closed {
    /// Client hung up, asked to close, or the server drained it cleanly.
    Normally,
    /// An in-flight request was cut off by the drain deadline.
    Forced,
}

#[derive(Debug)]
enum HeadError {
    Io(io::Error),
    TooLarge,
    Malformed(RequestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Done,
    Length { remaining: u64 },
    Chunked(Chunked),
}

/// The read half of a connection plus whatever has been read ahead.
struct ConnReader {
    read: OwnedReadHalf,
    buf: BytesMut,
    body: BodyState,
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-message")
}

fn invalid_chunk(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed chunked body: {detail}"))
}

impl ConnReader {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            read,
            buf: BytesMut::with_capacity(READ_CHUNK),
            body: BodyState::Done,
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.read.read_buf(&mut self.buf).await
    }

    async fn fill_or_eof(&mut self) -> io::Result<()> {
        match self.fill().await? {
            0 => Err(unexpected_eof()),
            _ => Ok(()),
        }
    }

    /// Next request head, or `None` if the client closed between requests.
    async fn read_head(&mut self) -> Result<Option<Request>, HeadError> {
        loop {
            if !self.buf.is_empty() {
                match Request::parse(&self.buf) {
                    Ok((request, head_len)) => {
                        self.buf.advance(head_len);
                        return Ok(Some(request));
                    }
                    Err(RequestError::Incomplete) if self.buf.len() > MAX_HEAD_SIZE => {
                        return Err(HeadError::TooLarge);
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(RequestError::Parse(httparse::Error::TooManyHeaders)) => {
                        return Err(HeadError::TooLarge);
                    }
                    Err(err) => return Err(HeadError::Malformed(err)),
                }
            }
            match self.fill().await {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => return Err(HeadError::Io(unexpected_eof())),
                Ok(_) => {}
                Err(err) => return Err(HeadError::Io(err)),
            }
        }
    }

    fn start_body(&mut self, framing: Framing) {
        self.body = match framing {
            Framing::Length(0) => BodyState::Done,
            Framing::Length(remaining) => BodyState::Length { remaining },
            Framing::Chunked => BodyState::Chunked(Chunked::Size),
        };
    }

    fn body_complete(&self) -> bool {
        self.body == BodyState::Done
    }

    /// Next piece of the current body. Never returns more than one read's
    /// worth of bytes beyond what was already buffered.
    async fn next_body_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.body {
                BodyState::Done => return Ok(None),
                BodyState::Length { remaining } => {
                    if self.buf.is_empty() {
                        self.fill_or_eof().await?;
                    }
                    let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let chunk = self.buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.body = if remaining == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length { remaining }
                    };
                    return Ok(Some(chunk));
                }
                BodyState::Chunked(state) => {
                    if let Some(chunk) = self.step_chunked(state).await? {
                        return Ok(Some(chunk));
                    }
                }
            }
        }
    }

    // Advances the chunked decoder by one step; yields data when a step
    // produced some.
    async fn step_chunked(&mut self, state: Chunked) -> io::Result<Option<Bytes>> {
        match state {
            Chunked::Size => match httparse::parse_chunk_size(&self.buf) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    self.buf.advance(consumed);
                    self.body = BodyState::Chunked(if size == 0 {
                        Chunked::Trailers
                    } else {
                        Chunked::Data { remaining: size }
                    });
                }
                Ok(httparse::Status::Partial) if self.buf.len() > MAX_LINE => {
                    return Err(invalid_chunk("chunk-size line too long"));
                }
                Ok(httparse::Status::Partial) => self.fill_or_eof().await?,
                Err(_) => return Err(invalid_chunk("invalid chunk size")),
            },
            Chunked::Data { remaining } => {
                if self.buf.is_empty() {
                    self.fill_or_eof().await?;
                }
                let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let chunk = self.buf.split_to(take).freeze();
                let remaining = remaining - take as u64;
                self.body = BodyState::Chunked(if remaining == 0 {
                    Chunked::DataEnd
                } else {
                    Chunked::Data { remaining }
                });
                return Ok(Some(chunk));
            }
            Chunked::DataEnd => {
                if self.buf.len() < 2 {
                    self.fill_or_eof().await?;
                } else if &self.buf[..2] == b"\r\n" {
                    self.buf.advance(2);
                    self.body = BodyState::Chunked(Chunked::Size);
                } else {
                    return Err(invalid_chunk("missing CRLF after chunk data"));
                }
            }
            Chunked::Trailers => match self.buf.windows(2).position(|w| w == b"\r\n") {
                // An empty line ends the message.
                Some(0) => {
                    self.buf.advance(2);
                    self.body = BodyState::Done;
                }
                // Trailer fields are discarded.
                Some(end) => self.buf.advance(end + 2),
                None if self.buf.len() > MAX_LINE => {
                    return Err(invalid_chunk("trailer line too long"));
                }
                None => self.fill_or_eof().await?,
            },
        }
        Ok(None)
    }
}

/// Request body streamed straight off the connection.
struct ConnBody {
    reader: Arc<Mutex<ConnReader>>,
    declared: Option<u64>,
}

impl BodySource for ConnBody {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move { self.reader.lock().await.next_body_chunk().await })
    }

    fn declared_len(&self) -> Option<u64> {
        self.declared
    }
}

async fn write_response(
    write: &mut OwnedWriteHalf,
    response: Response,
    include_body: bool,
) -> io::Result<()> {
    write.write_all(&response.serialize(include_body)).await?;
    write.flush().await
}

/// Serves requests on `stream` until it closes.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> io::Result<Closed> {
    // Responses are small writes; don't hold them back.
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let reader = Arc::new(Mutex::new(ConnReader::new(read)));
    let mut state = shared.state.clone();
    let mut force = shared.force.clone();

    let closed = loop {
        // Only a connection with nothing of its next request buffered is
        // idle; one whose head is partly in has a request in flight.
        if reader.lock().await.buf.is_empty() {
            if *state.borrow() >= ServerState::Draining {
                debug!(peer = %peer, "closing idle connection for drain");
                break Closed::Normally;
            }
            let filled = tokio::select! {
                biased;
                () = draining(&mut state) => {
                    debug!(peer = %peer, "closing idle connection for drain");
                    break Closed::Normally;
                }
                filled = async { reader.lock().await.fill().await } => filled,
            };
            match filled {
                Ok(0) => {
                    debug!(peer = %peer, "connection closed by peer");
                    break Closed::Normally;
                }
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }

        let head = tokio::select! {
            biased;
            () = forced(&mut force) => {
                warn!(peer = %peer, "drain timeout reached while a request head was arriving");
                break Closed::Forced;
            }
            head = async { reader.lock().await.read_head().await } => head,
        };

        let request = match head {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(peer = %peer, "connection closed by peer");
                break Closed::Normally;
            }
            Err(HeadError::Io(err)) => return Err(err),
            Err(HeadError::TooLarge) => {
                warn!(peer = %peer, limit = MAX_HEAD_SIZE, "request head too large");
                write_response(&mut write, Rejection::HeadTooLarge.into_response(), true).await?;
                break Closed::Normally;
            }
            Err(HeadError::Malformed(err)) => {
                warn!(peer = %peer, error = %err, "malformed request head");
                let rejection = Rejection::BadRequest {
                    detail: err.to_string(),
                };
                write_response(&mut write, rejection.into_response(), true).await?;
                break Closed::Normally;
            }
        };

        let framing = match request.framing() {
            Ok(framing) => framing,
            Err(err) => {
                warn!(peer = %peer, error = %err, "unusable request framing");
                let rejection = Rejection::BadRequest {
                    detail: err.to_string(),
                };
                write_response(&mut write, rejection.into_response(), true).await?;
                break Closed::Normally;
            }
        };

        match exchange(request, framing, peer, &shared, &reader, &state).await {
            Exchange::Respond {
                response,
                include_body,
            } => {
                let keep_alive = response.is_keep_alive();
                write_response(&mut write, response, include_body).await?;
                if !keep_alive {
                    break Closed::Normally;
                }
            }
            Exchange::Abandon => break Closed::Forced,
        }
    };

    let _ = write.shutdown().await;
    Ok(closed)
}

/// Resolves once the drain deadline forces connections closed. Never
/// resolves if the server is gone without forcing.
async fn forced(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|forced| *forced).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum Exchange {
    Respond {
        response: Response,
        include_body: bool,
    },
    Abandon,
}

async fn exchange(
    request: Request,
    framing: Framing,
    peer: SocketAddr,
    shared: &Shared,
    reader: &Arc<Mutex<ConnReader>>,
    state: &watch::Receiver<ServerState>,
) -> Exchange {
    let include_body = *request.method() != Method::Head;
    let client_keep_alive = request.is_keep_alive();

    reader.lock().await.start_body(framing);
    let body = match framing {
        Framing::Length(0) => Body::Empty,
        Framing::Length(len) => Body::stream(ConnBody {
            reader: Arc::clone(reader),
            declared: Some(len),
        }),
        Framing::Chunked => Body::stream(ConnBody {
            reader: Arc::clone(reader),
            declared: None,
        }),
    };

    let mut ctx = RequestContext::new(request, peer, body);
    let target = match shared.router.resolve(ctx.method(), ctx.path()) {
        Resolution::Matched { route, params } => {
            ctx.set_route(route.info().clone(), params);
            Target::Handler(Arc::clone(route.handler()))
        }
        Resolution::NotFound => Target::Respond(Rejection::NotFound.into_response()),
        Resolution::MethodNotAllowed { allowed } => {
            Target::Respond(Rejection::MethodNotAllowed { allowed }.into_response())
        }
    };

    let timeout = shared.request_timeout;
    let mut force = shared.force.clone();
    let interrupt = async move {
        let deadline = async {
            match timeout {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    Interrupt::Timeout(after)
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reason = deadline => reason,
            _ = force.wait_for(|forced| *forced) => Interrupt::Drain,
        }
    };

    let outcome = shared.pipeline.execute(ctx, target, interrupt).await;
    match outcome.interrupted {
        Some(Interrupt::Drain) => {
            warn!(peer = %peer, "drain timeout reached, abandoning in-flight request");
            return Exchange::Abandon;
        }
        Some(Interrupt::Timeout(after)) => {
            warn!(peer = %peer, timeout_ms = after.as_millis() as u64, "request timed out");
        }
        None => {}
    }

    // An unread body leaves the stream mid-message, so the connection
    // cannot carry another request.
    let body_complete = reader.lock().await.body_complete();
    let draining = *state.borrow() >= ServerState::Draining;
    let keep_alive =
        client_keep_alive && body_complete && !draining && outcome.response.is_keep_alive();

    Exchange::Respond {
        response: outcome.response.keep_alive(keep_alive),
        include_body,
    }
}
