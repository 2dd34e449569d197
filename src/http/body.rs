//! Request bodies that are read lazily, chunk by chunk.
//!
//! A body starts out as a [`Body::Stream`] wired to the connection. Nothing is
//! read from the socket until a stage (usually the body-limit guard) or the
//! pipeline itself calls [`Body::collect`], which enforces a byte ceiling as
//! the chunks arrive instead of after the fact.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::BoxFuture;

static EMPTY: Bytes = Bytes::from_static(b"");

/// A pull-based source of body chunks.
///
/// `next_chunk` yields `Ok(None)` once the message body is complete.
/// Implementations must never yield more than they have buffered from the
/// underlying transport, so that a caller enforcing a limit overruns it by
/// at most one chunk.
pub trait BodySource: Send + Sync {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    /// Length announced by the sender, if any.
    fn declared_len(&self) -> Option<u64> {
        None
    }
}

/// Errors raised while buffering a body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds the {limit}-byte limit ({received} bytes seen)")]
    TooLarge { limit: usize, received: u64 },

    #[error("failed to read request body: {0}")]
    Io(#[from] io::Error),
}

/// A request body in one of its three states.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Stream(Box<dyn BodySource>),
}

impl Body {
    pub fn stream(source: impl BodySource + 'static) -> Self {
        Body::Stream(Box::new(source))
    }

    /// Length the body is known or announced to have.
    pub fn declared_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(source) => source.declared_len(),
        }
    }

    /// `true` once the body no longer depends on the transport.
    pub fn is_buffered(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    /// The buffered bytes, or `None` while the body is still a stream.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Empty => Some(&EMPTY),
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    /// Reads the rest of the body into memory, failing as soon as more than
    /// `limit` bytes have been received.
    ///
    /// A declared length above `limit` fails before a single byte is read.
    /// On success the body becomes [`Body::Full`]; on failure it is left as a
    /// partially consumed stream.
    pub async fn collect(&mut self, limit: usize) -> Result<Bytes, BodyError> {
        let source = match self {
            Body::Empty => return Ok(Bytes::new()),
            Body::Full(bytes) if bytes.len() > limit => {
                return Err(BodyError::TooLarge {
                    limit,
                    received: bytes.len() as u64,
                });
            }
            Body::Full(bytes) => return Ok(bytes.clone()),
            Body::Stream(source) => source,
        };

        let declared = source.declared_len();
        if let Some(declared) = declared {
            if declared > limit as u64 {
                return Err(BodyError::TooLarge {
                    limit,
                    received: declared,
                });
            }
        }

        let initial = declared.map_or(0, |d| d as usize).min(limit);
        let mut buf = BytesMut::with_capacity(initial);
        while let Some(chunk) = source.next_chunk().await? {
            let received = buf.len() + chunk.len();
            if received > limit {
                return Err(BodyError::TooLarge {
                    limit,
                    received: received as u64,
                });
            }
            buf.extend_from_slice(&chunk);
        }

        let bytes = buf.freeze();
        *self = Body::Full(bytes.clone());
        Ok(bytes)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(source) => write!(f, "Body::Stream(declared={:?})", source.declared_len()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Body source that replays fixed chunks and counts how many bytes were pulled.
    pub(crate) struct ScriptedBody {
        chunks: VecDeque<Bytes>,
        declared: Option<u64>,
        pub(crate) pulled: Arc<AtomicU64>,
    }

    impl ScriptedBody {
        pub(crate) fn new(chunks: Vec<Vec<u8>>, declared: Option<u64>) -> Self {
            Self {
                chunks: chunks.into_iter().map(Bytes::from).collect(),
                declared,
                pulled: Arc::new(AtomicU64::new(0)),
            }
        }

        /// `total` bytes split into `chunk`-sized pieces, no declared length.
        pub(crate) fn sized(total: usize, chunk: usize) -> Self {
            let mut chunks = Vec::new();
            let mut left = total;
            while left > 0 {
                let n = left.min(chunk);
                chunks.push(vec![b'x'; n]);
                left -= n;
            }
            Self::new(chunks, None)
        }
    }

    impl BodySource for ScriptedBody {
        fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
            let next = self.chunks.pop_front();
            if let Some(chunk) = &next {
                self.pulled.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            }
            Box::pin(async move { Ok(next) })
        }

        fn declared_len(&self) -> Option<u64> {
            self.declared
        }
    }
}
