//! HTTP/1.1 request-head parsing using the [`httparse`] crate.
//!
//! Only the head (request line and headers) is parsed here. The body stays on
//! the socket until something asks for it; see [`super::body`].

use std::collections::HashMap;

use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing a request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("both Content-Length and Transfer-Encoding are present")]
    ConflictingFraming,

    #[error("unsupported Transfer-Encoding: {value:?}")]
    UnsupportedTransferEncoding { value: String },
}

/// How the body of a request is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

impl Framing {
    /// `true` when no body bytes follow the head.
    pub fn is_empty(self) -> bool {
        self == Framing::Length(0)
    }
}

/// A parsed HTTP/1.1 request head.
///
/// # Examples
///
/// ```
/// use portico::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, head_len) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(head_len, raw.len());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    query_params: HashMap<String, String>,
}

impl Request {
    /// Maximum number of headers accepted per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from the front of `buf`.
    ///
    /// Returns the head and the number of bytes it occupied, so the caller
    /// can advance its buffer to the first body byte.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the `\r\n\r\n` terminator has not arrived yet.
    /// - [`RequestError::Parse`]: the bytes are not a valid HTTP/1.x head.
    /// - [`RequestError::MissingField`]: the request line lacks a method, path or version.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let head_len = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let query_params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                query_params,
            },
            head_len,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    /// Whether the client wants the connection kept open after this exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 only with an explicit
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) if conn.eq_ignore_ascii_case("close") => false,
            Some(conn) if conn.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == 1,
        }
    }

    /// Works out how the body is delimited.
    ///
    /// Requests carrying both `Content-Length` and `Transfer-Encoding` are
    /// rejected outright rather than guessing which one wins.
    pub fn framing(&self) -> Result<Framing, RequestError> {
        let length = self.headers.get("content-length");
        let encoding = self.headers.get("transfer-encoding");

        match (length, encoding) {
            (Some(_), Some(_)) => Err(RequestError::ConflictingFraming),
            (None, Some(te)) if te.trim().eq_ignore_ascii_case("chunked") => Ok(Framing::Chunked),
            (None, Some(te)) => Err(RequestError::UnsupportedTransferEncoding {
                value: te.to_owned(),
            }),
            (Some(cl), None) => cl
                .trim()
                .parse()
                .map(Framing::Length)
                .map_err(|_| RequestError::InvalidContentLength {
                    value: cl.to_owned(),
                }),
            (None, None) => Ok(Framing::Length(0)),
        }
    }
}

/// Parses `key=value&key2=value2` with `+` decoded as a space.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn head_length_excludes_body() {
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(&raw[offset..], b"hello");
        assert_eq!(req.framing().unwrap(), Framing::Length(5));
    }

    #[test]
    fn query_string_is_split_from_path() {
        let req = parse("GET /search?q=rust+lang&page=2 HTTP/1.1\r\n\r\n");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        assert!(parse("GET / HTTP/1.1\r\n\r\n").is_keep_alive());
        assert!(!parse("GET / HTTP/1.0\r\n\r\n").is_keep_alive());
        assert!(parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").is_keep_alive());
        assert!(!parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").is_keep_alive());
    }

    #[test]
    fn chunked_framing() {
        let req = parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(req.framing().unwrap(), Framing::Chunked);
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let req = parse(
            "POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(req.framing(), Err(RequestError::ConflictingFraming)));
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let req = parse("POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert!(matches!(
            req.framing(),
            Err(RequestError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn no_framing_headers_means_empty_body() {
        let req = parse("GET / HTTP/1.1\r\n\r\n");
        assert!(req.framing().unwrap().is_empty());
    }
}
