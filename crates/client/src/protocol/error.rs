use std::io;
use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

/// The error every request resolves to when it does not resolve to a response.
///
/// The variants follow the failure domains of the transport, so a caller can tell
/// socket failures from protocol violations, TLS failures, proxy failures and
/// timeouts. Cloning is cheap because non-clone sources are shared behind an `Arc`:
/// the same failure is often delivered both to a pending request and to a body stream.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {source}")]
    Transport { source: Arc<io::Error> },

    #[error("protocol error: {source}")]
    Parse { source: Arc<ParseError> },

    #[error("send error: {source}")]
    Send { source: Arc<SendError> },

    #[error("secure transport error: {source}")]
    Tls {
        #[from]
        source: TlsError,
    },

    #[error("proxy error: {source}")]
    Proxy {
        #[from]
        source: ProxyError,
    },

    #[error("timeout while {0}")]
    Timeout(TimeoutKind),

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("body stream error: {reason}")]
    BodyStream { reason: String },
}

impl ClientError {
    pub fn connection_closed<S: ToString>(str: S) -> Self {
        Self::ConnectionClosed { reason: str.to_string() }
    }

    pub fn body_stream<S: ToString>(str: S) -> Self {
        Self::BodyStream { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: Arc::new(e.into()) }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    #[inline]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ClientError::ConnectionClosed { .. })
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        Self::Parse { source: Arc::new(e) }
    }
}

impl From<SendError> for ClientError {
    fn from(e: SendError) -> Self {
        Self::Send { source: Arc::new(e) }
    }
}

impl From<ClientError> for io::Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, e),
            ClientError::ConnectionClosed { .. } => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            e => io::Error::other(e),
        }
    }
}

/// Which deadline expired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    ResponseHeader,
    ResponseBody,
    Idle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Connect => f.write_str("connecting"),
            TimeoutKind::ResponseHeader => f.write_str("receiving response header"),
            TimeoutKind::ResponseBody => f.write_str("receiving response body"),
            TimeoutKind::Idle => f.write_str("idle"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http status: {0:?}")]
    InvalidStatus(Option<u16>),

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk size line: {reason}")]
    InvalidChunkSize { reason: String },

    #[error("chunk size line exceed the limit of {max_digits} hex digits")]
    TooLargeChunkSize { max_digits: usize },

    #[error("chunked trailer exceed the limit {max_size}")]
    TooLargeTrailer { max_size: usize },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("body size overflow, {extra} bytes beyond the declared content-length")]
    BodySizeOverflow { extra: usize },

    #[error("unexpected data in buffer, {len} bytes after a complete response")]
    UnexpectedData { len: usize },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk_size<S: ToString>(str: S) -> Self {
        Self::InvalidChunkSize { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_request<S: ToString>(str: S) -> Self {
        Self::InvalidRequest { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug, Clone)]
pub enum TlsError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] rustls::Error),

    #[error("invalid server name {0}")]
    InvalidServerName(String),

    #[error("server host name verification for {host} has failed")]
    HostnameVerification { host: String },

    #[error("cannot write until the handshake has been completed")]
    HandshakeInProgress,

    #[error("only one write operation can be in progress during re-handshake")]
    WriteInProgress,

    #[error("the tls session has been closed")]
    SessionClosed,

    #[error("invalid trust material: {reason}")]
    TrustMaterial { reason: String },
}

impl TlsError {
    pub fn trust_material<S: ToString>(str: S) -> Self {
        Self::TrustMaterial { reason: str.to_string() }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("proxy returned 407 again after authenticating")]
    RepeatedAuthChallenge,

    #[error("proxy returned 407 without a Proxy-Authenticate header")]
    MissingAuthenticateHeader,

    #[error("unsupported proxy authentication scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("unsupported digest qop: {qop}")]
    UnsupportedQop { qop: String },

    #[error("proxy credentials are missing the {0}")]
    MissingCredentials(&'static str),

    #[error("invalid proxy authentication challenge: {reason}")]
    InvalidChallenge { reason: String },

    #[error("proxy connect failed with status {status}")]
    ConnectFailed { status: StatusCode },
}

impl ProxyError {
    pub fn invalid_challenge<S: ToString>(str: S) -> Self {
        Self::InvalidChallenge { reason: str.to_string() }
    }
}
