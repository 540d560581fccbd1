use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode, Version};

use crate::stream::BodyInputStream;

/// The status line and headers of a received response.
pub type ResponseHead = Response<()>;

/// The reason phrase of the status line, kept in the head's extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(Bytes);

impl ReasonPhrase {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A response handed back to the caller: status, headers and a forward-only body stream.
///
/// The body keeps filling after the response has been delivered, so the stream can be
/// consumed either with blocking reads or through the readiness contract, see
/// [`BodyInputStream`].
#[derive(Debug)]
pub struct ClientResponse {
    head: ResponseHead,
    body: BodyInputStream,
    has_content: bool,
}

impl ClientResponse {
    pub fn new(head: ResponseHead, body: BodyInputStream, has_content: bool) -> Self {
        Self { head, body, has_content }
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version()
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    /// The reason phrase sent by the server, or the canonical one when none was sent.
    pub fn reason(&self) -> &str {
        self.head
            .extensions()
            .get::<ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .or_else(|| self.status().canonical_reason())
            .unwrap_or("")
    }

    /// Whether the response carries a body at all.
    #[inline]
    pub fn has_content(&self) -> bool {
        self.has_content
    }

    #[inline]
    pub fn body(&self) -> &BodyInputStream {
        &self.body
    }

    pub fn into_body(self) -> BodyInputStream {
        self.body
    }

    pub fn into_parts(self) -> (ResponseHead, BodyInputStream) {
        (self.head, self.body)
    }

    /// `true` when the server asked for the connection to be closed after this response.
    pub fn is_connection_close(&self) -> bool {
        self.headers().get_all(http::header::CONNECTION).iter().any(|value| {
            value.as_bytes().split(|b| *b == b',').any(|token| token.trim_ascii().eq_ignore_ascii_case(b"close"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::body_stream;

    fn response(head: ResponseHead) -> ClientResponse {
        let (body, _sink) = body_stream(None);
        ClientResponse::new(head, body, false)
    }

    #[test]
    fn reason_falls_back_to_canonical() {
        let mut head = Response::new(());
        *head.status_mut() = StatusCode::NOT_FOUND;
        assert_eq!(response(head).reason(), "Not Found");

        let mut head = Response::new(());
        head.extensions_mut().insert(ReasonPhrase::new(Bytes::from_static(b"Nope")));
        assert_eq!(response(head).reason(), "Nope");
    }

    #[test]
    fn connection_close_token() {
        let mut head = Response::new(());
        head.headers_mut().insert(http::header::CONNECTION, "keep-alive, Close".parse().unwrap());
        assert!(response(head).is_connection_close());

        let mut head = Response::new(());
        head.headers_mut().insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(!response(head).is_connection_close());
    }
}
