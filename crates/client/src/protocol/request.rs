use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};

use crate::protocol::PayloadSize;
use crate::stream::ChunkedBodyOutputStream;

/// The request line and headers of an outgoing request.
pub type RequestHead = Request<()>;

/// How the body of a request travels over the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Buffered,
    Chunked,
}

#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Buffered(Bytes),
    Chunked(ChunkedBodyOutputStream),
}

/// A request submitted to the client.
///
/// Once sent, the head is only touched by the HTTP filter, which adds `Host`,
/// `Content-Length` or `Transfer-Encoding` when the caller did not supply them.
#[derive(Debug)]
pub struct ClientRequest {
    head: RequestHead,
    body: RequestBody,
}

impl ClientRequest {
    pub fn new(head: RequestHead, body: RequestBody) -> Self {
        Self { head, body }
    }

    /// A request without body.
    pub fn empty(method: Method, uri: Uri) -> Self {
        Self::new(head(method, uri), RequestBody::Empty)
    }

    pub fn get(uri: Uri) -> Self {
        Self::empty(Method::GET, uri)
    }

    /// A request whose whole body is known up front.
    pub fn buffered<B: Into<Bytes>>(method: Method, uri: Uri, body: B) -> Self {
        Self::new(head(method, uri), RequestBody::Buffered(body.into()))
    }

    /// A request whose body is streamed as HTTP chunks of at most `chunk_size` bytes.
    ///
    /// The returned stream is the writing end of the body. It only starts accepting data
    /// once the request header has been written; see [`ChunkedBodyOutputStream`].
    pub fn chunked(method: Method, uri: Uri, chunk_size: usize) -> (Self, ChunkedBodyOutputStream) {
        let stream = ChunkedBodyOutputStream::new(chunk_size);
        (Self::new(head(method, uri), RequestBody::Chunked(stream.clone())), stream)
    }

    #[inline]
    pub fn body_mode(&self) -> BodyMode {
        match &self.body {
            RequestBody::Empty => BodyMode::None,
            RequestBody::Buffered(_) => BodyMode::Buffered,
            RequestBody::Chunked(_) => BodyMode::Chunked,
        }
    }

    pub fn payload_size(&self) -> PayloadSize {
        match &self.body {
            RequestBody::Empty => PayloadSize::Empty,
            RequestBody::Buffered(bytes) => PayloadSize::new_length(bytes.len() as u64),
            RequestBody::Chunked(_) => PayloadSize::Chunked,
        }
    }

    #[inline]
    pub fn method(&self) -> &Method {
        self.head.method()
    }

    #[inline]
    pub fn uri(&self) -> &Uri {
        self.head.uri()
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.head.headers_mut()
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn body_stream(&self) -> Option<&ChunkedBodyOutputStream> {
        match &self.body {
            RequestBody::Chunked(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (RequestHead, RequestBody) {
        (self.head, self.body)
    }
}

impl From<Request<Bytes>> for ClientRequest {
    fn from(request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let body = if body.is_empty() { RequestBody::Empty } else { RequestBody::Buffered(body) };
        Self::new(Request::from_parts(parts, ()), body)
    }
}

fn head(method: Method, uri: Uri) -> RequestHead {
    let mut head = Request::new(());
    *head.method_mut() = method;
    *head.uri_mut() = uri;
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_mode_follows_body() {
        let uri: Uri = "http://localhost/".parse().unwrap();

        let request = ClientRequest::get(uri.clone());
        assert_eq!(request.body_mode(), BodyMode::None);
        assert!(request.payload_size().is_empty());

        let request = ClientRequest::buffered(Method::POST, uri.clone(), "hello");
        assert_eq!(request.body_mode(), BodyMode::Buffered);
        assert_eq!(request.payload_size(), PayloadSize::Length(5));

        let (request, _stream) = ClientRequest::chunked(Method::PUT, uri, 16);
        assert_eq!(request.body_mode(), BodyMode::Chunked);
        assert!(request.payload_size().is_chunked());
        assert!(request.body_stream().is_some());
    }

    #[test]
    fn from_http_request() {
        let request = Request::builder().method(Method::POST).uri("http://localhost/a").body(Bytes::from_static(b"x")).unwrap();
        let request = ClientRequest::from(request);
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.uri().path(), "/a");
        assert_eq!(request.payload_size(), PayloadSize::Length(1));
    }
}
