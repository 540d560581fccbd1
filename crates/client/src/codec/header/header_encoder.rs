//! Request header encoder
//!
//! Serializes the request line and header fields of a [`RequestHead`]. The framing
//! headers are derived from the [`PayloadSize`] of the body and from the target URI,
//! but a value the caller already set is always kept.

use std::io;
use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, Method, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{PayloadSize, RequestHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for request headers implementing the [`Encoder`] trait.
///
/// Adds, only when absent:
/// - `Host`, built from the authority of the request URI
/// - `Content-Length` for a length framed or empty body
/// - `Transfer-Encoding: chunked` for a chunked body
#[derive(Debug)]
pub struct HeaderEncoder;

impl Encoder<(RequestHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (RequestHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        let version = match head.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        };

        let authority = head.uri().authority().ok_or_else(|| SendError::invalid_request("request uri has no host"))?;
        // userinfo never goes on the wire
        let host_port = match authority.port_u16() {
            Some(port) => format!("{}:{}", authority.host(), port),
            None => authority.host().to_owned(),
        };
        let connect = head.method() == Method::CONNECT;

        dst.reserve(INIT_HEADER_SIZE);
        if connect {
            write!(FastWrite(dst), "{} {} {}\r\n", head.method(), host_port, version)?;
        } else {
            let target = head.uri().path_and_query().map_or("/", |path_and_query| path_and_query.as_str());
            write!(FastWrite(dst), "{} {} {}\r\n", head.method(), target, version)?;
        }

        let headers = head.headers_mut();
        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&host_port).map_err(|e| SendError::invalid_request(e.to_string()))?;
            headers.insert(header::HOST, host);
        }

        match payload_size {
            // a tunnel request has no body to frame
            PayloadSize::Length(_) | PayloadSize::Empty if connect => {}
            PayloadSize::Length(n) => {
                if !headers.contains_key(header::CONTENT_LENGTH) {
                    headers.insert(header::CONTENT_LENGTH, n.into());
                }
            }
            PayloadSize::Chunked => {
                if !headers.contains_key(header::TRANSFER_ENCODING) {
                    const CHUNKED_VALUE: HeaderValue = HeaderValue::from_static("chunked");
                    headers.insert(header::TRANSFER_ENCODING, CHUNKED_VALUE);
                }
            }
            PayloadSize::Empty => {
                if !headers.contains_key(header::CONTENT_LENGTH) {
                    const ZERO_VALUE: HeaderValue = HeaderValue::from_static("0");
                    headers.insert(header::CONTENT_LENGTH, ZERO_VALUE);
                }
            }
        }

        for (header_name, header_value) in head.headers() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// `io::Write` over a `BytesMut`, used for the formatted request line.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
