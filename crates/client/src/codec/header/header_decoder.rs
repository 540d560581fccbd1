//! Response header decoder
//!
//! Parses the status line and header fields of a response with `httparse`, then
//! decides how the payload that follows is framed. The decoder needs to know the
//! method of the request being answered, since `HEAD` responses and successful
//! `CONNECT` responses never carry a body whatever their headers say.
//!
//! Header names and values are recorded as byte ranges into the parsed buffer, which
//! is then frozen once and sliced, so no header data is copied.

use bytes::{Buf, BytesMut};
use http::{HeaderName, HeaderValue, Method, Response, StatusCode};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, ReasonPhrase, ResponseHead};

/// Maximum number of header fields in one response
const MAX_HEADER_NUM: usize = 64;

/// Shortest status line that can be complete: `HTTP/1.1 200 \r\n\r\n`
const MIN_RESPONSE_BYTES: usize = 16;

/// Decoder for response headers.
///
/// Yields the parsed [`ResponseHead`] together with the [`PayloadSize`] of the body.
/// Interim `100 Continue` responses are consumed and skipped.
#[derive(Debug)]
pub struct HeaderDecoder {
    max_header_size: usize,
    request_method: Method,
}

impl HeaderDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size, request_method: Method::GET }
    }

    /// Sets the method of the request whose response is decoded next.
    pub fn expect_response_to(&mut self, method: Method) {
        self.request_method = method;
    }
}

impl Decoder for HeaderDecoder {
    type Item = (ResponseHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < MIN_RESPONSE_BYTES {
                ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
                return Ok(None);
            }

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
            let mut resp = httparse::Response::new(&mut headers);

            let parsed_result = resp.parse(src).map_err(|e| match e {
                Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
                Error::Version => ParseError::InvalidVersion(None),
                Error::Status => ParseError::InvalidStatus(None),
                e => ParseError::invalid_header(e.to_string()),
            });

            let body_offset = match parsed_result? {
                Status::Complete(body_offset) => body_offset,
                Status::Partial => {
                    ensure!(src.len() <= self.max_header_size, ParseError::too_large_header(src.len(), self.max_header_size));
                    return Ok(None);
                }
            };

            trace!(header_size = body_offset, "parsed response header size");
            ensure!(body_offset <= self.max_header_size, ParseError::too_large_header(body_offset, self.max_header_size));

            let code = resp.code.ok_or(ParseError::InvalidStatus(None))?;
            if code == 100 {
                trace!("skip interim 100 continue response");
                src.advance(body_offset);
                continue;
            }
            let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus(Some(code)))?;

            let version = match resp.version {
                Some(0) => http::Version::HTTP_10,
                Some(1) => http::Version::HTTP_11,
                v => return Err(ParseError::InvalidVersion(v)),
            };

            let header_count = resp.headers.len();
            let mut header_index = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];
            HeaderIndex::record(src, resp.headers, &mut header_index);
            let reason = resp.reason.map(|reason| range_of(src, reason.as_bytes()));

            let header_bytes = src.split_to(body_offset).freeze();

            let mut head = Response::new(());
            *head.status_mut() = status;
            *head.version_mut() = version;

            let headers = head.headers_mut();
            headers.reserve(header_count);
            for index in &header_index[..header_count] {
                let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1])
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                let value = HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1))
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                headers.append(name, value);
            }

            if let Some((start, end)) = reason.filter(|(start, end)| end > start) {
                head.extensions_mut().insert(ReasonPhrase::new(header_bytes.slice(start..end)));
            }

            let payload_size = parse_payload(&head, &self.request_method, header_count)?;
            return Ok(Some((head, payload_size)));
        }
    }
}

/// Start and end positions of a header's name and value inside the parsed buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        for (header, index) in headers.iter().zip(indices.iter_mut()) {
            index.name = range_of(bytes, header.name.as_bytes());
            index.value = range_of(bytes, header.value);
        }
    }
}

fn range_of(bytes: &[u8], part: &[u8]) -> (usize, usize) {
    let start = part.as_ptr() as usize - bytes.as_ptr() as usize;
    (start, start + part.len())
}

/// Decides how the body that follows a response header is framed.
///
/// No body follows for `HEAD`, for a `2xx` to `CONNECT`, for `204`, `205` and `304`, or
/// when the response has no header at all. Otherwise `Transfer-Encoding` takes
/// precedence over `Content-Length`, and chunked must be its final coding. A response
/// that declares neither is treated as empty.
fn parse_payload(head: &ResponseHead, request_method: &Method, header_count: usize) -> Result<PayloadSize, ParseError> {
    if request_method == Method::HEAD || (request_method == Method::CONNECT && head.status().is_success()) {
        return Ok(PayloadSize::new_empty());
    }

    if matches!(head.status(), StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED) {
        return Ok(PayloadSize::new_empty());
    }

    if header_count == 0 {
        return Ok(PayloadSize::new_empty());
    }

    // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
    if let Some(te_value) = head.headers().get(http::header::TRANSFER_ENCODING) {
        return if is_chunked(te_value) {
            Ok(PayloadSize::new_chunked())
        } else {
            Err(ParseError::invalid_header("unsupported transfer-encoding"))
        };
    }

    match head.headers().get(http::header::CONTENT_LENGTH) {
        None => Ok(PayloadSize::new_empty()),
        Some(cl_value) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length = cl_str
                .trim()
                .parse::<i64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not a number")))?;
            let length = u64::try_from(length).map_err(|_| ParseError::invalid_content_length(format!("negative value {length}")))?;
            Ok(PayloadSize::new_length(length))
        }
    }
}

/// Checks that `chunked` is the final coding of a `Transfer-Encoding` value.
fn is_chunked(value: &HeaderValue) -> bool {
    value
        .as_bytes()
        .rsplit(|b| *b == b',')
        .next()
        .is_some_and(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
