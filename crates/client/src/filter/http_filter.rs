//! HTTP/1.1 stage of the filter chain
//!
//! Going down, a [`Payload::Request`] is encoded into a header write followed, for a
//! buffered body, by a body write once the header has been carried. The request's own
//! write id completes when the last of these completes. A chunked body is not written
//! here: the connection opens the request's output stream when the header is out and
//! writes the framed chunks below this stage.
//!
//! Going up, bytes are decoded into one [`Payload::Response`] per request. The response
//! is delivered as soon as its header is complete, its body keeps flowing into the
//! response's input stream, and [`Upstream::MessageComplete`] follows the last byte.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace};

use crate::codec::{RequestEncoder, ResponseDecoder};
use crate::filter::{Downstream, Filter, FilterContext, Payload, Upstream, WriteId};
use crate::protocol::{ClientError, ClientRequest, ClientResponse, Message, ParseError, PayloadItem, RequestBody};
use crate::stream::{BodySink, ListenerExecutor, body_stream};

#[derive(Debug)]
pub struct HttpFilter {
    encoder: RequestEncoder,
    decoder: ResponseDecoder,
    read_buf: BytesMut,
    sending: Option<Sending>,
    awaiting_response: bool,
    body_sink: Option<BodySink>,
    executor: Option<ListenerExecutor>,
}

/// Writes of the request currently going out.
#[derive(Debug)]
struct Sending {
    request_id: WriteId,
    waiting_for: WriteId,
    body: Option<Bytes>,
}

impl HttpFilter {
    pub fn new(max_header_size: usize, max_chunk_size_digits: usize) -> Self {
        Self {
            encoder: RequestEncoder::new(),
            decoder: ResponseDecoder::new(max_header_size, max_chunk_size_digits),
            read_buf: BytesMut::new(),
            sending: None,
            awaiting_response: false,
            body_sink: None,
            executor: None,
        }
    }

    /// Runs the listeners of response bodies on `executor`.
    pub fn with_executor(mut self, executor: Option<ListenerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    fn send_request(&mut self, request: ClientRequest, request_id: WriteId, cx: &mut FilterContext<'_>) {
        let payload_size = request.payload_size();
        let (head, body) = request.into_parts();
        let method = head.method().clone();

        let mut header = BytesMut::with_capacity(256);
        if let Err(e) = self.encoder.encode(Message::<_, Bytes>::Header((head, payload_size)), &mut header) {
            error!(?method, "failed to encode request header, cause: {}", e);
            cx.fail(e.into());
            return;
        }

        let body = match body {
            RequestBody::Buffered(bytes) if !bytes.is_empty() => {
                let mut encoded = BytesMut::with_capacity(bytes.len());
                if let Err(e) = self.encoder.encode(Message::Payload(PayloadItem::Chunk(bytes)), &mut encoded) {
                    error!(?method, "failed to encode request body, cause: {}", e);
                    cx.fail(e.into());
                    return;
                }
                Some(encoded.freeze())
            }
            _ => None,
        };

        trace!(?method, header_size = header.len(), "sending request");
        self.decoder.expect_response_to(method);
        self.awaiting_response = true;

        let waiting_for = cx.next_write_id();
        self.sending = Some(Sending { request_id, waiting_for, body });
        cx.write(Payload::Bytes(header.freeze()), waiting_for);
    }

    fn on_write_completed(&mut self, id: WriteId, cx: &mut FilterContext<'_>) {
        let Some(sending) = self.sending.as_mut().filter(|sending| sending.waiting_for == id) else {
            cx.emit(Upstream::WriteCompleted(id));
            return;
        };

        match sending.body.take() {
            Some(body) => {
                let body_id = cx.next_write_id();
                sending.waiting_for = body_id;
                cx.write(Payload::Bytes(body), body_id);
            }
            None => {
                let request_id = sending.request_id;
                self.sending = None;
                cx.emit(Upstream::WriteCompleted(request_id));
            }
        }
    }

    fn on_read(&mut self, bytes: Bytes, cx: &mut FilterContext<'_>) {
        if !self.awaiting_response && !self.decoder.in_body() {
            debug!(len = bytes.len(), "received data while no response was expected");
            cx.fail(ParseError::UnexpectedData { len: bytes.len() }.into());
            return;
        }

        self.read_buf.extend_from_slice(&bytes);

        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(Message::Header((head, payload_size)))) => {
                    trace!(status = head.status().as_u16(), ?payload_size, "received response header");
                    let (body, sink) = body_stream(self.executor.clone());
                    self.body_sink = Some(sink);
                    let response = ClientResponse::new(head, body, !payload_size.is_empty());
                    cx.emit(Upstream::Read(Payload::Response(Box::new(response))));
                }
                Ok(Some(Message::Payload(PayloadItem::Chunk(chunk)))) => {
                    if let Some(sink) = &self.body_sink {
                        sink.push(chunk);
                    }
                }
                Ok(Some(Message::Payload(PayloadItem::Eof))) => {
                    if let Some(sink) = self.body_sink.take() {
                        sink.complete();
                    }
                    self.awaiting_response = false;
                    cx.emit(Upstream::MessageComplete);
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("failed to decode response, cause: {}", e);
                    let error = ClientError::from(e);
                    self.abort(&error);
                    cx.fail(error);
                    break;
                }
            }
        }
    }

    fn abort(&mut self, error: &ClientError) {
        if let Some(sink) = self.body_sink.take() {
            sink.error(error.clone());
        }
        self.decoder.reset();
        self.read_buf.clear();
        self.awaiting_response = false;
    }
}

impl Filter for HttpFilter {
    fn on_downstream(&mut self, command: Downstream, cx: &mut FilterContext<'_>) {
        match command {
            Downstream::Write { payload: Payload::Request(request), id } => self.send_request(*request, id, cx),
            Downstream::Close => {
                if self.decoder.in_body() {
                    self.abort(&ClientError::connection_closed("connection closed while receiving the response body"));
                }
                cx.close();
            }
            command => cx.send(command),
        }
    }

    fn on_upstream(&mut self, event: Upstream, cx: &mut FilterContext<'_>) {
        match event {
            Upstream::Read(Payload::Bytes(bytes)) => self.on_read(bytes, cx),
            Upstream::WriteCompleted(id) => self.on_write_completed(id, cx),
            Upstream::ConnectionClosed => {
                if self.decoder.in_body() {
                    self.abort(&ClientError::connection_closed("connection closed while receiving the response body"));
                }
                cx.emit(Upstream::ConnectionClosed);
            }
            Upstream::Error(error) => {
                self.abort(&error);
                cx.emit(Upstream::Error(error));
            }
            event => cx.emit(event),
        }
    }
}

impl Default for HttpFilter {
    fn default() -> Self {
        Self::new(8 * 1024, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;
    use http::{Method, StatusCode};
    use indoc::indoc;

    fn chain() -> FilterChain {
        FilterChain::new(vec![Box::new(HttpFilter::default())])
    }

    fn written(output: &crate::filter::ChainOutput) -> Vec<(WriteId, Bytes)> {
        output
            .transport
            .iter()
            .filter_map(|command| match command {
                Downstream::Write { payload: Payload::Bytes(bytes), id } => Some((*id, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffered_body_is_written_after_header() {
        let mut chain = chain();
        let request = ClientRequest::buffered(Method::POST, "http://localhost:8080/items".parse().unwrap(), "abc");
        let (request_id, output) = chain.write(Payload::Request(Box::new(request)));

        let writes = written(&output);
        assert_eq!(writes.len(), 1);
        let header = String::from_utf8(writes[0].1.to_vec()).unwrap();
        assert!(header.starts_with("POST /items HTTP/1.1\r\n"));
        assert!(header.contains("host: localhost:8080\r\n"));
        assert!(header.contains("content-length: 3\r\n"));

        let output = chain.transport_write_completed(writes[0].0);
        assert!(output.events.is_empty());
        let writes = written(&output);
        assert_eq!(&writes[0].1[..], b"abc");

        let output = chain.transport_write_completed(writes[0].0);
        assert!(matches!(&output.events[..], [Upstream::WriteCompleted(id)] if *id == request_id));
    }

    #[test]
    fn response_header_then_body() {
        let mut chain = chain();
        let (request_id, output) = chain.write(Payload::Request(Box::new(ClientRequest::get("http://localhost/".parse().unwrap()))));
        let writes = written(&output);
        let output = chain.transport_write_completed(writes[0].0);
        assert!(matches!(&output.events[..], [Upstream::WriteCompleted(id)] if *id == request_id));

        let output = chain.transport_read(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello"));
        let [Upstream::Read(Payload::Response(response))] = &output.events[..] else { panic!("expect response, got {:?}", output.events) };
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.has_content());

        let output = chain.transport_read(Bytes::from_static(b"world"));
        assert!(matches!(&output.events[..], [Upstream::MessageComplete]));

        let body = response.body().read_to_bytes().unwrap();
        assert_eq!(&body[..], b"helloworld");
    }

    #[test]
    fn chunked_response() {
        let mut chain = chain();
        chain.write(Payload::Request(Box::new(ClientRequest::get("http://localhost/".parse().unwrap()))));

        let output = chain.transport_read(Bytes::from_static(
            indoc! {"
            HTTP/1.1 200 OK\r
            Transfer-Encoding: chunked\r
            \r
            5\r
            hello\r
            0\r
            \r
            "}
            .as_bytes(),
        ));
        let [Upstream::Read(Payload::Response(response)), Upstream::MessageComplete] = &output.events[..] else {
            panic!("unexpected events {:?}", output.events)
        };
        assert_eq!(&response.body().read_to_bytes().unwrap()[..], b"hello");
    }

    #[test]
    fn data_without_request_is_unexpected() {
        let mut chain = chain();
        let output = chain.transport_read(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));
        let [Upstream::Error(ClientError::Parse { source })] = &output.events[..] else { panic!("expect parse error") };
        assert!(matches!(**source, ParseError::UnexpectedData { len: 19 }));
    }

    #[test]
    fn close_while_receiving_body_fails_stream() {
        let mut chain = chain();
        chain.write(Payload::Request(Box::new(ClientRequest::get("http://localhost/".parse().unwrap()))));
        let output = chain.transport_read(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel"));
        let [Upstream::Read(Payload::Response(response))] = &output.events[..] else { panic!("expect response") };

        let output = chain.transport_closed();
        assert!(matches!(&output.events[..], [Upstream::ConnectionClosed]));

        let error = response.body().read_to_bytes().unwrap_err();
        assert!(error.is_connection_closed());
    }

    #[test]
    fn malformed_response_fails() {
        let mut chain = chain();
        chain.write(Payload::Request(Box::new(ClientRequest::get("http://localhost/".parse().unwrap()))));
        let output = chain.transport_read(Bytes::from_static(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n"));
        assert!(matches!(&output.events[..], [Upstream::Error(ClientError::Parse { .. })]));
    }
}
