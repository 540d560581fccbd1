//! Request encoder
//!
//! Encodes a request head, then the buffered body if it has one. A chunked body is
//! not written here: once the head is out, the body's own output stream frames and
//! writes its chunks.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::LengthEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadItem, PayloadSize, RequestHead, SendError};

#[derive(Debug)]
pub struct RequestEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<LengthEncoder>,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }

    /// `true` when no body bytes are owed for the last encoded head.
    pub fn is_finish(&self) -> bool {
        self.payload_encoder.as_ref().is_none_or(LengthEncoder::is_finish)
    }
}

impl Default for RequestEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Buf> Encoder<Message<(RequestHead, PayloadSize), D>> for RequestEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(RequestHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if !self.is_finish() {
                    error!("request head encoded before the previous body was complete");
                    return Err(SendError::invalid_body("previous request body is not complete"));
                }

                self.payload_encoder = match payload_size {
                    PayloadSize::Length(n) => Some(LengthEncoder::new(n)),
                    PayloadSize::Chunked | PayloadSize::Empty => None,
                };

                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect request head, but received body bytes");
                    return Err(SendError::invalid_body("no request body expected"));
                };

                let is_eof = payload_item.is_eof();
                payload_encoder.encode(payload_item, dst)?;

                if is_eof {
                    if !payload_encoder.is_finish() {
                        return Err(SendError::invalid_body("body is shorter than its content-length"));
                    }
                    self.payload_encoder = None;
                } else if payload_encoder.is_finish() {
                    self.payload_encoder = None;
                }
                Ok(())
            }
        }
    }
}
