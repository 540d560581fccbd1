//! Streaming response decoder
//!
//! Combines the [`HeaderDecoder`] and the [`PayloadDecoder`] into one decoder that
//! yields a response as a sequence of [`Message`]s:
//!
//! 1. `Message::Header((head, payload_size))` once the header is complete
//! 2. zero or more `Message::Payload(PayloadItem::Chunk(_))`
//! 3. a final `Message::Payload(PayloadItem::Eof)`
//!
//! One response is decoded at a time. The caller announces the method of the request
//! being answered with [`ResponseDecoder::expect_response_to`] before the header
//! arrives. Any byte left in the buffer once a response is complete is an error.

use bytes::BytesMut;
use http::Method;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHead};

#[derive(Debug)]
pub struct ResponseDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
    max_header_size: usize,
    max_chunk_size_digits: usize,
}

impl ResponseDecoder {
    pub fn new(max_header_size: usize, max_chunk_size_digits: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(max_header_size), payload_decoder: None, max_header_size, max_chunk_size_digits }
    }

    pub fn expect_response_to(&mut self, method: Method) {
        self.header_decoder.expect_response_to(method);
    }

    /// `true` while the body of a decoded header is still being read.
    pub fn in_body(&self) -> bool {
        self.payload_decoder.is_some()
    }

    /// Drops the decoding progress of the current response.
    pub fn reset(&mut self) {
        self.payload_decoder = None;
    }

    fn payload_decoder(&self, payload_size: PayloadSize) -> PayloadDecoder {
        match payload_size {
            PayloadSize::Length(n) => PayloadDecoder::fix_length(n),
            PayloadSize::Chunked => PayloadDecoder::chunked(self.max_chunk_size_digits, self.max_header_size),
            PayloadSize::Empty => PayloadDecoder::empty(),
        }
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder.take();
                    if !src.is_empty() {
                        return Err(ParseError::UnexpectedData { len: src.len() });
                    }
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((head, payload_size)) => {
                self.payload_decoder = Some(self.payload_decoder(payload_size));
                Some(Message::Header((head, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
