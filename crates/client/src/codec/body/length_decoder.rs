//! Decoder for bodies framed by `Content-Length`.

use std::cmp;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    length: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Yields body bytes until the declared length is consumed, then [`PayloadItem::Eof`].
    ///
    /// Bytes still buffered once the body is complete are more than the server
    /// declared, and fail with [`ParseError::BodySizeOverflow`].
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.length == 0 {
            if !src.is_empty() {
                return Err(ParseError::BodySizeOverflow { extra: src.len() });
            }
            return Ok(Some(PayloadItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = cmp::min(self.length, src.len() as u64);
        let bytes = src.split_to(usize::try_from(len).unwrap_or(usize::MAX)).freeze();

        self.length -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"1012345678"[..]);

        let mut length_decoder = LengthDecoder::new(10);
        let payload = length_decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&payload.as_bytes().unwrap()[..], b"1012345678");

        assert!(length_decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_partial() {
        let mut buffer: BytesMut = BytesMut::from(&b"abc"[..]);

        let mut length_decoder = LengthDecoder::new(5);
        assert_eq!(&length_decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap()[..], b"abc");
        assert!(length_decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"de");
        assert_eq!(&length_decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap()[..], b"de");
        assert!(length_decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_overflow() {
        let mut buffer: BytesMut = BytesMut::from(&b"hello!!"[..]);

        let mut length_decoder = LengthDecoder::new(5);
        assert!(length_decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(length_decoder.decode(&mut buffer), Err(ParseError::BodySizeOverflow { extra: 2 })));
    }
}
