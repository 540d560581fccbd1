//! Decoder for `Transfer-Encoding: chunked` response bodies.
//!
//! Refer: [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding)
//!
//! The size line is limited to a configured number of hex digits and the trailer
//! section to the maximum header size. Chunk extensions and trailer fields are read
//! and discarded.

use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

use crate::protocol::{ParseError, PayloadItem};

/// A decoder for chunked bodies.
///
/// Every piece of chunk data is yielded as soon as it arrives, so a chunk larger
/// than the read buffer comes out as several [`PayloadItem::Chunk`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    progress: Progress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Progress {
    remaining_size: u64,
    digits: usize,
    trailer_size: usize,
    max_digits: usize,
    max_trailer_size: usize,
}

impl ChunkedDecoder {
    pub fn new(max_digits: usize, max_trailer_size: usize) -> Self {
        Self {
            state: Size,
            progress: Progress { remaining_size: 0, digits: 0, trailer_size: 0, max_digits, max_trailer_size },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.state.step(src, &mut self.progress, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(e),
            };

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.is_empty() {
            return Poll::Pending;
        }
        $src.get_u8()
    }};
}

impl ChunkedState {
    fn step(&self, src: &mut BytesMut, progress: &mut Progress, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        match self {
            Size => ChunkedState::read_size(src, progress),
            SizeLws => ChunkedState::read_size_lws(src),
            Extension => ChunkedState::read_extension(src),
            SizeLf => ChunkedState::read_size_lf(src, progress),
            Body => ChunkedState::read_body(src, &mut progress.remaining_size, buf),
            BodyCr => ChunkedState::read_body_cr(src),
            BodyLf => ChunkedState::read_body_lf(src),
            Trailer => ChunkedState::read_trailer(src, progress),
            TrailerLf => ChunkedState::read_trailer_lf(src, progress),
            EndCr => ChunkedState::read_end_cr(src, progress),
            EndLf => ChunkedState::read_end_lf(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Reads the hex chunk size, one digit at a time.
    ///
    /// Spaces and tabs before the first digit are skipped; after it they end the size.
    fn read_size(src: &mut BytesMut, progress: &mut Progress) -> Poll<Result<ChunkedState, ParseError>> {
        let digit = match try_next_byte!(src) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' if progress.digits == 0 => return Poll::Ready(Ok(Size)),
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' if progress.digits > 0 => return Poll::Ready(Ok(Extension)),
            b'\r' if progress.digits > 0 => return Poll::Ready(Ok(SizeLf)),
            _ => return Poll::Ready(Err(ParseError::invalid_chunk_size("invalid size"))),
        };

        progress.digits += 1;
        if progress.digits > progress.max_digits {
            return Poll::Ready(Err(ParseError::TooLargeChunkSize { max_digits: progress.max_digits }));
        }

        match progress.remaining_size.checked_mul(16).and_then(|size| size.checked_add(u64::from(digit))) {
            Some(size) => progress.remaining_size = size,
            None => return Poll::Ready(Err(ParseError::invalid_chunk_size("chunk size overflow"))),
        }

        Poll::Ready(Ok(Size))
    }

    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk_size("invalid linear white space"))),
        }
    }

    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        // extensions end at the next CRLF, a bare LF is rejected
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_chunk_size("extension contains newline"))),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    fn read_size_lf(src: &mut BytesMut, progress: &mut Progress) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => {
                progress.digits = 0;
                if progress.remaining_size == 0 { Poll::Ready(Ok(EndCr)) } else { Poll::Ready(Ok(Body)) }
            }
            _ => Poll::Ready(Err(ParseError::invalid_chunk_size("invalid size LF"))),
        }
    }

    fn read_body(src: &mut BytesMut, remaining_size: &mut u64, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        if src.is_empty() {
            return Poll::Ready(Ok(Body));
        }

        if *remaining_size == 0 {
            return Poll::Ready(Ok(BodyCr));
        }

        let remaining = usize::try_from(*remaining_size).unwrap_or(usize::MAX);
        let read_size = remaining.min(src.len());

        *remaining_size -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if *remaining_size > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid chunk body LF"))),
        }
    }

    fn read_trailer(src: &mut BytesMut, progress: &mut Progress) -> Poll<Result<ChunkedState, ParseError>> {
        let byte = try_next_byte!(src);
        if let Err(e) = progress.count_trailer_byte() {
            return Poll::Ready(Err(e));
        }
        match byte {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            _ => Poll::Ready(Ok(Trailer)),
        }
    }

    fn read_trailer_lf(src: &mut BytesMut, progress: &mut Progress) -> Poll<Result<ChunkedState, ParseError>> {
        let byte = try_next_byte!(src);
        if let Err(e) = progress.count_trailer_byte() {
            return Poll::Ready(Err(e));
        }
        match byte {
            b'\n' => Poll::Ready(Ok(EndCr)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid trailer end LF"))),
        }
    }

    fn read_end_cr(src: &mut BytesMut, progress: &mut Progress) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(EndLf)),
            _ => match progress.count_trailer_byte() {
                Ok(()) => Poll::Ready(Ok(Trailer)),
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }

    fn read_end_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(End)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid chunk end LF"))),
        }
    }
}

impl Progress {
    fn count_trailer_byte(&mut self) -> Result<(), ParseError> {
        self.trailer_size += 1;
        if self.trailer_size > self.max_trailer_size {
            return Err(ParseError::TooLargeTrailer { max_size: self.max_trailer_size });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkedDecoder {
        ChunkedDecoder::new(16, 8 * 1024)
    }

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = decoder();

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(item.is_chunk());
        assert_eq!(&item.as_bytes().unwrap()[..], b"1234567890abcdef");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_multiple_chunks() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b", world"));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_chunks_with_extensions_and_trailers() {
        let mut buffer: BytesMut = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0\r\nTrailer: value\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_leading_whitespace_before_size() {
        let mut buffer: BytesMut = BytesMut::from(&b"  \t3\r\nabc\r\n0\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"abc"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_incomplete_chunk() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hel"));

        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"lo\r\n0\r\n\r\n");

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"lo"));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut buffer: BytesMut = BytesMut::from(&b"xyz\r\n"[..]);
        assert!(matches!(decoder().decode(&mut buffer), Err(ParseError::InvalidChunkSize { .. })));

        let mut buffer: BytesMut = BytesMut::from(&b"\r\n"[..]);
        assert!(matches!(decoder().decode(&mut buffer), Err(ParseError::InvalidChunkSize { .. })));
    }

    #[test]
    fn test_too_many_size_digits() {
        let mut buffer: BytesMut = BytesMut::from(&b"00000000000000001\r\n"[..]);
        assert!(matches!(decoder().decode(&mut buffer), Err(ParseError::TooLargeChunkSize { max_digits: 16 })));

        let mut buffer: BytesMut = BytesMut::from(&b"1234\r\n"[..]);
        assert!(matches!(ChunkedDecoder::new(3, 1024).decode(&mut buffer), Err(ParseError::TooLargeChunkSize { max_digits: 3 })));
    }

    #[test]
    fn test_trailer_over_limit() {
        let mut buffer: BytesMut = BytesMut::from(&b"0\r\nX-Trailer: a long trailer value\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new(16, 8);
        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::TooLargeTrailer { max_size: 8 })));
    }

    #[test]
    fn test_missing_crlf() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hello"));

        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_large_chunk() {
        let size = 1024 * 1024;
        let mut data = Vec::with_capacity(size + 16);
        data.extend(format!("{size:x}\r\n").into_bytes());
        data.extend(vec![b'A'; size]);
        data.extend(b"\r\n0\r\n\r\n");

        let mut buffer = BytesMut::from(&data[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap().len(), size);
        assert!(chunk.as_bytes().unwrap().iter().all(|&b| b == b'A'));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    /// Feeds `wire` in pieces of `split` bytes, returning the body and the number
    /// of bytes fed when the end of the body was reported.
    fn decode_split(wire: &[u8], split: usize) -> (Vec<u8>, usize) {
        let mut decoder = decoder();
        let mut buffer = BytesMut::new();
        let mut body = vec![];
        let mut fed = 0;

        for piece in wire.chunks(split) {
            buffer.extend_from_slice(piece);
            fed += piece.len();
            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                match item {
                    PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                    PayloadItem::Eof => {
                        assert!(buffer.is_empty());
                        return (body, fed);
                    }
                }
            }
        }
        panic!("end of body never reported after {fed} bytes");
    }

    #[test]
    fn test_wikipedia_split_anywhere() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        for split in 1..=wire.len() {
            let (body, fed) = decode_split(wire, split);
            assert_eq!(body, b"Wikipedia", "split {split}");
            // reported once, and only with the last byte
            assert_eq!(fed, wire.len(), "split {split}");
        }
    }

    #[test]
    fn test_encoder_output_round_trips() {
        use crate::codec::ChunkedEncoder;
        use tokio_util::codec::Encoder;

        let chunks: [&[u8]; 5] = [b"a", b"", b"0123456789abcdef0", &[b'x'; 300], b"\r\n0\r\n\r\n"];
        let mut encoder = ChunkedEncoder::new();
        let mut wire = BytesMut::new();
        for chunk in chunks {
            encoder.encode(PayloadItem::Chunk(Bytes::copy_from_slice(chunk)), &mut wire).unwrap();
        }
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut wire).unwrap();
        let expected: Vec<u8> = chunks.concat();

        for split in [1, 2, 3, 5, 7, 64, wire.len()] {
            let (body, fed) = decode_split(&wire, split);
            assert_eq!(body, expected, "split {split}");
            assert_eq!(fed, wire.len(), "split {split}");
        }
    }
}
