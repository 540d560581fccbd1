//! Body codecs.
//!
//! Response bodies are decoded by [`PayloadDecoder`], which dispatches to the
//! `Content-Length` or the chunked decoder. Request bodies are written by
//! [`LengthEncoder`] when buffered and by [`ChunkedEncoder`] when streamed.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;

pub use chunked_encoder::ChunkedEncoder;
pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
