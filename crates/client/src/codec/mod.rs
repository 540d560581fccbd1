//! HTTP/1.1 codecs of the client side
//!
//! - [`RequestEncoder`] writes a request head and a buffered body
//! - [`ResponseDecoder`] reads a response as a header followed by streamed payload items
//! - [`ChunkedEncoder`] frames the chunks of a streamed request body
//!
//! All of them follow the `tokio_util::codec` traits and work on `BytesMut`, they never
//! touch a socket.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_client::codec::ResponseDecoder;
//! use micro_client::protocol::Message;
//! use tokio_util::codec::Decoder;
//!
//! let mut decoder = ResponseDecoder::new(8 * 1024, 16);
//! let mut buf = BytesMut::from("HTTP/1.1 204 No Content\r\n\r\n");
//! let message = decoder.decode(&mut buf).unwrap().unwrap();
//! assert!(matches!(message, Message::Header(_)));
//! ```

mod body;
mod header;
mod request_encoder;
mod response_decoder;

pub use body::ChunkedEncoder;
pub use request_encoder::RequestEncoder;
pub use response_decoder::ResponseDecoder;
