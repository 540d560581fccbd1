//! Core protocol types of the client transport.
//!
//! - **Messages** ([`Message`], [`PayloadItem`], [`PayloadSize`]): what the codec
//!   produces and consumes
//! - **Requests** ([`ClientRequest`], [`BodyMode`], [`RequestBody`]): what a caller submits
//! - **Responses** ([`ClientResponse`], [`ReasonPhrase`]): what a caller gets back
//! - **Errors** ([`ClientError`] and the per-domain errors it wraps)

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::BodyMode;
pub use request::ClientRequest;
pub use request::RequestBody;
pub use request::RequestHead;

mod response;
pub use response::ClientResponse;
pub use response::ReasonPhrase;
pub use response::ResponseHead;

mod error;
pub use error::ClientError;
pub use error::ParseError;
pub use error::ProxyError;
pub use error::SendError;
pub use error::TimeoutKind;
pub use error::TlsError;
