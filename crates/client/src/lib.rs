//! An asynchronous micro HTTP/1.1 client transport
//!
//! This crate turns raw byte streams into pooled HTTP/1.1 request/response endpoints,
//! built on top of tokio. It focuses on the transport: connections, framing, TLS,
//! proxy tunneling and body streaming. Redirects, retries and cookies belong to the
//! layer above.
//!
//! # Features
//!
//! - HTTP/1.1 with keep-alive connections
//! - Fixed-length and chunked bodies in both directions
//! - TLS over rustls, with an optional extra hostname check
//! - `CONNECT` tunneling through a proxy with Basic or Digest authentication
//! - Body streams usable blocking or through readiness listeners
//! - Per-destination pools with bounded connections and request queueing
//!
//! # Example
//!
//! ```no_run
//! use http_body_util::BodyExt;
//! use micro_client::client::HttpClient;
//! use micro_client::config::ClientConfig;
//! use micro_client::protocol::ClientRequest;
//! use tokio::runtime::Handle;
//! use tracing::{Level, info};
//! use tracing_subscriber::FmtSubscriber;
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let client = HttpClient::with_handle(ClientConfig::default(), Handle::current()).unwrap();
//!     let request = ClientRequest::get("https://example.com/".parse().unwrap());
//!
//!     let response = client.submit(request).await.unwrap();
//!     info!(status = %response.status(), "received response header");
//!
//!     let body = response.into_body().collect().await.unwrap().to_bytes();
//!     info!(len = body.len(), "received response body");
//! }
//! ```
//!
//! # Architecture
//!
//! - [`client`]: the [`HttpClient`](client::HttpClient) entry point
//! - [`pool`]: per-destination pools and the registry routing requests to them
//! - [`connection`]: one connection task and its state machine
//! - [`filter`]: the sans-IO filter chain (proxy, HTTP, TLS) a connection drives
//! - [`codec`]: request encoding and response decoding
//! - [`stream`]: response and request body streams
//! - [`protocol`]: requests, responses, messages and errors
//! - [`config`]: client configuration
//!
//! ## Errors
//!
//! Every request resolves to a response or to one [`protocol::ClientError`], whose
//! variants separate transport, protocol, TLS, proxy and timeout failures.
//!
//! # Limitations
//!
//! - HTTP/1.1 only, one request in flight per connection
//! - Maximum header size: 8KB by default
//! - Maximum number of headers: 64

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod filter;
pub mod pool;
pub mod protocol;
pub mod stream;

mod utils;
pub(crate) use utils::ensure;
