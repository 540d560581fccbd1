//! The filter chain between a connection and its transport
//!
//! A connection talks to the network through an ordered list of [`Filter`]s. Commands
//! ([`Downstream`]) travel from the connection towards the transport; events
//! ([`Upstream`]) travel from the transport towards the connection. Each filter sees
//! both directions and may pass, transform, swallow or answer what it receives.
//!
//! ```text
//!  connection
//!      |  ^
//!      v  |      index 0
//!  [ proxy  ]    optional, tunnels through an HTTP proxy
//!  [ http   ]    request encoding, response decoding
//!  [ tls    ]    optional, encrypts everything below it
//!      |  ^
//!      v  |
//!   transport
//! ```
//!
//! The chain is sans-io: it never touches a socket. Whatever reaches the bottom is
//! returned to the caller as transport commands, and whatever reaches the top is
//! returned as connection events, see [`ChainOutput`].

mod chain;
mod digest;
mod http_filter;
mod proxy_filter;
mod tls_engine;
mod tls_filter;

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

pub use chain::ChainOutput;
pub use chain::FilterChain;
pub use digest::DigestAlgorithm;
pub use digest::DigestAuthenticator;
pub use digest::DigestChallenge;
pub use digest::basic_authorization;
pub use http_filter::HttpFilter;
pub use proxy_filter::ProxyFilter;
pub use tls_engine::{EngineResult, EngineStatus, HandshakeStatus, HostnameVerifier, RustlsEngine, TlsEngine};
pub use tls_filter::TlsFilter;

use crate::protocol::{ClientError, ClientRequest, ClientResponse};

/// A host and port to open a transport to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') { write!(f, "[{}]:{}", self.host, self.port) } else { write!(f, "{}:{}", self.host, self.port) }
    }
}

/// Identifies one write so that its completion can be matched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WriteId(u64);

/// What travels through the chain: raw bytes near the transport, typed messages near the connection.
#[derive(Debug)]
pub enum Payload {
    Bytes(Bytes),
    Request(Box<ClientRequest>),
    Response(Box<ClientResponse>),
}

#[derive(Debug)]
pub enum Downstream {
    Connect(Address),
    Write { payload: Payload, id: WriteId },
    StartTls,
    Close,
}

#[derive(Debug)]
pub enum Upstream {
    Connected,
    Read(Payload),
    WriteCompleted(WriteId),
    HandshakeCompleted,
    MessageComplete,
    ConnectionClosed,
    Error(ClientError),
}

/// One stage of the chain.
///
/// By default both directions pass through untouched.
pub trait Filter: Send {
    fn on_downstream(&mut self, command: Downstream, cx: &mut FilterContext<'_>) {
        cx.send(command);
    }

    fn on_upstream(&mut self, event: Upstream, cx: &mut FilterContext<'_>) {
        cx.emit(event);
    }
}

pub(crate) enum Hop {
    /// towards the transport; `to >= len` means the transport itself
    Down { to: usize, command: Downstream },
    /// towards the connection; `None` means the connection itself
    Up { to: Option<usize>, event: Upstream },
}

/// Handed to a filter for the duration of one callback.
///
/// Commands and events issued through the context are queued and delivered once
/// the current callback has returned, so a filter is never re-entered.
pub struct FilterContext<'a> {
    position: usize,
    queue: &'a mut VecDeque<Hop>,
    next_write_id: &'a mut u64,
}

impl FilterContext<'_> {
    /// Passes a command to the next stage towards the transport.
    pub fn send(&mut self, command: Downstream) {
        self.queue.push_back(Hop::Down { to: self.position + 1, command });
    }

    /// Passes an event to the next stage towards the connection.
    pub fn emit(&mut self, event: Upstream) {
        self.queue.push_back(Hop::Up { to: self.position.checked_sub(1), event });
    }

    pub fn write(&mut self, payload: Payload, id: WriteId) {
        self.send(Downstream::Write { payload, id });
    }

    pub fn connect(&mut self, address: Address) {
        self.send(Downstream::Connect(address));
    }

    pub fn close(&mut self) {
        self.send(Downstream::Close);
    }

    pub fn fail(&mut self, error: ClientError) {
        self.emit(Upstream::Error(error));
    }

    pub fn next_write_id(&mut self) -> WriteId {
        *self.next_write_id += 1;
        WriteId(*self.next_write_id)
    }
}

impl fmt::Debug for FilterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext").field("position", &self.position).field("queued", &self.queue.len()).finish()
    }
}
