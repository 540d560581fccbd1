//! Client connections
//!
//! An [`HttpConnection`] is one transport to one destination, running as its own task.
//! It owns the task's [`FilterChain`](crate::filter::FilterChain), the socket halves and
//! a single deadline, and it moves through the [`ConnectionState`] machine. Everything
//! it has to say is reported to a [`StateListener`], which is how the pool learns that
//! a connection became idle, that a response header arrived or that the connection
//! went away.
//!
//! The rest of the world talks to a running connection through its cloneable
//! [`ConnectionHandle`].

mod connector;
mod http_connection;
mod state;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

pub use connector::AsyncStream;
pub use connector::Connector;
pub use connector::TcpConnector;
pub use http_connection::HttpConnection;
pub use state::ConnectionState;

use crate::config::{ClientConfig, ConfigError};
use crate::protocol::{ClientError, ClientRequest, ClientResponse};
use crate::stream::{ListenerExecutor, WriteCompletion};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum Command {
    Send(Box<ClientRequest>),
    BodyChunk(Bytes, WriteCompletion),
    BodyClosed,
    Close,
}

/// Talks to a running [`HttpConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hands a request to an idle connection.
    ///
    /// The request comes back if the connection has already stopped. A request that
    /// the connection can no longer serve once accepted is given back through
    /// [`StateListener::on_request_returned`].
    pub fn send(&self, request: ClientRequest) -> Result<(), ClientRequest> {
        self.commands.send(Command::Send(Box::new(request))).map_err(|mpsc::error::SendError(command)| match command {
            Command::Send(request) => *request,
            _ => unreachable!("a send command was returned as another command"),
        })
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn commands(&self) -> &mpsc::UnboundedSender<Command> {
        &self.commands
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// One state transition, with what came with it.
#[derive(Debug)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
    /// set when a response header has been received
    pub response: Option<ClientResponse>,
    /// set on failures, timeouts and closes
    pub error: Option<ClientError>,
}

/// Observes a connection. Called on the connection's task, so implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, connection: &ConnectionHandle, change: StateChange);

    /// A request accepted by [`ConnectionHandle::send`] that the connection stopped before starting.
    fn on_request_returned(&self, connection: &ConnectionHandle, request: ClientRequest);
}

/// What every connection of a client shares.
pub struct ConnectionContext {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
    connector: Arc<dyn Connector>,
    executor: Option<ListenerExecutor>,
}

impl ConnectionContext {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tls = config.tls.build()?;
        Ok(Self { config, tls, connector: Arc::new(TcpConnector), executor: None })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_executor(mut self, executor: Option<ListenerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn tls(&self) -> &Arc<rustls::ClientConfig> {
        &self.tls
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub(crate) fn executor(&self) -> Option<&ListenerExecutor> {
        self.executor.as_ref()
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext").field("config", &self.config).field("executor", &self.executor).finish_non_exhaustive()
    }
}
