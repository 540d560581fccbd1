use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use http::Uri;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionContext, ConnectionHandle, ConnectionId, ConnectionState, HttpConnection, StateChange, StateListener};
use crate::filter::Address;
use crate::pool::{Responder, ResponseFuture};
use crate::protocol::{ClientError, ClientRequest, SendError};
use crate::stream::BodySink;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Identifies a destination by exact host, port and scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl DestinationKey {
    pub fn new<S: Into<String>>(host: S, port: u16, secure: bool) -> Self {
        Self { host: host.into(), port, secure }
    }

    /// `https` is secure, an absent port is the scheme's default.
    pub fn from_uri(uri: &Uri) -> Result<Self, ClientError> {
        let secure = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
            Some(scheme) => return Err(SendError::invalid_request(format!("unsupported scheme {scheme}")).into()),
            None => return Err(SendError::invalid_request("request uri has no scheme").into()),
        };
        let Some(host) = uri.host().filter(|host| !host.is_empty()) else {
            return Err(SendError::invalid_request("request uri has no host").into());
        };
        // Uri keeps the brackets of an IPv6 literal
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if secure { HTTPS_PORT } else { HTTP_PORT });

        Ok(Self::new(host, port, secure))
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.address())
    }
}

pub(crate) struct RequestRecord {
    pub(crate) request: ClientRequest,
    pub(crate) responder: Responder,
}

impl RequestRecord {
    fn fail(self, error: ClientError) {
        let _ = self.responder.send(Err(error));
    }
}

/// What the pool still owes the caller of a dispatched request.
enum InProgress {
    AwaitingHeader(Responder),
    ReceivingBody(BodySink),
}

impl InProgress {
    fn fail(self, error: ClientError) {
        match self {
            InProgress::AwaitingHeader(responder) => {
                let _ = responder.send(Err(error));
            }
            InProgress::ReceivingBody(sink) => sink.error(error),
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<ConnectionHandle>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    connecting: HashSet<ConnectionId>,
    pending: VecDeque<RequestRecord>,
    in_progress: HashMap<ConnectionId, InProgress>,
    closed: bool,
    retired: bool,
}

impl PoolState {
    fn is_drained(&self) -> bool {
        self.connections.is_empty() && self.pending.is_empty()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<InProgress> {
        self.connections.remove(&id);
        self.connecting.remove(&id);
        self.idle.retain(|handle| handle.id() != id);
        self.in_progress.remove(&id)
    }
}

pub(crate) type DrainedCallback = Box<dyn Fn(&Arc<DestinationPool>) + Send + Sync>;

/// The connections to one destination.
///
/// All bookkeeping happens under one lock. Connections are created under it but
/// connected after it is released, and a pool never calls into a connection other
/// than through its non-blocking [`ConnectionHandle`].
pub struct DestinationPool {
    key: DestinationKey,
    context: Arc<ConnectionContext>,
    runtime: Handle,
    max_connections: usize,
    state: Mutex<PoolState>,
    on_drained: Option<DrainedCallback>,
    me: Weak<DestinationPool>,
}

impl DestinationPool {
    /// A pool of its own, outside any registry. Connections are spawned on `runtime`.
    pub fn new(key: DestinationKey, context: Arc<ConnectionContext>, runtime: Handle) -> Arc<Self> {
        Self::with_drained_callback(key, context, runtime, None)
    }

    pub(crate) fn with_drained_callback(key: DestinationKey, context: Arc<ConnectionContext>, runtime: Handle, on_drained: Option<DrainedCallback>) -> Arc<Self> {
        let max_connections = context.config().max_connections_per_destination;
        Arc::new_cyclic(|me| Self {
            key,
            context,
            runtime,
            max_connections,
            state: Mutex::new(PoolState::default()),
            on_drained,
            me: Weak::clone(me),
        })
    }

    #[inline]
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Queues `request` and dispatches it as soon as a connection is free.
    ///
    /// The future fails with [`ClientError::ConnectionClosed`] once the pool is closed.
    pub fn send(&self, request: ClientRequest) -> ResponseFuture {
        let (responder, future) = ResponseFuture::channel();
        if let Err(record) = self.try_send(RequestRecord { request, responder }) {
            record.fail(ClientError::connection_closed("destination pool is closed"));
        }
        future
    }

    /// Queues the request, or hands it back when the pool no longer takes requests.
    pub(crate) fn try_send(&self, record: RequestRecord) -> Result<(), RequestRecord> {
        {
            let mut state = self.lock();
            if state.closed || state.retired {
                return Err(record);
            }
            trace!(destination = %self.key, uri = %record.request.uri(), "request queued");
            state.pending.push_back(record);
        }
        self.dispatch();
        Ok(())
    }

    /// Number of live connections, connecting ones included.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Connections waiting for a request.
    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Requests not handed to a connection yet.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Fails the queued requests and closes every connection. Closing twice does nothing.
    pub fn close(&self) {
        let (pending, connections) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let pending: Vec<_> = state.pending.drain(..).collect();
            let connections: Vec<_> = state.connections.values().cloned().collect();
            (pending, connections)
        };

        info!(destination = %self.key, pending = pending.len(), connections = connections.len(), "closing destination pool");
        for record in pending {
            record.fail(ClientError::connection_closed("destination pool is closed"));
        }
        for connection in connections {
            connection.close();
        }
        self.check_drained();
    }

    /// Matches queued requests with idle connections, then opens what capacity allows.
    fn dispatch(&self) {
        let mut opened = vec![];
        let mut failed = vec![];
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }

            while !state.pending.is_empty() {
                let Some(connection) = state.idle.pop_front() else {
                    break;
                };
                let Some(RequestRecord { request, responder }) = state.pending.pop_front() else {
                    break;
                };
                match connection.send(request) {
                    Ok(()) => {
                        debug!(destination = %self.key, connection = %connection.id(), "request dispatched");
                        state.in_progress.insert(connection.id(), InProgress::AwaitingHeader(responder));
                    }
                    Err(request) => {
                        debug!(destination = %self.key, connection = %connection.id(), "idle connection is gone, requeueing");
                        state.pending.push_front(RequestRecord { request, responder });
                        state.connections.remove(&connection.id());
                    }
                }
            }

            while state.connecting.len() < state.pending.len() && state.connections.len() < self.max_connections {
                match self.create_connection() {
                    Ok(connection) => {
                        let handle = connection.handle().clone();
                        state.connecting.insert(handle.id());
                        state.connections.insert(handle.id(), handle);
                        opened.push(connection);
                    }
                    Err(e) => {
                        warn!(destination = %self.key, "failed to create connection, cause: {}", e);
                        failed.extend(state.pending.drain(..).map(|record| (record, e.clone())));
                        break;
                    }
                }
            }
        }

        for (record, error) in failed {
            record.fail(error);
        }
        for connection in opened {
            debug!(destination = %self.key, connection = %connection.handle().id(), "opening connection");
            connection.connect(&self.runtime);
        }
    }

    fn create_connection(&self) -> Result<HttpConnection, ClientError> {
        let Some(me) = self.me.upgrade() else {
            return Err(ClientError::connection_closed("destination pool dropped"));
        };
        let listener: Arc<dyn StateListener> = me;
        HttpConnection::new(self.key.address(), self.key.secure, Arc::clone(&self.context), listener)
    }

    fn on_idle(&self, connection: &ConnectionHandle) {
        {
            let mut state = self.lock();
            state.connecting.remove(&connection.id());
            state.in_progress.remove(&connection.id());
            if state.closed || !state.connections.contains_key(&connection.id()) {
                drop(state);
                connection.close();
                return;
            }
            state.idle.push_back(connection.clone());
        }
        self.dispatch();
    }

    fn on_response(&self, connection: &ConnectionHandle, change: StateChange) {
        let Some(response) = change.response else {
            warn!(destination = %self.key, connection = %connection.id(), new = %change.new, "response header state without a response");
            return;
        };

        let responder = {
            let mut state = self.lock();
            let responder = match state.in_progress.remove(&connection.id()) {
                Some(InProgress::AwaitingHeader(responder)) => Some(responder),
                Some(other) => {
                    state.in_progress.insert(connection.id(), other);
                    None
                }
                None => None,
            };
            if change.new == ConnectionState::ReceivingBody {
                state.in_progress.insert(connection.id(), InProgress::ReceivingBody(response.body().sink()));
            }
            responder
        };

        match responder {
            Some(responder) => {
                if responder.send(Ok(response)).is_err() {
                    debug!(destination = %self.key, connection = %connection.id(), "caller is gone, dropping response");
                }
            }
            None => warn!(destination = %self.key, connection = %connection.id(), "response without a waiting request"),
        }
    }

    fn on_failure(&self, connection: &ConnectionHandle, change: StateChange) {
        let error = change.error.unwrap_or_else(|| ClientError::connection_closed(format!("connection ended in {}", change.new)));
        let (in_progress, pending) = {
            let mut state = self.lock();
            let in_progress = state.in_progress.remove(&connection.id());
            let mut pending = vec![];
            // nothing suggests a next connect attempt would go better
            if change.old == ConnectionState::Connecting && state.connections.len() == state.connecting.len() {
                pending.extend(state.pending.drain(..));
            }
            (in_progress, pending)
        };

        debug!(destination = %self.key, connection = %connection.id(), old = %change.old, new = %change.new, failed_pending = pending.len(), "connection failed, cause: {}", error);
        if let Some(in_progress) = in_progress {
            in_progress.fail(error.clone());
        }
        for record in pending {
            record.fail(error.clone());
        }
    }

    fn on_closed(&self, connection: &ConnectionHandle, change: StateChange) {
        let in_progress = self.lock().remove(connection.id());
        if let Some(in_progress) = in_progress {
            let error = change.error.unwrap_or_else(|| ClientError::connection_closed("connection closed"));
            in_progress.fail(error);
        }
        debug!(destination = %self.key, connection = %connection.id(), old = %change.old, "connection removed from pool");

        let has_pending = !self.lock().pending.is_empty();
        if has_pending {
            self.dispatch();
        }
        self.check_drained();
    }

    /// Retires a registered pool once it has nothing left, so the registry can drop it.
    fn check_drained(&self) {
        if self.on_drained.is_none() {
            return;
        }
        {
            let mut state = self.lock();
            if state.retired || !state.is_drained() {
                return;
            }
            state.retired = true;
        }

        debug!(destination = %self.key, "destination pool drained");
        if let (Some(on_drained), Some(me)) = (&self.on_drained, self.me.upgrade()) {
            on_drained(&me);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateListener for DestinationPool {
    fn on_state_changed(&self, connection: &ConnectionHandle, change: StateChange) {
        use ConnectionState::*;

        trace!(destination = %self.key, connection = %connection.id(), old = %change.old, new = %change.new, "connection state changed");
        match (change.old, change.new) {
            (Connecting | Received, Idle) => self.on_idle(connection),
            (ReceivingHeader, Received | ReceivingBody) => self.on_response(connection, change),
            (ReceivingBody, Received) => {
                self.lock().in_progress.remove(&connection.id());
            }
            (_, ConnectTimeout | ResponseTimeout | IdleTimeout | ClosedByServer | Error) => self.on_failure(connection, change),
            (_, Closed) => self.on_closed(connection, change),
            _ => {}
        }
    }

    fn on_request_returned(&self, connection: &ConnectionHandle, request: ClientRequest) {
        let requeued = {
            let mut state = self.lock();
            match state.in_progress.remove(&connection.id()) {
                Some(InProgress::AwaitingHeader(responder)) if !state.closed => {
                    state.pending.push_front(RequestRecord { request, responder });
                    Ok(())
                }
                Some(in_progress) => Err(Some(in_progress)),
                None => Err(None),
            }
        };

        match requeued {
            Ok(()) => {
                debug!(destination = %self.key, connection = %connection.id(), "request returned, requeued at the head");
                self.dispatch();
            }
            Err(in_progress) => {
                debug!(destination = %self.key, connection = %connection.id(), "dropping returned request");
                if let Some(in_progress) = in_progress {
                    in_progress.fail(ClientError::connection_closed("destination pool is closed"));
                }
            }
        }
    }
}

impl fmt::Debug for DestinationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DestinationPool")
            .field("key", &self.key)
            .field("max_connections", &self.max_connections)
            .field("connections", &state.connections.len())
            .field("idle", &state.idle.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
