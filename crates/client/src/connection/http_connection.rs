use std::collections::HashMap;
use std::fmt;
use std::future::{Future, pending};
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Version;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{AsyncStream, Command, ConnectionContext, ConnectionHandle, ConnectionId, ConnectionState, StateChange, StateListener};
use crate::filter::{Address, ChainOutput, Downstream, Filter, FilterChain, HttpFilter, Payload, ProxyFilter, RustlsEngine, TlsFilter, Upstream, WriteId};
use crate::protocol::{ClientError, ClientRequest, ClientResponse, TimeoutKind};
use crate::stream::{ChunkSink, ChunkedBodyOutputStream, WriteCompletion};

const SECURE_READ_BUFFER_SIZE: usize = 17_000;
const PLAIN_READ_BUFFER_SIZE: usize = 2048;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn AsyncStream>>> + Send>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Deadline {
    Connect,
    Response,
    Idle,
}

/// The sending side of the writer task.
struct Writer {
    writes: mpsc::UnboundedSender<(WriteId, Bytes)>,
    completions: mpsc::UnboundedReceiver<io::Result<WriteId>>,
}

/// One connection to one destination, driven by its own task.
///
/// Created in [`ConnectionState::Created`]; [`connect`](Self::connect) consumes it and
/// spawns the task, so a connection can only ever be connected once. From then on it
/// is reached through its [`ConnectionHandle`] and heard through its [`StateListener`].
///
/// The task waits on commands first, then on the transport and the current deadline.
/// At most one deadline is armed at a time: connect while connecting, response from
/// the moment the request is out until the response is complete, idle while idle.
pub struct HttpConnection {
    handle: ConnectionHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    destination: Address,
    context: Arc<ConnectionContext>,
    listener: Arc<dyn StateListener>,
    state: ConnectionState,

    chain: FilterChain,
    http_stage: usize,
    read_buffer_size: usize,
    read_buf: BytesMut,
    connecting: Option<ConnectFuture>,
    reader: Option<ReadHalf<Box<dyn AsyncStream>>>,
    writer: Option<Writer>,
    deadline: Option<(Instant, Deadline)>,

    request_write: Option<WriteId>,
    body: Option<ChunkedBodyOutputStream>,
    chunk_writes: HashMap<WriteId, WriteCompletion>,
    keep_alive: bool,
}

impl HttpConnection {
    /// Builds the filter chain for `destination`: a proxy stage when one is configured,
    /// and a TLS stage when `secure`.
    ///
    /// Fails when the TLS engine cannot be set up for the destination host.
    pub fn new(destination: Address, secure: bool, context: Arc<ConnectionContext>, listener: Arc<dyn StateListener>) -> Result<Self, ClientError> {
        let config = context.config();

        let mut stages: Vec<Box<dyn Filter>> = Vec::with_capacity(3);
        if let Some(proxy) = &config.proxy {
            stages.push(Box::new(ProxyFilter::new(Address::new(proxy.host.clone(), proxy.port), proxy.username.clone(), proxy.password.clone())));
        }
        let http_stage = stages.len();
        stages.push(Box::new(HttpFilter::new(config.max_header_size, config.max_chunk_size_digits).with_executor(context.executor().cloned())));
        if secure {
            let engine = RustlsEngine::new(Arc::clone(context.tls()), &destination.host)?;
            let tls = TlsFilter::new(Box::new(engine), destination.host.clone()).with_hostname_verifier(config.tls.hostname_verifier.clone());
            stages.push(Box::new(tls));
        }

        let (sender, commands) = mpsc::unbounded_channel();
        let handle = ConnectionHandle { id: ConnectionId::next(), commands: sender };
        let read_buffer_size = if secure { SECURE_READ_BUFFER_SIZE } else { PLAIN_READ_BUFFER_SIZE };

        Ok(Self {
            handle,
            commands,
            destination,
            context,
            listener,
            state: ConnectionState::Created,
            chain: FilterChain::new(stages),
            http_stage,
            read_buffer_size,
            read_buf: BytesMut::with_capacity(read_buffer_size),
            connecting: None,
            reader: None,
            writer: None,
            deadline: None,
            request_write: None,
            body: None,
            chunk_writes: HashMap::new(),
            keep_alive: true,
        })
    }

    /// The handle requests and close commands are sent through.
    #[inline]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Starts connecting on `runtime`.
    pub fn connect(self, runtime: &Handle) -> JoinHandle<()> {
        runtime.spawn(self.run())
    }

    async fn run(mut self) {
        info!(connection = %self.handle.id, destination = %self.destination, "connection started");
        self.transition(ConnectionState::Connecting, None, None);
        let output = self.chain.connect(self.destination.clone());
        self.apply(output);

        while !self.state.is_closed() {
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => self.on_command(command),
                connected = connecting(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_transport_connected(connected);
                }
                completion = next_completion(&mut self.writer) => self.on_write_completion(completion),
                read = next_read(&mut self.reader, &mut self.read_buf, self.read_buffer_size) => self.on_read(read),
                () = expire(self.deadline) => self.on_deadline(),
            }
        }

        info!(connection = %self.handle.id, destination = %self.destination, "connection closed");
    }

    fn transition(&mut self, new: ConnectionState, response: Option<ClientResponse>, error: Option<ClientError>) {
        let old = self.state;
        if !old.can_transition_to(new) {
            error!(connection = %self.handle.id, %old, %new, "illegal connection state transition");
            panic!("illegal connection state transition from {old} to {new}");
        }

        self.state = new;
        debug!(connection = %self.handle.id, %old, %new, "connection state changed");
        self.listener.on_state_changed(&self.handle, StateChange { old, new, response, error });
    }

    fn apply(&mut self, output: ChainOutput) {
        for command in output.transport {
            self.on_transport_command(command);
        }
        for event in output.events {
            if self.state.is_closed() {
                trace!(connection = %self.handle.id, ?event, "dropping event of a closed connection");
                continue;
            }
            self.on_event(event);
        }
    }

    fn on_transport_command(&mut self, command: Downstream) {
        match command {
            Downstream::Connect(address) => {
                debug!(connection = %self.handle.id, %address, "opening transport");
                let connector = Arc::clone(self.context.connector());
                self.connecting = Some(Box::pin(async move { connector.connect(&address).await }));
                self.arm(Deadline::Connect);
            }
            Downstream::Write { payload: Payload::Bytes(bytes), id } => {
                let sent = self.writer.as_ref().is_some_and(|writer| writer.writes.send((id, bytes)).is_ok());
                if !sent {
                    warn!(connection = %self.handle.id, "write issued without a writable transport");
                    self.fail(ClientError::connection_closed("transport is not writable"));
                }
            }
            Downstream::Write { payload, .. } => warn!(connection = %self.handle.id, ?payload, "dropping non byte payload"),
            Downstream::Close => {
                trace!(connection = %self.handle.id, "closing transport");
                self.connecting = None;
                self.reader = None;
                self.writer = None;
            }
            Downstream::StartTls => warn!(connection = %self.handle.id, "start tls reached the transport"),
        }
    }

    fn on_event(&mut self, event: Upstream) {
        match event {
            Upstream::Connected => {
                let output = self.chain.start_tls();
                self.apply(output);
            }
            Upstream::HandshakeCompleted => self.on_ready(),
            Upstream::Read(Payload::Response(response)) => self.on_response_header(*response),
            Upstream::Read(payload) => warn!(connection = %self.handle.id, ?payload, "unexpected payload at the top of the chain"),
            Upstream::WriteCompleted(id) => self.on_write_completed(id),
            Upstream::MessageComplete => self.on_message_complete(),
            Upstream::ConnectionClosed => self.on_closed_by_server(),
            Upstream::Error(e) => self.fail(e),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(request) => self.send(*request),
            Command::BodyChunk(chunk, completion) => self.write_body_chunk(chunk, completion),
            Command::BodyClosed => self.on_body_closed(),
            Command::Close => self.close("closed by client"),
        }
    }

    fn on_transport_connected(&mut self, result: io::Result<Box<dyn AsyncStream>>) {
        match result {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                self.reader = Some(reader);
                self.writer = Some(spawn_writer(writer, self.handle.id));
                let output = self.chain.transport_connected();
                self.apply(output);
            }
            Err(e) => {
                warn!(connection = %self.handle.id, destination = %self.destination, "failed to connect, cause: {}", e);
                self.fail(ClientError::io(e));
            }
        }
    }

    fn on_ready(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!(connection = %self.handle.id, state = %self.state, "handshake completed outside of connecting");
            return;
        }
        info!(connection = %self.handle.id, destination = %self.destination, "connection established");
        self.deadline = None;
        self.transition(ConnectionState::Idle, None, None);
        self.arm(Deadline::Idle);
    }

    fn send(&mut self, request: ClientRequest) {
        if self.state != ConnectionState::Idle {
            warn!(connection = %self.handle.id, state = %self.state, "request sent to a connection that is not idle");
            self.listener.on_request_returned(&self.handle, request);
            return;
        }

        self.deadline = None;
        self.keep_alive = true;
        self.body = request.body_stream().cloned();
        trace!(connection = %self.handle.id, method = %request.method(), uri = %request.uri(), "sending request");
        self.transition(ConnectionState::SendingRequest, None, None);

        let (id, output) = self.chain.write(Payload::Request(Box::new(request)));
        self.request_write = Some(id);
        self.apply(output);
    }

    fn on_write_completed(&mut self, id: WriteId) {
        if self.request_write == Some(id) {
            self.request_write = None;
            match &self.body {
                Some(body) => {
                    trace!(connection = %self.handle.id, "request header written, opening the chunked body");
                    body.open(Arc::new(ConnectionBodySink { commands: self.handle.commands.clone() }));
                }
                None => self.request_sent(),
            }
        } else if let Some(completion) = self.chunk_writes.remove(&id) {
            completion(Ok(()));
        } else {
            trace!(connection = %self.handle.id, ?id, "completion of an untracked write");
        }
    }

    fn write_body_chunk(&mut self, chunk: Bytes, completion: WriteCompletion) {
        if self.body.is_none() || self.state.is_closed() {
            completion(Err(ClientError::connection_closed("connection is not sending a request body")));
            return;
        }
        let (id, output) = self.chain.write_at(self.http_stage + 1, Payload::Bytes(chunk));
        self.chunk_writes.insert(id, completion);
        self.apply(output);
    }

    fn on_body_closed(&mut self) {
        if self.body.take().is_some() {
            trace!(connection = %self.handle.id, "chunked request body completed");
            self.request_sent();
        }
    }

    fn request_sent(&mut self) {
        if self.state == ConnectionState::SendingRequest {
            self.transition(ConnectionState::ReceivingHeader, None, None);
            self.arm(Deadline::Response);
        }
    }

    fn on_response_header(&mut self, response: ClientResponse) {
        // the response overtook the completion of the request write
        if self.state == ConnectionState::SendingRequest {
            if self.body.is_none() {
                self.request_write = None;
            }
            self.transition(ConnectionState::ReceivingHeader, None, None);
            self.arm(Deadline::Response);
        }
        if self.state != ConnectionState::ReceivingHeader {
            warn!(connection = %self.handle.id, state = %self.state, status = %response.status(), "dropping unexpected response");
            return;
        }

        self.keep_alive = response.version() == Version::HTTP_11 && !response.is_connection_close();
        debug!(connection = %self.handle.id, status = %response.status(), keep_alive = self.keep_alive, "response header received");

        let next = if response.has_content() { ConnectionState::ReceivingBody } else { ConnectionState::Received };
        self.transition(next, Some(response), None);
    }

    fn on_message_complete(&mut self) {
        match self.state {
            ConnectionState::ReceivingBody => self.transition(ConnectionState::Received, None, None),
            ConnectionState::Received => {}
            state => {
                warn!(connection = %self.handle.id, %state, "message completed unexpectedly");
                return;
            }
        }

        self.deadline = None;
        if let Some(body) = self.body.take() {
            body.fail(ClientError::connection_closed("response completed before the request body"));
            self.close("response completed before the request body");
        } else if self.keep_alive && self.request_write.is_none() {
            self.transition(ConnectionState::Idle, None, None);
            self.arm(Deadline::Idle);
        } else {
            self.close("connection is not persistent");
        }
    }

    fn on_deadline(&mut self) {
        let Some((_, deadline)) = self.deadline.take() else {
            return;
        };

        let (timeout_state, kind) = match deadline {
            Deadline::Connect => (ConnectionState::ConnectTimeout, TimeoutKind::Connect),
            Deadline::Response if self.state == ConnectionState::ReceivingBody => (ConnectionState::ResponseTimeout, TimeoutKind::ResponseBody),
            Deadline::Response => (ConnectionState::ResponseTimeout, TimeoutKind::ResponseHeader),
            Deadline::Idle => (ConnectionState::IdleTimeout, TimeoutKind::Idle),
        };
        debug!(connection = %self.handle.id, state = %self.state, ?kind, "deadline expired");

        let error = ClientError::Timeout(kind);
        if self.state.can_transition_to(timeout_state) {
            self.transition(timeout_state, None, Some(error.clone()));
        }
        self.close_with(error);
    }

    fn on_read(&mut self, result: io::Result<usize>) {
        let output = match result {
            Ok(0) => {
                debug!(connection = %self.handle.id, "transport reached end of stream");
                self.reader = None;
                self.chain.transport_closed()
            }
            Ok(n) => {
                trace!(connection = %self.handle.id, n, "read from transport");
                let bytes = self.read_buf.split().freeze();
                self.chain.transport_read(bytes)
            }
            Err(e) => {
                self.reader = None;
                self.chain.transport_error(ClientError::io(e))
            }
        };
        self.apply(output);
    }

    fn on_write_completion(&mut self, completion: Option<io::Result<WriteId>>) {
        let output = match completion {
            Some(Ok(id)) => self.chain.transport_write_completed(id),
            Some(Err(e)) => {
                self.writer = None;
                self.chain.transport_error(ClientError::io(e))
            }
            None => {
                self.writer = None;
                return;
            }
        };
        self.apply(output);
    }

    fn on_closed_by_server(&mut self) {
        if self.state.is_closed() {
            return;
        }
        info!(connection = %self.handle.id, state = %self.state, "connection closed by server");
        let error = ClientError::connection_closed("closed by server");
        if self.state.can_transition_to(ConnectionState::ClosedByServer) {
            self.transition(ConnectionState::ClosedByServer, None, Some(error.clone()));
        }
        self.close_with(error);
    }

    fn fail(&mut self, error: ClientError) {
        if self.state.is_closed() {
            return;
        }
        error!(connection = %self.handle.id, state = %self.state, "connection failed, cause: {}", error);
        if self.state.can_transition_to(ConnectionState::Error) {
            self.transition(ConnectionState::Error, None, Some(error.clone()));
        }
        self.close_with(error);
    }

    fn close(&mut self, reason: &str) {
        self.close_with(ClientError::connection_closed(reason));
    }

    fn close_with(&mut self, error: ClientError) {
        if self.state.is_closed() {
            return;
        }

        self.deadline = None;
        if let Some(body) = self.body.take() {
            body.fail(error.clone());
        }
        for (_, completion) in self.chunk_writes.drain() {
            completion(Err(error.clone()));
        }
        self.drain_commands();

        self.transition(ConnectionState::Closed, None, Some(error));
        let output = self.chain.close();
        self.apply(output);
    }

    fn arm(&mut self, deadline: Deadline) {
        let config = self.context.config();
        let timeout = match deadline {
            Deadline::Connect => config.connect_timeout,
            Deadline::Response => config.response_timeout,
            Deadline::Idle => config.idle_timeout,
        };
        self.deadline = timeout.map(|timeout| (Instant::now() + timeout, deadline));
    }

    /// Stops accepting commands and hands back the requests queued behind the close,
    /// before the listener hears about it.
    fn drain_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send(request) => {
                    debug!(connection = %self.handle.id, uri = %request.uri(), "returning request queued on a closed connection");
                    self.listener.on_request_returned(&self.handle, *request);
                }
                Command::BodyChunk(_, completion) => completion(Err(ClientError::connection_closed("connection closed"))),
                Command::BodyClosed | Command::Close => {}
            }
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.handle.id)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

/// Feeds the chunks of a request body to the connection task.
struct ConnectionBodySink {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChunkSink for ConnectionBodySink {
    fn write_chunk(&self, chunk: Bytes, completion: WriteCompletion) {
        if let Err(mpsc::error::SendError(Command::BodyChunk(_, completion))) = self.commands.send(Command::BodyChunk(chunk, completion)) {
            completion(Err(ClientError::connection_closed("connection closed")));
        }
    }

    fn close(&self) {
        let _ = self.commands.send(Command::BodyClosed);
    }
}

/// Writes in order on its own task and reports each completion.
fn spawn_writer(mut half: WriteHalf<Box<dyn AsyncStream>>, connection: ConnectionId) -> Writer {
    let (writes, mut pending_writes) = mpsc::unbounded_channel::<(WriteId, Bytes)>();
    let (done, completions) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some((id, bytes)) = pending_writes.recv().await {
            let result: io::Result<()> = async {
                half.write_all(&bytes).await?;
                half.flush().await
            }
            .await;

            match result {
                Ok(()) => {
                    let _ = done.send(Ok(id));
                }
                Err(e) => {
                    warn!(%connection, "transport write failed, cause: {}", e);
                    let _ = done.send(Err(e));
                    return;
                }
            }
        }
        let _ = half.shutdown().await;
        trace!(%connection, "writer finished");
    });

    Writer { writes, completions }
}

async fn connecting(future: &mut Option<ConnectFuture>) -> io::Result<Box<dyn AsyncStream>> {
    match future {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_completion(writer: &mut Option<Writer>) -> Option<io::Result<WriteId>> {
    match writer {
        Some(writer) => writer.completions.recv().await,
        None => pending().await,
    }
}

async fn next_read(reader: &mut Option<ReadHalf<Box<dyn AsyncStream>>>, buf: &mut BytesMut, capacity: usize) -> io::Result<usize> {
    match reader {
        Some(reader) => {
            if buf.capacity() == buf.len() {
                buf.reserve(capacity);
            }
            reader.read_buf(buf).await
        }
        None => pending().await,
    }
}

async fn expire(deadline: Option<(Instant, Deadline)>) {
    match deadline {
        Some((at, _)) => sleep_until(at).await,
        None => pending().await,
    }
}
