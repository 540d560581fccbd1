use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use http_body::{Body, Frame};
use tracing::trace;

use crate::protocol::ClientError;
use crate::stream::{ListenerExecutor, Mode, ReadListener, dispatch};

/// Creates the two ends of a response body.
///
/// Listener callbacks of the stream run on `executor` when one is given.
pub fn body_stream(executor: Option<ListenerExecutor>) -> (BodyInputStream, BodySink) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            mode: Mode::Undecided,
            items: VecDeque::new(),
            listener: None,
            call_listener: false,
            terminal_notified: false,
            closed_for_input: false,
            waker: None,
        }),
        readable: Condvar::new(),
        executor,
    });
    (BodyInputStream { shared: Arc::clone(&shared) }, BodySink { shared })
}

enum Item {
    Data(Bytes),
    Eof,
    Error(ClientError),
}

struct State {
    mode: Mode,
    items: VecDeque<Item>,
    listener: Option<Arc<dyn ReadListener>>,
    call_listener: bool,
    terminal_notified: bool,
    closed_for_input: bool,
    waker: Option<Waker>,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    executor: Option<ListenerExecutor>,
}

enum Event {
    DataAvailable,
    AllDataRead,
    Error(ClientError),
}

type Notification = (Arc<dyn ReadListener>, Event);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notification: Option<Notification>) {
        let Some((listener, event)) = notification else {
            return;
        };
        dispatch(self.executor.as_ref(), move || {
            let result = match event {
                Event::DataAvailable => listener.on_data_available(),
                Event::AllDataRead => listener.on_all_data_read(),
                Event::Error(e) => {
                    listener.on_error(e);
                    Ok(())
                }
            };
            if let Err(e) = result {
                listener.on_error(e);
            }
        });
    }
}

impl State {
    /// Readiness check; arms the listener when nothing can be read yet.
    fn check_ready(&mut self) -> (bool, Option<Notification>) {
        match self.items.front() {
            Some(Item::Data(_)) => (true, None),
            Some(Item::Eof) => (false, self.terminal(Event::AllDataRead)),
            Some(Item::Error(e)) => {
                let event = Event::Error(e.clone());
                (false, self.terminal(event))
            }
            None => {
                self.call_listener = true;
                (false, None)
            }
        }
    }

    fn terminal(&mut self, event: Event) -> Option<Notification> {
        if self.terminal_notified {
            return None;
        }
        let listener = self.listener.clone()?;
        self.terminal_notified = true;
        Some((listener, event))
    }

    /// Consumes the armed listener for an item that was just queued.
    fn armed(&mut self, event: Event) -> Option<Notification> {
        if !self.mode.is_asynchronous() || !self.call_listener {
            return None;
        }
        self.call_listener = false;
        match event {
            Event::DataAvailable => self.listener.clone().map(|listener| (listener, event)),
            terminal => self.terminal(terminal),
        }
    }

    fn enqueue(&mut self, item: Item) -> Option<Waker> {
        self.items.push_back(item);
        self.waker.take()
    }

    /// Copies queued data into `buf`. `None` when nothing is queued yet.
    fn copy_to(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ClientError> {
        let mut written = 0;
        while written < buf.len() {
            let Some(Item::Data(bytes)) = self.items.front_mut() else {
                break;
            };
            let n = bytes.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&bytes[..n]);
            bytes.advance(n);
            written += n;
            if bytes.is_empty() {
                self.items.pop_front();
            }
        }

        if written > 0 {
            return Ok(Some(written));
        }
        match self.items.front() {
            Some(Item::Eof) => Ok(Some(0)),
            Some(Item::Error(e)) => Err(e.clone()),
            _ => Ok(None),
        }
    }

    fn pop_data(&mut self) -> Option<Bytes> {
        if !matches!(self.items.front(), Some(Item::Data(_))) {
            return None;
        }
        match self.items.pop_front() {
            Some(Item::Data(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

/// Readable end of a response body.
///
/// Bytes come out in the order the connection pushed them. The end of the body, or
/// the failure that cut it short, is reported once everything before it was read.
///
/// - Synchronous use: [`read`](Self::read) and [`read_chunk`](Self::read_chunk) block
///   until data, the end of the body or an error is available.
/// - Asynchronous use: register a [`ReadListener`], then read while
///   [`is_ready`](Self::is_ready) returns `true`. When it returns `false`, the listener
///   is called once data arrives. The stream also implements [`http_body::Body`].
pub struct BodyInputStream {
    shared: Arc<Shared>,
}

impl BodyInputStream {
    /// Registers the listener, committing the stream to asynchronous mode.
    pub fn set_read_listener(&self, listener: Arc<dyn ReadListener>) -> Result<(), ClientError> {
        let notification = {
            let mut state = self.shared.lock();
            if state.listener.is_some() {
                return Err(ClientError::body_stream("read listener can be set only once"));
            }
            state.mode.commit(Mode::Asynchronous)?;
            state.listener = Some(Arc::clone(&listener));

            match state.check_ready() {
                (true, _) => Some((listener, Event::DataAvailable)),
                (false, notification) => notification,
            }
        };
        self.shared.notify(notification);
        Ok(())
    }

    /// `true` when a read would not wait. A `false` arms the read listener.
    pub fn is_ready(&self) -> Result<bool, ClientError> {
        let (ready, notification) = {
            let mut state = self.shared.lock();
            if state.mode.is_synchronous() {
                return Err(ClientError::body_stream("readiness is only available in asynchronous mode"));
            }
            state.check_ready()
        };
        self.shared.notify(notification);
        Ok(ready)
    }

    /// Reads into `buf`, returning `0` at the end of the body.
    ///
    /// Blocks in synchronous mode. In asynchronous mode it fails unless the stream is
    /// ready or at its end.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let mut state = self.shared.lock();
        if state.mode.is_undecided() {
            state.mode = Mode::Synchronous;
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if state.mode.is_asynchronous() {
            return state.copy_to(buf)?.ok_or_else(|| ClientError::body_stream("read called when the stream is not ready"));
        }

        loop {
            if let Some(n) = state.copy_to(buf)? {
                return Ok(n);
            }
            state = self.shared.readable.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Reads the next piece of the body as pushed by the connection, `None` at the end.
    pub fn read_chunk(&self) -> Result<Option<Bytes>, ClientError> {
        let mut state = self.shared.lock();
        if state.mode.is_undecided() {
            state.mode = Mode::Synchronous;
        }

        loop {
            if let Some(bytes) = state.pop_data() {
                return Ok(Some(bytes));
            }
            match state.items.front() {
                Some(Item::Eof) => return Ok(None),
                Some(Item::Error(e)) => return Err(e.clone()),
                _ if state.mode.is_asynchronous() => {
                    return Err(ClientError::body_stream("read called when the stream is not ready"));
                }
                _ => state = self.shared.readable.wait(state).unwrap_or_else(PoisonError::into_inner),
            }
        }
    }

    /// Reads the rest of the body into one buffer.
    pub fn read_to_bytes(&self) -> Result<Bytes, ClientError> {
        let mut body = bytes::BytesMut::new();
        while let Some(chunk) = self.read_chunk()? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub fn mode(&self) -> Mode {
        self.shared.lock().mode
    }

    pub(crate) fn sink(&self) -> BodySink {
        BodySink { shared: Arc::clone(&self.shared) }
    }
}

impl io::Read for BodyInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BodyInputStream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Read for &BodyInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BodyInputStream::read(self, buf).map_err(io::Error::from)
    }
}

impl Body for BodyInputStream {
    type Data = Bytes;
    type Error = ClientError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut state = self.shared.lock();
        if let Err(e) = state.mode.commit(Mode::Asynchronous) {
            return Poll::Ready(Some(Err(e)));
        }

        if let Some(bytes) = state.pop_data() {
            return Poll::Ready(Some(Ok(Frame::data(bytes))));
        }
        match state.items.front() {
            Some(Item::Eof) => Poll::Ready(None),
            Some(Item::Error(e)) => Poll::Ready(Some(Err(e.clone()))),
            _ => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.shared.lock().items.front(), Some(Item::Eof))
    }
}

impl std::fmt::Debug for BodyInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shared.state.try_lock() {
            Ok(state) => f.debug_struct("BodyInputStream").field("mode", &state.mode).field("queued", &state.items.len()).finish(),
            Err(_) => f.debug_struct("BodyInputStream").finish_non_exhaustive(),
        }
    }
}

/// Writing end of a response body, held by the connection.
///
/// Anything pushed after the body was completed or failed is dropped.
#[derive(Clone)]
pub struct BodySink {
    shared: Arc<Shared>,
}

impl BodySink {
    pub fn push(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.enqueue(Item::Data(data), Event::DataAvailable, false);
    }

    /// Marks the end of the body.
    pub fn complete(&self) {
        self.enqueue(Item::Eof, Event::AllDataRead, true);
    }

    /// Ends the body with `error`. The reader sees it after the data queued before it.
    pub fn error(&self, error: ClientError) {
        self.enqueue(Item::Error(error.clone()), Event::Error(error), true);
    }

    pub fn is_closed_for_input(&self) -> bool {
        self.shared.lock().closed_for_input
    }

    fn enqueue(&self, item: Item, event: Event, terminal: bool) {
        let (waker, notification) = {
            let mut state = self.shared.lock();
            if state.closed_for_input {
                trace!("body already ended, drop input");
                return;
            }
            state.closed_for_input = terminal;
            let waker = state.enqueue(item);
            (waker, state.armed(event))
        };

        self.shared.readable.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        self.shared.notify(notification);
    }
}

impl std::fmt::Debug for BodySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySink").finish_non_exhaustive()
    }
}
