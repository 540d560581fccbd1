use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use futures::channel::oneshot;
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::codec::ChunkedEncoder;
use crate::protocol::{ClientError, PayloadItem};
use crate::stream::{ListenerExecutor, Mode, WriteListener, dispatch};

/// Called once with the outcome of one [`ChunkSink::write_chunk`].
pub type WriteCompletion = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

/// Where an opened [`ChunkedBodyOutputStream`] sends its encoded chunks.
pub trait ChunkSink: Send + Sync {
    /// Writes already framed bytes and calls `completion` once they are written.
    fn write_chunk(&self, chunk: Bytes, completion: WriteCompletion);

    /// The terminating chunk has been written.
    fn close(&self);
}

struct State {
    mode: Mode,
    buffer: BytesMut,
    encoder: ChunkedEncoder,
    sink: Option<Arc<dyn ChunkSink>>,
    listener: Option<Arc<dyn WriteListener>>,
    ready: bool,
    call_listener: bool,
    closed: bool,
    failure: Option<ClientError>,
}

struct Shared {
    state: Mutex<State>,
    opened: Condvar,
    chunk_size: usize,
    executor: Option<ListenerExecutor>,
}

/// Writable end of a chunked request body.
///
/// Written bytes are buffered and sent as chunks of `chunk_size` bytes; a flush or
/// close sends what is left as a shorter chunk. The stream opens once the request
/// header has been written. Before that, synchronous writes wait and asynchronous
/// writes are not ready.
///
/// - Synchronous use: every write that fills a chunk blocks until the connection
///   has written it.
/// - Asynchronous use: register a [`WriteListener`] and write while
///   [`is_ready`](Self::is_ready) returns `true`. A write that sends a chunk makes
///   the stream not ready until the chunk is written, then the listener is told.
///
/// Closing writes the terminating chunk, after which the connection starts waiting
/// for the response.
#[derive(Clone)]
pub struct ChunkedBodyOutputStream {
    shared: Arc<Shared>,
}

impl ChunkedBodyOutputStream {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_executor(chunk_size, None)
    }

    pub fn with_executor(chunk_size: usize, executor: Option<ListenerExecutor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    mode: Mode::Undecided,
                    buffer: BytesMut::new(),
                    encoder: ChunkedEncoder::new(),
                    sink: None,
                    listener: None,
                    ready: false,
                    call_listener: false,
                    closed: false,
                    failure: None,
                }),
                opened: Condvar::new(),
                chunk_size: chunk_size.max(1),
                executor,
            }),
        }
    }

    /// Registers the listener, committing the stream to asynchronous mode.
    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) -> Result<(), ClientError> {
        let possible = {
            let mut state = self.lock();
            if state.listener.is_some() {
                return Err(ClientError::body_stream("write listener can be set only once"));
            }
            state.mode.commit(Mode::Asynchronous)?;
            state.listener = Some(Arc::clone(&listener));
            if state.ready {
                true
            } else {
                state.call_listener = true;
                false
            }
        };
        if possible {
            self.notify_write_possible(listener);
        }
        Ok(())
    }

    /// `true` when a write can be issued. A `false` arms the write listener.
    pub fn is_ready(&self) -> Result<bool, ClientError> {
        let mut state = self.lock();
        if state.mode.is_synchronous() {
            return Err(ClientError::body_stream("readiness is only available in asynchronous mode"));
        }
        state.check_writable()?;
        if !state.ready {
            state.call_listener = true;
        }
        Ok(state.ready)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.mode.is_undecided() {
            state.mode = Mode::Synchronous;
        }
        state.check_writable()?;

        if state.mode.is_synchronous() {
            state = self.wait_opened(state)?;
        } else if !state.ready {
            return Err(ClientError::body_stream("write called when the stream is not ready"));
        }

        state.buffer.extend_from_slice(data);
        let full = state.buffer.len() / self.shared.chunk_size * self.shared.chunk_size;
        if full == 0 {
            return Ok(());
        }
        let data = state.buffer.split_to(full).freeze();
        self.send(state, data, false)
    }

    /// Sends the buffered bytes as one chunk.
    pub fn flush(&self) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.mode.is_undecided() || state.closed {
            return Ok(());
        }
        state.check_writable()?;

        if state.mode.is_synchronous() {
            state = self.wait_opened(state)?;
        } else if !state.ready {
            return Err(ClientError::body_stream("flush called when the stream is not ready"));
        }

        if state.buffer.is_empty() {
            return Ok(());
        }
        let data = state.buffer.split().freeze();
        self.send(state, data, false)
    }

    /// Sends the buffered bytes and the terminating chunk. Closing twice does nothing.
    pub fn close(&self) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        if state.mode.is_undecided() {
            state.mode = Mode::Synchronous;
        }
        if let Some(e) = &state.failure {
            return Err(e.clone());
        }

        if state.mode.is_synchronous() {
            state = self.wait_opened(state)?;
        } else if !state.ready {
            return Err(ClientError::body_stream("close called when the stream is not ready"));
        }

        state.closed = true;
        let data = state.buffer.split().freeze();
        self.send(state, data, true)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Starts accepting data: the request header is on the wire.
    pub(crate) fn open(&self, sink: Arc<dyn ChunkSink>) {
        let listener = {
            let mut state = self.lock();
            state.sink = Some(sink);
            state.ready = true;
            if state.mode.is_asynchronous() && state.call_listener {
                state.call_listener = false;
                state.listener.clone()
            } else {
                None
            }
        };
        self.shared.opened.notify_all();
        debug!("chunked body stream opened");
        if let Some(listener) = listener {
            self.notify_write_possible(listener);
        }
    }

    /// Fails the stream, waking a writer waiting to be opened.
    pub(crate) fn fail(&self, error: ClientError) {
        let listener = {
            let mut state = self.lock();
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(error.clone());
            state.ready = false;
            state.listener.clone()
        };
        self.shared.opened.notify_all();
        if let Some(listener) = listener {
            dispatch(self.shared.executor.as_ref(), move || listener.on_error(error));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_opened<'a>(&'a self, mut state: MutexGuard<'a, State>) -> Result<MutexGuard<'a, State>, ClientError> {
        while state.sink.is_none() && state.failure.is_none() {
            trace!("waiting for the chunked body stream to open");
            state = self.shared.opened.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        match &state.failure {
            Some(e) => Err(e.clone()),
            None => Ok(state),
        }
    }

    /// Encodes `data`, plus the terminator when `last`, and hands it to the sink.
    fn send(&self, mut state: MutexGuard<'_, State>, data: Bytes, last: bool) -> Result<(), ClientError> {
        let encoded = state.encode(data, self.shared.chunk_size, last)?;
        let sink = state.sink.clone().ok_or_else(|| ClientError::body_stream("stream is not open"))?;

        if state.mode.is_synchronous() {
            drop(state);
            let result = write_blocking(sink.as_ref(), encoded);
            match &result {
                Ok(()) if last => sink.close(),
                Ok(()) => {}
                Err(e) => self.lock().failure = Some(e.clone()),
            }
            return result;
        }

        state.ready = false;
        drop(state);

        let stream = self.clone();
        if last {
            let closing = Arc::clone(&sink);
            sink.write_chunk(
                encoded,
                Box::new(move |result| match result {
                    Ok(()) => closing.close(),
                    Err(e) => stream.fail(e),
                }),
            );
        } else {
            sink.write_chunk(encoded, Box::new(move |result| stream.on_write_completed(result)));
        }
        Ok(())
    }

    fn on_write_completed(&self, result: Result<(), ClientError>) {
        if let Err(e) = result {
            self.fail(e);
            return;
        }
        let listener = {
            let mut state = self.lock();
            state.ready = true;
            if state.call_listener {
                state.call_listener = false;
                state.listener.clone()
            } else {
                None
            }
        };
        if let Some(listener) = listener {
            self.notify_write_possible(listener);
        }
    }

    fn notify_write_possible(&self, listener: Arc<dyn WriteListener>) {
        dispatch(self.shared.executor.as_ref(), move || {
            if let Err(e) = listener.on_write_possible() {
                listener.on_error(e);
            }
        });
    }
}

impl State {
    fn check_writable(&self) -> Result<(), ClientError> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        if self.closed {
            return Err(ClientError::body_stream("stream is closed"));
        }
        Ok(())
    }

    fn encode(&mut self, mut data: Bytes, chunk_size: usize, last: bool) -> Result<Bytes, ClientError> {
        let mut dst = BytesMut::with_capacity(data.len() + 32);
        while !data.is_empty() {
            let piece = data.split_to(chunk_size.min(data.len()));
            self.encoder.encode(PayloadItem::Chunk(piece), &mut dst)?;
        }
        if last {
            self.encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst)?;
        }
        Ok(dst.freeze())
    }
}

fn write_blocking(sink: &dyn ChunkSink, encoded: Bytes) -> Result<(), ClientError> {
    let (tx, rx) = oneshot::channel();
    sink.write_chunk(
        encoded,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    futures::executor::block_on(rx).unwrap_or_else(|_| Err(ClientError::connection_closed("connection dropped the body write")))
}

impl io::Write for ChunkedBodyOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChunkedBodyOutputStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ChunkedBodyOutputStream::flush(self)?;
        Ok(())
    }
}

impl std::fmt::Debug for ChunkedBodyOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shared.state.try_lock() {
            Ok(state) => f
                .debug_struct("ChunkedBodyOutputStream")
                .field("mode", &state.mode)
                .field("chunk_size", &self.shared.chunk_size)
                .field("buffered", &state.buffer.len())
                .field("closed", &state.closed)
                .finish(),
            Err(_) => f.debug_struct("ChunkedBodyOutputStream").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Recording {
        written: Mutex<Vec<Bytes>>,
        pending: Mutex<Vec<WriteCompletion>>,
        hold: bool,
        closed: AtomicBool,
    }

    impl Recording {
        fn holding() -> Self {
            Self { hold: true, ..Default::default() }
        }

        fn wire(&self) -> Vec<u8> {
            self.written.lock().unwrap().iter().flat_map(|b| b.to_vec()).collect()
        }

        fn complete_pending(&self) {
            let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
            for completion in pending {
                completion(Ok(()));
            }
        }
    }

    impl ChunkSink for Recording {
        fn write_chunk(&self, chunk: Bytes, completion: WriteCompletion) {
            self.written.lock().unwrap().push(chunk);
            if self.hold {
                self.pending.lock().unwrap().push(completion);
            } else {
                completion(Ok(()));
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Possible(AtomicUsize);

    impl WriteListener for Possible {
        fn on_write_possible(&self) -> Result<(), ClientError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _error: ClientError) {}
    }

    #[test]
    fn sync_writes_are_chunked_and_terminated() {
        let stream = ChunkedBodyOutputStream::new(4);
        let sink = Arc::new(Recording::default());
        stream.open(sink.clone());

        stream.write(b"abcdefghij").unwrap();
        assert_eq!(sink.wire(), b"4\r\nabcd\r\n4\r\nefgh\r\n");

        stream.close().unwrap();
        assert_eq!(sink.wire(), b"4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n");
        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(matches!(stream.write(b"late"), Err(ClientError::BodyStream { .. })));
        stream.close().unwrap();
    }

    #[test]
    fn flushed_chunks_decode_to_one_body() {
        use crate::codec::ResponseDecoder;
        use crate::protocol::{Message, PayloadItem};
        use bytes::BytesMut;
        use tokio_util::codec::Decoder;

        let stream = ChunkedBodyOutputStream::new(16);
        let sink = Arc::new(Recording::default());
        stream.open(sink.clone());

        stream.write(b"Wiki").unwrap();
        stream.flush().unwrap();
        stream.write(b"pedia").unwrap();
        stream.close().unwrap();
        let wire = sink.wire();
        assert_eq!(wire, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");

        let mut decoder = ResponseDecoder::new(8 * 1024, 16);
        decoder.expect_response_to(http::Method::POST);
        let mut buffer = BytesMut::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
        let mut body = vec![];
        let mut eofs = 0;
        for byte in wire {
            buffer.extend_from_slice(&[byte]);
            while let Some(message) = decoder.decode(&mut buffer).unwrap() {
                match message {
                    Message::Header(_) => assert!(body.is_empty()),
                    Message::Payload(PayloadItem::Chunk(bytes)) => body.extend_from_slice(&bytes),
                    Message::Payload(PayloadItem::Eof) => eofs += 1,
                }
            }
        }
        assert_eq!(body, b"Wikipedia");
        assert_eq!(eofs, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn sync_write_waits_until_opened() {
        let stream = ChunkedBodyOutputStream::new(2);
        let sink = Arc::new(Recording::default());

        let writer = {
            let stream = stream.clone();
            thread::spawn(move || {
                stream.write(b"hi").unwrap();
                stream.close().unwrap();
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        assert!(sink.wire().is_empty());
        stream.open(sink.clone());
        writer.join().unwrap();

        assert_eq!(sink.wire(), b"2\r\nhi\r\n0\r\n\r\n");
    }

    #[test]
    fn failure_wakes_waiting_writer() {
        let stream = ChunkedBodyOutputStream::new(2);
        let writer = {
            let stream = stream.clone();
            thread::spawn(move || stream.write(b"hi"))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        stream.fail(ClientError::connection_closed("gone"));
        assert!(writer.join().unwrap().unwrap_err().is_connection_closed());
    }

    #[test]
    fn async_readiness_follows_write_completion() {
        let stream = ChunkedBodyOutputStream::new(3);
        let listener = Arc::new(Possible::default());
        stream.set_write_listener(listener.clone()).unwrap();
        assert!(!stream.is_ready().unwrap());

        let sink = Arc::new(Recording::holding());
        stream.open(sink.clone());
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        assert!(stream.is_ready().unwrap());
        stream.write(b"ab").unwrap();
        assert!(stream.is_ready().unwrap());
        stream.write(b"cd").unwrap();
        assert!(!stream.is_ready().unwrap());
        assert!(stream.write(b"x").is_err());

        sink.complete_pending();
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert!(stream.is_ready().unwrap());

        stream.close().unwrap();
        assert!(!sink.closed.load(Ordering::SeqCst));
        sink.complete_pending();
        assert!(sink.closed.load(Ordering::SeqCst));
        assert_eq!(sink.wire(), b"3\r\nabc\r\n1\r\nd\r\n0\r\n\r\n");
    }
}
