//! Dual-mode body streams
//!
//! [`BodyInputStream`] is the readable end of a response body, fed by the connection
//! through a [`BodySink`]. [`ChunkedBodyOutputStream`] is the writable end of a
//! chunked request body, drained by the connection through a [`ChunkSink`].
//!
//! Both commit to one [`Mode`] on first use. In synchronous mode calls block the
//! calling thread, so they must not run on a runtime worker. In asynchronous mode the
//! caller checks readiness and is told through a listener when to come back.

mod body_input;
mod chunked_output;
mod listener;
mod mode;

pub use body_input::BodyInputStream;
pub use body_input::BodySink;
pub use body_input::body_stream;
pub use chunked_output::ChunkSink;
pub use chunked_output::ChunkedBodyOutputStream;
pub use chunked_output::WriteCompletion;
pub use listener::ListenerExecutor;
pub use listener::ReadListener;
pub use listener::WriteListener;
pub use mode::Mode;

pub(crate) use listener::dispatch;
