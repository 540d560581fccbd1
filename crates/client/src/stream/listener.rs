use tokio::runtime::Handle;

use crate::protocol::ClientError;

/// Notified by a [`BodyInputStream`](super::BodyInputStream) in asynchronous mode.
///
/// A callback that fails has its error handed to [`ReadListener::on_error`].
pub trait ReadListener: Send + Sync {
    /// Data can be read without waiting. Fired at most once per unsuccessful readiness check.
    fn on_data_available(&self) -> Result<(), ClientError>;

    /// The whole body has been read.
    fn on_all_data_read(&self) -> Result<(), ClientError>;

    fn on_error(&self, error: ClientError);
}

/// Notified by a [`ChunkedBodyOutputStream`](super::ChunkedBodyOutputStream) in asynchronous mode.
pub trait WriteListener: Send + Sync {
    /// A write can be issued. Fired at most once per unsuccessful readiness check.
    fn on_write_possible(&self) -> Result<(), ClientError>;

    fn on_error(&self, error: ClientError);
}

/// Runs listener callbacks off the connection task, on the blocking pool of a runtime.
///
/// Without an executor the callbacks run inline, on whatever thread triggered them.
#[derive(Debug, Clone)]
pub struct ListenerExecutor {
    handle: Handle,
}

impl ListenerExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(task));
    }
}

pub(crate) fn dispatch<F>(executor: Option<&ListenerExecutor>, task: F)
where
    F: FnOnce() + Send + 'static,
{
    match executor {
        Some(executor) => executor.execute(task),
        None => task(),
    }
}
