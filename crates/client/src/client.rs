use std::fmt;
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};
use tracing::info;

use crate::config::{ClientConfig, ConfigError};
use crate::connection::ConnectionContext;
use crate::pool::{ConnectionPool, ResponseFuture};
use crate::protocol::ClientRequest;
use crate::stream::ListenerExecutor;

/// The entry point: submits requests to pooled connections.
///
/// A client either builds its own runtime from [`ThreadPoolConfig`](crate::config::ThreadPoolConfig)
/// or runs on the one it is handed. An owned runtime is shut down with the client.
///
/// ```no_run
/// use micro_client::client::HttpClient;
/// use micro_client::config::ClientConfig;
/// use micro_client::protocol::ClientRequest;
///
/// let client = HttpClient::new(ClientConfig::default()).unwrap();
/// let response = futures::executor::block_on(client.submit(ClientRequest::get("http://example.com/".parse().unwrap()))).unwrap();
/// println!("{}", response.status());
/// let body = response.body().read_to_bytes().unwrap();
/// println!("{} bytes", body.len());
/// ```
pub struct HttpClient {
    runtime: Option<Runtime>,
    handle: Handle,
    pool: Arc<ConnectionPool>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = config.thread_pool.build_runtime()?;
        let handle = runtime.handle().clone();
        let context = ConnectionContext::new(config)?;
        Ok(Self::build(context, Some(runtime), handle))
    }

    /// A client running its connections on `handle`.
    pub fn with_handle(config: ClientConfig, handle: Handle) -> Result<Self, ConfigError> {
        Ok(Self::build(ConnectionContext::new(config)?, None, handle))
    }

    /// A client over a prepared context, for a custom [`Connector`](crate::connection::Connector).
    pub fn with_context(context: ConnectionContext, handle: Handle) -> Self {
        Self::build(context, None, handle)
    }

    fn build(context: ConnectionContext, runtime: Option<Runtime>, handle: Handle) -> Self {
        let context = if context.config().thread_pool.listener_executor {
            context.with_executor(Some(ListenerExecutor::new(handle.clone())))
        } else {
            context
        };
        info!(owned_runtime = runtime.is_some(), max_connections_per_destination = context.config().max_connections_per_destination, "http client started");
        let pool = ConnectionPool::new(Arc::new(context), handle.clone());
        Self { runtime, handle, pool }
    }

    /// Routes `request` to a connection of its destination.
    ///
    /// The future resolves once the response header is in, or fails. It does not need
    /// the client's runtime to be polled.
    pub fn submit(&self, request: ClientRequest) -> ResponseFuture {
        self.pool.send(request)
    }

    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[inline]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Closes every connection, failing what is still pending. Closing twice does nothing.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.pool.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient").field("owned_runtime", &self.runtime.is_some()).field("pool", &self.pool).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadPoolConfig;
    use crate::protocol::ClientError;
    use futures::executor::block_on;
    use http::{Method, StatusCode};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// A blocking server answering each request with `response`, until the client hangs up.
    fn serve(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                thread::spawn(move || {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut content_length = 0;
                        let mut line = String::new();
                        if reader.read_line(&mut line).unwrap_or(0) == 0 {
                            return;
                        }
                        loop {
                            line.clear();
                            reader.read_line(&mut line).unwrap();
                            if line == "\r\n" {
                                break;
                            }
                            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                                content_length = value.trim().parse().unwrap();
                            }
                        }
                        let mut body = vec![0; content_length];
                        reader.read_exact(&mut body).unwrap();
                        reader.get_mut().write_all(response).unwrap();
                    }
                });
            }
        });
        port
    }

    #[test]
    fn owned_runtime_and_blocking_body() {
        let port = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nhello client");
        let client = HttpClient::new(ClientConfig::default().with_thread_pool(ThreadPoolConfig { worker_threads: Some(2), ..Default::default() })).unwrap();

        let uri = format!("http://127.0.0.1:{port}/greeting");
        let response = block_on(client.submit(ClientRequest::get(uri.parse().unwrap()))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = String::new();
        response.into_body().read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello client");

        let post = ClientRequest::buffered(Method::POST, uri.parse().unwrap(), "payload");
        let response = block_on(client.submit(post)).unwrap();
        assert_eq!(&response.body().read_to_bytes().unwrap()[..], b"hello client");
    }

    #[test]
    fn closed_client_fails_requests() {
        let client = HttpClient::new(ClientConfig::default()).unwrap();
        client.close();
        client.close();
        let error = block_on(client.submit(ClientRequest::get("http://127.0.0.1:1/".parse().unwrap()))).unwrap_err();
        assert!(error.is_connection_closed());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let error = HttpClient::new(ClientConfig::default().with_max_connections_per_destination(0)).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn borrowed_runtime_with_listener_executor() {
        let port = serve(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        let config = ClientConfig::default().with_thread_pool(ThreadPoolConfig { listener_executor: true, ..Default::default() });
        let client = HttpClient::with_handle(config, Handle::current()).unwrap();

        let response = client.submit(ClientRequest::get(format!("http://127.0.0.1:{port}/missing").parse().unwrap())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!response.has_content());

        drop(client);
        // the borrowed runtime outlives the client
        let result: Result<(), ClientError> = tokio::spawn(async { Ok(()) }).await.unwrap();
        assert!(result.is_ok());
    }
}
