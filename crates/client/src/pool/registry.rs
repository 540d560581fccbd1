use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::runtime::Handle;
use tracing::{debug, info, trace};

use crate::connection::ConnectionContext;
use crate::pool::destination::{DrainedCallback, RequestRecord};
use crate::pool::{DestinationKey, DestinationPool, ResponseFuture};
use crate::protocol::{ClientError, ClientRequest};

/// Routes requests to the [`DestinationPool`] of their destination.
///
/// Pools are created on the first request to a destination and removed once drained.
/// A request racing with the removal of its pool is moved to the pool that replaces it.
pub struct ConnectionPool {
    context: Arc<ConnectionContext>,
    runtime: Handle,
    pools: RwLock<HashMap<DestinationKey, Arc<DestinationPool>>>,
    closed: AtomicBool,
    me: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(context: Arc<ConnectionContext>, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self { context, runtime, pools: RwLock::new(HashMap::new()), closed: AtomicBool::new(false), me: Weak::clone(me) })
    }

    pub fn send(&self, request: ClientRequest) -> ResponseFuture {
        if self.is_closed() {
            return ResponseFuture::failed(ClientError::connection_closed("connection pool is closed"));
        }
        let key = match DestinationKey::from_uri(request.uri()) {
            Ok(key) => key,
            Err(e) => return ResponseFuture::failed(e),
        };

        let (responder, future) = ResponseFuture::channel();
        let mut record = RequestRecord { request, responder };
        loop {
            if self.is_closed() {
                let _ = record.responder.send(Err(ClientError::connection_closed("connection pool is closed")));
                break;
            }
            let pool = self.pool_for(&key);
            match pool.try_send(record) {
                Ok(()) => break,
                Err(returned) => {
                    trace!(destination = %key, "pool retired while sending, retrying");
                    self.remove(&pool);
                    record = returned;
                }
            }
        }
        future
    }

    /// The pool of `key`, if one is live.
    pub fn get(&self, key: &DestinationKey) -> Option<Arc<DestinationPool>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every pool. Later requests fail with [`ClientError::ConnectionClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = self.pools.write().unwrap_or_else(PoisonError::into_inner).drain().map(|(_, pool)| pool).collect();
        info!(pools = pools.len(), "closing connection pool");
        for pool in pools {
            pool.close();
        }
    }

    fn pool_for(&self, key: &DestinationKey) -> Arc<DestinationPool> {
        if let Some(pool) = self.get(key) {
            return pool;
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.entry(key.clone()).or_insert_with(|| {
            debug!(destination = %key, "creating destination pool");
            let registry = Weak::clone(&self.me);
            let on_drained: DrainedCallback = Box::new(move |pool| {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(pool);
                }
            });
            DestinationPool::with_drained_callback(key.clone(), Arc::clone(&self.context), self.runtime.clone(), Some(on_drained))
        });
        Arc::clone(pool)
    }

    /// Removes `pool` unless a replacement has already taken its key.
    fn remove(&self, pool: &Arc<DestinationPool>) {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if pools.get(pool.key()).is_some_and(|current| Arc::ptr_eq(current, pool)) {
            pools.remove(pool.key());
            debug!(destination = %pool.key(), "destination pool removed");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("pools", &self.pool_count()).field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn registry() -> Arc<ConnectionPool> {
        let context = Arc::new(ConnectionContext::new(ClientConfig::default()).unwrap());
        ConnectionPool::new(context, Handle::current())
    }

    /// Serves one `Connection: close` response per connection.
    async fn closing_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut stream = BufReader::new(stream);
                    let mut line = String::new();
                    while line != "\r\n" {
                        line.clear();
                        if stream.read_line(&mut line).await.unwrap() == 0 {
                            return;
                        }
                    }
                    let _ = stream.get_mut().write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok").await;
                });
            }
        });
        port
    }

    async fn wait_for_no_pools(registry: &ConnectionPool) {
        timeout(Duration::from_secs(5), async {
            while registry.pool_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn routes_and_drops_drained_pools() {
        let port = closing_server().await;
        let registry = registry();
        let uri = format!("http://127.0.0.1:{port}/");

        let response = timeout(Duration::from_secs(5), registry.send(ClientRequest::get(uri.parse().unwrap()))).await.unwrap().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(&response.into_body().collect().await.unwrap().to_bytes()[..], b"ok");
        wait_for_no_pools(&registry).await;

        // a new pool takes over the destination
        let response = timeout(Duration::from_secs(5), registry.send(ClientRequest::get(uri.parse().unwrap()))).await.unwrap().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn separate_pools_per_destination() {
        let registry = registry();
        // connects through the backlog and is never answered, so both pools stay
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let _plain = registry.send(ClientRequest::get(format!("http://127.0.0.1:{port}/").parse().unwrap()));
        let _other = registry.send(ClientRequest::get(format!("http://localhost:{port}/").parse().unwrap()));
        assert_eq!(registry.pool_count(), 2);
        assert!(registry.get(&DestinationKey::new("127.0.0.1", port, false)).is_some());
        assert!(registry.get(&DestinationKey::new("127.0.0.1", port, true)).is_none());
    }

    #[tokio::test]
    async fn invalid_uri_fails_immediately() {
        let registry = registry();
        let error = registry.send(ClientRequest::get("/no-host".parse().unwrap())).await.unwrap_err();
        assert!(matches!(error, ClientError::Send { .. }));
        assert_eq!(registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_later_requests() {
        let registry = registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = format!("http://127.0.0.1:{port}/");

        let pending = registry.send(ClientRequest::get(uri.parse().unwrap()));
        registry.close();
        registry.close();

        assert!(timeout(Duration::from_secs(5), pending).await.unwrap().unwrap_err().is_connection_closed());
        assert!(registry.send(ClientRequest::get(uri.parse().unwrap())).await.unwrap_err().is_connection_closed());
        assert_eq!(registry.pool_count(), 0);
    }
}
