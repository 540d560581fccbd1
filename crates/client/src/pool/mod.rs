//! Connection pooling
//!
//! A [`DestinationPool`] owns every connection to one [`DestinationKey`]: it reuses idle
//! connections, opens new ones up to the configured maximum and queues requests while
//! the pool is at capacity. The [`ConnectionPool`] registry routes each request to the
//! pool of its destination, creating pools on demand and dropping them once their
//! last connection has closed with nothing left to send.
//!
//! Every submitted request resolves exactly once, through its [`ResponseFuture`].

mod destination;
mod registry;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::channel::oneshot;
use pin_project_lite::pin_project;

pub use destination::DestinationKey;
pub use destination::DestinationPool;
pub use registry::ConnectionPool;

use crate::protocol::{ClientError, ClientResponse};

pub(crate) type Responder = oneshot::Sender<Result<ClientResponse, ClientError>>;

pin_project! {
    /// Resolves to the response header of a submitted request, or to why there is none.
    ///
    /// The body keeps streaming after the future resolves.
    #[derive(Debug)]
    pub struct ResponseFuture {
        #[pin]
        receiver: oneshot::Receiver<Result<ClientResponse, ClientError>>,
    }
}

impl ResponseFuture {
    pub(crate) fn channel() -> (Responder, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    pub(crate) fn failed(error: ClientError) -> Self {
        let (sender, future) = Self::channel();
        let _ = sender.send(Err(error));
        future
    }
}

impl Future for ResponseFuture {
    type Output = Result<ClientResponse, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().receiver.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(oneshot::Canceled) => Poll::Ready(Err(ClientError::connection_closed("request dropped by the pool"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_future_resolves_immediately() {
        let error = ResponseFuture::failed(ClientError::connection_closed("pool closed")).await.unwrap_err();
        assert!(error.is_connection_closed());
    }

    #[tokio::test]
    async fn dropped_responder_is_connection_closed() {
        let (responder, future) = ResponseFuture::channel();
        drop(responder);
        assert!(future.await.unwrap_err().is_connection_closed());
    }
}
