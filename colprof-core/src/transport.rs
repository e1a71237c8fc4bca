//! Transport seam between the scheduler and the network.
//!
//! The queue is agnostic to URLs, headers and encoding: it hands each admitted
//! payload to a [`Transport`] together with the entry's cancellation token and
//! waits for the returned future to settle.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Future returned by a transport call
pub type TransportFuture<R> = BoxFuture<'static, Result<R, TransportError>>;

/// Performs one physical request.
///
/// Implementations should stop work once `cancel` fires; the queue reports the
/// abort as [`QueryError::Cancelled`](crate::error::QueryError::Cancelled)
/// whatever the future returns afterwards.
pub trait Transport<P, R>: Send + Sync + 'static {
    /// Send `payload`, resolving with the server's result
    fn send(&self, payload: P, cancel: CancellationToken) -> TransportFuture<R>;
}

impl<P, R, T> Transport<P, R> for Arc<T>
where
    T: Transport<P, R> + ?Sized,
{
    fn send(&self, payload: P, cancel: CancellationToken) -> TransportFuture<R> {
        (**self).send(payload, cancel)
    }
}

/// Transport backed by a closure
pub struct FnTransport<F> {
    f: F,
}

/// Wrap a closure as a [`Transport`].
///
/// The closure body runs synchronously at admission; only the returned future
/// is awaited.
pub fn transport_fn<P, R, F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TransportError>> + Send + 'static,
{
    FnTransport { f }
}

impl<P, R, F, Fut> Transport<P, R> for FnTransport<F>
where
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TransportError>> + Send + 'static,
{
    fn send(&self, payload: P, cancel: CancellationToken) -> TransportFuture<R> {
        Box::pin((self.f)(payload, cancel))
    }
}
