//! Queue entries and result delivery.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::priority::Rank;

/// Receives the outcome of an entry, exactly once
pub type Settle<R> = Box<dyn FnOnce(Result<R, QueryError>) + Send + 'static>;

/// One logical request waiting for admission
#[derive(Debug)]
pub struct QueueEntry<P> {
    /// Identifies the logical request within its group
    pub key: String,
    /// Owning resource, e.g. a table name
    pub group: String,
    /// Finer identity inside the group, e.g. a column name
    pub sub_key: Option<String>,
    /// Lower is admitted sooner
    pub priority: Rank,
    /// Handed to the transport verbatim
    pub payload: P,
    /// Cancels the entry while queued, aborts it while in flight
    pub cancel: CancellationToken,
}

impl<P> QueueEntry<P> {
    /// Create an entry with rank 0 and a fresh cancellation token
    pub fn new(group: impl Into<String>, key: impl Into<String>, payload: P) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            sub_key: None,
            priority: 0,
            payload,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    pub fn with_priority(mut self, priority: Rank) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Future resolving with the outcome of a submitted entry
#[derive(Debug)]
pub struct Ticket<R> {
    rx: oneshot::Receiver<Result<R, QueryError>>,
}

impl<R: Send + 'static> Ticket<R> {
    /// Create a ticket and the callback that completes it
    pub fn channel() -> (Settle<R>, Ticket<R>) {
        let (tx, rx) = oneshot::channel();
        let settle: Settle<R> = Box::new(move |result| {
            // The holder may have dropped the ticket; nothing to deliver then.
            let _ = tx.send(result);
        });
        (settle, Ticket { rx })
    }
}

impl<R> Future for Ticket<R> {
    type Output = Result<R, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Settle callback dropped without running: the queue went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueryError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
