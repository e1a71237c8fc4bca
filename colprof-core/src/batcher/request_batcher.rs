//! Single-use collector folding a burst of logical queries into one request.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::select_all;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::wire::{BatchQuery, BatchRequest, BatchResponse, BatchResult};
use crate::error::{QueryError, TransportError};
use crate::priority::Rank;
use crate::queue::{PriorityRequestQueue, QueueEntry, Settle, Ticket};

/// Queue carrying physical batch requests
pub type BatchQueue = PriorityRequestQueue<BatchRequest, BatchResponse>;

/// One logical query to fold into a batch
#[derive(Debug)]
pub struct BatchEntry {
    pub payload: Value,
    /// Key the result comes back under; defaults to a numeric key unique
    /// within the batch
    pub response_key: Option<String>,
    pub priority: Rank,
    pub cancel: CancellationToken,
}

impl BatchEntry {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            response_key: None,
            priority: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_response_key(mut self, key: impl Into<String>) -> Self {
        self.response_key = Some(key.into());
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

struct Held {
    /// Assigned when the batch is sent if the caller gave none
    response_key: Option<String>,
    payload: Value,
    priority: Rank,
    cancel: CancellationToken,
    settle: Settle<Option<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Collecting,
    Sent,
    Cancelled,
}

struct BatcherState {
    phase: Phase,
    /// Entries announced through `register`
    expected: usize,
    /// Entries offered through `add`, including ones rejected on arrival
    added: usize,
    entries: Vec<Held>,
}

/// Collects logical queries for one backend instance and sends them as a
/// single entry on a [`BatchQueue`].
///
/// A batcher is spent after `send` or `cancel`; entries added afterwards are
/// rejected as cancelled.
pub struct RequestBatcher {
    queue: BatchQueue,
    group: String,
    key: String,
    sub_key: Option<String>,
    state: Mutex<BatcherState>,
    ready: Notify,
}

impl RequestBatcher {
    /// Create a batcher whose request is queued under `group`/`key`
    pub fn new(queue: BatchQueue, group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            queue,
            group: group.into(),
            key: key.into(),
            sub_key: None,
            state: Mutex::new(BatcherState {
                phase: Phase::Collecting,
                expected: 0,
                added: 0,
                entries: Vec::new(),
            }),
            ready: Notify::new(),
        }
    }

    /// Tag the physical request with a sub key so it can be re-ranked alone
    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, BatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announce one more entry; `send` waits until it has been added
    pub fn register(&self) {
        self.state().expected += 1;
    }

    /// Add an entry; `settle` receives its slice of the response exactly once.
    ///
    /// A response without the entry's key resolves with `None`.
    pub fn add<F>(&self, entry: BatchEntry, settle: F)
    where
        F: FnOnce(Result<Option<Value>, QueryError>) + Send + 'static,
    {
        self.push(entry, Box::new(settle));
    }

    /// Add an entry and await its slice through the returned ticket
    pub fn fetch(&self, entry: BatchEntry) -> Ticket<Option<Value>> {
        let (settle, ticket) = Ticket::channel();
        self.push(entry, settle);
        ticket
    }

    fn push(&self, entry: BatchEntry, settle: Settle<Option<Value>>) {
        let rejected = {
            let mut state = self.state();
            if state.phase != Phase::Collecting {
                warn!(key = %self.key, phase = ?state.phase, "Entry added to a spent batcher");
                Some((settle, QueryError::Cancelled))
            } else {
                state.added += 1;
                let taken = entry.response_key.as_ref().filter(|key| {
                    state
                        .entries
                        .iter()
                        .any(|held| held.response_key.as_ref() == Some(*key))
                });
                if let Some(key) = taken {
                    warn!(
                        key = %self.key,
                        response_key = %key,
                        "Response key already in batch"
                    );
                    Some((settle, QueryError::duplicate(self.key.clone(), key.clone())))
                } else if entry.cancel.is_cancelled() {
                    Some((settle, QueryError::Cancelled))
                } else {
                    state.entries.push(Held {
                        response_key: entry.response_key,
                        payload: entry.payload,
                        priority: entry.priority,
                        cancel: entry.cancel,
                        settle,
                    });
                    None
                }
            }
        };

        self.ready.notify_waiters();
        if let Some((settle, err)) = rejected {
            settle(Err(err));
        }
    }

    /// Effective rank: the most urgent rank among held entries
    pub fn priority(&self) -> Option<Rank> {
        self.state().entries.iter().map(|e| e.priority).min()
    }

    /// Number of entries held for sending
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send every held entry as one request and deliver each entry's slice.
    ///
    /// Waits for all registered entries to be added, then resolves once the
    /// physical request has settled. Calling it on a spent batcher does nothing.
    pub async fn send(&self, instance_id: impl Into<String>) {
        loop {
            let added = self.ready.notified();
            {
                let state = self.state();
                match state.phase {
                    Phase::Collecting if state.added >= state.expected => break,
                    Phase::Collecting => {}
                    Phase::Sent | Phase::Cancelled => return,
                }
            }
            added.await;
        }

        let entries = {
            let mut state = self.state();
            if state.phase != Phase::Collecting {
                return;
            }
            state.phase = Phase::Sent;
            std::mem::take(&mut state.entries)
        };

        // Entries cancelled while the batch was collecting leave it here.
        let (cancelled, mut live): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.cancel.is_cancelled());
        for held in cancelled {
            (held.settle)(Err(QueryError::Cancelled));
        }
        assign_default_keys(&mut live);
        let Some(priority) = live.iter().map(|e| e.priority).min() else {
            return;
        };

        let request = BatchRequest {
            instance_id: instance_id.into(),
            queries: live
                .iter()
                .map(|e| BatchQuery {
                    key: e.response_key.clone().unwrap_or_default(),
                    query: e.payload.clone(),
                })
                .collect(),
        };

        let batch_cancel = CancellationToken::new();
        let settled = CancellationToken::new();
        abort_on_any(
            live.iter().map(|e| e.cancel.clone()).collect(),
            batch_cancel.clone(),
            settled.clone(),
        );

        debug!(
            group = %self.group,
            key = %self.key,
            entries = live.len(),
            priority,
            "Sending batch"
        );
        self.queue.metrics().record_batch(live.len());

        let mut entry = QueueEntry::new(self.group.clone(), self.key.clone(), request)
            .with_priority(priority)
            .with_cancel(batch_cancel);
        if let Some(sub_key) = &self.sub_key {
            entry = entry.with_sub_key(sub_key.clone());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.queue.enqueue(entry, move |result| {
            settled.cancel();
            demultiplex(live, result);
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }

    /// Reject every held entry and discard the batch. No-op once sent.
    pub fn cancel(&self) {
        let entries = {
            let mut state = self.state();
            if state.phase != Phase::Collecting {
                return;
            }
            state.phase = Phase::Cancelled;
            std::mem::take(&mut state.entries)
        };

        self.ready.notify_waiters();
        debug!(key = %self.key, entries = entries.len(), "Batch cancelled before send");
        for held in entries {
            (held.settle)(Err(QueryError::Cancelled));
        }
    }
}

/// Cancel `batch` as soon as any of `tokens` fires, until `settled` fires
fn abort_on_any(
    tokens: Vec<CancellationToken>,
    batch: CancellationToken,
    settled: CancellationToken,
) {
    tokio::spawn(async move {
        let any = select_all(tokens.into_iter().map(|t| Box::pin(t.cancelled_owned())));
        tokio::select! {
            _ = any => batch.cancel(),
            _ = settled.cancelled() => {}
        }
    });
}

/// Give every entry without a response key the lowest free numeric key
fn assign_default_keys(entries: &mut [Held]) {
    let explicit: HashSet<String> = entries
        .iter()
        .filter_map(|held| held.response_key.clone())
        .collect();
    let mut free = (0usize..)
        .map(|n| n.to_string())
        .filter(|key| !explicit.contains(key));
    for held in entries.iter_mut().filter(|held| held.response_key.is_none()) {
        held.response_key = free.next();
    }
}

fn demultiplex(entries: Vec<Held>, result: Result<BatchResponse, QueryError>) {
    let response = match result {
        Ok(response) => response.into_map(),
        Err(err) => {
            for held in entries {
                (held.settle)(Err(err.clone()));
            }
            return;
        }
    };

    for held in entries {
        let key = held.response_key.as_deref().unwrap_or_default();
        let outcome: Result<Option<Value>, QueryError> = match response.get(key) {
            Some(BatchResult {
                error: Some(error), ..
            }) if !error.is_empty() => Err(TransportError::query(error.clone()).into()),
            Some(slice) => Ok(slice.result.clone()),
            None => Ok(None),
        };
        (held.settle)(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::queue::QueueConfig;
    use crate::test_support::{settle_tasks, ScriptedTransport};

    type Transport = ScriptedTransport<BatchRequest, BatchResponse>;

    fn batch_label(request: &BatchRequest) -> String {
        request
            .queries
            .iter()
            .map(|q| q.key.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn setup(limit: usize) -> (BatchQueue, Transport) {
        let transport = Transport::labelled(batch_label);
        let config = QueueConfig {
            concurrency_limit: limit,
            ..QueueConfig::default()
        };
        (PriorityRequestQueue::new(config, transport.clone()), transport)
    }

    fn spawn_send(batcher: &Arc<RequestBatcher>) -> tokio::task::JoinHandle<()> {
        let batcher = Arc::clone(batcher);
        tokio::spawn(async move { batcher.send("default").await })
    }

    #[tokio::test]
    async fn test_demultiplex_by_response_key() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let a = batcher.fetch(BatchEntry::new(json!({"q": "a"})).with_response_key("a"));
        let b = batcher.fetch(BatchEntry::new(json!({"q": "b"})).with_response_key("b"));
        let c = batcher.fetch(BatchEntry::new(json!({"q": "c"})).with_response_key("c"));

        let send = spawn_send(&batcher);
        settle_tasks().await;

        assert_eq!(transport.started(), vec!["a,b,c"]);
        let request = &transport.payloads()[0];
        assert_eq!(request.instance_id, "default");
        assert_eq!(request.queries[1].query, json!({"q": "b"}));

        transport.resolve(
            "a,b,c",
            BatchResponse::new(vec![
                BatchResult::ok("c", json!(3)),
                BatchResult::ok("a", json!(1)),
                BatchResult::ok("b", json!(2)),
            ]),
        );

        assert_eq!(a.await, Ok(Some(json!(1))));
        assert_eq!(b.await, Ok(Some(json!(2))));
        assert_eq!(c.await, Ok(Some(json!(3))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_failure_rejects_every_entry() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let tickets: Vec<_> = (0..3)
            .map(|i| batcher.fetch(BatchEntry::new(json!(i))))
            .collect();

        let send = spawn_send(&batcher);
        settle_tasks().await;
        transport.reject("0,1,2", TransportError::status(502, "bad gateway"));

        for ticket in tickets {
            assert_eq!(
                ticket.await,
                Err(QueryError::Transport(TransportError::status(502, "bad gateway")))
            );
        }
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_key_and_per_entry_error() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let present = batcher.fetch(BatchEntry::new(json!(1)).with_response_key("present"));
        let missing = batcher.fetch(BatchEntry::new(json!(2)).with_response_key("missing"));
        let failed = batcher.fetch(BatchEntry::new(json!(3)).with_response_key("failed"));

        let send = spawn_send(&batcher);
        settle_tasks().await;
        transport.resolve(
            "present,missing,failed",
            BatchResponse::new(vec![
                BatchResult::ok("present", json!("x")),
                BatchResult::failed("failed", "column dropped"),
            ]),
        );

        assert_eq!(present.await, Ok(Some(json!("x"))));
        assert_eq!(missing.await, Ok(None));
        assert_eq!(
            failed.await,
            Err(QueryError::Transport(TransportError::query("column dropped")))
        );
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_default_keys_skip_explicit_ones() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let first = batcher.fetch(BatchEntry::new(json!("first")));
        let named = batcher.fetch(BatchEntry::new(json!("named")).with_response_key("1"));
        let third = batcher.fetch(BatchEntry::new(json!("third")));

        let send = spawn_send(&batcher);
        settle_tasks().await;
        assert_eq!(transport.started(), vec!["0,1,2"]);

        transport.resolve(
            "0,1,2",
            BatchResponse::new(vec![
                BatchResult::ok("0", json!("first")),
                BatchResult::ok("1", json!("named")),
                BatchResult::ok("2", json!("third")),
            ]),
        );

        assert_eq!(first.await, Ok(Some(json!("first"))));
        assert_eq!(named.await, Ok(Some(json!("named"))));
        assert_eq!(third.await, Ok(Some(json!("third"))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_response_key_rejected() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let kept = batcher.fetch(BatchEntry::new(json!(1)).with_response_key("top_k"));
        let repeated = batcher.fetch(BatchEntry::new(json!(2)).with_response_key("top_k"));

        assert_eq!(
            repeated.await,
            Err(QueryError::duplicate("orders/amount", "top_k"))
        );
        assert_eq!(batcher.len(), 1);

        let send = spawn_send(&batcher);
        settle_tasks().await;
        transport.resolve(
            "top_k",
            BatchResponse::new(vec![BatchResult::ok("top_k", json!(1))]),
        );

        assert_eq!(kept.await, Ok(Some(json!(1))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_send() {
        let (queue, transport) = setup(5);
        let batcher = RequestBatcher::new(queue, "orders", "orders/amount");

        let a = batcher.fetch(BatchEntry::new(json!(1)));
        let b = batcher.fetch(BatchEntry::new(json!(2)));

        batcher.cancel();
        batcher.cancel();
        batcher.send("default").await;

        assert_eq!(a.await, Err(QueryError::Cancelled));
        assert_eq!(b.await, Err(QueryError::Cancelled));
        assert!(transport.started().is_empty());
        assert!(batcher.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_send_is_noop() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let a = batcher.fetch(BatchEntry::new(json!(1)).with_response_key("a"));
        let send = spawn_send(&batcher);
        settle_tasks().await;

        batcher.cancel();
        assert!(!transport.was_cancelled("a"));

        transport.resolve("a", BatchResponse::new(vec![BatchResult::ok("a", json!(true))]));
        assert_eq!(a.await, Ok(Some(json!(true))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_waits_for_registered_entries() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        batcher.register();
        batcher.register();
        let send = spawn_send(&batcher);
        settle_tasks().await;
        assert!(transport.started().is_empty());

        let first = batcher.fetch(BatchEntry::new(json!(1)).with_response_key("first"));
        settle_tasks().await;
        assert!(transport.started().is_empty());

        let second = batcher.fetch(BatchEntry::new(json!(2)).with_response_key("second"));
        settle_tasks().await;
        assert_eq!(transport.started(), vec!["first,second"]);

        transport.resolve("first,second", BatchResponse::default());
        assert_eq!(first.await, Ok(None));
        assert_eq!(second.await, Ok(None));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_waiting_send() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        batcher.register();
        batcher.register();
        let only = batcher.fetch(BatchEntry::new(json!(1)));
        let send = spawn_send(&batcher);
        settle_tasks().await;

        batcher.cancel();
        send.await.unwrap();

        assert_eq!(only.await, Err(QueryError::Cancelled));
        assert!(transport.started().is_empty());
    }

    #[tokio::test]
    async fn test_batch_takes_most_urgent_priority() {
        let (queue, transport) = setup(1);

        let blocker = Arc::new(RequestBatcher::new(queue.clone(), "t0", "blocker"));
        let _blocked = blocker.fetch(BatchEntry::new(json!(0)).with_response_key("blocker"));
        let blocker_send = spawn_send(&blocker);
        settle_tasks().await;

        let background = Arc::new(RequestBatcher::new(queue.clone(), "t1", "background"));
        background.add(BatchEntry::new(json!(1)).with_response_key("b1").with_priority(50), |_| {});
        background.add(BatchEntry::new(json!(2)).with_response_key("b2").with_priority(60), |_| {});

        let urgent = Arc::new(RequestBatcher::new(queue.clone(), "t1", "urgent"));
        urgent.add(BatchEntry::new(json!(3)).with_response_key("u1").with_priority(100), |_| {});
        urgent.add(BatchEntry::new(json!(4)).with_response_key("u2").with_priority(5), |_| {});
        assert_eq!(urgent.priority(), Some(5));

        let background_send = spawn_send(&background);
        let urgent_send = spawn_send(&urgent);
        settle_tasks().await;

        transport.resolve("blocker", BatchResponse::default());
        settle_tasks().await;
        assert_eq!(transport.started(), vec!["blocker", "u1,u2"]);

        transport.resolve("u1,u2", BatchResponse::default());
        settle_tasks().await;
        transport.resolve("b1,b2", BatchResponse::default());

        blocker_send.await.unwrap();
        urgent_send.await.unwrap();
        background_send.await.unwrap();
        assert_eq!(queue.metrics().snapshot().batches_sent, 3);
    }

    #[tokio::test]
    async fn test_constituent_cancel_aborts_batch() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));
        let token = CancellationToken::new();

        let a = batcher.fetch(
            BatchEntry::new(json!(1))
                .with_response_key("a")
                .with_cancel(token.clone()),
        );
        let b = batcher.fetch(BatchEntry::new(json!(2)).with_response_key("b"));

        let send = spawn_send(&batcher);
        settle_tasks().await;
        token.cancel();
        settle_tasks().await;

        assert!(transport.was_cancelled("a,b"));
        assert_eq!(a.await, Err(QueryError::Cancelled));
        assert_eq!(b.await, Err(QueryError::Cancelled));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_cancelled_before_send_is_left_out() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));
        let token = CancellationToken::new();

        let dropped = batcher.fetch(
            BatchEntry::new(json!(1))
                .with_response_key("dropped")
                .with_cancel(token.clone()),
        );
        let kept = batcher.fetch(BatchEntry::new(json!(2)).with_response_key("kept"));
        token.cancel();

        let send = spawn_send(&batcher);
        settle_tasks().await;
        assert_eq!(transport.started(), vec!["kept"]);
        assert_eq!(dropped.await, Err(QueryError::Cancelled));

        transport.resolve("kept", BatchResponse::new(vec![BatchResult::ok("kept", json!(2))]));
        assert_eq!(kept.await, Ok(Some(json!(2))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_add_after_send_is_rejected() {
        let (queue, transport) = setup(5);
        let batcher = Arc::new(RequestBatcher::new(queue, "orders", "orders/amount"));

        let first = batcher.fetch(BatchEntry::new(json!(1)).with_response_key("first"));
        let send = spawn_send(&batcher);
        settle_tasks().await;

        let late = batcher.fetch(BatchEntry::new(json!(2)));
        assert_eq!(late.await, Err(QueryError::Cancelled));

        transport.resolve("first", BatchResponse::default());
        assert_eq!(first.await, Ok(None));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let (queue, transport) = setup(5);
        let batcher = RequestBatcher::new(queue, "orders", "orders/amount");

        batcher.send("default").await;
        assert!(transport.started().is_empty());
    }
}
