//! Bounded-concurrency, priority-ordered dispatcher.
//!
//! Queued entries live in a `BTreeMap` keyed by `(priority, position, sequence)`,
//! so the next entry to admit is always the first key. Re-ranking removes an
//! entry and reinserts it under its new key; keys are never edited in place.
//! `position` is the arrival sequence unless the entry was moved to the front
//! or back of its rank.
//!
//! Settle callbacks run only after the state lock is released, so a callback
//! may freely enqueue or cancel more work.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::config::QueueConfig;
use super::entry::{QueueEntry, Settle, Ticket};
use super::metrics::{Outcome, QueueMetrics, RequestTimer};
use crate::error::QueryError;
use crate::priority::Rank;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Rank,
    /// Tie-break within a rank
    position: i64,
    /// Identity of the entry for its whole life
    sequence: u64,
}

impl OrderKey {
    fn arrival(priority: Rank, sequence: u64) -> Self {
        Self {
            priority,
            position: sequence as i64,
            sequence,
        }
    }
}

struct Pending<P, R> {
    key: String,
    group: String,
    sub_key: Option<String>,
    payload: P,
    /// Child of the caller's token; aborting it never cancels the caller's
    abort: CancellationToken,
    /// Stops the queued-cancellation watcher once the entry leaves the queue
    watcher: CancellationToken,
    settle: Settle<R>,
    timer: RequestTimer,
}

struct Running {
    group: String,
    abort: CancellationToken,
}

struct QueueState<P, R> {
    queued: BTreeMap<OrderKey, Pending<P, R>>,
    /// Current key of each queued sequence number
    orders: HashMap<u64, OrderKey>,
    in_flight: HashMap<u64, Running>,
    /// `(group, key)` of every queued or in-flight entry
    active_keys: HashSet<(String, String)>,
    next_sequence: u64,
    /// Next position handed out for moves to the front of a rank; counts down
    next_front: i64,
}

impl<P, R> QueueState<P, R> {
    fn new() -> Self {
        Self {
            queued: BTreeMap::new(),
            orders: HashMap::new(),
            in_flight: HashMap::new(),
            active_keys: HashSet::new(),
            next_sequence: 0,
            next_front: 0,
        }
    }

    fn take_queued(&mut self, sequence: u64) -> Option<Pending<P, R>> {
        let order = self.orders.remove(&sequence)?;
        let pending = self.queued.remove(&order)?;
        self.active_keys
            .remove(&(pending.group.clone(), pending.key.clone()));
        Some(pending)
    }

    fn queued_in_group(&self, group: &str) -> Vec<OrderKey> {
        self.queued
            .iter()
            .filter(|(_, p)| p.group == group)
            .map(|(order, _)| *order)
            .collect()
    }

    fn rekey(&mut self, from: OrderKey, to: OrderKey) {
        if from == to {
            return;
        }
        if let Some(pending) = self.queued.remove(&from) {
            self.queued.insert(to, pending);
            self.orders.insert(to.sequence, to);
        }
    }

    fn rerank(&mut self, order: OrderKey, priority: Rank) {
        self.rekey(order, OrderKey { priority, ..order });
    }

    /// Place `orders` ahead of everything else at `priority`, keeping their
    /// relative order
    fn move_to_front(&mut self, orders: &[OrderKey], priority: Rank) {
        self.next_front -= orders.len() as i64;
        let base = self.next_front;
        for (offset, order) in orders.iter().enumerate() {
            let position = base + offset as i64;
            self.rekey(*order, OrderKey { priority, position, ..*order });
        }
    }

    /// Place `orders` behind everything queued so far at `priority`
    fn move_to_back(&mut self, orders: &[OrderKey], priority: Rank) {
        for order in orders {
            let position = self.next_sequence as i64;
            self.next_sequence += 1;
            self.rekey(*order, OrderKey { priority, position, ..*order });
        }
    }
}

struct Inner<P, R> {
    limit: usize,
    config: QueueConfig,
    transport: Arc<dyn Transport<P, R>>,
    state: Mutex<QueueState<P, R>>,
    metrics: Arc<QueueMetrics>,
}

/// Priority request queue with a fixed concurrency ceiling.
///
/// Cloning yields another handle to the same queue. All operations must be
/// called from within a Tokio runtime, since admitted entries run as tasks.
pub struct PriorityRequestQueue<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for PriorityRequestQueue<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, R> PriorityRequestQueue<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Create a queue dispatching through `transport`
    pub fn new(config: QueueConfig, transport: impl Transport<P, R>) -> Self {
        Self::with_metrics(config, transport, Arc::new(QueueMetrics::new()))
    }

    /// Create a queue reporting into shared metrics
    pub fn with_metrics(
        config: QueueConfig,
        transport: impl Transport<P, R>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: config.effective_limit(),
                config,
                transport: Arc::new(transport),
                state: Mutex::new(QueueState::new()),
                metrics,
            }),
        }
    }

    /// Queue an entry; `settle` receives its outcome exactly once.
    ///
    /// A key already queued or in flight for the same group is rejected with
    /// [`QueryError::Duplicate`] before anything is queued.
    pub fn enqueue<F>(&self, entry: QueueEntry<P>, settle: F)
    where
        F: FnOnce(Result<R, QueryError>) + Send + 'static,
    {
        self.inner.enqueue(entry, Box::new(settle));
    }

    /// Queue an entry and await its outcome through the returned ticket
    pub fn submit(&self, entry: QueueEntry<P>) -> Ticket<R> {
        let (settle, ticket) = Ticket::channel();
        self.inner.enqueue(entry, settle);
        ticket
    }

    /// Cancel every queued and in-flight entry of `group`.
    ///
    /// Queued entries are rejected before this returns. In-flight entries are
    /// aborted and reject once the abort reaches their dispatch task.
    pub fn remove_by_group(&self, group: &str) {
        let (dropped, aborts) = {
            let mut state = self.inner.state();
            let dropped: Vec<_> = state
                .queued_in_group(group)
                .into_iter()
                .filter_map(|order| state.take_queued(order.sequence))
                .collect();
            let aborts: Vec<_> = state
                .in_flight
                .values()
                .filter(|r| r.group == group)
                .map(|r| r.abort.clone())
                .collect();
            (dropped, aborts)
        };

        debug!(
            group = %group,
            dropped = dropped.len(),
            aborted = aborts.len(),
            "Removing group"
        );

        for pending in dropped {
            self.inner.reject_queued(pending);
        }
        for abort in aborts {
            abort.cancel();
        }
    }

    /// Move every queued entry of `group` behind all regularly ranked work.
    ///
    /// Relative order inside the group is kept and nothing is cancelled.
    pub fn deprioritize_group(&self, group: &str) {
        let floor = self.inner.config.deprioritized_floor;
        let mut state = self.inner.state();
        for order in state.queued_in_group(group) {
            if order.priority < floor {
                state.rerank(order, floor.saturating_add(order.priority));
            }
        }
        trace!(group = %group, "Deprioritized group");
    }

    /// Move the queued entries for `sub_key` to the front (`promote`) or back
    /// of their group's band. In-flight work is never preempted.
    pub fn reprioritize_sub(&self, group: &str, sub_key: &str, promote: bool) {
        let mut state = self.inner.state();
        let (matching, others): (Vec<_>, Vec<_>) = state
            .queued
            .iter()
            .filter(|(_, p)| p.group == group)
            .map(|(order, p)| (*order, p.sub_key.as_deref() == Some(sub_key)))
            .partition(|(_, is_match)| *is_match);
        let matching = matching.into_iter().map(|(order, _)| order);
        let others = others.into_iter().map(|(order, _)| order);

        // Front of the band is just ahead of the group's best other entry,
        // back is just behind its worst.
        if promote {
            let Some(front) = others.min() else {
                return;
            };
            let behind: Vec<OrderKey> = matching.filter(|order| *order > front).collect();
            match front.priority.checked_sub(1) {
                Some(target) => behind.into_iter().for_each(|o| state.rerank(o, target)),
                None => state.move_to_front(&behind, front.priority),
            }
        } else {
            let Some(back) = others.max() else {
                return;
            };
            let ahead: Vec<OrderKey> = matching.filter(|order| *order < back).collect();
            match back.priority.checked_add(1) {
                Some(target) => ahead.into_iter().for_each(|o| state.rerank(o, target)),
                None => state.move_to_back(&ahead, back.priority),
            }
        }
        trace!(group = %group, sub_key = %sub_key, promote, "Reprioritized sub key");
    }

    /// Set the rank of the queued entries for `sub_key` directly
    pub fn set_sub_priority(&self, group: &str, sub_key: &str, priority: Rank) {
        let mut state = self.inner.state();
        let matching: Vec<OrderKey> = state
            .queued
            .iter()
            .filter(|(_, p)| p.group == group && p.sub_key.as_deref() == Some(sub_key))
            .map(|(order, _)| *order)
            .collect();
        for order in matching {
            state.rerank(order, priority);
        }
        trace!(group = %group, sub_key = %sub_key, priority, "Set sub key priority");
    }

    /// Cancel everything, queued and in flight
    pub fn clear(&self) {
        let (dropped, aborts) = {
            let mut state = self.inner.state();
            let sequences: Vec<u64> = state.queued.keys().map(|o| o.sequence).collect();
            let dropped: Vec<_> = sequences
                .into_iter()
                .filter_map(|sequence| state.take_queued(sequence))
                .collect();
            let aborts: Vec<_> = state.in_flight.values().map(|r| r.abort.clone()).collect();
            (dropped, aborts)
        };
        for pending in dropped {
            self.inner.reject_queued(pending);
        }
        for abort in aborts {
            abort.cancel();
        }
    }

    /// Entries waiting for admission
    pub fn queue_depth(&self) -> usize {
        self.inner.state().queued.len()
    }

    /// Entries currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight.len()
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }
}

impl<P, R> Inner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn state(&self) -> MutexGuard<'_, QueueState<P, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, entry: QueueEntry<P>, settle: Settle<R>) {
        self.metrics.record_received();

        let QueueEntry {
            key,
            group,
            sub_key,
            priority,
            payload,
            cancel,
        } = entry;

        if cancel.is_cancelled() {
            self.metrics.record_cancelled();
            settle(Err(QueryError::Cancelled));
            return;
        }

        let inserted = {
            let mut state = self.state();
            if state.active_keys.insert((group.clone(), key.clone())) {
                let sequence = state.next_sequence;
                state.next_sequence += 1;

                let abort = cancel.child_token();
                let watcher = CancellationToken::new();
                debug!(group = %group, key = %key, priority, sequence, "Entry enqueued");
                let order = OrderKey::arrival(priority, sequence);
                state.queued.insert(
                    order,
                    Pending {
                        key,
                        group,
                        sub_key,
                        payload,
                        abort: abort.clone(),
                        watcher: watcher.clone(),
                        settle,
                        timer: RequestTimer::new(),
                    },
                );
                state.orders.insert(sequence, order);
                Ok((sequence, abort, watcher))
            } else {
                Err((group, key, settle))
            }
        };

        match inserted {
            Ok((sequence, abort, watcher)) => {
                self.metrics.record_queued();
                self.watch_queued(sequence, abort, watcher);
                self.admit();
            }
            Err((group, key, settle)) => {
                debug!(group = %group, key = %key, "Duplicate entry rejected");
                self.metrics.record_duplicate();
                settle(Err(QueryError::duplicate(group, key)));
            }
        }
    }

    /// Reject a queued entry as soon as its token fires
    fn watch_queued(
        self: &Arc<Self>,
        sequence: u64,
        abort: CancellationToken,
        watcher: CancellationToken,
    ) {
        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    if let Some(queue) = queue.upgrade() {
                        queue.cancel_queued(sequence);
                    }
                }
                _ = watcher.cancelled() => {}
            }
        });
    }

    fn cancel_queued(&self, sequence: u64) {
        let pending = self.state().take_queued(sequence);
        if let Some(pending) = pending {
            self.reject_queued(pending);
        }
    }

    fn reject_queued(&self, pending: Pending<P, R>) {
        pending.watcher.cancel();
        self.metrics.record_dropped();
        debug!(group = %pending.group, key = %pending.key, "Queued entry cancelled");
        (pending.settle)(Err(QueryError::Cancelled));
    }

    /// Admit entries until the ceiling is reached or the queue is empty.
    ///
    /// An entry whose token fired before its watcher ran is rejected here
    /// instead of being dispatched.
    fn admit(self: &Arc<Self>) {
        loop {
            let (next, cancelled) = {
                let mut state = self.state();
                let mut cancelled = Vec::new();
                let next = loop {
                    if state.in_flight.len() >= self.limit {
                        break None;
                    }
                    let Some((order, pending)) = state.queued.pop_first() else {
                        break None;
                    };
                    state.orders.remove(&order.sequence);
                    if pending.abort.is_cancelled() {
                        state
                            .active_keys
                            .remove(&(pending.group.clone(), pending.key.clone()));
                        cancelled.push(pending);
                        continue;
                    }
                    state.in_flight.insert(
                        order.sequence,
                        Running {
                            group: pending.group.clone(),
                            abort: pending.abort.clone(),
                        },
                    );
                    break Some((order, pending));
                };
                (next, cancelled)
            };

            for pending in cancelled {
                self.reject_queued(pending);
            }
            match next {
                Some((order, pending)) => self.dispatch(order, pending),
                None => return,
            }
        }
    }

    fn dispatch(self: &Arc<Self>, order: OrderKey, mut pending: Pending<P, R>) {
        pending.watcher.cancel();
        pending.timer.start_processing();
        self.metrics
            .record_admitted(pending.timer.queue_wait_time());

        debug!(
            group = %pending.group,
            key = %pending.key,
            priority = order.priority,
            "Entry admitted"
        );

        let Pending {
            key,
            group,
            payload,
            abort,
            settle,
            timer,
            ..
        } = pending;

        let call = self.transport.send(payload, abort.clone());
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => Err(QueryError::Cancelled),
                result = call => result.map_err(QueryError::from),
            };
            queue.complete(order.sequence, &group, &key, timer, result, settle);
        });
    }

    fn complete(
        self: &Arc<Self>,
        sequence: u64,
        group: &str,
        key: &str,
        timer: RequestTimer,
        result: Result<R, QueryError>,
        settle: Settle<R>,
    ) {
        {
            let mut state = self.state();
            state.in_flight.remove(&sequence);
            state
                .active_keys
                .remove(&(group.to_string(), key.to_string()));
        }

        let outcome = match &result {
            Ok(_) => Outcome::Resolved,
            Err(QueryError::Cancelled) => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        };
        self.metrics
            .record_settled(outcome, timer.processing_time());
        debug!(group = %group, key = %key, ?outcome, "Entry settled");

        settle(result);
        self.admit();
    }
}
