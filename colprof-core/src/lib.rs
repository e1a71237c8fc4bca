//! Colprof Core Library
//!
//! Client-side admission control for interactive column profiling: a
//! bounded-concurrency priority queue, a request batcher that coalesces a burst
//! of statistics queries into one round trip, and the rank policy feeding both.
//!
//! # Example
//!
//! ```rust,no_run
//! use colprof_core::error::TransportError;
//! use colprof_core::priority::{priority_of, ColumnQuery};
//! use colprof_core::queue::{PriorityRequestQueue, QueueConfig, QueueEntry};
//! use colprof_core::transport::transport_fn;
//!
//! # async fn demo() {
//! let transport = transport_fn(|sql: String, _cancel| async move {
//!     Ok::<_, TransportError>(sql.len())
//! });
//! let queue = PriorityRequestQueue::new(QueueConfig::default(), transport);
//!
//! let rank = priority_of(ColumnQuery::NullCount, true);
//! let entry = QueueEntry::new("orders", "orders/amount/null_count", "SELECT ...".to_string())
//!     .with_sub_key("amount")
//!     .with_priority(rank);
//! let result = queue.submit(entry).await;
//! # }
//! ```

pub mod batcher;
pub mod error;
pub mod priority;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use batcher::{BatchEntry, RequestBatcher};
pub use error::{QueryError, TransportError};
pub use priority::{priority_of, ColumnQuery, Rank};
pub use queue::{PriorityRequestQueue, QueueConfig, QueueEntry, Ticket};
