//! Priority request queue for profiling queries.
//!
//! Decides which outstanding queries go to the server now, in what order, and
//! how many may be in flight at once.
//!
//! # Architecture
//!
//! ```text
//!   enqueue / submit
//!          │
//! ┌────────▼─────────────────┐
//! │  Queued                  │ ← ordered by (priority, arrival)
//! │  (0,3) (1,0) (1,4) ...   │   remove_by_group / deprioritize_group /
//! └────────┬─────────────────┘   reprioritize_sub re-rank or drop here
//!          │ admit while in_flight < concurrency_limit
//! ┌────────▼─────────────────┐
//! │  InFlight                │ ← transport(payload, cancel token)
//! └────────┬─────────────────┘
//!          │ settle (resolved / failed / cancelled)
//!          ▼
//!   callback or Ticket, then admit again
//! ```
//!
//! # Guarantees
//!
//! - At most `concurrency_limit` entries are in flight at any instant
//! - Equal priorities are admitted in insertion order
//! - Re-ranking only affects queued entries; admitted work is never preempted
//! - No retries and no timeouts: a stuck call holds its slot until cancelled

mod config;
mod entry;
mod metrics;
mod priority_queue;

pub use config::QueueConfig;
pub use entry::{QueueEntry, Settle, Ticket};
pub use metrics::{MetricsSnapshot, Outcome, QueueMetrics, RequestTimer};
pub use priority_queue::PriorityRequestQueue;
