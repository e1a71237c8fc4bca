//! Request batching for per-column profiling queries.
//!
//! A table with thirty columns and five statistics per column would cost one
//! hundred and fifty round trips if each statistic were fetched alone. A
//! [`RequestBatcher`] folds a burst of logical queries into one physical
//! request, and the [`PriorityRequestQueue`](crate::queue::PriorityRequestQueue)
//! then governs how many *batches* are outstanding.
//!
//! ```text
//!  fetch(null_count) ─┐
//!  fetch(cardinality) ├─► RequestBatcher ──send()──► queue entry ──► transport
//!  fetch(top_k)      ─┘        ▲                                       │
//!                              └──────── demultiplex by key ◄──────────┘
//! ```
//!
//! A batch is a shared failure domain: if the physical request fails or is
//! aborted, every entry folded into it rejects with the same error.

mod request_batcher;
mod wire;

pub use request_batcher::{BatchEntry, BatchQueue, RequestBatcher};
pub use wire::{BatchQuery, BatchRequest, BatchResponse, BatchResult};
