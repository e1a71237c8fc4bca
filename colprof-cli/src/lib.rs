//! Runtime-facing pieces of colprof: the HTTP transport that carries query
//! batches and the table profiler that drives the queue.

pub mod http;
pub mod profiler;

pub use http::HttpTransport;
pub use profiler::{ColumnKind, ColumnProfile, ColumnSpec, TableProfile, TableProfiler};
