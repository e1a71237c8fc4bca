//! Configuration for the priority request queue.

use crate::priority::{Rank, DEPRIORITIZED_FLOOR};

/// Configuration for the priority request queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of requests in flight at once
    pub concurrency_limit: usize,

    /// Rank added to entries of a deprioritized group so they sort after
    /// every regularly ranked entry
    pub deprioritized_floor: Rank,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            deprioritized_floor: DEPRIORITIZED_FLOOR,
        }
    }
}

impl QueueConfig {
    /// One request at a time, strictly in rank order
    pub fn single_flight() -> Self {
        Self {
            concurrency_limit: 1,
            ..Self::default()
        }
    }

    /// For runtimes that serve many concurrent profiling queries
    pub fn high_throughput() -> Self {
        Self {
            concurrency_limit: 16,
            ..Self::default()
        }
    }

    /// Create config from environment variables
    ///
    /// - `COLPROF_CONCURRENCY_LIMIT`: requests in flight (default: 5)
    /// - `COLPROF_DEPRIORITIZED_FLOOR`: rank floor for deprioritized groups (default: 1000)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("COLPROF_CONCURRENCY_LIMIT") {
            if let Ok(n) = val.parse() {
                config.concurrency_limit = n;
            }
        }

        if let Ok(val) = std::env::var("COLPROF_DEPRIORITIZED_FLOOR") {
            if let Ok(n) = val.parse() {
                config.deprioritized_floor = n;
            }
        }

        config
    }

    /// Effective limit; a zero limit would never admit anything
    pub(crate) fn effective_limit(&self) -> usize {
        if self.concurrency_limit == 0 {
            tracing::warn!("concurrency_limit of 0 would stall the queue, using 1");
        }
        self.concurrency_limit.max(1)
    }
}
