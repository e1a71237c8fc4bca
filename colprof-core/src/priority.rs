//! Rank assignment for column profiling queries.
//!
//! Lower ranks are admitted sooner. Ranks are laid out in bands:
//!
//! ```text
//!   0 ..  99   active column (the one the user expanded)
//! 100 .. 199   background profiling of the remaining columns
//! 1000 ..      deprioritized groups (see PriorityRequestQueue::deprioritize_group)
//! ```
//!
//! Within a band, cheap aggregates come first so coarse signal appears before
//! histograms and time series.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rank of a queued request; lower dispatches sooner
pub type Rank = u32;

/// First rank of the active-column band
pub const ACTIVE_BAND: Rank = 0;

/// First rank of the background band
pub const BACKGROUND_BAND: Rank = 100;

/// First rank of the deprioritized band
pub const DEPRIORITIZED_FLOOR: Rank = 1000;

/// Profiling statistics a column widget can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnQuery {
    /// Row count of the whole table
    TableCardinality,
    /// Number of nulls in the column
    NullCount,
    /// Count of distinct values
    Cardinality,
    /// Most frequent values
    TopK,
    /// Min, max, mean, quantiles
    DescriptiveStatistics,
    /// Min/max of a timestamp column
    TimeRangeSummary,
    /// Finest time grain present in a timestamp column
    SmallestTimeGrain,
    /// Bucketed value distribution
    NumericHistogram,
    /// Fine-grained distribution used for rug plots
    RugHistogram,
    /// Column aggregated over time
    TimeSeries,
}

impl ColumnQuery {
    /// Every query type, cheapest first
    pub const ALL: [ColumnQuery; 10] = [
        ColumnQuery::TableCardinality,
        ColumnQuery::NullCount,
        ColumnQuery::Cardinality,
        ColumnQuery::TopK,
        ColumnQuery::DescriptiveStatistics,
        ColumnQuery::TimeRangeSummary,
        ColumnQuery::SmallestTimeGrain,
        ColumnQuery::NumericHistogram,
        ColumnQuery::RugHistogram,
        ColumnQuery::TimeSeries,
    ];

    /// Position of this query inside a band
    pub fn cost(self) -> Rank {
        match self {
            ColumnQuery::TableCardinality => 0,
            ColumnQuery::NullCount => 1,
            ColumnQuery::Cardinality => 1,
            ColumnQuery::TopK => 3,
            ColumnQuery::DescriptiveStatistics => 4,
            ColumnQuery::TimeRangeSummary => 4,
            ColumnQuery::SmallestTimeGrain => 5,
            ColumnQuery::NumericHistogram => 6,
            ColumnQuery::RugHistogram => 7,
            ColumnQuery::TimeSeries => 8,
        }
    }

    /// Wire name, also used as the response key inside a batch
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnQuery::TableCardinality => "table_cardinality",
            ColumnQuery::NullCount => "null_count",
            ColumnQuery::Cardinality => "cardinality",
            ColumnQuery::TopK => "top_k",
            ColumnQuery::DescriptiveStatistics => "descriptive_statistics",
            ColumnQuery::TimeRangeSummary => "time_range_summary",
            ColumnQuery::SmallestTimeGrain => "smallest_time_grain",
            ColumnQuery::NumericHistogram => "numeric_histogram",
            ColumnQuery::RugHistogram => "rug_histogram",
            ColumnQuery::TimeSeries => "time_series",
        }
    }
}

impl fmt::Display for ColumnQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ColumnQuery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColumnQuery::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown column query '{}'", s))
    }
}

/// Rank for a query about a column.
///
/// Every query on the active column outranks every background query.
pub fn priority_of(query: ColumnQuery, is_active_column: bool) -> Rank {
    let band = if is_active_column {
        ACTIVE_BAND
    } else {
        BACKGROUND_BAND
    };
    band + query.cost()
}
