//! Table profiling on top of the batched priority queue.
//!
//! A [`TableProfiler`] issues every statistic of a column as one batch, ranked
//! by whether that column is the one the user is looking at. All batches of a
//! table share the table name as their queue group, so leaving the table or
//! pushing it to the background affects them together.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use colprof_core::batcher::{BatchEntry, BatchQueue, RequestBatcher};
use colprof_core::priority::BACKGROUND_BAND;
use colprof_core::{priority_of, ColumnQuery, Rank, Ticket};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Broad column type, deciding which statistics are profiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    Timestamp,
}

impl ColumnKind {
    /// Statistics profiled for this kind of column
    pub fn queries(self) -> &'static [ColumnQuery] {
        match self {
            ColumnKind::Numeric => &[
                ColumnQuery::NullCount,
                ColumnQuery::Cardinality,
                ColumnQuery::DescriptiveStatistics,
                ColumnQuery::NumericHistogram,
                ColumnQuery::RugHistogram,
            ],
            ColumnKind::Categorical => &[
                ColumnQuery::NullCount,
                ColumnQuery::Cardinality,
                ColumnQuery::TopK,
            ],
            ColumnKind::Timestamp => &[
                ColumnQuery::NullCount,
                ColumnQuery::TimeRangeSummary,
                ColumnQuery::SmallestTimeGrain,
                ColumnQuery::TimeSeries,
            ],
        }
    }

    /// Rank of the column's batch, the most urgent of its statistics
    pub fn rank(self, is_active_column: bool) -> Rank {
        self.queries()
            .iter()
            .map(|query| priority_of(*query, is_active_column))
            .min()
            .unwrap_or(BACKGROUND_BAND)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Timestamp => "timestamp",
        };
        f.pad(name)
    }
}

impl FromStr for ColumnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "numeric" | "number" => Ok(ColumnKind::Numeric),
            "categorical" | "string" | "text" => Ok(ColumnKind::Categorical),
            "timestamp" | "time" => Ok(ColumnKind::Timestamp),
            other => Err(format!("unknown column kind '{}'", other)),
        }
    }
}

/// A column to profile, written `name` or `name:kind` on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl FromStr for ColumnSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, kind) = match s.split_once(':') {
            Some((name, kind)) => (name.trim(), kind.trim().parse()?),
            None => (s.trim(), ColumnKind::Categorical),
        };
        if name.is_empty() {
            return Err(format!("missing column name in '{}'", s));
        }
        Ok(Self::new(name, kind))
    }
}

/// Statistics gathered for one column
#[derive(Debug, Clone, Serialize)]
pub struct ColumnProfile {
    pub column: String,
    pub kind: ColumnKind,
    /// Query name to result
    pub stats: BTreeMap<String, Value>,
    /// Query name to error message
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
    /// Set when any statistic was cancelled before it arrived
    pub cancelled: bool,
}

/// Statistics gathered for a table
#[derive(Debug, Clone, Serialize)]
pub struct TableProfile {
    pub table: String,
    pub row_count: Option<Value>,
    pub columns: Vec<ColumnProfile>,
}

/// Profiles the columns of one table through a shared [`BatchQueue`]
pub struct TableProfiler {
    queue: BatchQueue,
    instance_id: String,
    table: String,
    columns: Vec<ColumnSpec>,
    active: Mutex<Option<String>>,
}

impl TableProfiler {
    pub fn new(
        queue: BatchQueue,
        instance_id: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnSpec>,
    ) -> Self {
        Self {
            queue,
            instance_id: instance_id.into(),
            table: table.into(),
            columns,
            active: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn active_column(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Focus `column`, re-ranking batches that are still queued.
    ///
    /// The previously active column drops back to the background band.
    /// Batches already in flight are unaffected.
    pub fn set_active_column(&self, column: Option<&str>) {
        let previous = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *active, column.map(str::to_string))
        };
        if previous.as_deref() == column {
            return;
        }

        debug!(table = %self.table, ?previous, ?column, "Active column changed");

        if let Some(spec) = previous.as_deref().and_then(|name| self.column(name)) {
            self.queue
                .set_sub_priority(&self.table, &spec.name, spec.kind.rank(false));
        }
        if let Some(spec) = column.and_then(|name| self.column(name)) {
            self.queue
                .set_sub_priority(&self.table, &spec.name, spec.kind.rank(true));
        }
    }

    /// Drop every queued or in-flight batch of this table
    pub fn leave(&self) {
        info!(table = %self.table, "Leaving table");
        self.queue.remove_by_group(&self.table);
    }

    /// Let other tables go first without dropping this one's work
    pub fn background(&self) {
        info!(table = %self.table, "Moving table to background");
        self.queue.deprioritize_group(&self.table);
    }

    fn entry(&self, query: ColumnQuery, column: Option<&str>, is_active: bool) -> BatchEntry {
        BatchEntry::new(json!({
            "type": query,
            "table": self.table,
            "column": column,
        }))
        .with_response_key(query.as_str())
        .with_priority(priority_of(query, is_active))
    }

    /// Profile the table and every column, one batch per column.
    ///
    /// Cancelled statistics are left out of the profile rather than reported
    /// as errors.
    pub async fn profile(&self) -> TableProfile {
        let active = self.active_column();
        info!(
            table = %self.table,
            columns = self.columns.len(),
            active = ?active,
            "Profiling table"
        );

        let table_batcher = RequestBatcher::new(self.queue.clone(), &self.table, &self.table);
        let row_count = table_batcher.fetch(self.entry(ColumnQuery::TableCardinality, None, false));

        let mut batchers = vec![table_batcher];
        let mut pending = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let is_active = active.as_deref() == Some(column.name.as_str());
            let batcher = RequestBatcher::new(
                self.queue.clone(),
                &self.table,
                format!("{}/{}", self.table, column.name),
            )
            .with_sub_key(&column.name);

            let tickets: Vec<_> = column
                .kind
                .queries()
                .iter()
                .map(|&query| {
                    let entry = self.entry(query, Some(&column.name), is_active);
                    (query, batcher.fetch(entry))
                })
                .collect();

            batchers.push(batcher);
            pending.push((column, tickets));
        }

        let sends = join_all(
            batchers
                .iter()
                .map(|batcher| batcher.send(self.instance_id.as_str())),
        );
        let gather = async {
            let row_count = match row_count.await {
                Ok(value) => value,
                Err(err) if err.is_cancelled() => None,
                Err(err) => {
                    warn!(table = %self.table, error = %err, "Row count failed");
                    None
                }
            };
            let columns = join_all(
                pending
                    .into_iter()
                    .map(|(column, tickets)| collect_column(column, tickets)),
            )
            .await;
            (row_count, columns)
        };

        let (_, (row_count, columns)) = tokio::join!(sends, gather);

        TableProfile {
            table: self.table.clone(),
            row_count,
            columns,
        }
    }
}

async fn collect_column(
    column: &ColumnSpec,
    tickets: Vec<(ColumnQuery, Ticket<Option<Value>>)>,
) -> ColumnProfile {
    let mut profile = ColumnProfile {
        column: column.name.clone(),
        kind: column.kind,
        stats: BTreeMap::new(),
        errors: BTreeMap::new(),
        cancelled: false,
    };

    for (query, ticket) in tickets {
        match ticket.await {
            Ok(Some(value)) => {
                profile.stats.insert(query.to_string(), value);
            }
            Ok(None) => debug!(column = %column.name, %query, "No result returned"),
            Err(err) if err.is_cancelled() => profile.cancelled = true,
            Err(err) => {
                profile.errors.insert(query.to_string(), err.to_string());
            }
        }
    }

    profile
}
