//! Runtime job model
//!
//! A `SyncPair` is one configured replication unit after the config
//! binder has resolved endpoints, destinations, and the sync-table
//! location. `Job` wraps a pair with the per-job mutex: exactly one run
//! of a job is in flight at any moment, and the pair's mutable state
//! (resume values, nested sub-jobs) is only touched while the lock is
//! held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::dialect::DatabaseType;
use crate::error::{Error, Result};

/// A resolved database endpoint: dialect plus connection string.
///
/// Connection strings are interned by the config binder, so identical
/// endpoints across jobs share one record.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Database dialect
    pub db_type: DatabaseType,
    /// Connection string in the dialect's native format
    pub conn: Arc<str>,
}

/// Binding between a source column, a source-procedure parameter, and
/// the resume value flowing between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnParam {
    /// Result column whose maximum value advances the resume value
    pub column: String,
    /// Procedure parameter that receives the current resume value
    pub param: String,
    /// Current resume value
    pub value: i64,
    /// Bind as an 8-byte big-endian buffer (mssql rowversion)
    pub big_end: bool,
    /// Output parameter: the post-call value supplies the next resume value
    pub output: bool,
}

/// Destination procedure, optionally annotated with a table type
/// (`"dbo.Ingest @dbo.RowTT"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestProc {
    /// Procedure name
    pub name: String,
    /// Table type for batch dispatch (mssql only)
    pub table_type: Option<String>,
}

impl DestProc {
    /// Parse a `Dest` entry of the form `<name>` or `<name> @<TypeName>`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::config("empty destination procedure"));
        }
        match spec.split_once(" @") {
            Some((name, table_type)) => {
                let (name, table_type) = (name.trim(), table_type.trim());
                if name.is_empty() || table_type.is_empty() {
                    return Err(Error::config(format!("invalid destination '{spec}'")));
                }
                Ok(Self {
                    name: name.to_string(),
                    table_type: Some(table_type.to_string()),
                })
            }
            None => Ok(Self {
                name: spec.to_string(),
                table_type: None,
            }),
        }
    }
}

/// Conditional per-row trigger of nested jobs.
#[derive(Debug, Clone)]
pub struct RowProc {
    /// JSONPath predicate body; empty matches every row
    pub condition: String,
    /// Nested jobs run for each matching row
    pub jobs: Vec<SyncPair>,
}

/// Which side of the pair hosts the sync-state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    /// Table lives on the source database
    Source,
    /// Table lives on the target database
    Target,
}

/// One configured replication unit with its runtime state.
#[derive(Debug, Clone)]
pub struct SyncPair {
    /// Source endpoint
    pub source: Endpoint,
    /// Target endpoint
    pub target: Endpoint,
    /// Source procedure name
    pub origin: String,
    /// Destination procedures, one per expected result set
    pub dest: Vec<DestProc>,
    /// Resume-value bindings, in declaration order
    pub column_params: Vec<ColumnParam>,
    /// Source name → destination name field mapping
    pub mapping: BTreeMap<String, String>,
    /// Per-row triggers; non-empty switches the run to streaming dispatch
    pub row_procs: Vec<RowProc>,
    /// Sync-state table name
    pub sync_table: String,
    /// Side hosting the sync-state table
    pub sync_side: SyncSide,
}

impl SyncPair {
    /// Endpoint hosting the sync-state table.
    pub fn sync_endpoint(&self) -> &Endpoint {
        match self.sync_side {
            SyncSide::Source => &self.source,
            SyncSide::Target => &self.target,
        }
    }
}

/// A scheduled job: the pair guarded by its run mutex, plus the fields
/// the scheduler and log output need without taking the lock.
#[derive(Debug)]
pub struct Job {
    /// Origin procedure name (for scheduling and log output)
    pub origin: String,
    /// Tick period
    pub period: Duration,
    /// The replication unit; lock held for the whole run
    pub pair: Mutex<SyncPair>,
}

impl Job {
    /// Wrap a pair for scheduling.
    pub fn new(pair: SyncPair, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            origin: pair.origin.clone(),
            period,
            pair: Mutex::new(pair),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_proc_plain() {
        let d = DestProc::parse("dst.ingest").unwrap();
        assert_eq!(d.name, "dst.ingest");
        assert_eq!(d.table_type, None);
    }

    #[test]
    fn test_dest_proc_with_table_type() {
        let d = DestProc::parse("dbo.Ingest @dbo.RowTT").unwrap();
        assert_eq!(d.name, "dbo.Ingest");
        assert_eq!(d.table_type.as_deref(), Some("dbo.RowTT"));
    }

    #[test]
    fn test_dest_proc_invalid() {
        assert!(DestProc::parse("").is_err());
        assert!(DestProc::parse("dbo.Ingest @").is_err());
    }
}
