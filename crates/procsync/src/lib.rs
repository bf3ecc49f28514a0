//! # procsync
//!
//! Incremental stored-procedure replication between SQL databases.
//!
//! procsync periodically calls a stored procedure on a source database
//! (PostgreSQL or SQL Server), maps every returned row into a
//! destination schema, and hands the rows to stored procedures on a
//! target database. Progress is carried by per-(job, parameter) resume
//! values persisted in an external sync-state table: each run passes the
//! last persisted value into the source procedure and advances it from
//! the rows it just saw.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ tick  ┌─────────┐ call ┌─────────┐ rows ┌─────────┐
//! │ Scheduler │──────▶│  Engine │─────▶│ Dialect │─────▶│  Mapper │
//! └───────────┘       └────┬────┘      │ Adapter │      └────┬────┘
//!                          │ persist   └─────────┘           │ dispatch
//!                     ┌────▼────┐                       ┌────▼────┐
//!                     │ RV store│                       │ target  │
//!                     └─────────┘                       │ proc(s) │
//!                                                       └─────────┘
//! ```
//!
//! Rows either batch into one destination call per result set, or — when
//! per-row triggers (`RowProc`) are configured — stream one call per row
//! with nested sub-jobs gated by JSONPath conditions.

pub mod config;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod job;
pub mod mapper;
pub mod rvstore;
pub mod scheduler;
pub mod types;

pub use error::{Error, Result};
pub use types::Value;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{bind_jobs, Settings};
    pub use crate::dialect::{
        ConnectionFactory, DatabaseType, DriverConnectionFactory, ResultSet, SqlConn,
    };
    pub use crate::engine;
    pub use crate::error::{Error, Result};
    pub use crate::job::{ColumnParam, DestProc, Job, SyncPair, SyncSide};
    pub use crate::scheduler::Scheduler;
    pub use crate::types::Value;
}
