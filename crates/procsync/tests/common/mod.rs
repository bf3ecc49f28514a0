#![allow(dead_code)]

//! Scripted in-memory connections for engine tests.
//!
//! `MockConn` answers sync-table reads from a fixed row list, pops
//! scripted result sets for everything else, and records every
//! statement it sees. `MockFactory` hands out fresh mock connections
//! per run for scheduler-level tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use procsync::dialect::{ConnectionFactory, DatabaseType, ResultSet, SqlConn};
use procsync::error::{Error, Result};
use procsync::job::{ColumnParam, DestProc, Endpoint, RowProc, SyncPair, SyncSide};
use procsync::types::Value;

/// One recorded statement
#[derive(Debug, Clone)]
pub struct Call {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Tracks how many calls are in flight at once
#[derive(Debug, Default)]
pub struct Gate {
    active: AtomicI64,
    max_seen: AtomicI64,
}

impl Gate {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> i64 {
        self.max_seen.load(Ordering::SeqCst)
    }
}

pub struct MockConn {
    db_type: DatabaseType,
    script: VecDeque<Vec<ResultSet>>,
    rv_rows: Vec<(String, i64)>,
    log: Arc<Mutex<Vec<Call>>>,
    delay: Option<Duration>,
    gate: Option<Arc<Gate>>,
}

impl MockConn {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            script: VecDeque::new(),
            rv_rows: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            gate: None,
        }
    }

    /// Queue a response for the next non-sync-table query
    pub fn push_response(&mut self, sets: Vec<ResultSet>) {
        self.script.push_back(sets);
    }

    /// Seed a persisted sync-table row
    pub fn with_rv_row(mut self, param: &str, value: i64) -> Self {
        self.rv_rows.push((param.to_string(), value));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_log(mut self, log: Arc<Mutex<Vec<Call>>>) -> Self {
        self.log = log;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn sqls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.sql).collect()
    }

    fn rv_result(&self) -> Vec<ResultSet> {
        vec![ResultSet {
            columns: vec!["param".into(), "value".into()],
            rows: self
                .rv_rows
                .iter()
                .map(|(p, v)| vec![Value::String(p.clone()), Value::Int64(*v)])
                .collect(),
        }]
    }

    async fn observe(&mut self, sql: &str, params: &[Value]) {
        if let Some(gate) = &self.gate {
            gate.enter();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().unwrap().push(Call {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if let Some(gate) = &self.gate {
            gate.exit();
        }
    }
}

#[async_trait]
impl SqlConn for MockConn {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultSet>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.observe(sql, params).await;
        if sql.starts_with("select param, value from") {
            return Ok(self.rv_result());
        }
        Ok(self.script.pop_front().unwrap_or_default())
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.observe(sql, params).await;
        Ok(1)
    }
}

/// Factory that builds one mock per connect, all sharing a log and gate
pub struct MockFactory {
    pub db_type: DatabaseType,
    pub source_response: Vec<ResultSet>,
    pub log: Arc<Mutex<Vec<Call>>>,
    pub gate: Arc<Gate>,
    pub delay: Duration,
}

impl MockFactory {
    pub fn new(db_type: DatabaseType, source_response: Vec<ResultSet>, delay: Duration) -> Self {
        Self {
            db_type,
            source_response,
            log: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Gate::default()),
            delay,
        }
    }

    pub fn source_calls(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.sql.starts_with("select * from"))
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        db_type: DatabaseType,
        _conn_string: &str,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn SqlConn>> {
        let mut conn = MockConn::new(db_type)
            .with_log(self.log.clone())
            .with_gate(self.gate.clone())
            .with_delay(self.delay);
        conn.push_response(self.source_response.clone());
        Ok(Box::new(conn))
    }
}

pub fn endpoint(db_type: DatabaseType, host: &str) -> Endpoint {
    Endpoint {
        db_type,
        conn: Arc::from(format!("host={host}")),
    }
}

pub fn column_param(column: &str, param: &str, value: i64) -> ColumnParam {
    ColumnParam {
        column: column.to_string(),
        param: param.to_string(),
        value,
        big_end: false,
        output: false,
    }
}

/// Minimal pair fixture; tweak fields per scenario
pub fn pair(db_type: DatabaseType, origin: &str, dest: &[&str]) -> SyncPair {
    SyncPair {
        source: endpoint(db_type, "src"),
        target: endpoint(db_type, "dst"),
        origin: origin.to_string(),
        dest: dest.iter().map(|d| DestProc::parse(d).unwrap()).collect(),
        column_params: Vec::new(),
        mapping: Default::default(),
        row_procs: Vec::new(),
        sync_table: "sync.sqlsync".to_string(),
        sync_side: SyncSide::Target,
    }
}

pub fn row_proc(condition: &str, jobs: Vec<SyncPair>) -> RowProc {
    RowProc {
        condition: condition.to_string(),
        jobs,
    }
}

pub fn result_set(columns: &[&str], rows: Vec<Vec<Value>>) -> ResultSet {
    ResultSet {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
    }
}
