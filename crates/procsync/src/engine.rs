//! Sync engine
//!
//! Drives one job run: take the job's lock, open per-run connections,
//! call the origin procedure, walk its result sets, dispatch mapped rows
//! to the destination procedures, and advance the persisted resume
//! values.
//!
//! Dispatch mode is decided by the job: any RowProc switches the run to
//! streaming (one destination call and one RV persistence per row, with
//! nested sub-jobs triggered per matching row); otherwise rows are
//! accumulated and dispatched once per result set.

use std::future::Future;
use std::pin::Pin;

use serde_json_path::JsonPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dialect::{self, mssql, ConnectionFactory, DatabaseType, SqlConn};
use crate::error::{Error, Result};
use crate::job::{ColumnParam, DestProc, Job, SyncPair, SyncSide};
use crate::mapper::{MappedRow, OwnedRow, RowMapper};
use crate::rvstore;
use crate::types::{rows_to_json, Value};

/// Load a job's persisted resume values (startup Init).
pub async fn init(
    pair: &mut SyncPair,
    factory: &dyn ConnectionFactory,
    cancel: &CancellationToken,
) -> Result<()> {
    let endpoint = pair.sync_endpoint().clone();
    let mut conn = factory
        .connect(endpoint.db_type, &endpoint.conn, cancel)
        .await?;
    rvstore::load(
        conn.as_mut(),
        &pair.sync_table,
        &pair.origin,
        &mut pair.column_params,
        cancel,
    )
    .await
}

/// Run one job: exclusive per-job lock, per-run connections, one full
/// pass over the origin's result sets. Errors abort the run and are
/// reported prefixed with the origin; the next tick is the retry.
pub async fn run(
    job: &Job,
    factory: &dyn ConnectionFactory,
    cancel: &CancellationToken,
    quiet: bool,
) -> Result<()> {
    let mut pair = job.pair.lock().await;

    let result = async {
        let mut src = factory
            .connect(pair.source.db_type, &pair.source.conn, cancel)
            .await?;
        let mut dst = factory
            .connect(pair.target.db_type, &pair.target.conn, cancel)
            .await?;
        run_pair(src.as_mut(), dst.as_mut(), &mut pair, cancel, quiet).await
    }
    .await;

    if let Err(e) = &result {
        if e.is_cancelled() {
            debug!(origin = %job.origin, "run cancelled");
        } else {
            error!("{}: {}", job.origin, e);
        }
    }
    result
}

/// Run a pair over already-open connections. Callers must hold the
/// job's lock (or otherwise guarantee exclusive access to the pair).
pub async fn run_pair(
    src: &mut dyn SqlConn,
    dst: &mut dyn SqlConn,
    pair: &mut SyncPair,
    cancel: &CancellationToken,
    quiet: bool,
) -> Result<()> {
    do_sync(src, dst, pair, cancel, 0, quiet).await
}

fn format_params(params: &[ColumnParam]) -> String {
    params
        .iter()
        .map(|p| format!("@{}={}", p.param, p.value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn do_sync<'a>(
    src: &'a mut dyn SqlConn,
    dst: &'a mut dyn SqlConn,
    pair: &'a mut SyncPair,
    cancel: &'a CancellationToken,
    depth: usize,
    quiet: bool,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        debug!(
            origin = %pair.origin,
            depth,
            params = %format_params(&pair.column_params),
            "calling source procedure"
        );

        let (sets, outs) =
            dialect::call_source(src, &pair.origin, &pair.column_params, cancel).await?;

        // working vector; committed back over the pair only when the
        // whole run succeeds
        let mut pv = pair.column_params.clone();
        let origin = pair.origin.clone();
        let streaming = !pair.row_procs.is_empty();

        for (recordset, set) in sets.iter().enumerate() {
            let mapper = RowMapper::new(&set.columns, &pair.mapping, &pv);
            let mut heap: Vec<OwnedRow> = Vec::new();
            let mut nrows = 0usize;

            for values in &set.rows {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                nrows += 1;

                for cp in pv.iter_mut() {
                    let nv = mapper.int64_by_name(values, &cp.column);
                    if nv > cp.value {
                        cp.value = nv;
                    }
                }

                if streaming {
                    let view = mapper.row_view(values);
                    store_data(dst, &origin, &pair.dest, recordset, &[view], cancel).await?;

                    for p in 0..pair.row_procs.len() {
                        if !pair.row_procs[p].condition.is_empty() {
                            let row_json = serde_json::to_value(mapper.row_view(values))?;
                            if !condition_matches(&pair.row_procs[p].condition, &row_json)? {
                                continue;
                            }
                        }
                        for s in 0..pair.row_procs[p].jobs.len() {
                            {
                                let sub = &mut pair.row_procs[p].jobs[s];
                                for cp in sub.column_params.iter_mut() {
                                    cp.value = mapper.int64_by_name(values, &cp.column);
                                }
                            }
                            do_sync(
                                &mut *src,
                                &mut *dst,
                                &mut pair.row_procs[p].jobs[s],
                                cancel,
                                depth + 1,
                                quiet,
                            )
                            .await?;
                        }
                    }

                    store_rv(&mut *src, &mut *dst, pair, &pv, cancel).await?;
                } else {
                    heap.push(mapper.copy_row(values));
                }
            }

            for (i, cp) in pv.iter_mut().enumerate() {
                if cp.output && cp.value < outs[i] {
                    cp.value = outs[i];
                }
            }

            if !heap.is_empty() {
                store_data(dst, &origin, &pair.dest, recordset, &heap, cancel).await?;
            }

            store_rv(&mut *src, &mut *dst, pair, &pv, cancel).await?;

            if quiet {
                debug!(origin = %origin, depth, recordset, rows = nrows, "result set processed");
            } else {
                info!(origin = %origin, depth, recordset, rows = nrows, "result set processed");
            }
        }

        // a source call can produce output values without any result
        // set at all; they still advance the resume values
        if sets.is_empty() {
            for (i, cp) in pv.iter_mut().enumerate() {
                if cp.output && cp.value < outs[i] {
                    cp.value = outs[i];
                }
            }
            store_rv(&mut *src, &mut *dst, pair, &pv, cancel).await?;
        }

        for (cp, advanced) in pair.column_params.iter_mut().zip(&pv) {
            cp.value = advanced.value;
        }
        Ok(())
    })
}

/// Dispatch one result set's rows (or one streamed row) to the
/// destination procedure for that result-set index. Extra result sets
/// with no configured destination are dropped with a warning.
async fn store_data<R: MappedRow + Sync>(
    dst: &mut dyn SqlConn,
    origin: &str,
    dest: &[DestProc],
    recordset: usize,
    rows: &[R],
    cancel: &CancellationToken,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let Some(d) = dest.get(recordset) else {
        warn!(
            origin,
            recordset, "not enough Dest procedures, dropping extra result set"
        );
        return Ok(());
    };

    let result = match dst.database_type() {
        DatabaseType::Postgres => {
            let json = rows_to_json(rows)?;
            let sql = format!("select * from {}($1)", d.name);
            dst.query(&sql, &[Value::Json(json)], cancel).await
        }
        DatabaseType::SqlServer => {
            let sql = mssql::build_target_statement(d, rows);
            dst.query(&sql, &[], cancel).await
        }
    };

    result
        .map(|_| ())
        .map_err(|e| annotate_target_error(&d.name, e))
}

fn annotate_target_error(proc: &str, e: Error) -> Error {
    if e.is_cancelled() {
        return e;
    }
    let msg = e.to_string();
    if msg.contains("does not exist") || msg.contains("Could not find") {
        return Error::query(format!("{proc}: destination proc probably missing ({msg})"));
    }
    e
}

async fn store_rv(
    src: &mut dyn SqlConn,
    dst: &mut dyn SqlConn,
    pair: &SyncPair,
    pv: &[ColumnParam],
    cancel: &CancellationToken,
) -> Result<()> {
    let conn: &mut dyn SqlConn = match pair.sync_side {
        SyncSide::Source => src,
        SyncSide::Target => dst,
    };
    rvstore::save(
        conn,
        &pair.sync_table,
        &pair.origin,
        &pair.column_params,
        pv,
        cancel,
    )
    .await
}

/// Evaluate a RowProc condition against one row.
///
/// The condition body is wrapped as `$[?(<cond>)]` and applied to a
/// one-element array holding the row; a non-empty result means the row
/// matches.
pub fn condition_matches(condition: &str, row: &serde_json::Value) -> Result<bool> {
    let expr = format!("$[?({condition})]");
    let path = JsonPath::parse(&expr)
        .map_err(|e| Error::json(format!("invalid condition '{condition}': {e}")))?;
    let wrapped = serde_json::Value::Array(vec![row.clone()]);
    Ok(!path.query(&wrapped).is_empty())
}
