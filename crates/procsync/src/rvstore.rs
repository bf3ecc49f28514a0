//! Resume-value store
//!
//! Reads and writes the external sync-state table
//! `(tbl varchar, param varchar, value bigint)`. `load` runs once at
//! startup; `save` runs during each sync (per row in streaming mode,
//! per result set otherwise). Writes are individual statements with no
//! surrounding transaction; the per-job mutex makes concurrent writers
//! to the same (tbl, param) row impossible.

use std::collections::{BTreeMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::dialect::{DatabaseType, SqlConn};
use crate::error::Result;
use crate::job::ColumnParam;
use crate::mapper::RowMapper;
use crate::types::Value;

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn placeholder(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::Postgres => "$1",
        DatabaseType::SqlServer => "@P1",
    }
}

fn select_subset_sql(sync_table: &str, origin: &str, params: &[ColumnParam]) -> String {
    let names: Vec<String> = params.iter().map(|p| quote_literal(&p.param)).collect();
    format!(
        "select param, value from {} where tbl = {} and param in ({})",
        sync_table,
        quote_literal(origin),
        names.join(",")
    )
}

fn update_sql(sync_table: &str, origin: &str, param: &ColumnParam) -> String {
    format!(
        "update {} set value = {} where tbl = {} and param = {}",
        sync_table,
        param.value,
        quote_literal(origin),
        quote_literal(&param.param)
    )
}

fn insert_sql(sync_table: &str, origin: &str, param: &ColumnParam) -> String {
    format!(
        "insert into {} (tbl, param, value) values ({}, {}, {})",
        sync_table,
        quote_literal(origin),
        quote_literal(&param.param),
        param.value
    )
}

/// Load persisted resume values for a job's parameters.
///
/// Rows whose `param` matches a configured ColumnParam overwrite that
/// parameter's in-memory value; everything else is ignored.
pub async fn load(
    conn: &mut dyn SqlConn,
    sync_table: &str,
    origin: &str,
    params: &mut [ColumnParam],
    cancel: &CancellationToken,
) -> Result<()> {
    let sql = format!(
        "select param, value from {} where tbl = {}",
        sync_table,
        placeholder(conn.database_type())
    );
    let sets = conn
        .query(&sql, &[Value::String(origin.to_string())], cancel)
        .await?;

    let Some(set) = sets.first() else {
        return Ok(());
    };
    let mapper = RowMapper::new(&set.columns, &BTreeMap::new(), &[]);

    for row in &set.rows {
        let db_param = mapper.string_by_name(row, "param");
        for p in params.iter_mut() {
            if p.param == db_param {
                p.value = mapper.int64_by_name(row, "value");
            }
        }
    }
    Ok(())
}

/// Persist advanced resume values.
///
/// Does nothing when `current` matches the persisted view. Otherwise
/// re-reads the job's subset of the sync table, updates rows that exist
/// and inserts the ones that do not.
pub async fn save(
    conn: &mut dyn SqlConn,
    sync_table: &str,
    origin: &str,
    persisted: &[ColumnParam],
    current: &[ColumnParam],
    cancel: &CancellationToken,
) -> Result<()> {
    let changed = current
        .iter()
        .zip(persisted)
        .any(|(n, o)| n.value != o.value);
    if !changed || current.is_empty() {
        return Ok(());
    }

    let sql = select_subset_sql(sync_table, origin, current);
    let sets = conn.query(&sql, &[], cancel).await?;

    let mut saved: HashSet<&str> = HashSet::new();
    if let Some(set) = sets.first() {
        let mapper = RowMapper::new(&set.columns, &BTreeMap::new(), &[]);
        for row in &set.rows {
            let db_param = mapper.string_by_name(row, "param");
            for p in current {
                if p.param == db_param {
                    conn.execute(&update_sql(sync_table, origin, p), &[], cancel)
                        .await?;
                    saved.insert(p.param.as_str());
                }
            }
        }
    }

    for p in current {
        if saved.contains(p.param.as_str()) {
            continue;
        }
        conn.execute(&insert_sql(sync_table, origin, p), &[], cancel)
            .await?;
    }

    Ok(())
}
