//! PostgreSQL backend
//!
//! Statements are prepared before execution so column names are known
//! even when a call returns zero rows (the mapper needs the column list
//! regardless). A procedure call produces a single result set.

use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

use crate::dialect::{DatabaseType, ResultSet, SqlConn};
use crate::error::{Error, Result};
use crate::types::Value;

use async_trait::async_trait;

/// PostgreSQL connection
pub struct PgConn {
    client: tokio_postgres::Client,
}

/// Connect with a libpq-style connection string
/// (`host=… port=… dbname=… user=… password=… sslmode=disable`).
pub async fn connect(conn_string: &str, cancel: &CancellationToken) -> Result<PgConn> {
    let connect = tokio_postgres::connect(conn_string, NoTls);
    let (client, connection) = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        res = connect => res.map_err(|e| Error::connect_with_source("postgres connect failed", e))?,
    };

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("postgres connection closed: {}", e);
        }
    });

    Ok(PgConn { client })
}

/// Convert a procsync Value to a tokio-postgres parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
    }
}

/// Convert one column of a tokio-postgres row to a procsync Value
fn pg_value_to_value(
    row: &tokio_postgres::Row,
    idx: usize,
    pg_type: &tokio_postgres::types::Type,
) -> Value {
    use tokio_postgres::types::Type;

    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(Value::Int16)
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(Value::Int32)
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int64)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(Value::Float32)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float64)
            .unwrap_or(Value::Null),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTimeTz)
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.code() == Some(&SqlState::UNDEFINED_FUNCTION) {
        return Error::query_with_sql(format!("procedure does not exist: {e}"), sql);
    }
    Error::query_with_sql(e.to_string(), sql)
}

impl PgConn {
    async fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<ResultSet>> {
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let pg_rows = self
            .client
            .query(&stmt, &refs)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        let rows = pg_rows
            .iter()
            .map(|r| {
                r.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| pg_value_to_value(r, i, c.type_()))
                    .collect()
            })
            .collect();

        Ok(vec![ResultSet { columns, rows }])
    }
}

#[async_trait]
impl SqlConn for PgConn {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultSet>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.run_query(sql, params) => res,
        }
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.client.execute(sql, &refs) => res.map_err(|e| map_pg_error(e, sql)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_sql_covers_all_variants() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int64(1),
            Value::String("x".into()),
            Value::Bytes(vec![1]),
            Value::Json(serde_json::json!({"a": 1})),
        ];
        for v in &values {
            let _ = value_to_sql(v);
        }
    }
}
