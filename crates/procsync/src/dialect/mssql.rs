//! SQL Server backend
//!
//! Values are bound as typed TDS parameters, never interpolated into
//! statement text. Result sets are materialized per result-set
//! granularity while draining the query stream, which preserves column
//! metadata for empty sets.
//!
//! Target dispatch is the one place literals do go into SQL text: the
//! table-type batch and the per-row EXEC form are wire formats consumed
//! by the destination procedures, built from [`sql_literal`].

use std::borrow::Cow;

use futures::stream::TryStreamExt;
use tiberius::{AuthMethod, Client, Config, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;

use crate::dialect::{DatabaseType, ResultSet, SqlConn};
use crate::error::{Error, Result};
use crate::job::DestProc;
use crate::mapper::MappedRow;
use crate::types::Value;

use async_trait::async_trait;

/// SQL Server connection
pub struct MssqlConn {
    client: Client<Compat<TcpStream>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ConnParams {
    server: String,
    failover: Option<String>,
    database: Option<String>,
    port: u16,
    user: String,
    password: String,
}

/// Parse the `server=…; failoverpartner=…; database=…; port=…;
/// user id=…; password=…` connection-string form.
fn parse_conn_string(conn_string: &str) -> Result<ConnParams> {
    let mut params = ConnParams {
        port: 1433,
        ..Default::default()
    };

    for part in conn_string.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::config(format!("malformed connection string near '{part}'")))?;
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "server" => params.server = value.to_string(),
            "failoverpartner" => params.failover = Some(value.to_string()),
            "database" => params.database = Some(value.to_string()),
            "port" => {
                params.port = value
                    .parse()
                    .map_err(|_| Error::config(format!("invalid port '{value}'")))?
            }
            "user id" => params.user = value.to_string(),
            "password" => params.password = value.to_string(),
            _ => {}
        }
    }

    if params.server.is_empty() {
        return Err(Error::config("connection string is missing server"));
    }
    Ok(params)
}

fn tiberius_config(params: &ConnParams, host: &str) -> Config {
    let mut config = Config::new();
    config.host(host);
    config.port(params.port);
    if let Some(db) = &params.database {
        config.database(db);
    }
    config.authentication(AuthMethod::sql_server(&params.user, &params.password));
    config.trust_cert();
    config
}

async fn connect_host(params: &ConnParams, host: &str) -> Result<MssqlConn> {
    let config = tiberius_config(params, host);

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| Error::connect_with_source(format!("tcp connect to {host} failed"), e))?;
    tcp.set_nodelay(true).ok();

    let client = Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| Error::connect_with_source(format!("mssql handshake with {host} failed"), e))?;

    Ok(MssqlConn { client })
}

/// Connect, trying the failover partner when the primary is unreachable.
pub async fn connect(conn_string: &str, cancel: &CancellationToken) -> Result<MssqlConn> {
    let params = parse_conn_string(conn_string)?;

    let attempt = async {
        match connect_host(&params, &params.server).await {
            Ok(conn) => Ok(conn),
            Err(primary_err) => match &params.failover {
                Some(failover) => {
                    tracing::warn!(
                        server = %params.server,
                        failover = %failover,
                        "primary unreachable ({}), trying failover partner",
                        primary_err
                    );
                    connect_host(&params, failover).await
                }
                None => Err(primary_err),
            },
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = attempt => res,
    }
}

/// Owned parameter wrapper for typed tiberius binding
struct SqlParam(Value);

impl tiberius::ToSql for SqlParam {
    fn to_sql(&self) -> tiberius::ColumnData<'_> {
        use tiberius::ColumnData;

        match &self.0 {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int16(n) => ColumnData::I16(Some(*n)),
            Value::Int32(n) => ColumnData::I32(Some(*n)),
            Value::Int64(n) => ColumnData::I64(Some(*n)),
            Value::Float32(n) => ColumnData::F32(Some(*n)),
            Value::Float64(n) => ColumnData::F64(Some(*n)),
            Value::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            Value::Uuid(u) => ColumnData::Guid(Some(*u)),
            Value::Date(d) => ColumnData::String(Some(Cow::Owned(d.format("%Y-%m-%d").to_string()))),
            Value::Time(t) => {
                ColumnData::String(Some(Cow::Owned(t.format("%H:%M:%S%.f").to_string())))
            }
            Value::DateTime(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ))),
            Value::DateTimeTz(dt) => ColumnData::String(Some(Cow::Owned(dt.to_rfc3339()))),
            Value::Json(j) => ColumnData::String(Some(Cow::Owned(j.to_string()))),
        }
    }
}

/// Convert one tiberius row to values, probing typed columns before raw
/// bytes so BIT and rowversion columns land in the right variant.
fn row_to_values(row: &tiberius::Row) -> Vec<Value> {
    (0..row.columns().len()).map(|i| cell_value(row, i)).collect()
}

fn cell_value(row: &tiberius::Row, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::Int16(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::Int32(v);
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::Int64(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::Float32(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::Float64(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return Value::Uuid(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return Value::DateTime(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
        return Value::Date(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveTime, _>(idx) {
        return Value::Time(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
        return Value::DateTimeTz(v);
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
        return Value::Bytes(v.to_vec());
    }
    Value::Null
}

fn map_tib_error(e: tiberius::error::Error, sql: &str) -> Error {
    Error::query_with_sql(e.to_string(), sql)
}

impl MssqlConn {
    async fn run_query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<ResultSet>> {
        let tib_params: Vec<SqlParam> = params.iter().cloned().map(SqlParam).collect();
        let refs: Vec<&dyn tiberius::ToSql> = tib_params
            .iter()
            .map(|p| p as &dyn tiberius::ToSql)
            .collect();

        let mut stream = self
            .client
            .query(sql, &refs)
            .await
            .map_err(|e| map_tib_error(e, sql))?;

        let mut sets: Vec<ResultSet> = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(|e| map_tib_error(e, sql))? {
            match item {
                QueryItem::Metadata(meta) => sets.push(ResultSet {
                    columns: meta.columns().iter().map(|c| c.name().to_string()).collect(),
                    rows: Vec::new(),
                }),
                QueryItem::Row(row) => {
                    let values = row_to_values(&row);
                    match sets.last_mut() {
                        Some(set) => set.rows.push(values),
                        None => sets.push(ResultSet {
                            columns: row.columns().iter().map(|c| c.name().to_string()).collect(),
                            rows: vec![values],
                        }),
                    }
                }
            }
        }
        Ok(sets)
    }

    async fn run_execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let tib_params: Vec<SqlParam> = params.iter().cloned().map(SqlParam).collect();
        let refs: Vec<&dyn tiberius::ToSql> = tib_params
            .iter()
            .map(|p| p as &dyn tiberius::ToSql)
            .collect();

        let result = self
            .client
            .execute(sql, &refs)
            .await
            .map_err(|e| map_tib_error(e, sql))?;
        Ok(result.total())
    }
}

#[async_trait]
impl SqlConn for MssqlConn {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
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
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.run_execute(sql, params) => res,
        }
    }
}

/// Encode a value as an in-SQL literal for target dispatch.
///
/// Integers and floats render as decimal text, strings single-quoted
/// with `'` doubled, booleans as 1/0, timestamps as
/// `'YYYY-MM-DD HH:MM:SS'`, NULL as `null`, and binary as a `0x…`
/// varbinary literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int16(n) => n.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Float32(n) => n.to_string(),
        Value::Float64(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        Value::Bytes(b) => {
            let mut lit = String::with_capacity(2 + b.len() * 2);
            lit.push_str("0x");
            for byte in b {
                lit.push_str(&format!("{byte:02X}"));
            }
            lit
        }
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Time(t) => format!("'{}'", t.format("%H:%M:%S")),
        Value::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S")),
        Value::DateTimeTz(dt) => format!("'{}'", dt.naive_utc().format("%Y-%m-%d %H:%M:%S")),
        Value::Uuid(u) => format!("'{u}'"),
        Value::Json(j) => quote_str(&j.to_string()),
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Build the target statement for one result set's rows.
///
/// With a table-type annotation the rows go through a declared table
/// variable in a single batch; without one, each row becomes its own
/// `EXEC dest @col=value, …;` line. Column order is the mapper's field
/// order, taken from the first row.
pub fn build_target_statement<R: MappedRow>(dest: &DestProc, rows: &[R]) -> String {
    let fields = match rows.first() {
        Some(first) => first.fields(),
        None => return String::new(),
    };

    match &dest.table_type {
        Some(table_type) => {
            let cols = fields
                .iter()
                .map(|(name, _)| format!("[{name}]"))
                .collect::<Vec<_>>()
                .join(", ");

            let values = rows
                .iter()
                .map(|row| {
                    let vals = row
                        .fields()
                        .iter()
                        .map(|(_, v)| sql_literal(v))
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("({vals})")
                })
                .collect::<Vec<_>>()
                .join(",\n");

            format!(
                "DECLARE @tbl AS {table_type}\nINSERT INTO @tbl ({cols})\nSELECT * FROM ( VALUES\n{values}\n) t ({cols});\nEXEC {} @tbl;",
                dest.name
            )
        }
        None => {
            let mut statement = String::new();
            for row in rows {
                let args = row
                    .fields()
                    .iter()
                    .map(|(name, v)| format!("@{name}={}", sql_literal(v)))
                    .collect::<Vec<_>>()
                    .join(", ");
                statement.push_str(&format!("EXEC {} {args};\n", dest.name));
            }
            statement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_conn_string() {
        let p = parse_conn_string(
            "server=db1; failoverpartner=db2; database=orders; port=1533; user id=app; password=s3cr;et",
        );
        // a ';' inside the password splits the pair; the remainder has no '='
        assert!(p.is_err());

        let p = parse_conn_string(
            "server=db1; failoverpartner=db2; database=orders; port=1533; user id=app; password=s3cret",
        )
        .unwrap();
        assert_eq!(p.server, "db1");
        assert_eq!(p.failover.as_deref(), Some("db2"));
        assert_eq!(p.database.as_deref(), Some("orders"));
        assert_eq!(p.port, 1533);
        assert_eq!(p.user, "app");
        assert_eq!(p.password, "s3cret");
    }

    #[test]
    fn test_parse_conn_string_defaults() {
        let p = parse_conn_string("server=h; database=d; user id=u; password=p").unwrap();
        assert_eq!(p.port, 1433);
        assert_eq!(p.failover, None);
    }

    #[test]
    fn test_parse_conn_string_missing_server() {
        assert!(parse_conn_string("database=d; user id=u; password=p").is_err());
    }

    #[test]
    fn test_sql_literal_scalars() {
        assert_eq!(sql_literal(&Value::Int64(42)), "42");
        assert_eq!(sql_literal(&Value::Float64(1.5)), "1.5");
        assert_eq!(sql_literal(&Value::Bool(true)), "1");
        assert_eq!(sql_literal(&Value::Bool(false)), "0");
        assert_eq!(sql_literal(&Value::Null), "null");
    }

    #[test]
    fn test_sql_literal_string_quoting() {
        assert_eq!(
            sql_literal(&Value::String("it's".into())),
            "'it''s'"
        );
    }

    #[test]
    fn test_sql_literal_timestamp() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(13, 5, 9)
            .unwrap();
        assert_eq!(sql_literal(&Value::DateTime(dt)), "'2024-03-01 13:05:09'");
    }

    #[test]
    fn test_sql_literal_bytes() {
        assert_eq!(sql_literal(&Value::Bytes(vec![0xDE, 0xAD])), "0xDEAD");
    }
}
