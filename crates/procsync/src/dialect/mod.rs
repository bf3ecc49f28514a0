//! Dialect adapter: per-dialect connections, statement construction,
//! and result-set fetching.
//!
//! The engine talks to databases exclusively through [`SqlConn`], which
//! returns fully materialized result sets. Both backends work in
//! result-set granularity anyway (tiberius processes the TDS stream that
//! way), and materializing keeps the source cursor usable while resume
//! values are written back over the same side's connection.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::ColumnParam;
use crate::types::Value;

pub mod mssql;
pub mod postgres;

/// Supported database dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// PostgreSQL
    Postgres,
    /// Microsoft SQL Server
    SqlServer,
}

impl std::str::FromStr for DatabaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "mssql" => Ok(Self::SqlServer),
            other => Err(Error::config(format!("unsupported type: {other}"))),
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::SqlServer => write!(f, "mssql"),
        }
    }
}

/// One materialized result set: column names plus row values in arrival
/// order.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Column names, in result order
    pub columns: Vec<String>,
    /// Rows; each row has one value per column
    pub rows: Vec<Vec<Value>>,
}

/// A connection to a database.
///
/// Every call takes the run's cancellation token; a cancelled token makes
/// in-flight calls return [`Error::Cancelled`].
#[async_trait]
pub trait SqlConn: Send {
    /// The dialect this connection speaks
    fn database_type(&self) -> DatabaseType;

    /// Execute a statement and collect every result set it produces
    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResultSet>>;

    /// Execute a statement that returns no rows
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// Factory for per-run connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to the given endpoint
    async fn connect(
        &self,
        db_type: DatabaseType,
        conn_string: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SqlConn>>;
}

/// Factory backed by the real database drivers
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverConnectionFactory;

#[async_trait]
impl ConnectionFactory for DriverConnectionFactory {
    async fn connect(
        &self,
        db_type: DatabaseType,
        conn_string: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SqlConn>> {
        match db_type {
            DatabaseType::Postgres => {
                let conn = postgres::connect(conn_string, cancel).await?;
                Ok(Box::new(conn))
            }
            DatabaseType::SqlServer => {
                let conn = mssql::connect(conn_string, cancel).await?;
                Ok(Box::new(conn))
            }
        }
    }
}

/// A built source-procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCall {
    /// Statement text (postgres: SELECT with inlined literals; mssql:
    /// EXEC batch with positional binds)
    pub statement: String,
    /// Bound parameter values, in bind order
    pub params: Vec<Value>,
    /// Indices into the job's ColumnParam list that are output
    /// parameters, in declaration order
    pub outputs: Vec<usize>,
}

/// Build the source call for a job's origin procedure.
///
/// postgres inlines the current resume values as decimal literals in
/// declaration order. mssql binds named parameters; tiberius only binds
/// positionally, so named/output parameters go through a small T-SQL
/// batch: locals are declared from the binds, passed as `@name = @oN
/// OUTPUT`, and a trailing SELECT returns the post-call values as one
/// extra result set (stripped off again by [`call_source`]).
pub fn build_source_call(
    db_type: DatabaseType,
    origin: &str,
    params: &[ColumnParam],
) -> SourceCall {
    match db_type {
        DatabaseType::Postgres => {
            let args: Vec<String> = params.iter().map(|p| p.value.to_string()).collect();
            SourceCall {
                statement: format!("select * from {}({})", origin, args.join(", ")),
                params: Vec::new(),
                outputs: Vec::new(),
            }
        }
        DatabaseType::SqlServer => {
            let mut decls = String::new();
            let mut args = Vec::with_capacity(params.len());
            let mut binds = Vec::new();
            let mut outputs = Vec::new();

            for (i, p) in params.iter().enumerate() {
                if p.output {
                    decls.push_str(&format!("DECLARE @o{} BIGINT = @P{};\n", i, binds.len() + 1));
                    binds.push(Value::Int64(p.value));
                    args.push(format!("@{} = @o{} OUTPUT", p.param, i));
                    outputs.push(i);
                } else {
                    let bind = if p.big_end {
                        Value::Bytes((p.value as u64).to_be_bytes().to_vec())
                    } else {
                        Value::Int64(p.value)
                    };
                    binds.push(bind);
                    args.push(format!("@{} = @P{}", p.param, binds.len()));
                }
            }

            let mut statement = decls;
            statement.push_str("EXEC ");
            statement.push_str(origin);
            if !args.is_empty() {
                statement.push(' ');
                statement.push_str(&args.join(", "));
            }
            statement.push(';');
            if !outputs.is_empty() {
                let selects: Vec<String> = outputs
                    .iter()
                    .map(|i| format!("@o{} AS [o{}]", i, i))
                    .collect();
                statement.push_str(&format!("\nSELECT {};", selects.join(", ")));
            }

            SourceCall {
                statement,
                params: binds,
                outputs,
            }
        }
    }
}

/// Issue the source call and split the reply into data result sets plus
/// post-call output-parameter values.
///
/// `outs` is seeded with the current resume values, so parameters without
/// an output slot (or an output the server never produced) keep their
/// pre-call value.
pub async fn call_source(
    conn: &mut dyn SqlConn,
    origin: &str,
    params: &[ColumnParam],
    cancel: &CancellationToken,
) -> Result<(Vec<ResultSet>, Vec<i64>)> {
    let call = build_source_call(conn.database_type(), origin, params);
    let mut sets = conn.query(&call.statement, &call.params, cancel).await?;

    let mut outs: Vec<i64> = params.iter().map(|p| p.value).collect();
    if !call.outputs.is_empty() {
        let out_set = sets
            .pop()
            .ok_or_else(|| Error::scan(format!("{origin}: output parameter result set missing")))?;
        let row = out_set
            .rows
            .first()
            .ok_or_else(|| Error::scan(format!("{origin}: output parameter row missing")))?;
        for (slot, &param_idx) in call.outputs.iter().enumerate() {
            if let Some(v) = row.get(slot).and_then(Value::as_i64) {
                outs[param_idx] = v;
            }
        }
    }

    Ok((sets, outs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(column: &str, name: &str, value: i64) -> ColumnParam {
        ColumnParam {
            column: column.into(),
            param: name.into(),
            value,
            big_end: false,
            output: false,
        }
    }

    #[test]
    fn test_database_type_parse() {
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::Postgres);
        assert_eq!("mssql".parse::<DatabaseType>().unwrap(), DatabaseType::SqlServer);
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn test_postgres_source_call_inlines_literals() {
        let params = vec![param("id", "after", 10), param("seq", "cursor", -3)];
        let call = build_source_call(DatabaseType::Postgres, "src.foo", &params);
        assert_eq!(call.statement, "select * from src.foo(10, -3)");
        assert!(call.params.is_empty());
        assert!(call.outputs.is_empty());
    }

    #[test]
    fn test_postgres_source_call_no_params() {
        let call = build_source_call(DatabaseType::Postgres, "src.foo", &[]);
        assert_eq!(call.statement, "select * from src.foo()");
    }

    #[test]
    fn test_mssql_source_call_named_binds() {
        let params = vec![param("id", "after", 10)];
        let call = build_source_call(DatabaseType::SqlServer, "dbo.GetRows", &params);
        assert_eq!(call.statement, "EXEC dbo.GetRows @after = @P1;");
        assert_eq!(call.params, vec![Value::Int64(10)]);
    }

    #[test]
    fn test_mssql_source_call_big_endian() {
        let mut p = param("rv", "rv", 0x12FF);
        p.big_end = true;
        let call = build_source_call(DatabaseType::SqlServer, "dbo.GetDelta", &[p]);
        assert_eq!(
            call.params,
            vec![Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0x12, 0xFF])]
        );
    }

    #[test]
    fn test_mssql_source_call_output() {
        let mut p = param("", "rv", 5);
        p.output = true;
        let call = build_source_call(DatabaseType::SqlServer, "dbo.GetDelta", &[p]);
        assert_eq!(
            call.statement,
            "DECLARE @o0 BIGINT = @P1;\nEXEC dbo.GetDelta @rv = @o0 OUTPUT;\nSELECT @o0 AS [o0];"
        );
        assert_eq!(call.params, vec![Value::Int64(5)]);
        assert_eq!(call.outputs, vec![0]);
    }

    #[test]
    fn test_mssql_source_call_mixed() {
        let mut out = param("", "rv", 7);
        out.output = true;
        let params = vec![param("id", "after", 3), out];
        let call = build_source_call(DatabaseType::SqlServer, "dbo.GetDelta", &params);
        assert_eq!(
            call.statement,
            "DECLARE @o1 BIGINT = @P2;\nEXEC dbo.GetDelta @after = @P1, @rv = @o1 OUTPUT;\nSELECT @o1 AS [o1];"
        );
        assert_eq!(call.params, vec![Value::Int64(3), Value::Int64(7)]);
        assert_eq!(call.outputs, vec![1]);
    }
}
