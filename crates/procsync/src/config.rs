//! Configuration loading and binding
//!
//! The wire format is JSON with `Source`/`Target` default endpoints and
//! a `Sync` array of job configs. Binding resolves each job's effective
//! endpoint by coalescing job fields with the globals, builds the
//! dialect-native connection strings, interns them so identical
//! endpoints share one record, and produces the runtime job model.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dialect::DatabaseType;
use crate::error::{Error, Result};
use crate::job::{ColumnParam, DestProc, Endpoint, Job, RowProc, SyncPair, SyncSide};

/// Pattern for `${VAR}` / `${VAR:-default}` expansion
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Default sync-state table, on the target side
pub const DEFAULT_SYNC_TABLE: &str = "sync.sqlsync";

/// A configured database endpoint; every field optional so jobs can
/// override only what differs from the global default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DbServer {
    /// Dialect: "postgres" or "mssql"
    #[serde(rename = "Type")]
    pub db_type: Option<String>,
    pub host: Option<String>,
    pub failover: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "DB")]
    pub db: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Resume-value binding as configured
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ColumnParamConfig {
    pub column: String,
    pub param: String,
    pub value: i64,
    pub big_end: bool,
    pub output: bool,
}

/// Conditional per-row trigger as configured
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RowProcConfig {
    /// JSONPath predicate body; empty matches every row
    pub condition: String,
    /// Nested jobs; they inherit the outer job's endpoints
    pub sync: Vec<JobConfig>,
}

/// One sync job as configured
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobConfig {
    #[serde(default)]
    pub source: DbServer,
    #[serde(default)]
    pub target: DbServer,
    /// Source procedure name
    pub origin: String,
    /// Destination procedures, each `"<name>"` or `"<name> @<TypeName>"`
    #[serde(default)]
    pub dest: Vec<String>,
    #[serde(default)]
    pub column_param: Vec<ColumnParamConfig>,
    /// Source name → destination name field mapping
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub row_proc: Vec<RowProcConfig>,
    /// Tick period; required for top-level jobs
    #[serde(default)]
    pub period: Option<DurationValue>,
    /// Sync-table form: `src.X`, `dst.X`, `src`, `dst`, or bare `X`
    #[serde(default)]
    pub sync_table: Option<String>,
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    /// Default source endpoint
    pub source: DbServer,
    /// Default target endpoint
    pub target: DbServer,
    /// Job configs
    pub sync: Vec<JobConfig>,
}

/// Duration that deserializes from a nanosecond number or a
/// human-readable suffixed string (`"30s"`, `"1h 30m"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = DurationValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration as nanoseconds or a suffixed string like \"30s\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(DurationValue(Duration::from_nanos(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(DurationValue(Duration::from_nanos(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(DurationValue(Duration::from_nanos(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                humantime::parse_duration(v)
                    .map(DurationValue)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for DurationValue {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(self.0))
    }
}

impl Settings {
    /// Load settings from a JSON file, expanding `${VAR}` /
    /// `${VAR:-default}` references first.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read config {}: {e}", path.display())))?;
        let expanded = expand_env_vars(&content);
        serde_json::from_str(&expanded).map_err(|e| Error::config(format!("invalid config: {e}")))
    }
}

fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());
            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Parse a SyncTable form into (side, table name).
pub fn parse_sync_table(spec: Option<&str>) -> Result<(SyncSide, String)> {
    let spec = match spec {
        None => return Ok((SyncSide::Target, DEFAULT_SYNC_TABLE.to_string())),
        Some(s) => s.trim(),
    };

    match spec {
        "src" => Ok((SyncSide::Source, DEFAULT_SYNC_TABLE.to_string())),
        "dst" => Ok((SyncSide::Target, DEFAULT_SYNC_TABLE.to_string())),
        _ => {
            if let Some(table) = spec.strip_prefix("src.") {
                if table.is_empty() {
                    return Err(Error::config(format!("invalid SyncTable '{spec}'")));
                }
                return Ok((SyncSide::Source, table.to_string()));
            }
            if let Some(table) = spec.strip_prefix("dst.") {
                if table.is_empty() {
                    return Err(Error::config(format!("invalid SyncTable '{spec}'")));
                }
                return Ok((SyncSide::Target, table.to_string()));
            }
            if spec.is_empty() {
                return Err(Error::config("invalid SyncTable ''"));
            }
            Ok((SyncSide::Target, spec.to_string()))
        }
    }
}

fn coalesce<'a, T>(job: &'a Option<T>, global: &'a Option<T>) -> Option<&'a T> {
    job.as_ref().or(global.as_ref())
}

/// Build the dialect-native connection string for a resolved endpoint.
fn make_conn_string(
    db_type: DatabaseType,
    host: &str,
    failover: Option<&str>,
    port: Option<u16>,
    db: &str,
    user: &str,
    password: &str,
) -> String {
    match db_type {
        DatabaseType::SqlServer => {
            let failover = match failover {
                Some(f) if !f.is_empty() => format!("failoverpartner={f}; "),
                _ => String::new(),
            };
            let port = match port {
                Some(p) if p > 0 => p,
                _ => 1433,
            };
            format!(
                "server={host}; {failover}database={db}; port={port}; user id={user}; password={password}"
            )
        }
        DatabaseType::Postgres => {
            let port = match port {
                Some(p) if p > 0 => p,
                _ => 5432,
            };
            format!(
                "host={host} port={port} dbname={db} user={user} password={password} sslmode=disable"
            )
        }
    }
}

fn resolve_endpoint(
    job: &DbServer,
    global: &DbServer,
    cache: &mut HashMap<String, Arc<str>>,
) -> Result<Endpoint> {
    let db_type: DatabaseType = coalesce(&job.db_type, &global.db_type)
        .ok_or_else(|| Error::config("missing database type"))?
        .parse()?;

    let host = coalesce(&job.host, &global.host);
    let db = coalesce(&job.db, &global.db);
    let user = coalesce(&job.user, &global.user);
    let password = coalesce(&job.password, &global.password);

    let (host, db, user, password) = match (host, db, user, password) {
        (Some(h), Some(d), Some(u), Some(p))
            if !h.is_empty() && !d.is_empty() && !u.is_empty() && !p.is_empty() =>
        {
            (h, d, u, p)
        }
        _ => {
            return Err(Error::config(
                "host, db, user and password are required",
            ))
        }
    };

    let failover = coalesce(&job.failover, &global.failover).map(String::as_str);
    let port = coalesce(&job.port, &global.port).copied();

    let conn = make_conn_string(db_type, host, failover, port, db, user, password);
    let conn = cache
        .entry(conn.clone())
        .or_insert_with(|| Arc::from(conn.as_str()))
        .clone();

    Ok(Endpoint { db_type, conn })
}

/// Resolve all configured jobs into runtime jobs.
///
/// Each top-level job gets its coalesced endpoints, parsed destinations,
/// and sync-table location; nested RowProc jobs inherit the parent's
/// endpoints and connection records.
pub fn bind_jobs(settings: &Settings) -> Result<Vec<Arc<Job>>> {
    let mut cache: HashMap<String, Arc<str>> = HashMap::new();
    let mut jobs = Vec::with_capacity(settings.sync.len());

    for jc in &settings.sync {
        let with_origin =
            |e: Error| Error::config(format!("{}: {e}", jc.origin));

        let source = resolve_endpoint(&jc.source, &settings.source, &mut cache)
            .map_err(with_origin)?;
        let target = resolve_endpoint(&jc.target, &settings.target, &mut cache)
            .map_err(with_origin)?;

        let period = jc
            .period
            .ok_or_else(|| Error::config(format!("{}: Period is required", jc.origin)))?;
        if period.0.is_zero() {
            return Err(Error::config(format!(
                "{}: Period must be positive",
                jc.origin
            )));
        }

        let pair = bind_pair(jc, source, target).map_err(with_origin)?;
        jobs.push(Job::new(pair, period.0));
    }

    Ok(jobs)
}

fn bind_pair(jc: &JobConfig, source: Endpoint, target: Endpoint) -> Result<SyncPair> {
    if jc.origin.is_empty() {
        return Err(Error::config("Origin is required"));
    }

    let dest = jc
        .dest
        .iter()
        .map(|d| DestProc::parse(d))
        .collect::<Result<Vec<_>>>()?;

    let column_params: Vec<ColumnParam> = jc
        .column_param
        .iter()
        .map(|c| ColumnParam {
            column: c.column.clone(),
            param: c.param.clone(),
            value: c.value,
            big_end: c.big_end,
            output: c.output,
        })
        .collect();

    for src in jc.mapping.keys() {
        if let Some(param) = src.strip_prefix('@') {
            if !column_params.iter().any(|c| c.param == param) {
                warn!(
                    origin = %jc.origin,
                    "mapping references unknown parameter @{param}"
                );
            }
        }
    }

    let row_procs = jc
        .row_proc
        .iter()
        .map(|rp| {
            let nested = rp
                .sync
                .iter()
                .map(|sub| bind_pair(sub, source.clone(), target.clone()))
                .collect::<Result<Vec<_>>>()?;
            Ok(RowProc {
                condition: rp.condition.clone(),
                jobs: nested,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let (sync_side, sync_table) = parse_sync_table(jc.sync_table.as_deref())?;

    Ok(SyncPair {
        source,
        target,
        origin: jc.origin.clone(),
        dest,
        column_params,
        mapping: jc.mapping.clone(),
        row_procs,
        sync_table,
        sync_side,
    })
}
