//! Value types for procsync
//!
//! `Value` is the owned, dialect-neutral representation of anything a
//! result-set column or procedure parameter can carry. Accessors are
//! deliberately lossy: resume-value arithmetic only ever needs `i64`,
//! and 8-byte binary buffers decode as big-endian u64 (the SQL Server
//! rowversion convention).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use uuid::Uuid;

/// SQL value that can hold any column or parameter content
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean (BIT, BOOLEAN)
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION, FLOAT)
    Float64(f64),
    /// Text (VARCHAR, NVARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA, VARBINARY, rowversion)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP, DATETIME2)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ, DATETIMEOFFSET)
    DateTimeTz(DateTime<Utc>),
    /// UUID (UUID, UNIQUEIDENTIFIER)
    Uuid(Uuid),
    /// JSON document (JSON, JSONB)
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to i64.
    ///
    /// Integer widths pass through; an exactly-8-byte buffer decodes as a
    /// big-endian u64 reinterpreted as i64. Everything else is `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Bytes(b) if b.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                Some(u64::from_be_bytes(buf) as i64)
            }
            _ => None,
        }
    }

    /// Try to borrow as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Untagged JSON projection: rows dispatched to postgres destination
/// procedures must read as plain JSON objects, so variants serialize as
/// their natural JSON scalar. Binary data becomes base64 text, timestamps
/// become ISO-8601 text.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int16(n) => serializer.serialize_i16(*n),
            Self::Int32(n) => serializer.serialize_i32(*n),
            Self::Int64(n) => serializer.serialize_i64(*n),
            Self::Float32(n) => serializer.serialize_f32(*n),
            Self::Float64(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::Bytes(b) => serializer.serialize_str(&BASE64_STANDARD.encode(b)),
            Self::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            Self::Time(t) => serializer.collect_str(&t.format("%H:%M:%S%.f")),
            Self::DateTime(dt) => serializer.collect_str(&dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::DateTimeTz(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            Self::Uuid(u) => serializer.collect_str(u),
            Self::Json(j) => j.serialize(serializer),
        }
    }
}

/// Serialize a sequence of serializable rows as a JSON array.
pub(crate) fn rows_to_json<R: Serialize>(rows: &[R]) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(SliceSeq(rows))
}

struct SliceSeq<'a, R>(&'a [R]);

impl<R: Serialize> Serialize for SliceSeq<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for row in self.0 {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int64(0).is_null());
    }

    #[test]
    fn test_as_i64_integers() {
        assert_eq!(Value::Int16(7).as_i64(), Some(7));
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::Int64(1 << 40).as_i64(), Some(1 << 40));
        assert_eq!(Value::String("42".into()).as_i64(), None);
    }

    #[test]
    fn test_as_i64_big_endian_buffer() {
        // rowversion 0x00000000000012FF
        let v = Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0x12, 0xFF]);
        assert_eq!(v.as_i64(), Some(0x12FF));

        // wrong length does not decode
        assert_eq!(Value::Bytes(vec![1, 2, 3]).as_i64(), None);
    }

    #[test]
    fn test_untagged_json() {
        let json = serde_json::to_value(Value::Int64(11)).unwrap();
        assert_eq!(json, serde_json::json!(11));

        let json = serde_json::to_value(Value::String("a'b".into())).unwrap();
        assert_eq!(json, serde_json::json!("a'b"));

        let json = serde_json::to_value(Value::Null).unwrap();
        assert!(json.is_null());

        let json = serde_json::to_value(Value::Bytes(vec![0xDE, 0xAD])).unwrap();
        assert_eq!(json, serde_json::json!("3q0="));
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(5_i64), Value::Int64(5));
        assert_eq!(Value::from("x"), Value::String("x".into()));
        assert!(Value::from(None::<i64>).is_null());
    }
}
