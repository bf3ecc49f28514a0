//! Row mapper
//!
//! Resolves the fused namespace of result columns and `@param`
//! pseudo-params into the destination schema, and materializes per-row
//! dictionaries in that schema.
//!
//! Two row flavors exist on purpose: [`RowView`] borrows the scanned
//! values and is only valid for the current row (streaming dispatch and
//! JSONPath evaluation), while [`OwnedRow`] clones them and is safe to
//! accumulate for batched dispatch.

use std::collections::{BTreeMap, HashMap};

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::warn;

use crate::job::ColumnParam;
use crate::types::Value;

static NULL_VALUE: Value = Value::Null;

/// Where a destination-schema field reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Index into the result-row values
    Column(usize),
    /// Index into the pseudo-values captured at construction
    Pseudo(usize),
}

/// Destination-schema index for one result set.
#[derive(Debug)]
pub struct RowMapper {
    /// Destination fields in deterministic order: result columns first
    /// (renamed in place by mapping overrides), then pseudo-params in
    /// mapping order
    fields: Vec<(String, Slot)>,
    index: HashMap<String, Slot>,
    /// ColumnParam values captured at construction
    pseudo: Vec<Value>,
    missing: Vec<String>,
}

impl RowMapper {
    /// Build the destination schema for a result set.
    ///
    /// Every column is addressable by its own name unless a mapping
    /// entry renames it; `@param` mapping sources inject the parameter's
    /// current value under the destination name. Unresolvable entries
    /// are warnings, not errors.
    pub fn new(
        columns: &[String],
        mapping: &BTreeMap<String, String>,
        params: &[ColumnParam],
    ) -> Self {
        let mut mapper = Self {
            fields: Vec::with_capacity(columns.len()),
            index: HashMap::with_capacity(columns.len()),
            pseudo: Vec::new(),
            missing: Vec::new(),
        };

        for (i, column) in columns.iter().enumerate() {
            let name = mapping.get(column).unwrap_or(column);
            mapper.upsert(name.clone(), Slot::Column(i));
        }

        for (src, dst) in mapping {
            if let Some(param_name) = src.strip_prefix('@') {
                match params.iter().find(|p| p.param == param_name) {
                    Some(p) => {
                        mapper.pseudo.push(Value::Int64(p.value));
                        mapper.upsert(dst.clone(), Slot::Pseudo(mapper.pseudo.len() - 1));
                    }
                    None => mapper.missing.push(src.clone()),
                }
            } else if !mapper.index.contains_key(dst) {
                mapper.missing.push(format!("{src}({dst})"));
            }
        }

        if !mapper.missing.is_empty() {
            warn!("missing fields: {}", mapper.missing.join(", "));
        }

        mapper
    }

    fn upsert(&mut self, name: String, slot: Slot) {
        if self.index.insert(name.clone(), slot).is_some() {
            if let Some(entry) = self.fields.iter_mut().find(|(n, _)| *n == name) {
                entry.1 = slot;
                return;
            }
        }
        self.fields.push((name, slot));
    }

    /// Mapping entries that could not be resolved
    pub fn missing_fields(&self) -> &[String] {
        &self.missing
    }

    fn value_at<'a>(&'a self, slot: Slot, values: &'a [Value]) -> &'a Value {
        match slot {
            Slot::Column(i) => values.get(i).unwrap_or(&NULL_VALUE),
            Slot::Pseudo(i) => &self.pseudo[i],
        }
    }

    fn value_by_name<'a>(&'a self, values: &'a [Value], name: &str) -> Option<&'a Value> {
        self.index.get(name).map(|slot| self.value_at(*slot, values))
    }

    /// Coerce a field to i64; absent names and non-integer values are 0.
    /// 8-byte buffers decode as big-endian u64 (rowversion convention).
    pub fn int64_by_name(&self, values: &[Value], name: &str) -> i64 {
        self.value_by_name(values, name)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Coerce a field to a string; absent names and non-string values
    /// are empty.
    pub fn string_by_name(&self, values: &[Value], name: &str) -> String {
        self.value_by_name(values, name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Live view over the current row; valid until the values are
    /// overwritten by the next scan.
    pub fn row_view<'a>(&'a self, values: &'a [Value]) -> RowView<'a> {
        RowView {
            mapper: self,
            values,
        }
    }

    /// Owned snapshot of the current row.
    pub fn copy_row(&self, values: &[Value]) -> OwnedRow {
        OwnedRow {
            fields: self
                .fields
                .iter()
                .map(|(name, slot)| (name.clone(), self.value_at(*slot, values).clone()))
                .collect(),
        }
    }
}

/// A row in destination-schema shape, iterable in field order.
pub trait MappedRow: Serialize {
    /// Field names and values in the mapper's deterministic order
    fn fields(&self) -> Vec<(&str, &Value)>;
}

/// Non-owning row: shares storage with the scanned values.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    mapper: &'a RowMapper,
    values: &'a [Value],
}

impl MappedRow for RowView<'_> {
    fn fields(&self) -> Vec<(&str, &Value)> {
        self.mapper
            .fields
            .iter()
            .map(|(name, slot)| (name.as_str(), self.mapper.value_at(*slot, self.values)))
            .collect()
    }
}

impl Serialize for RowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = self.fields();
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (name, value) in fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Owned row snapshot.
#[derive(Debug, Clone)]
pub struct OwnedRow {
    fields: Vec<(String, Value)>,
}

impl MappedRow for OwnedRow {
    fn fields(&self) -> Vec<(&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v)).collect()
    }
}

impl Serialize for OwnedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
