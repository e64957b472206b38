//! Schema inference over a batch of records
//!
//! Field types come from the first non-null value seen for a key. Later values
//! that disagree widen the type instead of being ignored:
//!
//! - `integer` and `number` widen to `number`
//! - objects merge their properties, arrays widen their element type
//! - any other disagreement widens to `string`
//!
//! A key whose values are all null is typed `string`. A key is required when
//! it is present (even as null) in every record of the batch.

use super::{FieldType, SchemaDescriptor};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Infer a schema from a batch of records
pub fn infer(records: &[Map<String, Value>]) -> SchemaDescriptor {
    if records.is_empty() {
        return SchemaDescriptor::default();
    }

    let mut observed: BTreeMap<String, Option<FieldType>> = BTreeMap::new();
    let mut presence: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        for (key, value) in record {
            *presence.entry(key.clone()).or_default() += 1;
            let slot = observed.entry(key.clone()).or_default();
            *slot = merge_optional(slot.take(), value_type(value));
        }
    }

    let required: BTreeSet<String> = presence
        .into_iter()
        .filter(|(_, count)| *count == records.len())
        .map(|(key, _)| key)
        .collect();

    let properties = observed
        .into_iter()
        .map(|(key, ty)| (key, ty.unwrap_or(FieldType::String)))
        .collect();

    SchemaDescriptor {
        properties,
        required,
    }
}

/// Type of a single JSON value, `None` for null
fn value_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(_) => Some(FieldType::String),
        Value::Array(items) => {
            let element = items
                .iter()
                .fold(None, |acc, item| merge_optional(acc, value_type(item)));
            Some(FieldType::Array(element.map(Box::new)))
        },
        Value::Object(map) => Some(FieldType::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), value_type(v).unwrap_or(FieldType::String)))
                .collect(),
        )),
    }
}

fn merge_optional(current: Option<FieldType>, next: Option<FieldType>) -> Option<FieldType> {
    match (current, next) {
        (Some(a), Some(b)) => Some(widen(a, b)),
        (a, b) => a.or(b),
    }
}

/// Least common type of two observations
fn widen(current: FieldType, next: FieldType) -> FieldType {
    match (current, next) {
        (a, b) if a == b => a,
        (FieldType::Integer, FieldType::Number) | (FieldType::Number, FieldType::Integer) => {
            FieldType::Number
        },
        (FieldType::Array(a), FieldType::Array(b)) => {
            let merged = merge_optional(a.map(|t| *t), b.map(|t| *t));
            FieldType::Array(merged.map(Box::new))
        },
        (FieldType::Object(mut a), FieldType::Object(b)) => {
            for (key, ty) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => widen(existing, ty),
                    None => ty,
                };
                a.insert(key, merged);
            }
            FieldType::Object(a)
        },
        _ => FieldType::String,
    }
}
