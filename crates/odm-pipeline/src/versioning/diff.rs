//! Structural diff between two schemas
//!
//! Only top-level fields are compared, and a type change means the JSON Schema
//! type name differs (`integer` -> `string`). Changes nested inside an object
//! or array field do not count.

use serde::{Deserialize, Serialize};

use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub field: String,
    pub old_type: String,
    pub new_type: String,
}

/// Delta between an old and a new schema
///
/// Field lists are sorted, so equal inputs always produce equal diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub type_changes: Vec<TypeChange>,
    /// A field was removed or changed type
    pub breaking: bool,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_fields.is_empty() && self.removed_fields.is_empty() && self.type_changes.is_empty()
    }
}

pub fn diff(old: &SchemaDescriptor, new: &SchemaDescriptor) -> SchemaDiff {
    let added_fields: Vec<String> = new
        .properties
        .keys()
        .filter(|k| !old.properties.contains_key(*k))
        .cloned()
        .collect();

    let removed_fields: Vec<String> = old
        .properties
        .keys()
        .filter(|k| !new.properties.contains_key(*k))
        .cloned()
        .collect();

    let type_changes: Vec<TypeChange> = old
        .properties
        .iter()
        .filter_map(|(field, old_type)| {
            let new_type = new.properties.get(field)?;
            (old_type.type_name() != new_type.type_name()).then(|| TypeChange {
                field: field.clone(),
                old_type: old_type.type_name().to_string(),
                new_type: new_type.type_name().to_string(),
            })
        })
        .collect();

    let breaking = !removed_fields.is_empty() || !type_changes.is_empty();

    SchemaDiff {
        added_fields,
        removed_fields,
        type_changes,
        breaking,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use std::collections::BTreeMap;

    fn schema(fields: &[(&str, FieldType)]) -> SchemaDescriptor {
        SchemaDescriptor {
            properties: fields
                .iter()
                .map(|(n, t)| (n.to_string(), t.clone()))
                .collect(),
            required: Default::default(),
        }
    }

    #[test]
    fn test_added_and_removed_are_complements() {
        let pairs = [
            (
                schema(&[("a", FieldType::Integer)]),
                schema(&[("a", FieldType::Integer), ("b", FieldType::String)]),
            ),
            (
                schema(&[("x", FieldType::Boolean), ("y", FieldType::Number)]),
                schema(&[("y", FieldType::String), ("z", FieldType::Integer)]),
            ),
            (schema(&[]), schema(&[("only", FieldType::Array(None))])),
        ];

        for (old, new) in &pairs {
            assert_eq!(diff(old, new).added_fields, diff(new, old).removed_fields);
            assert_eq!(diff(old, new).removed_fields, diff(new, old).added_fields);
        }
    }

    #[test]
    fn test_type_change_is_breaking() {
        let old = schema(&[("a", FieldType::Integer)]);
        let new = schema(&[("a", FieldType::Number)]);
        let d = diff(&old, &new);
        assert!(d.breaking);
        assert_eq!(
            d.type_changes,
            vec![TypeChange {
                field: "a".into(),
                old_type: "integer".into(),
                new_type: "number".into(),
            }]
        );
    }

    #[test]
    fn test_addition_is_not_breaking() {
        let old = schema(&[("a", FieldType::Integer)]);
        let new = schema(&[("a", FieldType::Integer), ("b", FieldType::String)]);
        let d = diff(&old, &new);
        assert!(!d.breaking);
        assert_eq!(d.added_fields, vec!["b".to_string()]);
    }

    #[test]
    fn test_nested_changes_are_ignored() {
        let mut inner_old = BTreeMap::new();
        inner_old.insert("lat".to_string(), FieldType::Number);
        let mut inner_new = BTreeMap::new();
        inner_new.insert("lat".to_string(), FieldType::String);

        let d = diff(
            &schema(&[("geo", FieldType::Object(inner_old))]),
            &schema(&[("geo", FieldType::Object(inner_new))]),
        );
        assert!(d.is_empty());
        assert!(!d.breaking);
    }

    #[test]
    fn test_payload_shape() {
        let d = diff(&schema(&[("a", FieldType::Integer)]), &schema(&[]));
        let value = serde_json::to_value(&d).unwrap();
        assert_eq!(value["removed_fields"], serde_json::json!(["a"]));
        assert_eq!(value["breaking"], true);
    }
}
