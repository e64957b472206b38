//! Structural type descriptions of staged records
//!
//! A [`SchemaDescriptor`] is serialized as a JSON Schema object:
//!
//! ```json
//! {
//!   "type": "object",
//!   "properties": { "a": { "type": "integer" }, "b": { "type": "string" } },
//!   "required": ["a"]
//! }
//! ```

pub mod inference;

pub use inference::infer;

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Inferred type of one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    /// Element type, `None` when only empty arrays were observed
    Array(Option<Box<FieldType>>),
    Object(BTreeMap<String, FieldType>),
}

impl FieldType {
    /// JSON Schema type name, the unit compared by schema diffs
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array(_) => "array",
            FieldType::Object(_) => "object",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldType::Array(Some(items)) => json!({ "type": "array", "items": items.to_json() }),
            FieldType::Object(properties) => {
                json!({ "type": "object", "properties": properties_to_json(properties) })
            },
            other => json!({ "type": other.type_name() }),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        let type_name = value.get("type").and_then(Value::as_str).ok_or_else(|| {
            PipelineError::format(format!("schema node without a type: {}", value))
        })?;

        Ok(match type_name {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => match value.get("items") {
                Some(items) => FieldType::Array(Some(Box::new(FieldType::from_json(items)?))),
                None => FieldType::Array(None),
            },
            "object" => FieldType::Object(properties_from_json(value.get("properties"))?),
            other => {
                return Err(PipelineError::format(format!("unsupported schema type '{}'", other)))
            },
        })
    }
}

/// Field name to type, plus the set of fields present in every record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct SchemaDescriptor {
    pub properties: BTreeMap<String, FieldType>,
    pub required: BTreeSet<String>,
}

impl SchemaDescriptor {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.properties.get(name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(name)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "type": "object",
            "properties": properties_to_json(&self.properties),
            "required": self.required.iter().collect::<Vec<_>>(),
        })
    }

    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        let properties = properties_from_json(value.get("properties"))?;
        let required = match value.get("required") {
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| {
                    n.as_str().map(str::to_string).ok_or_else(|| {
                        PipelineError::format("required entries must be strings")
                    })
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            Some(Value::Null) | None => BTreeSet::new(),
            Some(other) => {
                return Err(PipelineError::format(format!("invalid required list: {}", other)))
            },
        };
        Ok(Self {
            properties,
            required,
        })
    }
}

impl From<SchemaDescriptor> for Value {
    fn from(schema: SchemaDescriptor) -> Self {
        schema.to_json()
    }
}

impl TryFrom<Value> for SchemaDescriptor {
    type Error = PipelineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        SchemaDescriptor::from_json(&value)
    }
}

fn properties_to_json(properties: &BTreeMap<String, FieldType>) -> Value {
    Value::Object(
        properties
            .iter()
            .map(|(name, ty)| (name.clone(), ty.to_json()))
            .collect::<Map<_, _>>(),
    )
}

fn properties_from_json(
    value: Option<&Value>,
) -> Result<BTreeMap<String, FieldType>, PipelineError> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, node)| Ok((name.clone(), FieldType::from_json(node)?)))
            .collect(),
        Some(Value::Null) | None => Ok(BTreeMap::new()),
        Some(other) => Err(PipelineError::format(format!("invalid properties: {}", other))),
    }
}
