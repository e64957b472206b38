//! Fetcher descriptors
//!
//! A descriptor names a fetcher implementation and declares the parameters it
//! accepts. The registry validates resource parameters against it before a
//! fetcher is constructed, and `odm seed-fetchers` stores descriptors in the
//! catalog for management tooling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::params::{parse_bool, FetcherParams};
use crate::error::{PipelineError, Result};

/// Declared data type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Json,
    List,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (ParamType::String, Value::String(_) | Value::Number(_) | Value::Bool(_)) => true,
            (ParamType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ParamType::Integer, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            (ParamType::Number, Value::Number(_)) => true,
            (ParamType::Number, Value::String(s)) => s.trim().parse::<f64>().is_ok(),
            (ParamType::Boolean, Value::Bool(_)) => true,
            (ParamType::Boolean, Value::String(s)) => parse_bool(s).is_some(),
            (ParamType::Json, Value::Object(_) | Value::Array(_)) => true,
            (ParamType::Json, Value::String(s)) => serde_json::from_str::<Value>(s).is_ok(),
            (ParamType::List, Value::Array(_) | Value::String(_)) => true,
            _ => false,
        }
    }
}

/// One accepted parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub data_type: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: &str, data_type: ParamType) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            data_type,
            default: None,
            enum_values: None,
            description: None,
        }
    }

    pub fn optional(name: &str, data_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, data_type)
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }
}

/// Identifies a fetcher implementation and its parameter contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetcherDescriptor {
    /// Unique type code stored on resources, e.g. `PAGINATED_HTML`
    pub code: String,
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl FetcherDescriptor {
    pub fn new(code: &str, name: &str, description: &str, params: Vec<ParamSpec>) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            params,
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Check `params` against the declared contract and fill in defaults
    ///
    /// Parameters the descriptor does not declare pass through untouched.
    pub fn validate(&self, params: &FetcherParams) -> Result<FetcherParams> {
        let mut validated = params.clone();

        for spec in &self.params {
            let Some(value) = params.get(&spec.name) else {
                if let Some(default) = &spec.default {
                    validated = validated.with(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(PipelineError::configuration(format!(
                        "{} fetcher requires parameter '{}'",
                        self.code, spec.name
                    )));
                }
                continue;
            };

            if !spec.data_type.accepts(value) {
                return Err(PipelineError::configuration(format!(
                    "parameter '{}' of {} fetcher must be of type {:?}, got {}",
                    spec.name, self.code, spec.data_type, value
                )));
            }

            if let Some(allowed) = &spec.enum_values {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&text)) {
                    return Err(PipelineError::configuration(format!(
                        "parameter '{}' of {} fetcher must be one of [{}], got '{}'",
                        spec.name,
                        self.code,
                        allowed.join(", "),
                        text
                    )));
                }
            }
        }

        Ok(validated)
    }
}
