//! Rust bindings generated from an inferred schema
//!
//! The artifact bundle ships a `models.rs` with one `serde` struct so Rust
//! consumers can deserialize `data.jsonl` without writing the type by hand.

use std::collections::HashSet;
use std::fmt::Write;

use crate::schema::{FieldType, SchemaDescriptor};

const KEYWORDS: &[&str] = &[
    "as", "async", "await", "box", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while", "yield",
];

/// Header values printed at the top of the generated file
pub struct BindingContext<'a> {
    pub resource_name: &'a str,
    pub publisher: &'a str,
    pub version: &'a str,
    /// Struct name source, usually the target table or resource name
    pub type_name: &'a str,
}

/// Render a `models.rs` module for `schema`
pub fn render(ctx: &BindingContext<'_>, schema: &SchemaDescriptor) -> String {
    let struct_name = pascal_case(ctx.type_name);
    let mut out = String::new();

    // String writes are infallible
    let _ = writeln!(out, "//! Generated models for: {}", ctx.resource_name);
    let _ = writeln!(out, "//! Publisher: {}", ctx.publisher);
    let _ = writeln!(out, "//! Version: {}", ctx.version);
    let _ = writeln!(out, "//!");
    let _ = writeln!(out, "//! Do not edit. Download a newer artifact instead.");
    out.push('\n');
    out.push_str("use serde::{Deserialize, Serialize};\n\n");
    out.push_str("#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]\n");
    let _ = writeln!(out, "pub struct {} {{", struct_name);

    let mut used = HashSet::new();
    for (name, field_type) in &schema.properties {
        let ident = unique_ident(field_ident(name), &mut used);
        let mut ty = rust_type(field_type);
        let required = schema.is_required(name);
        if !required {
            ty = format!("Option<{}>", ty);
        }

        if ident != *name {
            let _ = writeln!(out, "    #[serde(rename = {:?})]", name);
        }
        if !required {
            out.push_str("    #[serde(default, skip_serializing_if = \"Option::is_none\")]\n");
        }
        let _ = writeln!(out, "    pub {}: {},", ident, ty);
    }

    out.push_str("}\n");
    out
}

/// Suffix `base` with `_2`, `_3`, ... until it is not in `used`
fn unique_ident(base: String, used: &mut HashSet<String>) -> String {
    let mut ident = base.clone();
    let mut n = 2;
    while used.contains(&ident) {
        ident = format!("{}_{}", base, n);
        n += 1;
    }
    used.insert(ident.clone());
    ident
}

fn rust_type(field_type: &FieldType) -> String {
    match field_type {
        FieldType::String => "String".to_string(),
        FieldType::Integer => "i64".to_string(),
        FieldType::Number => "f64".to_string(),
        FieldType::Boolean => "bool".to_string(),
        FieldType::Array(Some(items)) if !matches!(**items, FieldType::Object(_)) => {
            format!("Vec<{}>", rust_type(items))
        },
        FieldType::Array(_) => "Vec<serde_json::Value>".to_string(),
        FieldType::Object(_) => "serde_json::Value".to_string(),
    }
}

/// `bdns_grants` or `BDNS grants` to `BdnsGrants`
pub fn pascal_case(name: &str) -> String {
    let mut out: String = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    if out.is_empty() {
        out.push_str("Record");
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 'R');
    }
    out
}

/// Valid snake_case field identifier for a JSON key
pub fn field_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }

    let trimmed = out.trim_end_matches('_');
    let mut ident = if trimmed.is_empty() && !out.is_empty() {
        "_field".to_string()
    } else {
        trimmed.to_string()
    };
    if ident.is_empty() {
        ident.push_str("field");
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if KEYWORDS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(pascal_case("bdns_grants"), "BdnsGrants");
        assert_eq!(pascal_case("BDNS - Convocatorias"), "BdnsConvocatorias");
        assert_eq!(pascal_case("2024 data"), "R2024Data");
        assert_eq!(field_ident("totalPages"), "total_pages");
        assert_eq!(field_ident("fecha-alta"), "fecha_alta");
        assert_eq!(field_ident("type"), "type_");
        assert_eq!(field_ident("_row_index"), "_row_index");
        assert_eq!(field_ident("1st"), "_1st");
    }

    #[test]
    fn test_render_struct() {
        let mut schema = SchemaDescriptor::default();
        schema.properties.insert("id".into(), FieldType::Integer);
        schema.properties.insert("totalPages".into(), FieldType::Integer);
        schema
            .properties
            .insert("tags".into(), FieldType::Array(Some(Box::new(FieldType::String))));
        schema.properties.insert("extra".into(), FieldType::Object(Default::default()));
        schema.required.insert("id".into());
        schema.required.insert("totalPages".into());

        let code = render(
            &BindingContext {
                resource_name: "Grants",
                publisher: "IGAE",
                version: "1.2.0",
                type_name: "bdns_grants",
            },
            &schema,
        );

        assert!(code.contains("pub struct BdnsGrants {"));
        assert!(code.contains("    pub id: i64,\n"));
        assert!(code.contains("    #[serde(rename = \"totalPages\")]\n    pub total_pages: i64,"));
        assert!(code.contains("pub tags: Option<Vec<String>>,"));
        assert!(code.contains("pub extra: Option<serde_json::Value>,"));
        assert!(code.contains("//! Version: 1.2.0"));
    }

    #[test]
    fn test_colliding_keys_get_distinct_fields() {
        let mut schema = SchemaDescriptor::default();
        schema.properties.insert("Name".into(), FieldType::String);
        schema.properties.insert("name".into(), FieldType::String);
        schema.properties.insert("fecha alta".into(), FieldType::String);
        schema.properties.insert("fecha_alta".into(), FieldType::String);
        schema.properties.insert("name_2".into(), FieldType::String);

        let code = render(
            &BindingContext {
                resource_name: "Altas",
                publisher: "INE",
                version: "1.0.0",
                type_name: "altas",
            },
            &schema,
        );

        let fields: Vec<&str> = code
            .lines()
            .filter_map(|l| l.trim().strip_prefix("pub "))
            .filter(|l| !l.starts_with("struct"))
            .filter_map(|l| l.split(':').next())
            .collect();
        assert_eq!(fields.len(), 5);
        let distinct: HashSet<&str> = fields.iter().copied().collect();
        assert_eq!(distinct.len(), 5, "duplicate fields in {:?}", fields);

        // every colliding key keeps its wire name
        assert!(code.contains("#[serde(rename = \"Name\")]"));
        assert!(code.contains("#[serde(rename = \"fecha alta\")]"));
        assert!(code.contains("#[serde(rename = \"name\")]"));
        assert!(code.contains("#[serde(rename = \"fecha_alta\")]"));
        assert!(fields.contains(&"name_2") && fields.contains(&"name_2_2"));
    }
}
