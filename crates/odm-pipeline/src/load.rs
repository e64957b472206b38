//! Destination tables for staged records
//!
//! Loading is optional per resource. The set of tables a run may write to is
//! passed in explicitly, computed from the resource's own `target_table`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::config::is_identifier;
use crate::error::{PipelineError, Result};
use crate::models::LoadMode;
use crate::staging::Record;

/// One write of staged records into a table
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub table: &'a str,
    pub records: &'a [Record],
    pub mode: LoadMode,
    /// Conflict columns for [`LoadMode::Upsert`]
    pub upsert_key: &'a [String],
    pub allowed_tables: &'a BTreeSet<String>,
}

impl LoadRequest<'_> {
    /// Reject tables outside the whitelist and names that are not plain identifiers
    pub fn validate(&self) -> Result<()> {
        if !self.allowed_tables.contains(self.table) {
            let allowed: Vec<&str> = self.allowed_tables.iter().map(String::as_str).collect();
            return Err(PipelineError::Load(format!(
                "table '{}' is not in the allowed list [{}]",
                self.table,
                allowed.join(", ")
            )));
        }
        check_identifier(self.table)?;
        if self.mode == LoadMode::Upsert {
            if self.upsert_key.is_empty() {
                return Err(PipelineError::Load("upsert requires at least one key column".into()));
            }
            for key in self.upsert_key {
                check_identifier(key)?;
            }
        }
        for record in self.records {
            for column in record.keys() {
                check_identifier(column)?;
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(PipelineError::Load(format!("'{}' is not a valid SQL identifier", name)))
    }
}

/// Write target for the LOAD phase
#[async_trait]
pub trait Destination: Send + Sync {
    /// Write all records in one transaction, returning the number written
    async fn load(&self, request: LoadRequest<'_>) -> Result<u64>;
}

/// Postgres tables under one schema
pub struct PgDestination {
    pool: PgPool,
    schema: String,
}

impl PgDestination {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        if !is_identifier(&schema) {
            return Err(PipelineError::configuration(format!(
                "load schema '{}' is not a valid identifier",
                schema
            )));
        }
        Ok(Self { pool, schema })
    }

    async fn write(&self, request: &LoadRequest<'_>) -> std::result::Result<u64, sqlx::Error> {
        let table = format!("\"{}\".\"{}\"", self.schema, request.table);
        let mut tx = self.pool.begin().await?;

        if request.mode == LoadMode::Replace {
            let deleted = sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?
                .rows_affected();
            info!(table = %request.table, deleted, "Cleared destination table");
        }

        let mut written = 0;
        for record in request.records {
            written += insert_record(&mut tx, &table, record, request).await?;
        }

        tx.commit().await?;
        Ok(written)
    }
}

async fn insert_record(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    record: &Record,
    request: &LoadRequest<'_>,
) -> std::result::Result<u64, sqlx::Error> {
    if record.is_empty() {
        return Ok(0);
    }
    let columns: Vec<String> = record.keys().map(|k| format!("\"{}\"", k)).collect();
    let column_list = columns.join(", ");

    let mut sql = format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1)",
        table = table,
        cols = column_list
    );

    if request.mode == LoadMode::Upsert {
        let keys: Vec<String> = request.upsert_key.iter().map(|k| format!("\"{}\"", k)).collect();
        let updates: Vec<String> = record
            .keys()
            .filter(|k| !request.upsert_key.contains(k))
            .map(|k| format!("\"{0}\" = EXCLUDED.\"{0}\"", k))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                updates.join(", ")
            ));
        }
    }

    let result = sqlx::query(&sql)
        .bind(Value::Object(record.clone()))
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl Destination for PgDestination {
    #[instrument(skip_all, fields(table = %request.table, mode = %request.mode, records = request.records.len()))]
    async fn load(&self, request: LoadRequest<'_>) -> Result<u64> {
        request.validate()?;
        let written = self
            .write(&request)
            .await
            .map_err(|e| PipelineError::Load(e.to_string()))?;
        info!(written, "Loaded records into destination");
        Ok(written)
    }
}

/// In-process tables, keyed by table name
#[derive(Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of `table`
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.tables.lock().await.get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn load(&self, request: LoadRequest<'_>) -> Result<u64> {
        request.validate()?;
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(request.table.to_string()).or_default();

        match request.mode {
            LoadMode::Replace => {
                rows.clear();
                rows.extend(request.records.iter().cloned());
            },
            LoadMode::Append => rows.extend(request.records.iter().cloned()),
            LoadMode::Upsert => {
                for record in request.records {
                    let key_of = |r: &Record| -> Vec<Option<Value>> {
                        request.upsert_key.iter().map(|k| r.get(k).cloned()).collect()
                    };
                    let key = key_of(record);
                    match rows.iter_mut().find(|existing| key_of(existing) == key) {
                        Some(existing) => {
                            for (k, v) in record {
                                existing.insert(k.clone(), v.clone());
                            }
                        },
                        None => rows.push(record.clone()),
                    }
                }
            },
        }
        Ok(request.records.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recs(value: Value) -> Vec<Record> {
        crate::staging::to_records(value.into())
    }

    fn allowed(table: &str) -> BTreeSet<String> {
        BTreeSet::from([table.to_string()])
    }

    #[tokio::test]
    async fn test_table_must_be_allowed() {
        let dest = MemoryDestination::new();
        let records = recs(json!([{"id": 1}]));
        let err = dest
            .load(LoadRequest {
                table: "other",
                records: &records,
                mode: LoadMode::Append,
                upsert_key: &[],
                allowed_tables: &allowed("grants"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load(msg) if msg.contains("not in the allowed list")));
    }

    #[tokio::test]
    async fn test_bad_column_is_rejected() {
        let dest = MemoryDestination::new();
        let records = recs(json!([{"id; drop table x": 1}]));
        let err = dest
            .load(LoadRequest {
                table: "grants",
                records: &records,
                mode: LoadMode::Append,
                upsert_key: &[],
                allowed_tables: &allowed("grants"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LoadError");
    }

    async fn load(dest: &MemoryDestination, records: Value, mode: LoadMode) -> u64 {
        let records = recs(records);
        let key = vec!["id".to_string()];
        let tables = allowed("grants");
        let written = dest
            .load(LoadRequest {
                table: "grants",
                records: &records,
                mode,
                upsert_key: &key,
                allowed_tables: &tables,
            })
            .await
            .unwrap();
        written
    }

    #[tokio::test]
    async fn test_modes() {
        let dest = MemoryDestination::new();

        load(&dest, json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]), LoadMode::Replace).await;
        load(&dest, json!([{"id": 3, "v": "c"}]), LoadMode::Append).await;
        assert_eq!(dest.rows("grants").await.len(), 3);

        load(&dest, json!([{"id": 2, "v": "B"}, {"id": 4, "v": "d"}]), LoadMode::Upsert).await;
        let rows = dest.rows("grants").await;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1]["v"], json!("B"));

        load(&dest, json!([{"id": 9}]), LoadMode::Replace).await;
        assert_eq!(dest.rows("grants").await.len(), 1);
    }
}
