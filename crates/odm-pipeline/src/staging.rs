//! Staging of fetcher output as newline-delimited JSON
//!
//! Every run writes `{staging_dir}/{resource_id}/{execution_id}.jsonl`, one
//! object per line. The file is written to a temporary path and renamed into
//! place so a crashed run never leaves a half-written staging file behind.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fetchers::DomainData;

/// One staged record
pub type Record = Map<String, Value>;

/// Convert fetcher output into JSON, stringifying markup fragments
pub fn to_json(data: DomainData) -> Value {
    match data {
        DomainData::Json(value) => value,
        DomainData::Markup(html) => Value::String(html),
        DomainData::List(items) => Value::Array(items.into_iter().map(to_json).collect()),
        DomainData::Record(fields) => {
            Value::Object(fields.into_iter().map(|(k, v)| (k, to_json(v))).collect())
        },
    }
}

/// Flatten fetcher output into a list of records
///
/// A bare object becomes a one-element list and null becomes an empty list.
/// List elements that are not objects are wrapped as `{"value": ...}`.
pub fn to_records(data: DomainData) -> Vec<Record> {
    match to_json(data) {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        other => vec![into_record(other)],
    }
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        },
    }
}

/// Location of the staging file for one run
pub fn staging_path(staging_dir: &Path, resource_id: Uuid, execution_id: Uuid) -> PathBuf {
    staging_dir
        .join(resource_id.to_string())
        .join(format!("{}.jsonl", execution_id))
}

/// Serialize records as JSONL bytes
pub fn encode(records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Write records to `path`, creating parent directories
pub async fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let bytes = encode(records)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("jsonl.tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await?;

    info!(path = %path.display(), records = records.len(), bytes = bytes.len(), "Staged records");
    Ok(())
}

/// Read a JSONL file back into records, skipping blank lines
pub async fn read_records(path: &Path) -> Result<Vec<Record>> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line)? {
            Value::Object(map) => records.push(map),
            _ => {
                return Err(PipelineError::format(format!(
                    "{}:{}: staged line is not a JSON object",
                    path.display(),
                    line_no + 1
                )))
            },
        }
    }
    debug!(path = %path.display(), records = records.len(), "Read staged records");
    Ok(records)
}
