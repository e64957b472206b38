//! Catalog entities
//!
//! Rust views of the rows the pipeline reads and writes. Persistence lives in
//! [`crate::catalog`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::fetchers::FetcherParams;
use crate::schema::SchemaDescriptor;
use crate::versioning::SemanticVersion;

/// Resource parameters read by the load step rather than the fetcher
pub const LOAD_PARAMS: &[&str] = &["upsert_key"];

/// How staged records are written to the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Delete existing rows, then insert
    #[default]
    Replace,
    /// Insert only
    Append,
    /// Insert, updating rows whose key already exists
    Upsert,
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Replace => "replace",
            LoadMode::Append => "append",
            LoadMode::Upsert => "upsert",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "replace" => Ok(LoadMode::Replace),
            "append" => Ok(LoadMode::Append),
            "upsert" => Ok(LoadMode::Upsert),
            other => Err(format!("invalid load mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceParam {
    pub key: String,
    pub value: String,
}

/// A configured data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub publisher: String,
    pub description: Option<String>,
    /// Destination table under the load schema
    pub target_table: Option<String>,
    pub active: bool,
    pub enable_load: bool,
    pub load_mode: LoadMode,
    /// Registry code of the fetcher
    pub fetcher_code: String,
    pub params: Vec<ResourceParam>,
    /// Higher runs first in `run_all`
    pub execution_priority: i32,
    /// Deadline for the extract phase
    pub timeout_seconds: Option<u64>,
}

impl Resource {
    pub fn new(name: &str, publisher: &str, fetcher_code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            publisher: publisher.to_string(),
            description: None,
            target_table: None,
            active: true,
            enable_load: false,
            load_mode: LoadMode::default(),
            fetcher_code: fetcher_code.to_string(),
            params: Vec::new(),
            execution_priority: 0,
            timeout_seconds: None,
        }
    }

    /// Set a parameter, replacing any existing value for `key`
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|p| p.key == key) {
            Some(existing) => existing.value = value,
            None => self.params.push(ResourceParam {
                key: key.to_string(),
                value,
            }),
        }
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|p| p.key == key).map(|p| p.value.as_str())
    }

    /// Parameters handed to the fetcher; load settings never reach the source
    pub fn fetcher_params(&self) -> FetcherParams {
        FetcherParams::from_pairs(
            self.params
                .iter()
                .filter(|p| !LOAD_PARAMS.contains(&p.key.as_str()))
                .map(|p| (p.key.clone(), p.value.as_str())),
        )
    }

    /// Conflict columns for upsert loads, from the `upsert_key` parameter
    pub fn upsert_keys(&self) -> Vec<String> {
        let keys: Vec<String> = self
            .param("upsert_key")
            .unwrap_or("id")
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            vec!["id".to_string()]
        } else {
            keys
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("invalid execution status '{}'", other)),
        }
    }
}

/// Audit record of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: Option<i64>,
    pub records_loaded: Option<i64>,
    pub staging_path: Option<String>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn start(resource_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            total_records: None,
            records_loaded: None,
            staging_path: None,
            error_message: None,
        }
    }
}

/// Immutable versioned package produced by a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub execution_id: Uuid,
    pub version: SemanticVersion,
    pub schema: SchemaDescriptor,
    /// Bundle directory
    pub data_path: String,
    pub record_count: i64,
    /// SHA-256 of `data.jsonl`
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// A consumer registered to receive artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Where the consumer keeps generated bindings
    pub models_path: Option<String>,
    pub subscribed_resources: Vec<Uuid>,
    pub active: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Application {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            models_path: None,
            subscribed_resources: Vec::new(),
            active: true,
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

/// Version pin on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VersionPin {
    /// Only this version
    Exact(SemanticVersion),
    /// `1.*` or `1.2.*`
    Wildcard { major: u32, minor: Option<u32> },
}

impl VersionPin {
    pub fn matches(&self, version: &SemanticVersion) -> bool {
        match self {
            VersionPin::Exact(pinned) => pinned == version,
            VersionPin::Wildcard { major, minor } => {
                version.major == *major && minor.map_or(true, |m| version.minor == m)
            },
        }
    }
}

impl fmt::Display for VersionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPin::Exact(v) => write!(f, "{}", v),
            VersionPin::Wildcard { major, minor: None } => write!(f, "{}.*", major),
            VersionPin::Wildcard {
                major,
                minor: Some(minor),
            } => write!(f, "{}.{}.*", major, minor),
        }
    }
}

impl FromStr for VersionPin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || format!("invalid version pin '{}'", s);
        match s.strip_suffix(".*") {
            Some(prefix) => {
                let mut parts = prefix.split('.');
                let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
                let minor = match parts.next() {
                    Some(p) => Some(p.parse().map_err(|_| invalid())?),
                    None => None,
                };
                if parts.next().is_some() {
                    return Err(invalid());
                }
                Ok(VersionPin::Wildcard { major, minor })
            },
            None => SemanticVersion::parse(s).map(VersionPin::Exact).ok_or_else(invalid),
        }
    }
}

impl From<VersionPin> for String {
    fn from(pin: VersionPin) -> Self {
        pin.to_string()
    }
}

impl TryFrom<String> for VersionPin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which bumps a subscription follows automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoUpgrade {
    /// Any newer version
    Major,
    /// Newer versions with the same major
    Minor,
    /// Newer versions with the same major and minor
    Patch,
}

impl AutoUpgrade {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoUpgrade::Major => "major",
            AutoUpgrade::Minor => "minor",
            AutoUpgrade::Patch => "patch",
        }
    }

    pub fn allows(self, current: &SemanticVersion, candidate: &SemanticVersion) -> bool {
        match self {
            AutoUpgrade::Major => true,
            AutoUpgrade::Minor => candidate.major == current.major,
            AutoUpgrade::Patch => {
                candidate.major == current.major && candidate.minor == current.minor
            },
        }
    }
}

impl FromStr for AutoUpgrade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "major" => Ok(AutoUpgrade::Major),
            "minor" => Ok(AutoUpgrade::Minor),
            "patch" => Ok(AutoUpgrade::Patch),
            other => Err(format!("invalid auto-upgrade policy '{}'", other)),
        }
    }
}

/// Links an application to a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub application_id: Uuid,
    pub resource_id: Uuid,
    pub pinned_version: Option<VersionPin>,
    pub auto_upgrade: Option<AutoUpgrade>,
    /// Last version the application was notified about
    pub current_version: Option<SemanticVersion>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(application_id: Uuid, resource_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            application_id,
            resource_id,
            pinned_version: None,
            auto_upgrade: None,
            current_version: None,
            notified_at: None,
        }
    }

    /// Whether an artifact at `version` should be delivered
    pub fn accepts(&self, version: &SemanticVersion) -> bool {
        if let Some(pin) = &self.pinned_version {
            if !pin.matches(version) {
                return false;
            }
        }
        match (self.auto_upgrade, &self.current_version) {
            (Some(policy), Some(current)) => policy.allows(current, version),
            _ => true,
        }
    }
}

/// A subscription joined with its (active) application
#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub subscription: Subscription,
    pub application: Application,
}

/// Append-only log entry of one webhook delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub application_id: Uuid,
    pub artifact_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

impl NotificationRecord {
    pub fn delivered(&self) -> bool {
        self.status_code.is_some_and(|code| (200..300).contains(&code))
    }
}
