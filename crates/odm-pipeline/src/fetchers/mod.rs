//! Fetchers retrieve data from one kind of source
//!
//! Every fetcher implements the three steps of [`Fetcher`]; [`run_pipeline`]
//! drives them in order. Built-in implementations:
//!
//! | Code             | Type                    | Source                          |
//! |------------------|-------------------------|---------------------------------|
//! | `REST`           | [`RestFetcher`]         | JSON over HTTP                  |
//! | `HTML`           | [`HtmlFetcher`]         | single HTML page                |
//! | `PAGINATED_HTML` | [`PaginatedHtmlFetcher`]| HTML result tables over pages   |
//! | `CSV`            | [`CsvFetcher`]          | CSV document over HTTP          |

pub mod csv;
pub mod descriptor;
pub mod html;
pub mod http;
pub mod paginated;
pub mod params;
pub mod rest;

pub use self::csv::CsvFetcher;
pub use descriptor::{FetcherDescriptor, ParamSpec, ParamType};
pub use html::HtmlFetcher;
pub use paginated::PaginatedHtmlFetcher;
pub use params::FetcherParams;
pub use rest::RestFetcher;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::error::Result;

/// Output of [`Fetcher::fetch`]
#[derive(Debug, Clone, PartialEq)]
pub enum RawData {
    /// Response body as received
    Text(String),
    /// Rows already extracted during the fetch (paginated crawls)
    Rows(Vec<DomainData>),
}

/// Structured data produced by parse and normalize
///
/// Most values are plain JSON. Markup fragments kept from HTML sources are
/// not JSON and are stringified when staged.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainData {
    Json(Value),
    Markup(String),
    List(Vec<DomainData>),
    Record(BTreeMap<String, DomainData>),
}

/// Output of [`Fetcher::parse`]
pub type ParsedData = DomainData;

impl DomainData {
    pub fn text(value: impl Into<String>) -> Self {
        DomainData::Json(Value::String(value.into()))
    }

    /// Number of top-level records this value stages as
    pub fn record_count(&self) -> usize {
        match self {
            DomainData::List(items) => items.len(),
            DomainData::Json(Value::Array(items)) => items.len(),
            DomainData::Json(Value::Null) => 0,
            _ => 1,
        }
    }
}

impl From<Value> for DomainData {
    fn from(value: Value) -> Self {
        DomainData::Json(value)
    }
}

/// Capability set of a data source
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Registry code of the implementation
    fn kind(&self) -> &'static str;

    /// Retrieve raw data; the only step allowed to do network I/O
    async fn fetch(&self) -> Result<RawData>;

    fn parse(&self, raw: RawData) -> Result<ParsedData>;

    fn normalize(&self, parsed: ParsedData) -> Result<DomainData> {
        Ok(parsed)
    }
}

/// Run fetch, parse and normalize in order
#[instrument(skip(fetcher), fields(kind = fetcher.kind()))]
pub async fn run_pipeline(fetcher: &dyn Fetcher) -> Result<DomainData> {
    let raw = fetcher.fetch().await?;
    debug!("Fetched raw data");
    let parsed = fetcher.parse(raw)?;
    let normalized = fetcher.normalize(parsed)?;
    debug!(records = normalized.record_count(), "Normalized fetcher output");
    Ok(normalized)
}
