//! CSV documents over HTTP

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{info, instrument};

use super::descriptor::{FetcherDescriptor, ParamSpec, ParamType};
use super::http::{self, API_USER_AGENT};
use super::params::FetcherParams;
use super::{DomainData, Fetcher, ParsedData, RawData};
use crate::error::{PipelineError, Result};

pub const CODE: &str = "CSV";

/// GET a CSV document and return one record per row
///
/// With `has_header` (default) the first row names the columns; otherwise
/// columns are named `column_0`, `column_1`, ... Cell values stay strings.
pub struct CsvFetcher {
    client: Client,
    url: url::Url,
    headers: HeaderMap,
    delimiter: u8,
    has_header: bool,
}

impl CsvFetcher {
    pub fn new(params: FetcherParams) -> Result<Self> {
        let url = http::url_param(&params)?;
        let headers = http::headers_param(&params)?;
        let delimiter = match params.str_or("delimiter", ",").as_bytes() {
            [byte] => *byte,
            b"\\t" => b'\t',
            _ => {
                return Err(PipelineError::configuration(
                    "parameter 'delimiter' must be a single ASCII character",
                ))
            },
        };
        let has_header = params.bool_or("has_header", true)?;
        let client = http::build_client(&params, API_USER_AGENT)?;

        Ok(Self {
            client,
            url,
            headers,
            delimiter,
            has_header,
        })
    }

    pub fn descriptor() -> FetcherDescriptor {
        FetcherDescriptor::new(
            CODE,
            "CSV file",
            "CSV document fetched over HTTP",
            vec![
                ParamSpec::required("url", ParamType::String),
                ParamSpec::optional("headers", ParamType::Json),
                ParamSpec::optional("delimiter", ParamType::String).default_value(","),
                ParamSpec::optional("has_header", ParamType::Boolean).default_value(true),
                ParamSpec::optional("timeout", ParamType::Integer).default_value(30),
            ],
        )
    }

    pub fn boxed(params: FetcherParams) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(Self::new(params)?))
    }
}

#[async_trait]
impl Fetcher for CsvFetcher {
    fn kind(&self) -> &'static str {
        CODE
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<RawData> {
        let request = self.client.get(self.url.clone()).headers(self.headers.clone());
        let body = http::send_text(request).await?;
        info!(bytes = body.len(), "Fetched CSV document");
        Ok(RawData::Text(body))
    }

    fn parse(&self, raw: RawData) -> Result<ParsedData> {
        let RawData::Text(body) = raw else {
            return Err(PipelineError::format("CSV fetcher expects a document body"));
        };

        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_header)
            .flexible(true)
            .from_reader(body.as_bytes());

        let columns: Vec<String> = if self.has_header {
            reader.headers()?.iter().map(|h| h.trim().to_string()).collect()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Map<String, Value> = record
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let name = columns
                        .get(i)
                        .filter(|c| !c.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", i));
                    (name, Value::String(cell.to_string()))
                })
                .collect();
            rows.push(DomainData::Json(Value::Object(row)));
        }

        Ok(DomainData::List(rows))
    }
}
