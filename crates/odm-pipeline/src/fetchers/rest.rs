//! JSON REST endpoints

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{info, instrument};

use super::descriptor::{FetcherDescriptor, ParamSpec, ParamType};
use super::http::{self, API_USER_AGENT};
use super::params::FetcherParams;
use super::{DomainData, Fetcher, ParsedData, RawData};
use crate::error::{PipelineError, Result};

pub const CODE: &str = "REST";

/// Fetch a JSON document from an HTTP endpoint
///
/// Parameters: `url` (required), `method` (GET), `headers` (JSON object),
/// `query_params` (JSON object), `body` (JSON, sent on POST/PUT), `timeout`
/// (seconds, 30).
pub struct RestFetcher {
    client: Client,
    url: url::Url,
    method: Method,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RestFetcher {
    /// Validate parameters and prepare the request; performs no I/O
    pub fn new(params: FetcherParams) -> Result<Self> {
        let url = http::url_param(&params)?;
        let method = http::method_param(&params, &["GET", "POST", "PUT"])?;
        let headers = http::headers_param(&params)?;
        let query = params.string_map("query_params")?;
        let body = match params.get("body") {
            Some(Value::String(s)) => Some(serde_json::from_str(s).map_err(|e| {
                PipelineError::configuration(format!("parameter 'body' is not valid JSON: {}", e))
            })?),
            Some(other) => Some(other.clone()),
            None => None,
        };
        let client = http::build_client(&params, API_USER_AGENT)?;

        Ok(Self {
            client,
            url,
            method,
            headers,
            query,
            body,
        })
    }

    pub fn descriptor() -> FetcherDescriptor {
        FetcherDescriptor::new(
            CODE,
            "REST API",
            "JSON document fetched from an HTTP endpoint",
            vec![
                ParamSpec::required("url", ParamType::String).describe("Endpoint URL"),
                ParamSpec::optional("method", ParamType::String)
                    .default_value("GET")
                    .one_of(&["GET", "POST", "PUT"]),
                ParamSpec::optional("headers", ParamType::Json).describe("Request headers"),
                ParamSpec::optional("query_params", ParamType::Json)
                    .describe("Query string parameters"),
                ParamSpec::optional("body", ParamType::Json).describe("Request body"),
                ParamSpec::optional("timeout", ParamType::Integer).default_value(30),
            ],
        )
    }

    pub fn boxed(params: FetcherParams) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(Self::new(params)?))
    }
}

#[async_trait]
impl Fetcher for RestFetcher {
    fn kind(&self) -> &'static str {
        CODE
    }

    #[instrument(skip(self), fields(url = %self.url, method = %self.method))]
    async fn fetch(&self) -> Result<RawData> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let body = http::send_text(request).await?;
        info!(bytes = body.len(), "Fetched REST response");
        Ok(RawData::Text(body))
    }

    fn parse(&self, raw: RawData) -> Result<ParsedData> {
        match raw {
            RawData::Text(body) => serde_json::from_str::<Value>(&body)
                .map(DomainData::Json)
                .map_err(|e| PipelineError::format(format!("response is not valid JSON: {}", e))),
            RawData::Rows(rows) => Ok(DomainData::List(rows)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_url_is_configuration_error() {
        let err = RestFetcher::new(FetcherParams::new()).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let fetcher = RestFetcher::new(FetcherParams::new().with("url", "http://localhost/x")).unwrap();
        let err = fetcher.parse(RawData::Text("<html>".into())).unwrap_err();
        assert!(matches!(err, PipelineError::Format(_)));

        let ok = fetcher.parse(RawData::Text(r#"{"a": 1}"#.into())).unwrap();
        assert_eq!(ok, DomainData::Json(json!({"a": 1})));
    }

    #[test]
    fn test_normalize_is_identity() {
        let fetcher = RestFetcher::new(FetcherParams::new().with("url", "http://localhost/x")).unwrap();
        let data = DomainData::Json(json!([{"a": 1}]));
        assert_eq!(fetcher.normalize(data.clone()).unwrap(), data);
    }

    #[test]
    fn test_descriptor_requires_url() {
        let descriptor = RestFetcher::descriptor();
        assert_eq!(descriptor.code, CODE);
        assert!(descriptor.param("url").unwrap().required);
    }
}
