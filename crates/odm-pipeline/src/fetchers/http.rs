//! HTTP plumbing shared by the fetchers

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;
use tracing::debug;

use super::params::FetcherParams;
use crate::error::{PipelineError, Result};

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// User agent for JSON and CSV sources
pub const API_USER_AGENT: &str = concat!("odm-pipeline/", env!("CARGO_PKG_VERSION"));

/// Browser user agent for HTML sources that reject unknown clients
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Build a client with the `timeout` parameter applied
pub fn build_client(params: &FetcherParams, user_agent: &str) -> Result<Client> {
    let timeout = params.u64_or("timeout", DEFAULT_TIMEOUT_SECS)?;
    if timeout == 0 {
        return Err(PipelineError::configuration("parameter 'timeout' must be greater than 0"));
    }
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .user_agent(user_agent)
        .build()
        .map_err(|e| PipelineError::configuration(format!("failed to build HTTP client: {}", e)))
}

/// Parse the `method` parameter, restricted to `allowed`
pub fn method_param(params: &FetcherParams, allowed: &[&str]) -> Result<Method> {
    let method = params.str_or("method", "GET").to_uppercase();
    if !allowed.contains(&method.as_str()) {
        return Err(PipelineError::configuration(format!(
            "unsupported method '{}', expected one of [{}]",
            method,
            allowed.join(", ")
        )));
    }
    Method::from_bytes(method.as_bytes())
        .map_err(|_| PipelineError::configuration(format!("invalid method '{}'", method)))
}

/// Parse the `headers` parameter into a header map
pub fn headers_param(params: &FetcherParams) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in params.string_map("headers")? {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            PipelineError::configuration(format!("invalid header name '{}'", name))
        })?;
        let header_value = HeaderValue::from_str(&value).map_err(|_| {
            PipelineError::configuration(format!("invalid value for header '{}'", name))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

/// Parse and check the `url` parameter
pub fn url_param(params: &FetcherParams) -> Result<url::Url> {
    let raw = params.require_str("url")?;
    let parsed = url::Url::parse(&raw)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(PipelineError::configuration(format!("unsupported url scheme '{}'", other))),
    }
}

/// Send a request and return the body of a successful response
pub async fn send_text(request: RequestBuilder) -> Result<String> {
    let response = request.send().await?;
    let status = response.status();
    let url = response.url().to_string();

    if !status.is_success() {
        return Err(PipelineError::transport(format!("HTTP {} from {}", status, url)));
    }

    let body = response.text().await?;
    debug!(%url, status = status.as_u16(), bytes = body.len(), "Received response");
    Ok(body)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_param() {
        let params = FetcherParams::new().with("method", "post");
        assert_eq!(method_param(&params, &["GET", "POST"]).unwrap(), Method::POST);
        assert_eq!(method_param(&FetcherParams::new(), &["GET"]).unwrap(), Method::GET);
        assert!(method_param(&params, &["GET"]).is_err());
    }

    #[test]
    fn test_headers_param() {
        let params = FetcherParams::new().with("headers", json!({"X-Api-Key": "k", "X-Count": 2}));
        let headers = headers_param(&params).unwrap();
        assert_eq!(headers["x-api-key"], "k");
        assert_eq!(headers["x-count"], "2");

        let bad = FetcherParams::new().with("headers", json!({"bad header": "v"}));
        assert!(headers_param(&bad).is_err());
    }

    #[test]
    fn test_url_param() {
        assert!(url_param(&FetcherParams::new()).is_err());
        assert!(url_param(&FetcherParams::new().with("url", "ftp://x/y")).is_err());
        assert!(url_param(&FetcherParams::new().with("url", "not a url")).is_err());
        assert_eq!(
            url_param(&FetcherParams::new().with("url", "https://example.org/a?b=1"))
                .unwrap()
                .as_str(),
            "https://example.org/a?b=1"
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let params = FetcherParams::new().with("timeout", 0);
        assert!(build_client(&params, API_USER_AGENT).is_err());
    }
}
