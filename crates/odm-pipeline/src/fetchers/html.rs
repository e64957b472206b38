//! Single HTML pages
//!
//! Parameters other than `url`, `method`, `headers` and `timeout` are sent to
//! the page as query parameters (GET) or form fields (POST), so a search form
//! can be submitted by configuring its field names on the resource.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, instrument};

use super::descriptor::{FetcherDescriptor, ParamSpec, ParamType};
use super::http::{self, BROWSER_USER_AGENT};
use super::params::FetcherParams;
use super::{DomainData, Fetcher, ParsedData, RawData};
use crate::error::{PipelineError, Result};

pub const CODE: &str = "HTML";

const TECHNICAL_PARAMS: &[&str] = &["url", "method", "headers", "timeout"];

/// Compile a CSS selector, reporting failures as configuration errors
pub(crate) fn css(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        PipelineError::configuration(format!("invalid CSS selector '{}': {:?}", selector, e))
    })
}

/// Visible text of an element with surrounding whitespace trimmed per node
pub(crate) fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fetch one HTML page and extract its title, tables and forms
pub struct HtmlFetcher {
    client: Client,
    url: url::Url,
    method: Method,
    headers: HeaderMap,
    fields: Vec<(String, String)>,
}

impl HtmlFetcher {
    pub fn new(params: FetcherParams) -> Result<Self> {
        let url = http::url_param(&params)?;
        let method = http::method_param(&params, &["GET", "POST"])?;
        let headers = http::headers_param(&params)?;
        let client = http::build_client(&params, BROWSER_USER_AGENT)?;

        let fields = params
            .iter()
            .filter(|(k, _)| !TECHNICAL_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();

        Ok(Self {
            client,
            url,
            method,
            headers,
            fields,
        })
    }

    pub fn descriptor() -> FetcherDescriptor {
        FetcherDescriptor::new(
            CODE,
            "HTML page",
            "Single HTML page; extra parameters are submitted as query or form fields",
            vec![
                ParamSpec::required("url", ParamType::String),
                ParamSpec::optional("method", ParamType::String)
                    .default_value("GET")
                    .one_of(&["GET", "POST"]),
                ParamSpec::optional("headers", ParamType::Json),
                ParamSpec::optional("timeout", ParamType::Integer).default_value(30),
            ],
        )
    }

    pub fn boxed(params: FetcherParams) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(Self::new(params)?))
    }
}

#[async_trait]
impl Fetcher for HtmlFetcher {
    fn kind(&self) -> &'static str {
        CODE
    }

    #[instrument(skip(self), fields(url = %self.url, method = %self.method))]
    async fn fetch(&self) -> Result<RawData> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if !self.fields.is_empty() {
            request = if self.method == Method::POST {
                request.form(&self.fields)
            } else {
                request.query(&self.fields)
            };
        }

        let body = http::send_text(request).await?;
        info!(bytes = body.len(), "Fetched HTML page");
        Ok(RawData::Text(body))
    }

    fn parse(&self, raw: RawData) -> Result<ParsedData> {
        let RawData::Text(html) = raw else {
            return Err(PipelineError::format("HTML fetcher expects a page body"));
        };
        let page = parse_page(&html)?;

        let mut record = BTreeMap::new();
        let title = page.title.map_or(Value::Null, Value::String);
        record.insert("title".to_string(), DomainData::Json(title));
        record.insert("tables".to_string(), DomainData::Json(json!(page.tables)));
        record.insert("forms".to_string(), DomainData::Json(Value::Array(page.forms)));
        record.insert("html".to_string(), DomainData::Markup(html));
        Ok(DomainData::Record(record))
    }

    fn normalize(&self, parsed: ParsedData) -> Result<DomainData> {
        let DomainData::Record(mut record) = parsed else {
            return Err(PipelineError::format("HTML fetcher expects a parsed page record"));
        };

        let count = |key: &str, record: &BTreeMap<String, DomainData>| match record.get(key) {
            Some(DomainData::Json(Value::Array(items))) => items.len(),
            _ => 0,
        };
        let tables_count = count("tables", &record);
        let forms_count = count("forms", &record);
        let raw_html_length = match record.get("html") {
            Some(DomainData::Markup(html)) => html.len(),
            _ => 0,
        };

        record.insert("source_type".to_string(), DomainData::text(CODE));
        record.insert("raw_html_length".to_string(), DomainData::Json(json!(raw_html_length)));
        record.insert("tables_count".to_string(), DomainData::Json(json!(tables_count)));
        record.insert("forms_count".to_string(), DomainData::Json(json!(forms_count)));
        Ok(DomainData::Record(record))
    }
}

struct ParsedPage {
    title: Option<String>,
    tables: Vec<Vec<Vec<String>>>,
    forms: Vec<Value>,
}

fn parse_page(html: &str) -> Result<ParsedPage> {
    let document = Html::parse_document(html);
    let title_sel = css("title")?;
    let table_sel = css("table")?;
    let row_sel = css("tr")?;
    let cell_sel = css("th, td")?;
    let form_sel = css("form")?;
    let input_sel = css("input, select, textarea")?;

    let title = document
        .select(&title_sel)
        .next()
        .map(|t| element_text(&t))
        .filter(|t| !t.is_empty());

    let tables: Vec<Vec<Vec<String>>> = document
        .select(&table_sel)
        .map(|table| {
            table
                .select(&row_sel)
                .map(|row| row.select(&cell_sel).map(|c| element_text(&c)).collect::<Vec<_>>())
                .filter(|cells| !cells.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();

    let forms: Vec<Value> = document
        .select(&form_sel)
        .map(|form| {
            let inputs: Map<String, Value> = form
                .select(&input_sel)
                .filter_map(|input| {
                    let name = input.value().attr("name")?;
                    let value = input.value().attr("value").unwrap_or_default();
                    Some((name.to_string(), Value::String(value.to_string())))
                })
                .collect();
            json!({
                "action": form.value().attr("action").unwrap_or_default(),
                "method": form.value().attr("method").unwrap_or("GET").to_uppercase(),
                "inputs": inputs,
            })
        })
        .collect();

    Ok(ParsedPage {
        title,
        tables,
        forms,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head><title> Registry search </title></head>
        <body>
          <form action="/search" method="post">
            <input type="text" name="q" value="rust">
            <input type="hidden" name="page" value="1">
            <input type="submit">
          </form>
          <table>
            <tr><th>Name</th><th>City</th></tr>
            <tr><td>Alpha</td><td> Madrid </td></tr>
          </table>
        </body></html>"#;

    fn fetcher(extra: &[(&str, &str)]) -> HtmlFetcher {
        let mut params = FetcherParams::new().with("url", "http://localhost/page");
        for (k, v) in extra {
            params = params.with(*k, *v);
        }
        HtmlFetcher::new(params).unwrap()
    }

    #[test]
    fn test_non_technical_params_become_fields() {
        let f = fetcher(&[("method", "POST"), ("q", "rust"), ("timeout", "5")]);
        assert_eq!(f.fields, vec![("q".to_string(), "rust".to_string())]);
        assert_eq!(f.method, Method::POST);
    }

    #[test]
    fn test_parse_and_normalize_page() {
        let f = fetcher(&[]);
        let parsed = f.parse(RawData::Text(PAGE.to_string())).unwrap();
        let DomainData::Record(record) = f.normalize(parsed).unwrap() else {
            panic!("expected record");
        };

        assert_eq!(record["title"], DomainData::text("Registry search"));
        assert_eq!(record["source_type"], DomainData::text("HTML"));
        assert_eq!(record["tables_count"], DomainData::Json(json!(1)));
        assert_eq!(record["forms_count"], DomainData::Json(json!(1)));
        assert_eq!(
            record["tables"],
            DomainData::Json(json!([[["Name", "City"], ["Alpha", "Madrid"]]]))
        );
        assert_eq!(
            record["forms"],
            DomainData::Json(json!([{
                "action": "/search",
                "method": "POST",
                "inputs": {"q": "rust", "page": "1"}
            }]))
        );
        assert_eq!(record["raw_html_length"], DomainData::Json(json!(PAGE.len())));
        assert!(matches!(record["html"], DomainData::Markup(_)));
    }

    #[test]
    fn test_invalid_selector_is_configuration_error() {
        assert!(matches!(css("td[").unwrap_err(), PipelineError::Configuration(_)));
    }
}
