//! Paginated HTML result tables
//!
//! Search front-ends often return results as an HTML table spread across many
//! pages. The crawl runs as an explicit state machine:
//!
//! ```text
//! FetchingPage -> Extracting -> CheckingNext -> FetchingPage | Done
//!      |
//!      +-> Error (retries exhausted)
//! ```
//!
//! `max_pages` bounds the number of page requests no matter how many "next"
//! links the source keeps advertising. Rows from every page are accumulated
//! and passed through parse and normalize once, after the crawl is done.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, Method};
use scraper::{ElementRef, Html};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::descriptor::{FetcherDescriptor, ParamSpec, ParamType};
use super::html::{css, element_text};
use super::http::{self, BROWSER_USER_AGENT};
use super::params::FetcherParams;
use super::{DomainData, Fetcher, ParsedData, RawData};
use crate::error::{PipelineError, Result};

pub const CODE: &str = "PAGINATED_HTML";

pub const DEFAULT_MAX_PAGES: u64 = 100;
pub const DEFAULT_MAX_RETRIES: u64 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 2.0;
pub const DEFAULT_DELAY_BETWEEN_PAGES_SECS: f64 = 1.0;
pub const DEFAULT_PAGE_PARAM: &str = "pagina";

/// How the next page is discovered
#[derive(Debug, Clone, PartialEq)]
enum Pagination {
    /// Follow the `href` of the first matching link
    Links { selectors: Vec<String> },
    /// Re-submit the first matching form with the page field incremented
    Form {
        selectors: Vec<String>,
        page_param: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldTransform {
    Trim,
    Upper,
    Lower,
}

impl FieldTransform {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "trim" => Some(FieldTransform::Trim),
            "upper" => Some(FieldTransform::Upper),
            "lower" => Some(FieldTransform::Lower),
            _ => None,
        }
    }

    fn apply(self, text: &str) -> String {
        match self {
            FieldTransform::Trim => text.trim().to_string(),
            FieldTransform::Upper => text.to_uppercase(),
            FieldTransform::Lower => text.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
struct CrawlConfig {
    url: Url,
    method: Method,
    rows_selector: String,
    max_pages: u64,
    max_retries: u64,
    retry_delay: Duration,
    delay_between_pages: Duration,
    pagination: Pagination,
    has_header: bool,
    header_selectors: Vec<String>,
    clean_html: bool,
    whitespace: Regex,
    include_row_metadata: bool,
    error_selectors: Vec<String>,
    transformations: Vec<(String, FieldTransform)>,
}

/// One page request
#[derive(Debug, Clone, PartialEq)]
enum PageRequest {
    Get(Url),
    Post { url: Url, form: Vec<(String, String)> },
}

impl PageRequest {
    fn url(&self) -> &Url {
        match self {
            PageRequest::Get(url) | PageRequest::Post { url, .. } => url,
        }
    }
}

enum CrawlState {
    FetchingPage { request: PageRequest, page: u64 },
    Extracting { body: String, url: Url, page: u64 },
    CheckingNext { next: Option<PageRequest>, page: u64 },
    Done { pages: u64 },
    Error(PipelineError),
}

/// Rows and next-page candidate found on one page
struct ExtractedPage {
    rows: Vec<DomainData>,
    next: Option<PageRequest>,
}

/// Crawl a paginated HTML result table
pub struct PaginatedHtmlFetcher {
    client: Client,
    headers: HeaderMap,
    config: CrawlConfig,
}

impl PaginatedHtmlFetcher {
    /// Validate parameters and compile selectors; performs no I/O
    pub fn new(params: FetcherParams) -> Result<Self> {
        let url = http::url_param(&params)?;
        let rows_selector = params.require_str("rows_selector")?;
        let method = http::method_param(&params, &["GET", "POST"])?;

        let max_pages = params.u64_or("max_pages", DEFAULT_MAX_PAGES)?;
        if max_pages == 0 {
            return Err(PipelineError::configuration("parameter 'max_pages' must be at least 1"));
        }

        let pagination = match params.str_or("pagination_type", "links").to_lowercase().as_str() {
            "links" => Pagination::Links {
                selectors: params.string_list("next_page_selector")?.unwrap_or_default(),
            },
            "form" => Pagination::Form {
                selectors: params.string_list("next_form_selector")?.unwrap_or_default(),
                page_param: params.str_or("page_param", DEFAULT_PAGE_PARAM),
            },
            other => {
                return Err(PipelineError::configuration(format!(
                    "pagination_type must be 'links' or 'form', got '{}'",
                    other
                )))
            },
        };

        let transformations = params
            .string_map("field_transformations")?
            .into_iter()
            .map(|(field, name)| {
                FieldTransform::parse(&name).map(|t| (field.clone(), t)).ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "unknown transformation '{}' for field '{}'",
                        name, field
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = CrawlConfig {
            url,
            method,
            rows_selector,
            max_pages,
            max_retries: params.u64_or("max_retries", DEFAULT_MAX_RETRIES)?,
            retry_delay: seconds(&params, "retry_delay", DEFAULT_RETRY_DELAY_SECS)?,
            delay_between_pages: seconds(
                &params,
                "delay_between_pages",
                DEFAULT_DELAY_BETWEEN_PAGES_SECS,
            )?,
            pagination,
            has_header: params.bool_or("has_header", true)?,
            header_selectors: params
                .string_list("header_selectors")?
                .unwrap_or_else(|| vec!["th".to_string(), "td".to_string()]),
            clean_html: params.bool_or("clean_html", true)?,
            whitespace: Regex::new(r"\s+")?,
            include_row_metadata: params.bool_or("include_row_metadata", false)?,
            error_selectors: params.string_list("error_selectors")?.unwrap_or_default(),
            transformations,
        };
        config.check_selectors()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("es-ES,es;q=0.8,en-US;q=0.5,en;q=0.3"));
        headers.extend(http::headers_param(&params)?);

        let client = http::build_client(&params, BROWSER_USER_AGENT)?;

        Ok(Self {
            client,
            headers,
            config,
        })
    }

    pub fn descriptor() -> FetcherDescriptor {
        FetcherDescriptor::new(
            CODE,
            "Paginated HTML",
            "HTML result table crawled across pages by link or form pagination",
            vec![
                ParamSpec::required("url", ParamType::String).describe("First results page"),
                ParamSpec::required("rows_selector", ParamType::String)
                    .describe("CSS selector matching table rows"),
                ParamSpec::optional("method", ParamType::String)
                    .default_value("GET")
                    .one_of(&["GET", "POST"]),
                ParamSpec::optional("headers", ParamType::Json),
                ParamSpec::optional("timeout", ParamType::Integer).default_value(30),
                ParamSpec::optional("max_pages", ParamType::Integer)
                    .default_value(DEFAULT_MAX_PAGES)
                    .describe("Hard ceiling on page requests"),
                ParamSpec::optional("max_retries", ParamType::Integer)
                    .default_value(DEFAULT_MAX_RETRIES),
                ParamSpec::optional("retry_delay", ParamType::Number)
                    .default_value(DEFAULT_RETRY_DELAY_SECS),
                ParamSpec::optional("delay_between_pages", ParamType::Number)
                    .default_value(DEFAULT_DELAY_BETWEEN_PAGES_SECS),
                ParamSpec::optional("pagination_type", ParamType::String)
                    .default_value("links")
                    .one_of(&["links", "form"]),
                ParamSpec::optional("next_page_selector", ParamType::List),
                ParamSpec::optional("next_form_selector", ParamType::List),
                ParamSpec::optional("page_param", ParamType::String)
                    .default_value(DEFAULT_PAGE_PARAM),
                ParamSpec::optional("has_header", ParamType::Boolean).default_value(true),
                ParamSpec::optional("header_selectors", ParamType::List)
                    .default_value(json!(["th", "td"])),
                ParamSpec::optional("clean_html", ParamType::Boolean).default_value(true),
                ParamSpec::optional("include_row_metadata", ParamType::Boolean)
                    .default_value(false),
                ParamSpec::optional("error_selectors", ParamType::List)
                    .describe("A page matching any of these is retried"),
                ParamSpec::optional("field_transformations", ParamType::Json)
                    .describe("Field to trim, upper or lower"),
            ],
        )
    }

    pub fn boxed(params: FetcherParams) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(Self::new(params)?))
    }

    fn initial_request(&self) -> PageRequest {
        if self.config.method == Method::POST {
            PageRequest::Post {
                url: self.config.url.clone(),
                form: Vec::new(),
            }
        } else {
            PageRequest::Get(self.config.url.clone())
        }
    }

    /// FETCHING_PAGE: one page with retries and exponential backoff
    async fn fetch_page(&self, request: &PageRequest, page: u64) -> Result<String> {
        let mut attempt: u64 = 0;
        loop {
            match self.try_fetch_page(request).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt >= self.config.max_retries => {
                    error!(page, attempts = attempt + 1, error = %e, "Page fetch failed, giving up");
                    return Err(e);
                },
                Err(e) => {
                    let wait = backoff(self.config.retry_delay, attempt);
                    warn!(
                        page,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Page fetch failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                },
            }
        }
    }

    async fn try_fetch_page(&self, request: &PageRequest) -> Result<String> {
        let builder = match request {
            PageRequest::Get(url) => self.client.get(url.clone()),
            PageRequest::Post { url, form } if form.is_empty() => self.client.post(url.clone()),
            PageRequest::Post { url, form } => self.client.post(url.clone()).form(form),
        };
        let body = http::send_text(builder.headers(self.headers.clone())).await?;

        if let Some(selector) = detect_error_page(&body, &self.config.error_selectors)? {
            return Err(PipelineError::transport(format!(
                "error page detected at {} (matched '{}')",
                request.url(),
                selector
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl Fetcher for PaginatedHtmlFetcher {
    fn kind(&self) -> &'static str {
        CODE
    }

    #[instrument(skip(self), fields(url = %self.config.url, max_pages = self.config.max_pages))]
    async fn fetch(&self) -> Result<RawData> {
        let mut rows: Vec<DomainData> = Vec::new();
        let mut state = CrawlState::FetchingPage {
            request: self.initial_request(),
            page: 1,
        };

        loop {
            state = match state {
                CrawlState::FetchingPage { request, page } => {
                    debug!(page, url = %request.url(), "Fetching page");
                    match self.fetch_page(&request, page).await {
                        Ok(body) => CrawlState::Extracting {
                            body,
                            url: request.url().clone(),
                            page,
                        },
                        Err(e) => CrawlState::Error(e),
                    }
                },
                CrawlState::Extracting { body, url, page } => {
                    match extract_page(&self.config, &body, &url, rows.len()) {
                        Ok(extracted) => {
                            info!(page, rows = extracted.rows.len(), "Extracted page rows");
                            rows.extend(extracted.rows);
                            CrawlState::CheckingNext {
                                next: extracted.next,
                                page,
                            }
                        },
                        Err(e) => CrawlState::Error(e),
                    }
                },
                CrawlState::CheckingNext { next, page } => match next {
                    Some(request) if page < self.config.max_pages => {
                        if !self.config.delay_between_pages.is_zero() {
                            tokio::time::sleep(self.config.delay_between_pages).await;
                        }
                        CrawlState::FetchingPage {
                            request,
                            page: page + 1,
                        }
                    },
                    Some(_) => {
                        warn!(page, "Page ceiling reached while more pages were advertised");
                        CrawlState::Done { pages: page }
                    },
                    None => CrawlState::Done { pages: page },
                },
                CrawlState::Done { pages } => {
                    info!(pages, records = rows.len(), "Paginated fetch completed");
                    return Ok(RawData::Rows(rows));
                },
                CrawlState::Error(e) => return Err(e),
            };
        }
    }

    fn parse(&self, raw: RawData) -> Result<ParsedData> {
        match raw {
            RawData::Rows(rows) => Ok(DomainData::List(rows)),
            RawData::Text(body) => {
                let extracted = extract_page(&self.config, &body, &self.config.url, 0)?;
                Ok(DomainData::List(extracted.rows))
            },
        }
    }

    fn normalize(&self, parsed: ParsedData) -> Result<DomainData> {
        if self.config.transformations.is_empty() {
            return Ok(parsed);
        }
        let DomainData::List(rows) = parsed else {
            return Ok(parsed);
        };

        let rows = rows
            .into_iter()
            .map(|row| match row {
                DomainData::Record(mut fields) => {
                    for (field, transform) in &self.config.transformations {
                        if let Some(DomainData::Json(Value::String(text))) = fields.get_mut(field) {
                            *text = transform.apply(text);
                        }
                    }
                    DomainData::Record(fields)
                },
                other => other,
            })
            .collect();
        Ok(DomainData::List(rows))
    }
}

impl CrawlConfig {
    fn check_selectors(&self) -> Result<()> {
        css(&self.rows_selector)?;
        let pagination = match &self.pagination {
            Pagination::Links { selectors } | Pagination::Form { selectors, .. } => selectors,
        };
        for selector in pagination
            .iter()
            .chain(&self.header_selectors)
            .chain(&self.error_selectors)
        {
            css(selector)?;
        }
        Ok(())
    }
}

fn seconds(params: &FetcherParams, key: &str, default: f64) -> Result<Duration> {
    let value = params.f64_or(key, default)?;
    Duration::try_from_secs_f64(value).map_err(|_| {
        PipelineError::configuration(format!("parameter '{}' must be a non-negative number", key))
    })
}

/// `delay * 2^attempt`
fn backoff(delay: Duration, attempt: u64) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16) as u32);
    delay.saturating_mul(factor)
}

/// First error selector present on the page, if any
fn detect_error_page(body: &str, selectors: &[String]) -> Result<Option<String>> {
    if selectors.is_empty() {
        return Ok(None);
    }
    let document = Html::parse_document(body);
    for selector in selectors {
        if document.select(&css(selector)?).next().is_some() {
            return Ok(Some(selector.clone()));
        }
    }
    Ok(None)
}

/// EXTRACTING: rows of one page plus the request for the next one
fn extract_page(
    config: &CrawlConfig,
    body: &str,
    page_url: &Url,
    row_offset: usize,
) -> Result<ExtractedPage> {
    let document = Html::parse_document(body);
    let rows_sel = css(&config.rows_selector)?;
    let cell_sel = css("td")?;
    let table_rows: Vec<ElementRef<'_>> = document.select(&rows_sel).collect();

    let mut headers: Vec<String> = Vec::new();
    let mut start = 0;
    if config.has_header {
        if let Some(header_row) = table_rows.first() {
            for selector in &config.header_selectors {
                headers = header_row
                    .select(&css(selector)?)
                    .map(|cell| element_text(&cell))
                    .collect();
                if !headers.is_empty() {
                    break;
                }
            }
            start = 1;
        }
    }

    let mut rows = Vec::new();
    for row in table_rows.iter().skip(start) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.is_empty() {
            continue;
        }

        let mut record = BTreeMap::new();
        for (i, cell) in cells.iter().enumerate() {
            let name = headers
                .get(i)
                .filter(|h| !h.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("column_{}", i));
            let mut text = element_text(cell);
            if config.clean_html {
                text = config.whitespace.replace_all(&text, " ").into_owned();
            }
            record.insert(name, DomainData::text(text));
        }

        if config.include_row_metadata {
            record.insert(
                "_row_index".to_string(),
                DomainData::Json(json!(row_offset + rows.len())),
            );
            record.insert(
                "_row_html".to_string(),
                DomainData::List(cells.iter().map(|c| DomainData::Markup(c.html())).collect()),
            );
        }
        rows.push(DomainData::Record(record));
    }

    let next = match &config.pagination {
        Pagination::Links { selectors } => next_link(&document, selectors, page_url)?,
        Pagination::Form {
            selectors,
            page_param,
        } => next_form(&document, selectors, page_param, page_url)?,
    };

    Ok(ExtractedPage { rows, next })
}

fn next_link(document: &Html, selectors: &[String], page_url: &Url) -> Result<Option<PageRequest>> {
    for selector in selectors {
        let href = document
            .select(&css(selector)?)
            .next()
            .and_then(|link| link.value().attr("href"))
            .filter(|href| !href.trim().is_empty());
        if let Some(href) = href {
            return Ok(Some(PageRequest::Get(page_url.join(href.trim())?)));
        }
    }
    Ok(None)
}

fn next_form(
    document: &Html,
    selectors: &[String],
    page_param: &str,
    page_url: &Url,
) -> Result<Option<PageRequest>> {
    let input_sel = css("input, select")?;
    for selector in selectors {
        let Some(form) = document.select(&css(selector)?).next() else {
            continue;
        };

        let mut fields: Vec<(String, String)> = form
            .select(&input_sel)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                Some((name.to_string(), input.value().attr("value").unwrap_or_default().to_string()))
            })
            .filter(|(name, _)| name != page_param)
            .collect();

        let current = form
            .select(&input_sel)
            .find(|input| input.value().attr("name") == Some(page_param))
            .and_then(|input| input.value().attr("value"))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(1);
        fields.push((page_param.to_string(), (current + 1).to_string()));

        let url = match form.value().attr("action").filter(|a| !a.trim().is_empty()) {
            Some(action) => page_url.join(action.trim())?,
            None => page_url.clone(),
        };
        return Ok(Some(PageRequest::Post { url, form: fields }));
    }
    Ok(None)
}
