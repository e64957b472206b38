//! Fetcher registry
//!
//! Resources store a fetcher type code (`REST`, `PAGINATED_HTML`, ...). The
//! registry maps that code to a constructor and a descriptor. It is built once
//! at start-up and shared by reference; adding a source type means writing a
//! [`Fetcher`] implementation and one [`FetcherRegistry::register`] call.

use std::collections::HashMap;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::fetchers::{
    CsvFetcher, Fetcher, FetcherDescriptor, FetcherParams, HtmlFetcher, PaginatedHtmlFetcher,
    RestFetcher,
};

/// Builds a fetcher from validated parameters
pub type FetcherConstructor = fn(FetcherParams) -> Result<Box<dyn Fetcher>>;

#[derive(Clone)]
struct Entry {
    constructor: FetcherConstructor,
    descriptor: FetcherDescriptor,
}

#[derive(Clone, Default)]
pub struct FetcherRegistry {
    entries: HashMap<String, Entry>,
}

impl FetcherRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every compiled-in fetcher
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(RestFetcher::descriptor(), RestFetcher::boxed);
        registry.register(HtmlFetcher::descriptor(), HtmlFetcher::boxed);
        registry.register(PaginatedHtmlFetcher::descriptor(), PaginatedHtmlFetcher::boxed);
        registry.register(CsvFetcher::descriptor(), CsvFetcher::boxed);
        registry
    }

    /// Add or replace the entry for `descriptor.code`
    pub fn register(&mut self, descriptor: FetcherDescriptor, constructor: FetcherConstructor) {
        let code = normalize_code(&descriptor.code);
        if self.entries.contains_key(&code) {
            debug!(%code, "Replacing registered fetcher");
        }
        self.entries.insert(
            code,
            Entry {
                constructor,
                descriptor,
            },
        );
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(&normalize_code(code))
    }

    /// Constructor registered for `code`
    pub fn resolve(&self, code: &str) -> Result<FetcherConstructor> {
        self.entry(code).map(|e| e.constructor)
    }

    pub fn descriptor(&self, code: &str) -> Result<&FetcherDescriptor> {
        self.entry(code).map(|e| &e.descriptor)
    }

    /// Validate `params` against the descriptor, then construct
    pub fn build(&self, code: &str, params: &FetcherParams) -> Result<Box<dyn Fetcher>> {
        let entry = self.entry(code)?;
        let validated = entry.descriptor.validate(params)?;
        (entry.constructor)(validated)
    }

    /// All descriptors sorted by code
    pub fn descriptors(&self) -> Vec<&FetcherDescriptor> {
        let mut descriptors: Vec<_> = self.entries.values().map(|e| &e.descriptor).collect();
        descriptors.sort_by(|a, b| a.code.cmp(&b.code));
        descriptors
    }

    fn entry(&self, code: &str) -> Result<&Entry> {
        self.entries
            .get(&normalize_code(code))
            .ok_or_else(|| PipelineError::UnknownFetcherType(code.to_string()))
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fetchers::{DomainData, ParsedData, RawData};
    use async_trait::async_trait;

    struct Fixed;

    #[async_trait]
    impl Fetcher for Fixed {
        fn kind(&self) -> &'static str {
            "FIXED"
        }

        async fn fetch(&self) -> Result<RawData> {
            Ok(RawData::Rows(vec![DomainData::text("v1")]))
        }

        fn parse(&self, raw: RawData) -> Result<ParsedData> {
            match raw {
                RawData::Rows(rows) => Ok(DomainData::List(rows)),
                RawData::Text(t) => Ok(DomainData::text(t)),
            }
        }
    }

    struct FixedV2;

    #[async_trait]
    impl Fetcher for FixedV2 {
        fn kind(&self) -> &'static str {
            "FIXED_V2"
        }

        async fn fetch(&self) -> Result<RawData> {
            Ok(RawData::Text("v2".into()))
        }

        fn parse(&self, raw: RawData) -> Result<ParsedData> {
            match raw {
                RawData::Text(t) => Ok(DomainData::text(t)),
                RawData::Rows(rows) => Ok(DomainData::List(rows)),
            }
        }
    }

    fn fixed_descriptor() -> FetcherDescriptor {
        FetcherDescriptor::new("fixed", "Fixed", "test", vec![])
    }

    #[test]
    fn test_builtin_codes() {
        let registry = FetcherRegistry::with_builtin();
        let codes: Vec<_> = registry.descriptors().iter().map(|d| d.code.clone()).collect();
        assert_eq!(codes, vec!["CSV", "HTML", "PAGINATED_HTML", "REST"]);
        assert!(registry.contains("rest"));
    }

    #[test]
    fn test_unknown_type() {
        let registry = FetcherRegistry::with_builtin();
        assert!(matches!(
            registry.resolve("FTP"),
            Err(PipelineError::UnknownFetcherType(code)) if code == "FTP"
        ));
    }

    #[test]
    fn test_build_validates_before_constructing() {
        let registry = FetcherRegistry::with_builtin();
        let err = registry.build("REST", &FetcherParams::new()).err().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));

        let fetcher = registry
            .build("REST", &FetcherParams::new().with("url", "http://localhost/x"))
            .unwrap();
        assert_eq!(fetcher.kind(), "REST");
    }

    #[tokio::test]
    async fn test_register_is_last_write_wins() {
        let mut registry = FetcherRegistry::new();
        registry.register(fixed_descriptor(), |_| Ok(Box::new(Fixed) as Box<dyn Fetcher>));
        registry.register(fixed_descriptor(), |_| Ok(Box::new(Fixed) as Box<dyn Fetcher>));
        assert_eq!(registry.descriptors().len(), 1);

        registry.register(fixed_descriptor(), |_| Ok(Box::new(FixedV2) as Box<dyn Fetcher>));
        let fetcher = registry.build("FIXED", &FetcherParams::new()).unwrap();
        let out = crate::fetchers::run_pipeline(fetcher.as_ref()).await.unwrap();
        assert_eq!(out, DomainData::text("v2"));
    }
}
