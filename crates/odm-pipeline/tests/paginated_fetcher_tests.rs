//! Paginated HTML crawls against a mock site

use odm_pipeline::fetchers::{run_pipeline, DomainData, FetcherParams, PaginatedHtmlFetcher};
use odm_pipeline::PipelineError;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn results_page(rows: &[(&str, &str)], next: Option<&str>) -> String {
    let mut html = String::from("<html><body><table id=\"results\"><tr><th>Name</th><th>City</th></tr>");
    for (name, city) in rows {
        html.push_str(&format!("<tr><td>{}</td><td>{}</td></tr>", name, city));
    }
    html.push_str("</table>");
    if let Some(href) = next {
        html.push_str(&format!("<a class=\"next\" href=\"{}\">Siguiente</a>", href));
    }
    html.push_str("</body></html>");
    html
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

fn params(server: &MockServer) -> FetcherParams {
    FetcherParams::new()
        .with("url", format!("{}/search", server.uri()))
        .with("rows_selector", "table#results tr")
        .with("next_page_selector", json!(["a.next"]))
        .with("delay_between_pages", 0)
        .with("retry_delay", 0)
}

fn rows(data: DomainData) -> Vec<DomainData> {
    match data {
        DomainData::List(rows) => rows,
        other => panic!("expected a list of rows, got {:?}", other),
    }
}

fn name_of(row: &DomainData) -> String {
    match row {
        DomainData::Record(fields) => match fields.get("Name") {
            Some(DomainData::Json(serde_json::Value::String(s))) => s.clone(),
            other => panic!("unexpected Name field: {:?}", other),
        },
        other => panic!("expected record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_follows_links_until_last_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("page", "2"))
        .respond_with(html(results_page(&[("Teatro", "Cádiz")], None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(results_page(
            &[("Museo", "Madrid"), ("Catedral", "Burgos")],
            Some("/search?page=2"),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = PaginatedHtmlFetcher::new(params(&server)).expect("valid params");
    let rows = rows(run_pipeline(&fetcher).await.expect("crawl should succeed"));

    let names: Vec<String> = rows.iter().map(name_of).collect();
    assert_eq!(names, vec!["Museo", "Catedral", "Teatro"]);
}

#[tokio::test]
async fn test_max_pages_bounds_requests() {
    let server = MockServer::start().await;
    // every page advertises another one
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(results_page(&[("Fila", "X")], Some("/search?page=next"))))
        .expect(3)
        .mount(&server)
        .await;

    let fetcher =
        PaginatedHtmlFetcher::new(params(&server).with("max_pages", 3)).expect("valid params");
    let rows = rows(run_pipeline(&fetcher).await.expect("crawl should succeed"));
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_retries_server_error_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(results_page(&[("Museo", "Madrid")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher =
        PaginatedHtmlFetcher::new(params(&server).with("max_retries", 2)).expect("valid params");
    let rows = rows(run_pipeline(&fetcher).await.expect("crawl should recover"));
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher =
        PaginatedHtmlFetcher::new(params(&server).with("max_retries", 1)).expect("valid params");
    let err = run_pipeline(&fetcher).await.unwrap_err();
    assert!(matches!(err, PipelineError::Transport(_)), "{:?}", err);
}

#[tokio::test]
async fn test_error_page_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(
            "<html><body><div class=\"error\">Servicio no disponible</div></body></html>".into(),
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(results_page(&[("Museo", "Madrid")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = PaginatedHtmlFetcher::new(
        params(&server)
            .with("error_selectors", json!(["div.error"]))
            .with("max_retries", 1),
    )
    .expect("valid params");
    let rows = rows(run_pipeline(&fetcher).await.expect("crawl should recover"));
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_form_pagination_posts_next_page() {
    let server = MockServer::start().await;
    let first = format!(
        "{}{}",
        results_page(&[("Museo", "Madrid")], None),
        r#"<form id="next" action="/buscar">
             <input type="hidden" name="q" value="museo">
             <input type="hidden" name="pagina" value="1">
           </form>"#
    );
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html(first))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/buscar"))
        .and(body_string_contains("pagina=2"))
        .and(body_string_contains("q=museo"))
        .respond_with(html(results_page(&[("Archivo", "Sevilla")], None)))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = PaginatedHtmlFetcher::new(
        params(&server)
            .with("pagination_type", "form")
            .with("next_form_selector", json!(["form#next"])),
    )
    .expect("valid params");
    let rows = rows(run_pipeline(&fetcher).await.expect("crawl should succeed"));

    let names: Vec<String> = rows.iter().map(name_of).collect();
    assert_eq!(names, vec!["Museo", "Archivo"]);
}
