//! The JSON API connector against a mock HTTP server
//!
//! These tests exercise the full path from paged HTTP responses through the
//! per-term cursor to stored documents.

use crate::common::TestEnv;
use malady_crawl::config::UserAgentConfig;
use malady_crawl::connector::{build_http_client, JsonApiConnector};
use malady_crawl::crawler::CursorStore;
use malady_crawl::storage::{AssociationMethod, Storage};
use malady_crawl::{CrawlError, CursorPhase, JobStatus, ScrapeRequest};
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn connector() -> Arc<JsonApiConnector> {
    let client = build_http_client(&UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    })
    .expect("Failed to build client");
    Arc::new(JsonApiConnector::new(client))
}

fn source_config(server: &MockServer, extra: Value) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert(
        "base-url".to_string(),
        json!(format!("{}/search", server.uri())),
    );
    config.insert("items-pointer".to_string(), json!("/results"));
    config.insert("page-size".to_string(), json!(2));
    if let Value::Object(extra) = extra {
        config.extend(extra);
    }
    config
}

fn item(id: &str, updated_at: &str) -> Value {
    json!({"id": id, "title": format!("Study {}", id), "updated_at": updated_at})
}

fn page(items: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "results": items }))
}

fn diabetes_request() -> ScrapeRequest {
    ScrapeRequest {
        disease_terms: vec!["diabetes".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_backfill_pages_until_short_page_then_tails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "diabetes"))
        .and(query_param("offset", "0"))
        .respond_with(page(vec![
            item("A", "2024-01-01T00:00:00Z"),
            item("B", "2024-01-03T00:00:00Z"),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(page(vec![item("C", "2024-01-02T00:00:00Z")]))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let source_id = env.add_source(
        "pubmed",
        "json_api",
        AssociationMethod::Search,
        source_config(&server, json!({})),
    );
    let orchestrator = env.orchestrator(connector());

    let outcome = orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_found, 3);
    assert_eq!(outcome.documents_processed, 3);
    assert_eq!(env.store().count_documents(Some(source_id)).unwrap(), 3);

    let cursors = CursorStore::new(env.storage.clone(), source_id);
    assert_eq!(
        cursors.phase("diabetes").unwrap(),
        CursorPhase::Tailing {
            newest_seen: Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
        }
    );

    // Once exhausted, runs ask only for what changed after the newest item seen
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "0"))
        .and(query_param("since", "2024-01-03T00:00:00Z"))
        .respond_with(page(vec![json!({
            "id": "A",
            "title": "Study A, revised",
            "updated_at": "2024-01-05T00:00:00Z"
        })]))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_processed, 1);

    let store = env.store();
    assert_eq!(store.count_documents(Some(source_id)).unwrap(), 3);
    let revised = store.get_document_by_external_id(source_id, "A").unwrap().unwrap();
    assert_eq!(revised.title, "Study A, revised");
    assert_eq!(revised.update_count, 1);
}

#[tokio::test]
async fn test_backfill_resumes_from_saved_offset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "0"))
        .respond_with(page(vec![
            item("A", "2024-01-01T00:00:00Z"),
            item("B", "2024-01-02T00:00:00Z"),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(page(vec![
            item("C", "2024-01-03T00:00:00Z"),
            item("D", "2024-01-04T00:00:00Z"),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let source_id = env.add_source(
        "trials",
        "json_api",
        AssociationMethod::Search,
        source_config(&server, json!({"max-pages": 1})),
    );
    let orchestrator = env.orchestrator(connector());
    let cursors = CursorStore::new(env.storage.clone(), source_id);

    orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert!(matches!(
        cursors.phase("diabetes").unwrap(),
        CursorPhase::Backfilling { offset: 2, .. }
    ));

    orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert!(matches!(
        cursors.phase("diabetes").unwrap(),
        CursorPhase::Backfilling { offset: 4, .. }
    ));
    assert_eq!(env.store().count_documents(Some(source_id)).unwrap(), 4);
}

#[tokio::test]
async fn test_failure_on_later_page_keeps_earlier_pages_for_next_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "0"))
        .respond_with(page(vec![
            item("A", "2024-01-01T00:00:00Z"),
            item("B", "2024-01-02T00:00:00Z"),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let source_id = env.add_source(
        "pubmed",
        "json_api",
        AssociationMethod::Search,
        source_config(&server, json!({})),
    );
    let orchestrator = env.orchestrator(connector());
    let cursors = CursorStore::new(env.storage.clone(), source_id);

    let result = orchestrator.scrape(source_id, diabetes_request()).await;
    assert!(matches!(result, Err(CrawlError::AllUnitsFailed { .. })));
    assert_eq!(cursors.phase("diabetes").unwrap(), CursorPhase::new());

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "0"))
        .respond_with(page(vec![
            item("A", "2024-01-01T00:00:00Z"),
            item("B", "2024-01-02T00:00:00Z"),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(page(vec![]))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_processed, 2);

    let store = env.store();
    assert!(store.get_document_by_external_id(source_id, "A").unwrap().is_some());
    assert!(store.get_document_by_external_id(source_id, "B").unwrap().is_some());
    drop(store);
    assert_eq!(
        cursors.phase("diabetes").unwrap(),
        CursorPhase::Tailing {
            newest_seen: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        }
    );
}

#[tokio::test]
async fn test_detail_fetch_replaces_search_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(page(vec![json!({"id": "NCT-7", "title": "Short"})]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/detail/NCT-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "record": {
                "id": "NCT-7",
                "title": "Full trial title",
                "content": "Eligibility and outcomes",
                "updated_at": "2024-03-01"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let detail_url = format!("{}/detail/{{id}}", server.uri());
    let source_id = env.add_source(
        "trials",
        "json_api",
        AssociationMethod::Search,
        source_config(
            &server,
            json!({"detail-url": detail_url, "detail-pointer": "/record"}),
        ),
    );
    let orchestrator = env.orchestrator(connector());

    let outcome = orchestrator.scrape(source_id, diabetes_request()).await.unwrap();
    assert_eq!(outcome.documents_processed, 1);

    let store = env.store();
    let doc = store.get_document_by_external_id(source_id, "NCT-7").unwrap().unwrap();
    assert_eq!(doc.title, "Full trial title");
    assert_eq!(doc.content.as_deref(), Some("Eligibility and outcomes"));
    assert_eq!(
        doc.source_updated_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_runtime_options_override_source_config() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("limit", "50"))
        .respond_with(page(vec![item("A", "2024-01-01T00:00:00Z")]))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let source_id = env.add_source(
        "pubmed",
        "json_api",
        AssociationMethod::Search,
        source_config(&server, json!({})),
    );
    let orchestrator = env.orchestrator(connector());

    let mut request = diabetes_request();
    request.options.insert("page-size".to_string(), json!(50));
    let outcome = orchestrator.scrape(source_id, request).await.unwrap();
    assert_eq!(outcome.documents_processed, 1);
}

#[tokio::test]
async fn test_server_errors_fail_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let source_id = env.add_source(
        "faers",
        "json_api",
        AssociationMethod::Search,
        source_config(&server, json!({})),
    );
    let orchestrator = env.orchestrator(connector());

    let result = orchestrator.scrape(source_id, diabetes_request()).await;
    match result {
        Err(CrawlError::AllUnitsFailed { units, last_error }) => {
            assert_eq!(units, 1);
            assert!(last_error.contains("503"));
        }
        other => panic!("expected AllUnitsFailed, got {:?}", other),
    }

    let store = env.store();
    let job = &store.list_jobs_for_source(source_id, 1).unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);

    // Nothing was consumed, so the next run starts from the beginning
    let cursors = CursorStore::new(env.storage.clone(), source_id);
    drop(store);
    assert!(matches!(
        cursors.phase("diabetes").unwrap(),
        CursorPhase::Backfilling { offset: 0, .. }
    ));
}
