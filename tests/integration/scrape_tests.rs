//! End-to-end scrape runs against a scripted connector

use crate::common::{MockConnector, TestEnv};
use malady_crawl::catalog::{retire_source, sync_catalog};
use malady_crawl::config::{load_config_with_hash, Options};
use malady_crawl::crawler::{cancel_job, Orchestrator, OrchestratorSettings};
use malady_crawl::storage::{
    self, AssociationMethod, ErrorDetail, JobCounters, NormalizedDocument, SourceRetirement,
    Storage,
};
use malady_crawl::{CrawlError, JobStatus, ScrapeRequest};
use chrono::{SubsecRound, Utc};
use serde_json::{json, Map};
use std::io::Write;
use std::sync::Arc;

fn search_request(disease_ids: Vec<i64>, terms: &[&str]) -> ScrapeRequest {
    ScrapeRequest {
        disease_ids,
        disease_terms: terms.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_search_source_counts_item_failures_and_completes() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");

    let mock = Arc::new(MockConnector::new().with_items(
        "diabetes",
        vec![
            json!({"id": "PMID-1", "title": "Insulin resistance"}),
            json!({"id": "PMID-2", "broken": true}),
            json!({"id": "PMID-3", "title": "Metformin outcomes"}),
        ],
    ));
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![diabetes], &["diabetes"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_found, 3);
    assert_eq!(outcome.documents_processed, 2);
    assert_eq!(outcome.errors, 1);
    assert_eq!(mock.searches(), vec!["diabetes"]);

    let store = env.store();
    assert_eq!(store.count_documents(Some(source_id)).unwrap(), 2);
    for external_id in ["PMID-1", "PMID-3"] {
        let doc = store
            .get_document_by_external_id(source_id, external_id)
            .unwrap()
            .unwrap();
        assert_eq!(store.document_disease_ids(doc.id).unwrap(), vec![diabetes]);
    }
    assert!(store
        .get_document_by_external_id(source_id, "PMID-2")
        .unwrap()
        .is_none());

    let job = store.get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.documents_found, 3);
    assert_eq!(job.counters.documents_processed, 2);
    assert_eq!(job.counters.errors, 1);
    assert_eq!(job.error_details.len(), 1);
    assert_eq!(job.error_details[0].context, "item:diabetes/PMID-2");
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(job.config["config_hash"], "test-hash");
    assert_eq!(job.config["disease_terms"], json!(["diabetes"]));

    let source = store.get_source(source_id).unwrap();
    assert!(source.last_crawled.is_some());
    assert_eq!(source.last_crawled_id, outcome.job_id);
}

#[tokio::test]
async fn test_disease_names_become_terms() {
    let env = TestEnv::new();
    let source_id = env.add_source("trials", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");
    let asthma = env.add_disease("Asthma");

    let mock = Arc::new(
        MockConnector::new()
            .with_items("Diabetes", vec![json!({"id": "NCT-1", "title": "A"})])
            .with_items("Asthma", vec![json!({"id": "NCT-2", "title": "B"})]),
    );
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![diabetes, asthma, 9999], &[]))
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(mock.searches(), vec!["Diabetes", "Asthma"]);

    // Each unit links only its own disease
    let store = env.store();
    let first = store.get_document_by_external_id(source_id, "NCT-1").unwrap().unwrap();
    let second = store.get_document_by_external_id(source_id, "NCT-2").unwrap().unwrap();
    assert_eq!(store.document_disease_ids(first.id).unwrap(), vec![diabetes]);
    assert_eq!(store.document_disease_ids(second.id).unwrap(), vec![asthma]);
}

#[tokio::test]
async fn test_rescrape_is_idempotent() {
    let env = TestEnv::new();
    let source_id = env.add_source("faers", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");

    let mock = Arc::new(MockConnector::new().with_items(
        "diabetes",
        vec![
            json!({"id": "R-1", "title": "Report 1", "updated_at": "2024-01-01T00:00:00Z"}),
            json!({"id": "R-2", "title": "Report 2", "updated_at": "2024-01-02T00:00:00Z"}),
        ],
    ));
    let orchestrator = env.orchestrator(mock.clone());

    for _ in 0..2 {
        let outcome = orchestrator
            .scrape(source_id, search_request(vec![diabetes], &["diabetes"]))
            .await
            .unwrap();
        assert_eq!(outcome.status, Some(JobStatus::Completed));
        assert_eq!(outcome.documents_processed, 2);
    }

    let store = env.store();
    assert_eq!(store.count_documents(Some(source_id)).unwrap(), 2);
    assert_eq!(store.count_document_links().unwrap(), 2);
    let doc = store.get_document_by_external_id(source_id, "R-1").unwrap().unwrap();
    assert_eq!(doc.update_count, 0);
}

#[tokio::test]
async fn test_document_versions_only_move_forward() {
    let env = TestEnv::new();
    let source_id = env.add_source("forum", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");

    let run = |title: &str, updated_at: &str| {
        let mock = Arc::new(MockConnector::new().with_items(
            "diabetes",
            vec![json!({"id": "T-1", "title": title, "updated_at": updated_at})],
        ));
        env.orchestrator(mock)
    };

    let request = || search_request(vec![diabetes], &["diabetes"]);

    run("First draft", "2024-01-01T00:00:00Z")
        .scrape(source_id, request())
        .await
        .unwrap();
    run("Edited", "2024-02-01T00:00:00Z")
        .scrape(source_id, request())
        .await
        .unwrap();
    run("Stale copy", "2023-06-01T00:00:00Z")
        .scrape(source_id, request())
        .await
        .unwrap();

    let store = env.store();
    let doc = store.get_document_by_external_id(source_id, "T-1").unwrap().unwrap();
    assert_eq!(doc.title, "Edited");
    assert_eq!(doc.update_count, 1);
    assert_eq!(doc.source_updated_at.to_rfc3339(), "2024-02-01T00:00:00+00:00");
}

#[tokio::test]
async fn test_document_found_again_gains_new_disease_link() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");
    let obesity = env.add_disease("Obesity");

    let shared = json!({"id": "PMID-9", "title": "Weight and glucose"});
    let mock = Arc::new(
        MockConnector::new()
            .with_items("Diabetes", vec![shared.clone()])
            .with_items("Obesity", vec![shared]),
    );
    let orchestrator = env.orchestrator(mock);

    orchestrator
        .scrape(source_id, search_request(vec![diabetes], &[]))
        .await
        .unwrap();
    orchestrator
        .scrape(source_id, search_request(vec![obesity], &[]))
        .await
        .unwrap();

    let store = env.store();
    assert_eq!(store.count_documents(Some(source_id)).unwrap(), 1);
    let doc = store.get_document_by_external_id(source_id, "PMID-9").unwrap().unwrap();
    assert_eq!(
        store.document_disease_ids(doc.id).unwrap(),
        vec![diabetes, obesity]
    );
}

#[tokio::test]
async fn test_linked_source_scrapes_wholesale_for_linked_diseases_only() {
    let env = TestEnv::new();
    let source_id = env.add_source("registry", "mock", AssociationMethod::Linked, Map::new());
    let diabetes = env.add_disease("Diabetes");
    let asthma = env.add_disease("Asthma");
    env.link(source_id, diabetes);

    let mock = Arc::new(
        MockConnector::new().with_items("*", vec![json!({"id": "REG-1", "title": "Entry"})]),
    );
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![diabetes, asthma], &[]))
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(mock.searches(), vec!["*"]);

    let store = env.store();
    let doc = store.get_document_by_external_id(source_id, "REG-1").unwrap().unwrap();
    assert_eq!(store.document_disease_ids(doc.id).unwrap(), vec![diabetes]);
}

#[tokio::test]
async fn test_linked_source_without_overlap_does_nothing() {
    let env = TestEnv::new();
    let source_id = env.add_source("registry", "mock", AssociationMethod::Linked, Map::new());
    let diabetes = env.add_disease("Diabetes");
    let asthma = env.add_disease("Asthma");
    env.link(source_id, diabetes);

    let mock = Arc::new(MockConnector::new());
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![asthma], &[]))
        .await
        .unwrap();

    assert_eq!(outcome.job_id, None);
    assert_eq!(outcome.status, None);
    assert!(mock.searches().is_empty());
    assert!(env.store().list_jobs_for_source(source_id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_search_source_without_terms_does_nothing() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());

    let orchestrator = env.orchestrator(Arc::new(MockConnector::new()));
    let outcome = orchestrator
        .scrape(source_id, ScrapeRequest::default())
        .await
        .unwrap();

    assert_eq!(outcome.job_id, None);
}

#[tokio::test]
async fn test_missing_inactive_and_unregistered_sources_are_rejected() {
    let env = TestEnv::new();
    let orchestrator = env.orchestrator(Arc::new(MockConnector::new()));
    let request = || search_request(vec![], &["diabetes"]);

    assert!(matches!(
        orchestrator.scrape(4242, request()).await,
        Err(CrawlError::SourceNotFound(4242))
    ));

    let unregistered =
        env.add_source("legacy", "soap_api", AssociationMethod::Search, Map::new());
    assert!(matches!(
        orchestrator.scrape(unregistered, request()).await,
        Err(CrawlError::UnknownConnector(kind)) if kind == "soap_api"
    ));

    let retired = env.add_source("old-forum", "mock", AssociationMethod::Search, Map::new());
    env.store()
        .insert_document(
            retired,
            &NormalizedDocument {
                external_id: "X".to_string(),
                title: "Kept".to_string(),
                ..Default::default()
            },
            Utc::now(),
            Utc::now(),
        )
        .unwrap();
    assert_eq!(
        retire_source(&env.storage, retired).unwrap(),
        SourceRetirement::Deactivated
    );
    assert!(matches!(
        orchestrator.scrape(retired, request()).await,
        Err(CrawlError::SourceInactive(id)) if id == retired
    ));
}

#[tokio::test]
async fn test_one_failing_unit_does_not_fail_the_job() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());

    let mock = Arc::new(
        MockConnector::new()
            .failing("asthma")
            .with_items("diabetes", vec![json!({"id": "D-1", "title": "Ok"})]),
    );
    let orchestrator = env.orchestrator(mock);

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![], &["asthma", "diabetes"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_processed, 1);
    assert_eq!(outcome.errors, 1);

    let job = env.store().get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.error_details[0].context, "search:asthma");
}

#[tokio::test]
async fn test_all_units_failing_fails_the_job() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());

    let mock = Arc::new(MockConnector::new().failing("asthma").failing("diabetes"));
    let orchestrator = env.orchestrator(mock);

    let result = orchestrator
        .scrape(source_id, search_request(vec![], &["asthma", "diabetes"]))
        .await;
    assert!(matches!(
        result,
        Err(CrawlError::AllUnitsFailed { units: 2, .. })
    ));

    let store = env.store();
    let jobs = store.list_jobs_for_source(source_id, 10).unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.counters.errors, 3);
    assert_eq!(job.error_details.last().unwrap().context, "fatal");

    // A failed run does not count as a successful crawl
    assert!(store.get_source(source_id).unwrap().last_crawled.is_none());
}

#[tokio::test]
async fn test_cancelled_job_stops_before_next_unit() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let job_id = env.store().create_job(source_id, &json!({})).unwrap();

    let storage = env.storage.clone();
    let mock = Arc::new(
        MockConnector::new()
            .with_items("alpha", vec![json!({"id": "A-1", "title": "Saved anyway"})])
            .with_items("beta", vec![json!({"id": "B-1", "title": "Never fetched"})])
            .on_search(move |term| {
                if term == "alpha" {
                    cancel_job(&storage, job_id).unwrap();
                }
            }),
    );
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(
            source_id,
            ScrapeRequest {
                disease_terms: vec!["alpha".to_string(), "beta".to_string()],
                job_id: Some(job_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.job_id, Some(job_id));
    assert_eq!(outcome.status, Some(JobStatus::Cancelled));
    assert_eq!(mock.searches(), vec!["alpha"]);

    let store = env.store();
    assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::Cancelled);
    assert!(store
        .get_document_by_external_id(source_id, "B-1")
        .unwrap()
        .is_none());
    assert!(store.get_source(source_id).unwrap().last_crawled.is_none());
}

#[tokio::test]
async fn test_job_failed_elsewhere_mid_run_stays_failed() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let job_id = env.store().create_job(source_id, &json!({})).unwrap();
    let failed_at = Utc::now().trunc_subsecs(0);

    let storage = env.storage.clone();
    let mock = Arc::new(
        MockConnector::new()
            .with_items(
                "alpha",
                vec![
                    json!({"id": "A-1", "title": "First"}),
                    json!({"id": "A-2", "title": "Second"}),
                ],
            )
            .with_items("beta", vec![json!({"id": "B-1", "title": "Never fetched"})])
            .on_search(move |term| {
                if term == "alpha" {
                    let detail = ErrorDetail::new("fatal", "job exceeded 120 minutes");
                    let applied = storage::lock(&storage)
                        .unwrap()
                        .finish_job(
                            job_id,
                            JobStatus::Failed,
                            failed_at,
                            JobCounters {
                                errors: 1,
                                ..Default::default()
                            },
                            &[detail],
                        )
                        .unwrap();
                    assert!(applied);
                }
            }),
    );
    let orchestrator = env.orchestrator(mock.clone());

    let outcome = orchestrator
        .scrape(
            source_id,
            ScrapeRequest {
                disease_terms: vec!["alpha".to_string(), "beta".to_string()],
                job_id: Some(job_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Failed));
    assert_eq!(mock.searches(), vec!["alpha"]);

    // Progress and completion writes after the forced failure are dropped
    let store = env.store();
    let job = store.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.completed_at, Some(failed_at));
    assert_eq!(
        job.counters,
        JobCounters {
            errors: 1,
            ..Default::default()
        }
    );
    assert_eq!(job.error_details.len(), 1);
    assert!(store.get_source(source_id).unwrap().last_crawled.is_none());
}

#[tokio::test]
async fn test_unknown_disease_ids_are_dropped_next_to_terms() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let diabetes = env.add_disease("Diabetes");

    let mock = Arc::new(MockConnector::new().with_items(
        "diabetes",
        vec![json!({"id": "PMID-9", "title": "Glycemic control"})],
    ));
    let orchestrator = env.orchestrator(mock);

    let outcome = orchestrator
        .scrape(source_id, search_request(vec![9999, diabetes], &["diabetes"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, Some(JobStatus::Completed));
    assert_eq!(outcome.documents_processed, 1);
    assert_eq!(outcome.errors, 0);

    let store = env.store();
    let doc = store
        .get_document_by_external_id(source_id, "PMID-9")
        .unwrap()
        .unwrap();
    assert_eq!(store.document_disease_ids(doc.id).unwrap(), vec![diabetes]);
    let job = store.get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.config["disease_ids"], json!([diabetes]));
}

#[tokio::test]
async fn test_adopted_job_keeps_its_options_under_runtime_ones() {
    let env = TestEnv::new();
    let source_id = env.add_source("pubmed", "mock", AssociationMethod::Search, Map::new());
    let job_id = env
        .store()
        .create_job(source_id, &json!({"options": {"page-size": 5, "sort": "date"}}))
        .unwrap();

    let orchestrator = env.orchestrator(Arc::new(MockConnector::new()));
    let mut options = Options::new();
    options.insert("sort".to_string(), json!("relevance"));

    let request = ScrapeRequest {
        disease_terms: vec!["diabetes".to_string()],
        options,
        job_id: Some(job_id),
        ..Default::default()
    };
    let outcome = orchestrator.scrape(source_id, request.clone()).await.unwrap();
    assert_eq!(outcome.status, Some(JobStatus::Completed));

    let job = env.store().get_job(job_id).unwrap();
    assert_eq!(
        job.config["options"],
        json!({"page-size": 5, "sort": "relevance"})
    );
    assert_eq!(job.config["association_method"], "search");

    // Completed jobs cannot be adopted again
    assert!(matches!(
        orchestrator.scrape(source_id, request).await,
        Err(CrawlError::JobNotAdoptable(id)) if id == job_id
    ));
}

#[tokio::test]
async fn test_incremental_scrape_starts_from_last_crawl() {
    let env = TestEnv::new();
    let source_id = env.add_source("faers", "mock", AssociationMethod::Search, Map::new());

    let mock = Arc::new(MockConnector::new());
    let orchestrator = env.orchestrator(mock.clone());
    let request = || search_request(vec![], &["diabetes"]);

    orchestrator
        .scrape_incremental(source_id, request())
        .await
        .unwrap();
    let first_crawl = env.store().get_source(source_id).unwrap().last_crawled;
    assert!(first_crawl.is_some());

    orchestrator
        .scrape_incremental(source_id, request())
        .await
        .unwrap();

    assert_eq!(mock.sinces(), vec![None, first_crawl]);
}

#[tokio::test]
async fn test_catalog_from_config_drives_a_scrape() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("catalog.db");
    let config_path = dir.path().join("malady.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    write!(
        file,
        r#"
[crawler]
progress-flush-every = 2

[user-agent]
crawler-name = "MaladyCrawl"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[storage]
database-path = "{}"

[[disease]]
name = "Diabetes"

[[disease]]
name = "Lupus"

[[source]]
name = "lupus-forum"
connector = "mock"
association-method = "linked"
linked-diseases = ["lupus"]
"#,
        db_path.display()
    )
    .unwrap();

    let (config, hash) = load_config_with_hash(&config_path).unwrap();
    let storage = malady_crawl::storage::open_storage(&db_path).unwrap();
    let summary = sync_catalog(&storage, &config).unwrap();
    assert_eq!(summary.diseases, 2);
    assert_eq!(summary.links, 1);

    let (source_id, lupus) = {
        let store = storage.lock().unwrap();
        let source = store.get_source_by_name("lupus-forum").unwrap().unwrap();
        let lupus = store.find_diseases_by_names(&["Lupus".to_string()]).unwrap()[0].id;
        (source.id, lupus)
    };

    let registry = malady_crawl::ConnectorRegistry::new().with(Arc::new(
        MockConnector::new().with_items("*", vec![json!({"id": "P-1", "title": "Flare diary"})]),
    ));
    let orchestrator = Orchestrator::new(
        storage.clone(),
        Arc::new(registry),
        OrchestratorSettings::from_config(&config.crawler, Some(hash.clone())),
    );

    let outcome = orchestrator
        .scrape(source_id, ScrapeRequest::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, Some(JobStatus::Completed));

    let store = storage.lock().unwrap();
    let job = store.get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.config["config_hash"], hash);
    let doc = store.get_document_by_external_id(source_id, "P-1").unwrap().unwrap();
    assert_eq!(store.document_disease_ids(doc.id).unwrap(), vec![lupus]);
}
