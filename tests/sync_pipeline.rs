//! End-to-end pipeline tests against an in-process mock upstream.
//!
//! The mock serves the upstream works listing (paginated, DRF-style
//! envelope) plus the signed asset URLs those records point at. Object
//! storage is in-memory and counts uploads, so relocation idempotence is
//! directly observable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use collection_mirror::archive::ArchiveStore;
use collection_mirror::config::UpstreamConfig;
use collection_mirror::index::{FtsIndex, SearchIndex, SearchQuery};
use collection_mirror::models::Work;
use collection_mirror::relocate::AssetRelocator;
use collection_mirror::store::{MemoryStore, ObjectStore};
use collection_mirror::sync::Syncer;
use collection_mirror::upstream::{SyncMode, UpstreamClient};

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn list_works(
    State(pages): State<Arc<Vec<Value>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    Json(pages[page - 1].clone())
}

async fn serve_asset(AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    (
        [("content-type", "image/jpeg")],
        format!("bytes-of-{}", id).into_bytes(),
    )
}

async fn expired_asset() -> StatusCode {
    StatusCode::FORBIDDEN
}

async fn get_work(
    State(pages): State<Arc<Vec<Value>>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    for page in pages.iter() {
        if let Some(results) = page["results"].as_array() {
            for record in results {
                if record["id"] == id {
                    return Json(record.clone()).into_response();
                }
            }
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Mock upstream serving the given listing pages and signed asset URLs
/// under `/signed/{id}`. Returns its base URL.
async fn spawn_upstream(pages: Vec<Value>) -> String {
    let app = Router::new()
        .route("/works/", get(list_works))
        .route("/works/{id}/", get(get_work))
        .route("/signed/{id}", get(serve_asset))
        .route("/expired/{id}", get(expired_asset))
        .with_state(Arc::new(pages));
    spawn(app).await
}

fn upstream_config(base: &str) -> UpstreamConfig {
    UpstreamConfig {
        endpoint: base.to_string(),
        page_size: 2,
        timeout_secs: 10,
        max_retries: 2,
        backoff_base_ms: 10,
    }
}

struct Harness {
    upstream: String,
    store: Arc<MemoryStore>,
    archive_dir: TempDir,
    index: Arc<FtsIndex>,
}

impl Harness {
    async fn new(pages: Vec<Value>) -> Self {
        Self {
            upstream: spawn_upstream(pages).await,
            store: Arc::new(MemoryStore::new("https://public-bucket")),
            archive_dir: TempDir::new().unwrap(),
            index: Arc::new(FtsIndex::in_memory().await.unwrap()),
        }
    }

    fn syncer(&self) -> Syncer {
        let relocator = AssetRelocator::new(
            self.store.clone() as Arc<dyn ObjectStore>,
            Duration::from_secs(10),
        );
        Syncer::new(
            UpstreamClient::new(&upstream_config(&self.upstream)).unwrap(),
            Arc::new(relocator),
            ArchiveStore::new(self.archive_dir.path()).unwrap(),
            self.index.clone(),
            2,
        )
    }

    fn archive(&self) -> ArchiveStore {
        ArchiveStore::new(self.archive_dir.path()).unwrap()
    }

    async fn search_count(&self, q: &str) -> u64 {
        self.index
            .search(&SearchQuery {
                query: q.to_string(),
                field: None,
                page: 1,
                page_size: 20,
            })
            .await
            .unwrap()
            .count
    }
}

fn archived_work(id: i64, title: &str, modified: &str) -> Work {
    Work {
        id,
        title: title.to_string(),
        description: format!("About {}", title),
        record_type: "film".to_string(),
        creators: Vec::new(),
        production_dates: Vec::new(),
        assets: Vec::new(),
        source: None,
        source_identifier: None,
        date_modified: modified.parse().unwrap(),
        unpublished: false,
    }
}

fn record(id: i64, title: &str, modified: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "description": format!("About {}", title),
        "record_type": "film",
        "creators": [{"name": "George Miller", "role": "director"}],
        "production_dates": ["1979"],
        "assets": [],
        "date_modified": modified,
        "unpublished": false,
    })
}

fn two_page_listing(asset_base: &str) -> Vec<Value> {
    let mut work2 = record(2, "Mad Max", "2024-05-02T00:00:00Z");
    work2["assets"] = json!([{
        "kind": "image",
        "asset_id": "img-2",
        "url": format!("{}/signed/img-2?sig=abc&expires=1", asset_base),
    }]);
    let mut hidden = record(4, "Internal Only", "2024-05-04T00:00:00Z");
    hidden["unpublished"] = json!(true);

    vec![
        json!({
            "count": 4,
            "next": "http://upstream.internal/works/?page=2&page_size=2",
            "previous": null,
            "results": [record(1, "The Castle", "2024-05-01T00:00:00Z"), work2],
        }),
        json!({
            "count": 4,
            "next": null,
            "previous": "http://upstream.internal/works/?page=1&page_size=2",
            "results": [record(3, "Dogs in Space", "2024-05-03T00:00:00Z"), hidden],
        }),
    ]
}

#[tokio::test]
async fn full_run_archives_relocates_and_indexes() {
    // The asset URL embeds the upstream's own address, so spin the server
    // up first with a placeholder page set, then point a second one at it.
    let asset_host = spawn_upstream(Vec::new()).await;
    let harness = Harness::new(two_page_listing(&asset_host)).await;

    let report = harness.syncer().run(SyncMode::Incremental, None).await.unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.fetched, 4);
    assert_eq!(report.created, 3);
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 0);
    assert_eq!(report.skipped_records, 0);
    assert_eq!(report.asset_failures, 0);
    assert_eq!(report.indexed, 3);

    let archive = harness.archive();
    assert_eq!(archive.list_ids().unwrap(), vec![1, 2, 3]);

    // The signed URL never survives; the public URL is content-addressed.
    let work2 = archive.read(2).unwrap().unwrap();
    assert_eq!(work2.assets[0].url, "https://public-bucket/assets/img-2");
    assert!(work2.assets[0].available);
    assert_eq!(
        harness.store.get("assets/img-2").unwrap(),
        b"bytes-of-img-2"
    );
    assert_eq!(harness.store.put_count(), 1);

    // Never-published records leave no trace.
    assert!(archive.read(4).unwrap().is_none());
    assert_eq!(harness.search_count("internal").await, 0);

    assert_eq!(harness.search_count("mad").await, 1);

    let watermark = archive.load_watermark().unwrap().unwrap();
    assert_eq!(
        watermark.last_synced.to_rfc3339(),
        "2024-05-03T00:00:00+00:00"
    );
}

#[tokio::test]
async fn rerun_with_no_changes_is_a_no_op() {
    let asset_host = spawn_upstream(Vec::new()).await;
    let harness = Harness::new(two_page_listing(&asset_host)).await;

    harness.syncer().run(SyncMode::Incremental, None).await.unwrap();
    assert_eq!(harness.store.put_count(), 1);

    let report = harness.syncer().run(SyncMode::Incremental, None).await.unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 3);
    // No re-download, no re-upload, no re-index.
    assert_eq!(harness.store.put_count(), 1);
    assert_eq!(report.indexed, 0);
}

#[tokio::test]
async fn unpublishing_a_work_tombstones_it() {
    let published = vec![json!({
        "count": 1,
        "next": null,
        "previous": null,
        "results": [record(7, "Storm Boy", "2024-05-01T00:00:00Z")],
    })];
    let harness = Harness::new(published).await;
    harness.syncer().run(SyncMode::Incremental, None).await.unwrap();
    assert_eq!(harness.search_count("storm").await, 1);

    // Same archive and index, new upstream where the work is withdrawn.
    let mut withdrawn = record(7, "Storm Boy", "2024-05-05T00:00:00Z");
    withdrawn["unpublished"] = json!(true);
    let upstream = spawn_upstream(vec![json!({
        "count": 1,
        "next": null,
        "previous": null,
        "results": [withdrawn],
    })])
    .await;
    let relocator = AssetRelocator::new(
        harness.store.clone() as Arc<dyn ObjectStore>,
        Duration::from_secs(10),
    );
    let syncer = Syncer::new(
        UpstreamClient::new(&upstream_config(&upstream)).unwrap(),
        Arc::new(relocator),
        harness.archive(),
        harness.index.clone(),
        2,
    );
    let report = syncer.run(SyncMode::Full, None).await.unwrap();

    assert_eq!(report.tombstoned, 1);
    let archive = harness.archive();
    // Tombstoned, never deleted.
    assert_eq!(archive.list_ids().unwrap(), vec![7]);
    assert!(archive.read(7).unwrap().unwrap().unpublished);
    assert!(archive.list_published().unwrap().is_empty());
    assert_eq!(harness.search_count("storm").await, 0);
}

#[tokio::test]
async fn failed_relocation_archives_the_work_without_the_asset() {
    let asset_host = spawn_upstream(Vec::new()).await;
    let mut work = record(9, "Walkabout", "2024-05-01T00:00:00Z");
    work["assets"] = json!([{
        "kind": "video",
        "asset_id": "vid-9",
        "url": format!("{}/expired/vid-9?sig=old", asset_host),
    }]);
    let harness = Harness::new(vec![json!({
        "count": 1,
        "next": null,
        "previous": null,
        "results": [work],
    })])
    .await;

    let report = harness.syncer().run(SyncMode::Incremental, None).await.unwrap();

    assert_eq!(report.asset_failures, 1);
    assert_eq!(report.created, 1);

    let archived = harness.archive().read(9).unwrap().unwrap();
    assert_eq!(archived.assets.len(), 1);
    assert!(!archived.assets[0].available);
    assert_eq!(archived.assets[0].url, "");
    assert_eq!(harness.store.put_count(), 0);
    // The record is still findable.
    assert_eq!(harness.search_count("walkabout").await, 1);
}

#[tokio::test]
async fn reindex_rebuilds_from_archive_alone() {
    let asset_host = spawn_upstream(Vec::new()).await;
    let harness = Harness::new(two_page_listing(&asset_host)).await;
    harness.syncer().run(SyncMode::Incremental, None).await.unwrap();

    // A lost index is rebuilt from archive entries only.
    let fresh = FtsIndex::in_memory().await.unwrap();
    let indexed = collection_mirror::index::rebuild(&fresh, &harness.archive())
        .await
        .unwrap();
    assert_eq!(indexed, 3);

    let results = fresh
        .search(&SearchQuery {
            query: "castle".to_string(),
            field: None,
            page: 1,
            page_size: 20,
        })
        .await
        .unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].id, 1);
}

#[tokio::test]
async fn resume_indexes_archived_but_unindexed_works() {
    let pages = vec![json!({
        "count": 1,
        "next": null,
        "previous": null,
        "results": [record(7, "Storm Boy", "2024-05-05T00:00:00Z")],
    })];
    let harness = Harness::new(pages).await;

    // A run that died after archiving page N but before indexing it
    // leaves the entry on disk and nothing in the index.
    harness
        .archive()
        .write(&archived_work(7, "Storm Boy", "2024-05-05T00:00:00Z"))
        .unwrap();
    assert_eq!(harness.search_count("storm").await, 0);

    let report = harness.syncer().run(SyncMode::Incremental, None).await.unwrap();

    // Timestamps are equal, so the diff says unchanged, but the resume
    // still repairs the index before the watermark moves past the work.
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.created, 0);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.index_failures, 0);
    assert_eq!(harness.store.put_count(), 0);
    assert_eq!(harness.search_count("storm").await, 1);

    let watermark = harness.archive().load_watermark().unwrap().unwrap();
    assert_eq!(
        watermark.last_synced.to_rfc3339(),
        "2024-05-05T00:00:00+00:00"
    );
}

#[tokio::test]
async fn refresh_republishes_one_record() {
    let asset_host = spawn_upstream(Vec::new()).await;
    let mut work = record(7, "Storm Boy", "2024-05-01T00:00:00Z");
    work["assets"] = json!([{
        "kind": "image",
        "asset_id": "img-7",
        "url": format!("{}/signed/img-7?sig=abc", asset_host),
    }]);
    let harness = Harness::new(vec![json!({
        "count": 1,
        "next": null,
        "previous": null,
        "results": [work],
    })])
    .await;

    let published = harness.syncer().refresh(7).await.unwrap().unwrap();

    assert_eq!(published.title, "Storm Boy");
    assert_eq!(published.assets[0].url, "https://public-bucket/assets/img-7");
    assert_eq!(harness.archive().list_ids().unwrap(), vec![7]);
    assert_eq!(harness.store.put_count(), 1);
    assert_eq!(harness.search_count("storm").await, 1);
}

#[tokio::test]
async fn refresh_of_an_unpublished_id_tombstones_any_local_entry() {
    let harness = Harness::new(vec![json!({
        "count": 0,
        "next": null,
        "previous": null,
        "results": [],
    })])
    .await;

    // Nothing local and upstream 404: a no-op.
    assert!(harness.syncer().refresh(999).await.unwrap().is_none());
    assert!(harness.archive().read(999).unwrap().is_none());

    // Locally published but gone upstream: tombstoned and de-indexed.
    let gone = archived_work(8, "Gone Girl", "2024-05-01T00:00:00Z");
    harness.archive().write(&gone).unwrap();
    harness.index.index(&gone).await.unwrap();
    assert_eq!(harness.search_count("gone").await, 1);

    assert!(harness.syncer().refresh(8).await.unwrap().is_none());
    assert!(harness.archive().read(8).unwrap().unwrap().unpublished);
    assert_eq!(harness.search_count("gone").await, 0);
}

#[tokio::test]
async fn concurrent_syncs_are_rejected() {
    let harness = Harness::new(vec![json!({
        "count": 0,
        "next": null,
        "previous": null,
        "results": [],
    })])
    .await;

    let archive = harness.archive();
    let _lock = archive.lock().unwrap();

    let err = harness
        .syncer()
        .run(SyncMode::Incremental, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running"));
}
