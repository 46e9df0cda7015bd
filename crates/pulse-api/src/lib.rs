//! Axum JSON surface over the store and pipeline. Read paths only touch
//! the store; ingest and backfill are explicit trigger endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use pulse_core::{Record, SentimentLabel};
use pulse_pipeline::{Ingestor, LabelBackfiller};
use pulse_store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pulse-api";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ingestor: Arc<Ingestor>,
    pub backfiller: Arc<LabelBackfiller>,
    pub cache_ttl: Duration,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/records", get(list_records_handler))
        .route("/records/summary", get(summary_handler))
        .route(
            "/records/{id}",
            get(get_record_handler).delete(delete_record_handler),
        )
        .route("/records/{id}/labels", put(set_labels_handler))
        .route("/ingest", post(ingest_handler))
        .route("/backfill", post(backfill_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_records_handler(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let cutoff = Utc::now() - state.cache_ttl;
    let records = state
        .store
        .query_fresh(&params.query, cutoff, params.limit)
        .await?;
    Ok(Json(records))
}

async fn get_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Record>, ApiError> {
    Ok(Json(state.store.get(&id).await?))
}

async fn delete_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
struct SetLabelsRequest {
    label_a: Option<SentimentLabel>,
    label_b: Option<SentimentLabel>,
}

async fn set_labels_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetLabelsRequest>,
) -> Result<Json<Record>, ApiError> {
    if body.label_a.is_none() && body.label_b.is_none() {
        return Err(ApiError::bad_request("no label fields provided"));
    }
    state
        .store
        .set_labels(&id, body.label_a, body.label_b)
        .await?;
    Ok(Json(state.store.get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    query: String,
}

#[derive(Debug, Serialize)]
struct SummaryResponse {
    query: String,
    total: usize,
    label_a: BTreeMap<String, usize>,
    label_b: BTreeMap<String, usize>,
    unlabeled: usize,
}

async fn summary_handler(
    State(state): State<AppState>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let records = state
        .store
        .query_fresh(&params.query, DateTime::<Utc>::MIN_UTC, 500)
        .await?;

    let mut label_a = BTreeMap::new();
    let mut label_b = BTreeMap::new();
    let mut unlabeled = 0usize;
    for record in &records {
        match &record.label_a {
            Some(label) => *label_a.entry(label.class.as_str().to_string()).or_default() += 1,
            None => {}
        }
        match &record.label_b {
            Some(label) => *label_b.entry(label.class.as_str().to_string()).or_default() += 1,
            None => {}
        }
        if !record.is_fully_labeled() {
            unlabeled += 1;
        }
    }

    Ok(Json(SummaryResponse {
        query: params.query,
        total: records.len(),
        label_a,
        label_b,
        unlabeled,
    }))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    query: String,
    returned: usize,
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let records = state.ingestor.ingest(&body.query, body.limit).await?;
    Ok(Json(IngestResponse {
        query: body.query,
        returned: records.len(),
    }))
}

#[derive(Debug, Serialize)]
struct BackfillResponse {
    updated: usize,
}

async fn backfill_handler(
    State(state): State<AppState>,
) -> Result<Json<BackfillResponse>, ApiError> {
    let updated = state.backfiller.backfill().await?;
    Ok(Json(BackfillResponse { updated }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use pulse_client::{
        ClassifierError, SearchClient, SearchError, SearchItem, SearchPage, SentimentClassifier,
    };
    use pulse_core::{NewRecord, SentimentClass};
    use pulse_pipeline::PipelineConfig;
    use pulse_store::MemoryStore;
    use tower::ServiceExt;

    struct OnePageSearch;

    #[async_trait]
    impl SearchClient for OnePageSearch {
        async fn search(
            &self,
            _query: &str,
            _page_size: usize,
            _page_token: Option<&str>,
        ) -> Result<SearchPage, SearchError> {
            Ok(SearchPage {
                items: vec![SearchItem {
                    id: "p1".to_string(),
                    text: "fresh post".to_string(),
                    author: "alice".to_string(),
                    created_at: Utc::now(),
                }],
                next_page_token: None,
            })
        }
    }

    struct PositiveClassifier;

    #[async_trait]
    impl SentimentClassifier for PositiveClassifier {
        async fn classify(
            &self,
            texts: &[String],
        ) -> Result<Vec<SentimentLabel>, ClassifierError> {
            Ok(texts
                .iter()
                .map(|_| SentimentLabel {
                    class: SentimentClass::Positive,
                    score: 0.8,
                })
                .collect())
        }
    }

    fn test_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig::default();
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            Arc::new(OnePageSearch),
            config.clone(),
        ));
        let backfiller = Arc::new(LabelBackfiller::new(
            store.clone(),
            Arc::new(PositiveClassifier),
            Arc::new(PositiveClassifier),
            config.clone(),
        ));
        let state = AppState {
            store: store.clone(),
            ingestor,
            backfiller,
            cache_ttl: config.cache_ttl,
        };
        (store, state)
    }

    async fn seed(store: &MemoryStore, id: &str, query: &str) {
        store
            .upsert(NewRecord {
                id: id.to_string(),
                query: query.to_string(),
                timestamp: Utc::now(),
                author: "seed".to_string(),
                raw_text: "seed text".to_string(),
                normalized_text: "seed text".to_string(),
            })
            .await
            .expect("seed");
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_endpoint_responds_ok() {
        let (_store, state) = test_state();
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_record_returns_404_for_unknown_id() {
        let (_store, state) = test_state();
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/records/missing")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_records_returns_seeded_rows() {
        let (store, state) = test_state();
        seed(&store, "1", "economy").await;
        seed(&store, "2", "economy").await;
        seed(&store, "3", "weather").await;

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/records?query=economy&limit=10")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().expect("array").len(), 2);
    }

    #[tokio::test]
    async fn ingest_endpoint_triggers_a_fetch() {
        let (store, state) = test_state();
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "economy", "limit": 5}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["returned"], 1);
        assert!(store.exists("p1").await.expect("exists"));
    }

    #[tokio::test]
    async fn backfill_endpoint_reports_updated_count() {
        let (store, state) = test_state();
        seed(&store, "1", "economy").await;

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/backfill")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["updated"], 1);
        assert!(store.get("1").await.expect("get").is_fully_labeled());
    }

    #[tokio::test]
    async fn set_labels_rejects_empty_body_and_fills_slots() {
        let (store, state) = test_state();
        seed(&store, "1", "economy").await;
        let router = app(state);

        let empty = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/records/1/labels")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let filled = router
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/records/1/labels")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"label_a": {"class": "NEUTRAL", "score": 0.0}}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(filled.status(), StatusCode::OK);
        let record = store.get("1").await.expect("get");
        assert_eq!(record.label_a.expect("label a").class, SentimentClass::Neutral);
    }

    #[tokio::test]
    async fn summary_counts_label_distribution() {
        let (store, state) = test_state();
        seed(&store, "1", "economy").await;
        seed(&store, "2", "economy").await;
        store
            .set_labels(
                "1",
                Some(SentimentLabel {
                    class: SentimentClass::Positive,
                    score: 0.9,
                }),
                None,
            )
            .await
            .expect("label");

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/records/summary?query=economy")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["label_a"]["POSITIVE"], 1);
        assert_eq!(body["unlabeled"], 2);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let (store, state) = test_state();
        seed(&store, "1", "economy").await;

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/records/1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!store.exists("1").await.expect("exists"));
    }
}
