//! Axum JSON service over the harvester and the warehouse.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use yth_core::Outcome;
use yth_harvest::{HarvestError, Harvester, StepReport};
use yth_warehouse::{AnalysisQuery, Warehouse};

pub const CRATE_NAME: &str = "yth-web";

/// Shared handler state. Orchestrator access is serialized through one lock;
/// warehouse reads go straight to the pool.
pub struct AppState {
    harvester: Mutex<Harvester>,
    warehouse: Warehouse,
}

impl AppState {
    pub fn new(harvester: Harvester) -> Self {
        let warehouse = harvester.warehouse().clone();
        Self {
            harvester: Mutex::new(harvester),
            warehouse,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalysisParams {
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Debug, Serialize)]
struct MenuEntry {
    slug: &'static str,
    description: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/harvest/staging", get(staging_handler))
        .route("/harvest/channels/{channel_id}", post(collect_handler))
        .route("/harvest/channels/{channel_id}/videos", post(fetch_videos_handler))
        .route("/harvest/channels/{channel_id}/comments", post(fetch_comments_handler))
        .route("/harvest/load", post(load_handler))
        .route("/warehouse/channels", get(channels_handler))
        .route("/analysis", get(analysis_menu_handler))
        .route("/analysis/{slug}", get(analysis_handler))
        .route("/query", post(query_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("YTH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let harvester = yth_harvest::harvester_from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving harvest api");
    axum::serve(listener, app(AppState::new(harvester))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn staging_handler(State(state): State<Arc<AppState>>) -> Response {
    let harvester = state.harvester.lock().await;
    Json(harvester.staged_channels()).into_response()
}

async fn collect_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    let mut harvester = state.harvester.lock().await;
    step_response(harvester.collect(&channel_id).await)
}

async fn fetch_videos_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    let mut harvester = state.harvester.lock().await;
    step_response(harvester.fetch_videos(&channel_id).await)
}

async fn fetch_comments_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    let mut harvester = state.harvester.lock().await;
    step_response(harvester.fetch_comments(&channel_id).await)
}

async fn load_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut harvester = state.harvester.lock().await;
    match harvester.load_all().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => harvest_error(err),
    }
}

async fn channels_handler(State(state): State<Arc<AppState>>) -> Response {
    outcome_response(state.warehouse.list_channels().await, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn analysis_menu_handler() -> Response {
    let menu = AnalysisQuery::ALL
        .into_iter()
        .map(|q| MenuEntry {
            slug: q.slug(),
            description: q.description(),
        })
        .collect::<Vec<_>>();
    Json(menu).into_response()
}

async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(params): Query<AnalysisParams>,
) -> Response {
    let Some(query) = AnalysisQuery::from_slug(&slug) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown analysis {slug}") })),
        )
            .into_response();
    };
    let outcome = state
        .warehouse
        .run_analysis(query, params.channel_id.as_deref())
        .await;
    outcome_response(outcome, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    outcome_response(state.warehouse.run_query(&request.sql).await, StatusCode::BAD_REQUEST)
}

fn step_response(result: Result<StepReport, HarvestError>) -> Response {
    match result {
        Ok(report) => Json(report).into_response(),
        Err(err) => harvest_error(err),
    }
}

fn outcome_response<T: Serialize>(outcome: Outcome<T>, failure_status: StatusCode) -> Response {
    let status = if outcome.has_failures() {
        failure_status
    } else {
        StatusCode::OK
    };
    (status, Json(outcome)).into_response()
}

fn harvest_error(err: HarvestError) -> Response {
    let status = match &err {
        HarvestError::ChannelUnavailable { .. } if err.is_not_found() => StatusCode::NOT_FOUND,
        HarvestError::ChannelUnavailable { .. } => StatusCode::BAD_GATEWAY,
        HarvestError::NotStaged(_) | HarvestError::VideosNotFetched(_) => StatusCode::CONFLICT,
        HarvestError::Warehouse(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": err.to_string(),
            "diagnostics": err.diagnostics(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use yth_client::{ApiError, HarvestClient, Page, VideoApi};
    use yth_core::{ChannelInfo, CommentRecord, VideoRecord};

    struct FakeApi;

    #[async_trait]
    impl VideoApi for FakeApi {
        async fn channel(&self, channel_id: &str) -> Result<Option<ChannelInfo>, ApiError> {
            match channel_id {
                "C1" => Ok(Some(ChannelInfo {
                    channel_id: "C1".into(),
                    channel_name: "Rustacean Station".into(),
                    subscribers: 42,
                    total_videos: 1,
                    uploads_playlist_id: "UUC1".into(),
                })),
                "C-DOWN" => Err(ApiError::Fetch("connection reset".into())),
                _ => Ok(None),
            }
        }

        async fn playlist_items(
            &self,
            _playlist_id: &str,
            _page_token: Option<&str>,
        ) -> Result<Page<String>, ApiError> {
            Ok(Page::last(vec!["V1".to_string()]))
        }

        async fn videos(&self, video_ids: &[String]) -> Result<Vec<VideoRecord>, ApiError> {
            Ok(video_ids
                .iter()
                .map(|id| VideoRecord {
                    video_id: id.clone(),
                    channel_id: "C1".into(),
                    title: "Async in depth".into(),
                    published_date: "2022-09-09T09:00:00Z".into(),
                    views: 1_000,
                    likes: 100,
                    comments_count: 1,
                    duration: Some("PT30M".into()),
                })
                .collect())
        }

        async fn comment_threads(
            &self,
            video_id: &str,
            _page_token: Option<&str>,
            _max_results: u32,
        ) -> Result<Page<CommentRecord>, ApiError> {
            Ok(Page::last(vec![CommentRecord {
                comment_id: format!("{video_id}-k0"),
                video_id: video_id.to_string(),
                author: "@ferris".into(),
                comment_text: "loved it".into(),
                published_date: "2022-09-10T00:00:00Z".into(),
            }]))
        }
    }

    async fn test_app() -> Router {
        let warehouse = Warehouse::in_memory().await.unwrap();
        warehouse.ensure_schema().await.unwrap();
        let client = HarvestClient::with_cache_ttl(Arc::new(FakeApi), Duration::ZERO);
        app(AppState::new(Harvester::new(Arc::new(client), warehouse)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn harvest_flow_over_http() {
        let app = test_app().await;

        let (status, body) = send(&app, "POST", "/harvest/channels/C1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stage"], "channel_fetched");

        let (status, body) = send(&app, "POST", "/harvest/channels/C1/videos", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["videos"], 1);

        let (_, staging) = send(&app, "GET", "/harvest/staging", None).await;
        assert_eq!(staging[0]["channel_id"], "C1");
        assert_eq!(staging[0]["stage"], "videos_fetched");

        let (status, report) = send(&app, "POST", "/harvest/load", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["totals"]["comments"], 1);
        assert_eq!(report["loaded"][0]["channel_id"], "C1");

        let (_, channels) = send(&app, "GET", "/warehouse/channels", None).await;
        assert_eq!(channels["value"][0]["name"], "Rustacean Station");

        let (status, analysis) =
            send(&app, "GET", "/analysis/top-viewed-videos?channel_id=C1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(analysis["value"]["rows"][0][0], "Async in depth");

        let (_, other) = send(&app, "GET", "/analysis/top-viewed-videos?channel_id=C2", None).await;
        assert_eq!(other["value"]["rows"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn harvest_errors_map_to_statuses() {
        let app = test_app().await;

        let (status, body) = send(&app, "POST", "/harvest/channels/C404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["diagnostics"][0]["kind"], "not_found");

        let (status, _) = send(&app, "POST", "/harvest/channels/C-DOWN", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = send(&app, "POST", "/harvest/channels/C1/videos", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        send(&app, "POST", "/harvest/channels/C1", None).await;
        let (status, _) = send(&app, "POST", "/harvest/channels/C1/comments", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn analysis_menu_and_unknown_slug() {
        let app = test_app().await;
        let (status, menu) = send(&app, "GET", "/analysis", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(menu.as_array().map(Vec::len), Some(10));
        assert_eq!(menu[0]["slug"], "videos-with-channels");

        let (status, _) = send(&app, "GET", "/analysis/most-disliked", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ad_hoc_query_endpoint() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(serde_json::json!({ "sql": "SELECT 1 AS one, 'x' AS label" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["columns"], serde_json::json!(["one", "label"]));
        assert_eq!(body["value"]["rows"][0], serde_json::json!([1, "x"]));

        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(serde_json::json!({ "sql": "DELETE FROM channels" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["diagnostics"][0]["severity"], "error");
    }
}
