//! Axum JSON API over the monitor.

use std::str::FromStr;
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
use tracing::{error, info};
use vigil_adapters::EventEnvelope;
use vigil_core::{CanonicalItem, ItemKind, SeverityLevel};
use vigil_storage::{Cursor, ItemPage};
use vigil_sync::{EventsQuery, FindingsQuery, IngestOutcome, Monitor, MonitorError, SyncOutcome};

pub const CRATE_NAME: &str = "vigil-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FindingsParams {
    account_id: Option<String>,
    severity: Option<String>,
    limit: Option<usize>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EventsParams {
    account_id: Option<String>,
    service: Option<String>,
    limit: Option<usize>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotationBody {
    comment: Option<String>,
    determination: Option<String>,
}

/// One page of either list endpoint; `nextToken` goes back as the query
/// parameter of the same name.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Vec<CanonicalItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<Cursor>,
}

impl From<ItemPage> for ListResponse {
    fn from(page: ItemPage) -> Self {
        Self {
            items: page.items,
            next_token: page.next_cursor,
        }
    }
}

/// Maps monitor failures onto status codes with a JSON `{"error": ..}` body.
struct ApiError(MonitorError);

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MonitorError::Validation(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::Accounts(_) => StatusCode::BAD_GATEWAY,
            MonitorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/guardduty/findings", get(list_findings_handler))
        .route(
            "/api/guardduty/findings/{account_id}/{finding_id}",
            get(get_finding_handler).patch(annotate_finding_handler),
        )
        .route("/api/guardduty/sync", post(sync_security_handler))
        .route("/api/health/events", get(list_events_handler))
        .route(
            "/api/health/events/{account_id}/{event_id}",
            get(get_event_handler).patch(annotate_event_handler),
        )
        .route("/api/health/sync", post(sync_operational_handler))
        .route("/api/events", post(ingest_event_handler))
        .route("/api/dashboard/summary", get(summary_handler))
        .route("/api/accounts", get(accounts_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(monitor: Arc<Monitor>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(monitor)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn list_findings_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FindingsParams>,
) -> ApiResult<Json<ListResponse>> {
    let severity = params
        .severity
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(SeverityLevel::from_str)
        .transpose()
        .map_err(MonitorError::from)?;
    let page = state
        .monitor
        .query_findings(FindingsQuery {
            account_id: params.account_id.filter(|a| !a.is_empty()),
            severity,
            cursor: params.next_token.map(Cursor::from_token),
            limit: params.limit,
        })
        .await?;
    Ok(Json(page.into()))
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> ApiResult<Json<ListResponse>> {
    let page = state
        .monitor
        .query_events(EventsQuery {
            account_id: params.account_id.filter(|a| !a.is_empty()),
            service: params.service.filter(|s| !s.is_empty()),
            cursor: params.next_token.map(Cursor::from_token),
            limit: params.limit,
        })
        .await?;
    Ok(Json(page.into()))
}

async fn get_finding_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, finding_id)): Path<(String, String)>,
) -> ApiResult<Json<CanonicalItem>> {
    let item = state
        .monitor
        .get_one(ItemKind::SecurityFinding, &account_id, &finding_id)
        .await?;
    Ok(Json(item))
}

async fn get_event_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, event_id)): Path<(String, String)>,
) -> ApiResult<Json<CanonicalItem>> {
    let item = state
        .monitor
        .get_one(ItemKind::OperationalEvent, &account_id, &event_id)
        .await?;
    Ok(Json(item))
}

async fn annotate(
    monitor: &Monitor,
    kind: ItemKind,
    account_id: &str,
    source_id: &str,
    body: AnnotationBody,
) -> ApiResult<Json<CanonicalItem>> {
    monitor
        .annotate(kind, account_id, source_id, body.comment, body.determination.as_deref())
        .await?;
    Ok(Json(monitor.get_one(kind, account_id, source_id).await?))
}

async fn annotate_finding_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, finding_id)): Path<(String, String)>,
    Json(body): Json<AnnotationBody>,
) -> ApiResult<Json<CanonicalItem>> {
    annotate(&state.monitor, ItemKind::SecurityFinding, &account_id, &finding_id, body).await
}

async fn annotate_event_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, event_id)): Path<(String, String)>,
    Json(body): Json<AnnotationBody>,
) -> ApiResult<Json<CanonicalItem>> {
    annotate(&state.monitor, ItemKind::OperationalEvent, &account_id, &event_id, body).await
}

fn sync_response(outcome: SyncOutcome) -> Response {
    let status = match outcome {
        SyncOutcome::Completed(_) => StatusCode::OK,
        SyncOutcome::Skipped { .. } => StatusCode::CONFLICT,
    };
    (status, Json(outcome)).into_response()
}

async fn sync_security_handler(State(state): State<Arc<AppState>>) -> Response {
    sync_response(state.monitor.sync_security().await)
}

async fn sync_operational_handler(State(state): State<Arc<AppState>>) -> Response {
    sync_response(state.monitor.sync_operational().await)
}

async fn ingest_event_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<EventEnvelope>,
) -> ApiResult<Response> {
    let outcome = state.monitor.ingest_event(envelope).await?;
    let status = match outcome {
        IngestOutcome::Stored { .. } => StatusCode::OK,
        IngestOutcome::Ignored { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    Ok(Json(state.monitor.summary().await?).into_response())
}

async fn accounts_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let accounts = state.monitor.accounts().await?;
    Ok(Json(accounts.as_ref().clone()).into_response())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;
    use vigil_sync::MonitorConfig;

    use super::*;

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    async fn test_app() -> Router {
        let config = MonitorConfig {
            fixtures_dir: fixtures_dir(),
            ..MonitorConfig::default()
        };
        let monitor = Monitor::from_config(&config).await.unwrap();
        app(AppState::new(Arc::new(monitor)))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn handler_smoke_sync_then_list_findings() {
        let app = test_app().await;
        let (status, report) = call(&app, Method::POST, "/api/guardduty/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["status"], "completed");
        assert_eq!(report["stored"], 3);

        let (status, page) = call(&app, Method::GET, "/api/guardduty/findings?accountId=111122223333", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"].as_array().unwrap().len(), 2);
        assert!(page.get("nextToken").is_none());

        let (_, first) = call(&app, Method::GET, "/api/guardduty/findings?limit=2", None).await;
        assert_eq!(first["items"].as_array().unwrap().len(), 2);
        let token = first["nextToken"].as_str().unwrap();
        let (status, rest) = call(&app, Method::GET, &format!("/api/guardduty/findings?limit=2&nextToken={token}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rest["items"].as_array().unwrap().len(), 1);
        assert!(rest.get("nextToken").is_none());

        let (status, page) = call(&app, Method::GET, "/api/guardduty/findings?severity=critical", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handler_smoke_error_statuses() {
        let app = test_app().await;
        let (status, body) = call(&app, Method::GET, "/api/guardduty/findings?severity=urgent", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("urgent"));

        let (status, _) = call(&app, Method::GET, "/api/guardduty/findings/111122223333/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/guardduty/findings/111122223333/nope",
            Some(serde_json::json!({"comment": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_smoke_push_then_annotate() {
        let app = test_app().await;
        let text = std::fs::read_to_string(fixtures_dir().join("events/guardduty-finding.json")).unwrap();
        let envelope: JsonValue = serde_json::from_str(&text).unwrap();
        let (status, outcome) = call(&app, Method::POST, "/api/events", Some(envelope)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["result"], "stored");
        assert_eq!(outcome["created"], true);

        let uri = "/api/guardduty/findings/111122223333/d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6";
        let (status, _) = call(
            &app,
            Method::PATCH,
            uri,
            Some(serde_json::json!({"determination": "not-sure"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, item) = call(
            &app,
            Method::PATCH,
            uri,
            Some(serde_json::json!({"comment": "mining on a build host", "determination": "confirmed-issue"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["comment"], "mining on a build host");

        let (status, ignored) = call(
            &app,
            Method::POST,
            "/api/events",
            Some(serde_json::json!({"source": "aws.s3", "detail": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(ignored["result"], "ignored");
    }

    #[tokio::test]
    async fn handler_smoke_summary_and_accounts() {
        let app = test_app().await;
        call(&app, Method::POST, "/api/guardduty/sync", None).await;
        call(&app, Method::POST, "/api/health/sync", None).await;

        let (status, summary) = call(&app, Method::GET, "/api/dashboard/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["guardduty"]["total"], 3);
        assert_eq!(summary["guardduty"]["severity"]["critical"], 1);
        assert_eq!(summary["health"]["open"], 2);
        assert_eq!(summary["health"]["upcoming"], 0);
        assert!(summary["lastUpdated"].is_string());

        let (status, events) = call(&app, Method::GET, "/api/health/events", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events["items"].as_array().unwrap().len(), 2);

        let (status, accounts) = call(&app, Method::GET, "/api/accounts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accounts["111122223333"], "production");
    }
}
