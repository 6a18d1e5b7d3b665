use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use reply_kernel_api::{
    AddEntryRequest, AddRawRecordRequest, FeedbackSignal, InboundMessage, ReplyKernelApi,
    RetireEntryRequest, UpdateEntryRequest, API_CONTRACT_VERSION,
};
use reply_kernel_core::{EngineConfig, EntryId, OutcomeId, TrustTier};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: ReplyKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct RetireResponse {
    entry_id: EntryId,
    retired: bool,
}

#[derive(Debug, Parser)]
#[command(name = "reply-kernel-service")]
#[command(about = "Local HTTP service for the automated-response decision engine")]
struct Args {
    #[arg(long, default_value = "./reply_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/messages/decide", post(messages_decide))
        .route("/v1/feedback", post(feedback))
        .route("/v1/consolidate", post(consolidate))
        .route("/v1/raw", post(raw_add))
        .route("/v1/knowledge", post(knowledge_add))
        .route("/v1/knowledge/update", post(knowledge_update))
        .route("/v1/knowledge/retire", post(knowledge_retire))
        .route("/v1/knowledge/search", post(knowledge_search))
        .route("/v1/knowledge/tier/:tier", get(knowledge_by_tier))
        .route("/v1/knowledge/:entry_id/chain", get(knowledge_chain))
        .route("/v1/outcomes/:outcome_id", get(outcome_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    // Eager construction: a bad config or rule table stops the process here.
    let api = ReplyKernelApi::new(args.db, EngineConfig::default())?;
    let state = ServiceState { api };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "reply-kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<reply_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<reply_kernel_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn messages_decide(
    State(state): State<ServiceState>,
    Json(request): Json<InboundMessage>,
) -> Result<Json<ServiceEnvelope<reply_kernel_api::DecisionReport>>, ServiceError> {
    let report =
        state.api.decide(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

async fn feedback(
    State(state): State<ServiceState>,
    Json(request): Json<FeedbackSignal>,
) -> Result<Json<ServiceEnvelope<reply_kernel_store_sqlite::FeedbackApplication>>, ServiceError> {
    let applied =
        state.api.feedback(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(applied)))
}

async fn consolidate(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<reply_kernel_api::ConsolidationSummary>>, ServiceError> {
    let summary =
        state.api.consolidate().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(summary)))
}

async fn raw_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddRawRecordRequest>,
) -> Result<Json<ServiceEnvelope<reply_kernel_core::RawConversationRecord>>, ServiceError> {
    let record =
        state.api.add_raw_record(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn knowledge_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddEntryRequest>,
) -> Result<Json<ServiceEnvelope<reply_kernel_core::KnowledgeEntry>>, ServiceError> {
    let entry =
        state.api.add_entry(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entry)))
}

async fn knowledge_update(
    State(state): State<ServiceState>,
    Json(request): Json<UpdateEntryRequest>,
) -> Result<Json<ServiceEnvelope<reply_kernel_core::KnowledgeEntry>>, ServiceError> {
    let entry =
        state.api.update_entry(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entry)))
}

async fn knowledge_retire(
    State(state): State<ServiceState>,
    Json(request): Json<RetireEntryRequest>,
) -> Result<Json<ServiceEnvelope<RetireResponse>>, ServiceError> {
    let entry_id = request.entry_id;
    state.api.retire_entry(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(RetireResponse { entry_id, retired: true })))
}

async fn knowledge_search(
    State(state): State<ServiceState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<ServiceEnvelope<Vec<reply_kernel_core::KnowledgeEntry>>>, ServiceError> {
    let entries =
        state.api.search(&request.query).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entries)))
}

async fn knowledge_by_tier(
    State(state): State<ServiceState>,
    Path(tier): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<reply_kernel_core::KnowledgeEntry>>>, ServiceError> {
    let tier = TrustTier::parse(&tier)
        .ok_or_else(|| ServiceState::error(format!("unknown trust tier: {tier}")))?;
    let entries =
        state.api.list_by_tier(tier).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(entries)))
}

async fn knowledge_chain(
    State(state): State<ServiceState>,
    Path(entry_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<reply_kernel_core::KnowledgeEntry>>>, ServiceError> {
    let entry_id = parse_entry_id(&entry_id)?;
    let chain = state
        .api
        .supersession_chain(entry_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(chain)))
}

async fn outcome_show(
    State(state): State<ServiceState>,
    Path(outcome_id): Path<String>,
) -> Result<Json<ServiceEnvelope<reply_kernel_core::OutcomeRecord>>, ServiceError> {
    let outcome_id = Ulid::from_string(&outcome_id)
        .map(OutcomeId)
        .map_err(|err| ServiceState::error(format!("invalid outcome id: {err}")))?;
    let outcome = state
        .api
        .outcome_show(outcome_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(outcome)))
}

fn parse_entry_id(raw: &str) -> Result<EntryId, ServiceError> {
    Ulid::from_string(raw)
        .map(EntryId)
        .map_err(|err| ServiceState::error(format!("invalid entry id: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("replykernel-service-{}.sqlite3", Ulid::new()))
    }

    fn state_at(db_path: &std::path::Path, config: EngineConfig) -> ServiceState {
        let api = match ReplyKernelApi::new(db_path.to_path_buf(), config) {
            Ok(api) => api,
            Err(err) => panic!("api should construct: {err}"),
        };
        ServiceState { api }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = state_at(&unique_temp_db_path(), EngineConfig::default());
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = state_at(&unique_temp_db_path(), EngineConfig::default());
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/messages/decide"));
        assert!(body.contains("/v1/consolidate"));
    }

    #[tokio::test]
    async fn add_decide_and_feedback_flow_round_trip() {
        let db_path = unique_temp_db_path();
        // Fresh manual entries score 0.61; lower the decision threshold so
        // this deployment answers from day one.
        let config = EngineConfig { min_confidence: 0.5, ..EngineConfig::default() };
        let state = state_at(&db_path, config);
        let router = app(state);

        let add_payload = serde_json::json!({
            "key": "gift_cards",
            "title": "Gift cards",
            "body": "Gift cards are sold at the front desk and online.",
            "problem": null,
            "solution": "Yes - gift cards are available at the front desk.",
            "trust_tier": "verified",
            "source_type": "manual",
            "confidence": 0.92,
            "entry_id": null,
            "created_at": null,
            "expires_at": null,
            "supersedes": []
        });
        let add_response = post_json(router.clone(), "/v1/knowledge", &add_payload).await;
        assert_eq!(add_response.status(), StatusCode::OK);

        let decide_payload = serde_json::json!({
            "conversation_id": "conv-http-1",
            "contact": "+15550001111",
            "text": "Do you sell gift cards?",
            "received_at": null
        });
        let decide_response =
            post_json(router.clone(), "/v1/messages/decide", &decide_payload).await;
        assert_eq!(decide_response.status(), StatusCode::OK);
        let decide_value = response_json(decide_response).await;
        assert_eq!(
            decide_value
                .get("data")
                .and_then(|data| data.get("disposition"))
                .and_then(serde_json::Value::as_str),
            Some("auto_replied")
        );
        let outcome_id = decide_value
            .get("data")
            .and_then(|data| data.get("outcome_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.outcome_id in response: {decide_value}"))
            .to_string();

        let feedback_payload = serde_json::json!({
            "outcome_id": outcome_id,
            "helpful": true
        });
        let feedback_response = post_json(router.clone(), "/v1/feedback", &feedback_payload).await;
        assert_eq!(feedback_response.status(), StatusCode::OK);

        let outcome_response = match router
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/outcomes/{outcome_id}"))
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("outcome request failed: {err}"),
        };
        assert_eq!(outcome_response.status(), StatusCode::OK);
        let outcome_value = response_json(outcome_response).await;
        assert_eq!(
            outcome_value
                .get("data")
                .and_then(|data| data.get("helpful"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn raw_capture_and_consolidate_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let state = state_at(&db_path, EngineConfig::default());
        let router = app(state);

        for index in 0..5 {
            let raw_payload = serde_json::json!({
                "conversation_id": format!("conv-raw-{index}"),
                "problem": "trackman is frozen and will not respond",
                "solution": "power cycle the unit and relaunch",
                "extraction_confidence": 0.5 + 0.05 * f64::from(index),
                "captured_at": null
            });
            let response = post_json(router.clone(), "/v1/raw", &raw_payload).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let consolidate_response =
            post_json(router.clone(), "/v1/consolidate", &serde_json::json!({})).await;
        assert_eq!(consolidate_response.status(), StatusCode::OK);
        let value = response_json(consolidate_response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("merges_performed"))
                .and_then(serde_json::Value::as_u64),
            Some(1)
        );

        let tier_response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/knowledge/tier/learned")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("tier request failed: {err}"),
        };
        assert_eq!(tier_response.status(), StatusCode::OK);
        let tier_value = response_json(tier_response).await;
        let learned = tier_value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("data should be an array: {tier_value}"));
        assert_eq!(learned.len(), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_trust_tier_is_a_client_error() {
        let state = state_at(&unique_temp_db_path(), EngineConfig::default());
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/knowledge/tier/platinum")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
