use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use clinref_api::{BatchResolution, MessageReferences, ReferenceApi, API_CONTRACT_VERSION};
use clinref_core::{ReferenceError, ResolvedReference};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DOCTOR_HEADER: &str = "x-doctor-id";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: ReferenceApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchResolveParams {
    reference_ids: String,
}

#[derive(Debug, Parser)]
#[command(name = "clinref-service")]
#[command(about = "HTTP service resolving citation references to clinical content")]
struct Args {
    #[arg(long, default_value = "./clinref.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4015")]
    bind: SocketAddr,
}

impl ServiceError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

impl From<ReferenceError> for ServiceError {
    fn from(err: ReferenceError) -> Self {
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            status,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn doctor_id_from_headers(headers: &HeaderMap) -> Result<String, ServiceError> {
    let value = headers
        .get(DOCTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if value.is_empty() {
        return Err(ServiceError::invalid(format!("missing {DOCTOR_HEADER} header")));
    }
    Ok(value.to_string())
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/references/resolve/:reference_id", get(resolve_reference))
        .route("/v1/references/batch-resolve", get(batch_resolve_references))
        .route("/v1/references/by-message/:message_id", get(references_by_message))
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
    let state = ServiceState { api: ReferenceApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "clinref service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn resolve_reference(
    State(state): State<ServiceState>,
    Path(reference_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ResolvedReference>, ServiceError> {
    let doctor_id = doctor_id_from_headers(&headers)?;
    let resolved = state.api.resolve(&reference_id, &doctor_id)?;
    Ok(Json(resolved))
}

async fn batch_resolve_references(
    State(state): State<ServiceState>,
    Query(params): Query<BatchResolveParams>,
    headers: HeaderMap,
) -> Result<Json<BatchResolution>, ServiceError> {
    let doctor_id = doctor_id_from_headers(&headers)?;
    let reference_ids: Vec<String> =
        params.reference_ids.split(',').map(str::to_string).collect();
    let batch = state.api.resolve_batch(&reference_ids, &doctor_id)?;
    Ok(Json(batch))
}

async fn references_by_message(
    State(state): State<ServiceState>,
    Path(message_id): Path<String>,
) -> Result<Json<MessageReferences>, ServiceError> {
    let message_references = state.api.references_for_message(&message_id)?;
    Ok(Json(message_references))
}
