use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use payid_registry::{
    Cancellation, MalformedReason, PayIdRegistry, Record, RecordRequest, RegistryError,
    UpsertOutcome,
};
use serde::Serialize;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PayIdRegistry>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    /// Upper bound for a single registry call, storage included
    pub storage_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: Arc<PayIdRegistry>, storage_timeout: Duration) -> Self {
        Self {
            registry,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            storage_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    record_count: usize,
    req_total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    status_code: u16,
    error: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn from_rejection(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Bad input. {}", rejection.body_text()))
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::MalformedIdentifier {
                reason: MalformedReason::MissingDelimiter,
                ..
            } => Self::bad_request("Bad input. PayIDs must contain a \"$\""),
            RegistryError::MalformedIdentifier {
                reason: MalformedReason::MultipleDelimiters,
                ..
            } => Self::bad_request("Bad input. PayIDs must contain only one \"$\""),
            RegistryError::DuplicateAddressKey { .. } => Self::bad_request(
                "Bad input. More than one address was provided for the same (paymentNetwork, environment) pair",
            ),
            RegistryError::NotFound { pay_id } => Self::new(
                StatusCode::NOT_FOUND,
                format!("No information could be found for the PayID {pay_id}."),
            ),
            RegistryError::AlreadyExists { .. } => Self::new(
                StatusCode::CONFLICT,
                "There already exists a user with the provided PayID",
            ),
            RegistryError::StorageUnavailable(source) => {
                warn!("Registry storage unavailable: {:#}", source);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The PayID store is temporarily unavailable",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            status_code: self.status.as_u16(),
            error: self
                .status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.message,
        });
        (self.status, payload).into_response()
    }
}

pub async fn start_server<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(state));
    let listener = bind_listener(addr).await?;
    info!("PayID admin API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("admin API server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind admin API listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind admin API listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/status/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/users", post(handle_create_user))
        .route(
            "/users/:pay_id",
            get(handle_get_user)
                .put(handle_upsert_user)
                .delete(handle_delete_user),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a registry call on the blocking pool, bounded by the storage timeout.
///
/// On timeout the call is cancelled. A mutation that already started
/// committing cannot be cancelled; its real outcome is awaited and returned.
async fn run_registry<T, F>(state: &AppState, op: F) -> Result<T, RegistryError>
where
    T: Send + 'static,
    F: FnOnce(&PayIdRegistry, &Cancellation) -> Result<T, RegistryError> + Send + 'static,
{
    let registry = state.registry.clone();
    let cancel = Cancellation::new();
    let token = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || op(&registry, &token));

    let joined = match timeout(state.storage_timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) if cancel.cancel() => {
            return Err(RegistryError::StorageUnavailable(anyhow!(
                "registry call exceeded {:?}",
                state.storage_timeout
            )));
        }
        Err(_) => {
            warn!(
                timeout = ?state.storage_timeout,
                "Registry call overran its timeout mid-commit; awaiting outcome"
            );
            task.await
        }
    };

    joined.map_err(|join_err| {
        RegistryError::StorageUnavailable(anyhow!("registry task failed: {join_err}"))
    })?
}

fn location_for(record: &Record) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!("/users/{}", record.pay_id))
        .map_err(|err| ApiError::internal(format!("invalid Location header: {err}")))
}

async fn handle_health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let req_total = state.record_request();
    let record_count = run_registry(&state, |registry, _| registry.count()).await?;

    Ok(Json(HealthResponse {
        status: "OK",
        uptime_secs: state.uptime_seconds(),
        record_count,
        req_total,
    }))
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    state.record_request();
    match &state.metrics {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            handle.render(),
        )
            .into_response(),
        None => ApiError::new(StatusCode::NOT_FOUND, "Metrics exporter is disabled").into_response(),
    }
}

async fn handle_get_user(
    State(state): State<SharedState>,
    AxumPath(pay_id): AxumPath<String>,
) -> Result<Json<Record>, ApiError> {
    state.record_request();
    let record = run_registry(&state, move |registry, _| registry.get(&pay_id)).await?;
    Ok(Json(record))
}

async fn handle_create_user(
    State(state): State<SharedState>,
    payload: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.record_request();
    let Json(request) = payload.map_err(ApiError::from_rejection)?;

    let record = run_registry(&state, move |registry, cancel| {
        registry.create_cancellable(request, cancel)
    }).await?;
    let location = location_for(&record)?;
    debug!(pay_id = %record.pay_id, "POST /users created record");

    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn handle_upsert_user(
    State(state): State<SharedState>,
    AxumPath(pay_id): AxumPath<String>,
    payload: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.record_request();
    let Json(request) = payload.map_err(ApiError::from_rejection)?;

    let outcome = run_registry(&state, move |registry, cancel| {
        registry.upsert_cancellable(&pay_id, request, cancel)
    }).await?;
    match outcome {
        UpsertOutcome::Updated(record) => Ok((StatusCode::OK, Json(record)).into_response()),
        UpsertOutcome::Created(record) => {
            let location = location_for(&record)?;
            Ok((
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(record),
            )
                .into_response())
        }
    }
}

async fn handle_delete_user(
    State(state): State<SharedState>,
    AxumPath(pay_id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    state.record_request();
    let outcome = run_registry(&state, move |registry, cancel| {
        registry.delete_cancellable(&pay_id, cancel)
    }).await?;
    debug!(?outcome, "DELETE /users handled");
    Ok(StatusCode::NO_CONTENT)
}
