use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use mission_control_core::{
    empty_object, now_utc, Decision, DecisionSource, MissionStep, MissionStore, NewMissionStep,
    NewProposal, PipelineConfig, PipelineError, Proposal, ProposalId, Resolution, StepId,
};
use mission_control_pipeline::{
    DecisionOutcome, Heartbeat, HeartbeatReport, Orchestrator, StepCompletion,
};
use mission_control_store_sqlite::SqliteMissionStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const HEARTBEAT_TOKEN_ENV: &str = "MC_HEARTBEAT_TOKEN";

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: Arc<PathBuf>,
    config: Arc<PipelineConfig>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

/// Why a blocking operation did not produce a value.
#[derive(Debug)]
enum OperationError {
    Open(anyhow::Error),
    Pipeline(PipelineError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    kind: String,
    project: String,
    #[serde(default = "empty_object")]
    payload: Value,
    #[serde(default)]
    proposal_id: Option<ProposalId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClaimRequest {
    worker_id: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    kinds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProposeRequest {
    agent_id: String,
    project: String,
    title: String,
    #[serde(default = "empty_object")]
    body: Value,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    unauthorized_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    store_unavailable_total: u64,
    unauthorized_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "mission-control-service")]
#[command(about = "Local HTTP service for the mission pipeline")]
struct Args {
    #[arg(long, default_value = "./mission_control.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `service.bind` from the config file.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(db_path: PathBuf, config: PipelineConfig) -> Self {
        Self {
            db_path: Arc::new(db_path),
            operation_timeout: Duration::from_millis(config.service.operation_timeout_ms),
            config: Arc::new(config),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn classify_pipeline_error(err: &PipelineError) -> ServiceFailure {
        let (status, details) = match err {
            PipelineError::NotFound { entity, id } => {
                (StatusCode::NOT_FOUND, Some(json!({"entity": entity, "id": id})))
            }
            PipelineError::AlreadyResolved { status, .. } => {
                (StatusCode::CONFLICT, Some(json!({"status": status})))
            }
            PipelineError::InvalidTransition { from, to, .. } => {
                (StatusCode::CONFLICT, Some(json!({"from": from, "to": to})))
            }
            PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            PipelineError::TransientStore(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            PipelineError::Store(_) | PipelineError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };
        Self::failure(status, err.code(), err.to_string(), details)
    }

    /// Opens the store on the blocking pool and runs `op` under the
    /// operation timeout.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MissionStore, &PipelineConfig) -> Result<T, PipelineError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = Arc::clone(&self.db_path);
        let config = Arc::clone(&self.config);
        let handle = tokio::task::spawn_blocking(move || {
            let store = SqliteMissionStore::open(&db_path).map_err(OperationError::Open)?;
            op(&store, config.as_ref()).map_err(OperationError::Pipeline)
        });

        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("operation_timeout", true);
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "operation_timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(OperationError::Open(err)) => {
                self.telemetry.record_failure("store_unavailable", false);
                tracing::error!(operation = operation_label, error = %format!("{err:#}"), "store open failed");
                Err(Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    format!("{err:#}"),
                    None,
                ))
            }
            Err(OperationError::Pipeline(err)) => {
                let failure = Self::classify_pipeline_error(&err);
                self.telemetry.record_failure(failure.code, false);
                tracing::debug!(operation = operation_label, code = failure.code, error = %err, "operation failed");
                Err(failure)
            }
        }
    }

    fn authorize_heartbeat(&self, headers: &HeaderMap) -> Result<(), ServiceFailure> {
        let Some(expected) = self.config.service.heartbeat_token.as_deref() else {
            return Ok(());
        };
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented == Some(expected) {
            return Ok(());
        }
        self.telemetry.record_failure("unauthorized", false);
        Err(Self::failure(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "heartbeat requires a valid bearer token",
            None,
        ))
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "already_resolved" | "invalid_transition" => &self.conflict_total,
            "store_unavailable" | "transient_store_error" => &self.store_unavailable_total,
            "unauthorized" => &self.unauthorized_total,
            "operation_timeout" => return,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/steps", post(step_enqueue))
        .route("/v1/steps/claim", post(step_claim))
        .route("/v1/steps/:step_id", get(step_show))
        .route("/v1/steps/:step_id/resolve", post(step_resolve))
        .route("/v1/proposals", post(proposal_create))
        .route("/v1/proposals/:proposal_id", get(proposal_show))
        .route("/v1/proposals/:proposal_id/approve", post(proposal_approve))
        .route("/v1/proposals/:proposal_id/reject", post(proposal_reject))
        .route("/v1/heartbeat", post(heartbeat))
        .with_state(state)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));
    let json_layer =
        json.then(|| fmt::layer().json().with_target(true).with_writer(std::io::stderr));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init();
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            PipelineConfig::from_toml_str(&raw)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.service.bind.clone_from(bind);
    }
    if let Ok(token) = std::env::var(HEARTBEAT_TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.service.heartbeat_token = Some(token);
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    let config = load_config(&args)?;

    SqliteMissionStore::open(&args.db)?.migrate()?;

    let bind = config.service.bind.clone();
    let state = ServiceState::new(args.db, config);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "mission control service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn step_enqueue(
    State(state): State<ServiceState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<MissionStep>>), ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let step = state
        .run_blocking("enqueue", move |store, config| {
            let mut step = NewMissionStep::new(request.kind, request.project, request.payload);
            step.proposal_id = request.proposal_id;
            Orchestrator::new(store, config).queue().enqueue(&step)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(envelope(step))))
}

async fn step_claim(
    State(state): State<ServiceState>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Option<MissionStep>>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let claimed = state
        .run_blocking("claim", move |store, config| {
            Orchestrator::new(store, config).queue().claim_next(
                &request.worker_id,
                request.project.as_deref(),
                &request.kinds,
            )
        })
        .await?;
    Ok(Json(envelope(claimed)))
}

async fn step_resolve(
    State(state): State<ServiceState>,
    Path(step_id): Path<String>,
    payload: Result<Json<Resolution>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<StepCompletion>>, ServiceFailure> {
    let Json(resolution) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let completion = state
        .run_blocking("resolve", move |store, config| {
            Orchestrator::new(store, config).complete_step(StepId::parse(&step_id)?, resolution)
        })
        .await?;
    Ok(Json(envelope(completion)))
}

async fn step_show(
    State(state): State<ServiceState>,
    Path(step_id): Path<String>,
) -> Result<Json<ServiceEnvelope<MissionStep>>, ServiceFailure> {
    let step = state
        .run_blocking("step_show", move |store, config| {
            Orchestrator::new(store, config).queue().get(StepId::parse(&step_id)?)
        })
        .await?;
    Ok(Json(envelope(step)))
}

async fn proposal_create(
    State(state): State<ServiceState>,
    payload: Result<Json<ProposeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Proposal>>), ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let proposal = state
        .run_blocking("propose", move |store, config| {
            let proposal = NewProposal {
                agent_id: request.agent_id,
                project: request.project,
                title: request.title,
                body: request.body,
            };
            Orchestrator::new(store, config).gate().propose(&proposal)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(envelope(proposal))))
}

async fn proposal_show(
    State(state): State<ServiceState>,
    Path(proposal_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Proposal>>, ServiceFailure> {
    let proposal = state
        .run_blocking("proposal_show", move |store, config| {
            Orchestrator::new(store, config).gate().get(ProposalId::parse(&proposal_id)?)
        })
        .await?;
    Ok(Json(envelope(proposal)))
}

async fn proposal_approve(
    State(state): State<ServiceState>,
    Path(proposal_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DecisionOutcome>>, ServiceFailure> {
    decide(&state, proposal_id, Decision::Approved).await
}

async fn proposal_reject(
    State(state): State<ServiceState>,
    Path(proposal_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DecisionOutcome>>, ServiceFailure> {
    decide(&state, proposal_id, Decision::Rejected).await
}

async fn decide(
    state: &ServiceState,
    proposal_id: String,
    decision: Decision,
) -> Result<Json<ServiceEnvelope<DecisionOutcome>>, ServiceFailure> {
    let outcome = state
        .run_blocking("decide", move |store, config| {
            Orchestrator::new(store, config).decide(
                ProposalId::parse(&proposal_id)?,
                decision,
                DecisionSource::Human,
            )
        })
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn heartbeat(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<HeartbeatReport>>, ServiceFailure> {
    state.authorize_heartbeat(&headers)?;
    let report = state
        .run_blocking("heartbeat", |store, config| Heartbeat::new(store, config).run(now_utc()))
        .await?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mission-control-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(config: PipelineConfig) -> ServiceState {
        let db_path = unique_temp_db_path();
        let migrated = SqliteMissionStore::open(&db_path).and_then(|store| store.migrate());
        if let Err(err) = migrated {
            panic!("failed to migrate test db: {err:#}");
        }
        ServiceState::new(db_path, config)
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
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

    fn data_str<'v>(value: &'v Value, field: &str) -> &'v str {
        match value["data"][field].as_str() {
            Some(text) => text,
            None => panic!("expected data.{field} string in {value}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(PipelineConfig::default()));
        let response = send(&router, empty_request("GET", "/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], json!(SERVICE_CONTRACT_VERSION));
        assert_eq!(value["data"]["status"], json!("ok"));
        assert_eq!(value["data"]["timeout_ms"], json!(2500));
    }

    #[tokio::test]
    async fn step_lifecycle_over_http() {
        let router = app(test_state(PipelineConfig::default()));

        let created = send(
            &router,
            json_request(
                "POST",
                "/v1/steps",
                &json!({"kind": "research", "project": "docs", "payload": {"topic": "tides"}}),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = response_json(created).await;
        assert_eq!(created["data"]["status"], json!("queued"));

        let claimed = send(
            &router,
            json_request("POST", "/v1/steps/claim", &json!({"worker_id": "w1"})),
        )
        .await;
        assert_eq!(claimed.status(), StatusCode::OK);
        let claimed = response_json(claimed).await;
        assert_eq!(claimed["data"]["status"], json!("processing"));
        let step_id = data_str(&claimed, "step_id").to_string();

        let resolved = send(
            &router,
            json_request(
                "POST",
                &format!("/v1/steps/{step_id}/resolve"),
                &json!({"outcome": "succeeded", "result": {"summary": "done"}}),
            ),
        )
        .await;
        assert_eq!(resolved.status(), StatusCode::OK);
        let resolved = response_json(resolved).await;
        assert_eq!(resolved["data"]["event"]["kind"], json!("research_completed"));

        let shown = send(&router, empty_request("GET", &format!("/v1/steps/{step_id}"))).await;
        let shown = response_json(shown).await;
        assert_eq!(shown["data"]["status"], json!("succeeded"));
        assert_eq!(shown["data"]["result"], json!({"summary": "done"}));

        let again = send(
            &router,
            json_request(
                "POST",
                &format!("/v1/steps/{step_id}/resolve"),
                &json!({"outcome": "failed", "reason": "late"}),
            ),
        )
        .await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
        assert_eq!(response_json(again).await["error"]["code"], json!("invalid_transition"));
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_null_data() {
        let router = app(test_state(PipelineConfig::default()));
        let response =
            send(&router, json_request("POST", "/v1/steps/claim", &json!({"worker_id": "w1"})))
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["data"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_map_to_404_and_400() {
        let router = app(test_state(PipelineConfig::default()));

        let missing = send(
            &router,
            empty_request("GET", &format!("/v1/steps/{}", ulid::Ulid::new())),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let missing = response_json(missing).await;
        assert_eq!(missing["error"]["code"], json!("not_found"));
        assert_eq!(missing["error"]["details"]["entity"], json!("mission_step"));

        let malformed = send(&router, empty_request("GET", "/v1/proposals/not-a-ulid")).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(malformed).await["error"]["code"], json!("validation_error"));
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_as_invalid_json() {
        let router = app(test_state(PipelineConfig::default()));
        let request = Request::builder()
            .uri("/v1/steps")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["error"]["code"], json!("invalid_json"));

        let health = response_json(send(&router, empty_request("GET", "/v1/health")).await).await;
        assert_eq!(health["data"]["telemetry"]["invalid_json_total"], json!(1));
    }

    #[tokio::test]
    async fn approval_enqueues_steps_and_second_decision_conflicts() {
        let router = app(test_state(PipelineConfig::default()));

        let created = send(
            &router,
            json_request(
                "POST",
                "/v1/proposals",
                &json!({
                    "agent_id": "dex",
                    "project": "docs",
                    "title": "Research tides",
                    "body": {"proposed_steps": [{"kind": "research", "payload": {"topic": "tides"}}]}
                }),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = response_json(created).await;
        let proposal_id = data_str(&created, "proposal_id").to_string();

        let approved = send(
            &router,
            empty_request("POST", &format!("/v1/proposals/{proposal_id}/approve")),
        )
        .await;
        assert_eq!(approved.status(), StatusCode::OK);
        let approved = response_json(approved).await;
        assert_eq!(approved["data"]["proposal"]["status"], json!("approved"));
        assert_eq!(approved["data"]["enqueued"][0]["kind"], json!("research"));

        let rejected = send(
            &router,
            empty_request("POST", &format!("/v1/proposals/{proposal_id}/reject")),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::CONFLICT);
        let rejected = response_json(rejected).await;
        assert_eq!(rejected["error"]["code"], json!("already_resolved"));
        assert_eq!(rejected["error"]["details"]["status"], json!("approved"));

        let shown = send(&router, empty_request("GET", &format!("/v1/proposals/{proposal_id}")))
            .await;
        assert_eq!(response_json(shown).await["data"]["status"], json!("approved"));
    }

    #[tokio::test]
    async fn heartbeat_requires_configured_bearer_token() {
        let mut config = PipelineConfig::default();
        config.service.heartbeat_token = Some("s3cret".to_string());
        let router = app(test_state(config));

        let denied = send(&router, empty_request("POST", "/v1/heartbeat")).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response_json(denied).await["error"]["code"], json!("unauthorized"));

        let request = Request::builder()
            .uri("/v1/heartbeat")
            .method("POST")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let allowed = send(&router, request).await;
        assert_eq!(allowed.status(), StatusCode::OK);
        let report = response_json(allowed).await;
        assert!(report["data"]["heartbeat_event_seq"].as_i64().is_some_and(|seq| seq >= 1));
    }

    #[tokio::test]
    async fn unreachable_db_reports_store_unavailable() {
        let db_path = std::env::temp_dir()
            .join(format!("mission-control-missing-parent-{}/db.sqlite3", ulid::Ulid::new()));
        let router = app(ServiceState::new(db_path, PipelineConfig::default()));

        let response = send(
            &router,
            empty_request("GET", &format!("/v1/steps/{}", ulid::Ulid::new())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response_json(response).await["error"]["code"], json!("store_unavailable"));
    }
}
