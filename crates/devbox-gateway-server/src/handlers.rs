use crate::types::{
    ApiResponse, ApplyTemplateRequest, ConfigureAssistantRequest, CreateContainerRequest,
    HealthStatus,
};
use crate::AppState;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use devbox_common::{
    BackupRecord, ContainerId, ContainerRecord, ContainerView, DevboxError, ErrorKind,
    ProvisioningResult, TemplateProfile,
};
use devbox_orchestrator::{AssistantReport, ContainerInfo, CreateOutcome, CreateRequest, MonitorReport};
use tracing::{error, warn};

/// A failed operation, rendered as the error envelope with its status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiResponse<()>,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ApiResponse::failure(ErrorKind::InvalidArgument, message),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::IdentityConflict
        | ErrorKind::InvalidTransition
        | ErrorKind::OperationInProgress => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::IdentitySpaceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::AdapterError | ErrorKind::CreationFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::ProvisioningStepFailed | ErrorKind::ConfigError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<DevboxError> for ApiError {
    fn from(err: DevboxError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            error!(kind = %err.kind(), error = %err, "Request failed");
        } else {
            warn!(kind = %err.kind(), error = %err, "Request rejected");
        }
        Self {
            status,
            body: ApiResponse::from(&err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::invalid(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

fn container_id(path: Result<Path<ContainerId>, PathRejection>) -> Result<ContainerId, ApiError> {
    let Path(id) = path?;
    Ok(id)
}

pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::ok(HealthStatus {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        observers: state.observer_count(),
    }))
}

pub async fn list_profiles(State(state): State<AppState>) -> ApiResult<Vec<TemplateProfile>> {
    ok(state.orchestrator.profiles())
}

pub async fn list_containers(State(state): State<AppState>) -> ApiResult<Vec<ContainerView>> {
    ok(state.orchestrator.list().await)
}

pub async fn create_container(
    State(state): State<AppState>,
    payload: Result<Json<CreateContainerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<CreateOutcome>>), ApiError> {
    let Json(body) = payload?;
    let request = CreateRequest {
        name: body.name,
        id: body.id,
        profile: body.profile,
    };
    let outcome = state.orchestrator.create(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(outcome))))
}

pub async fn container_info(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<ContainerInfo> {
    ok(state.orchestrator.info(container_id(path)?).await?)
}

pub async fn destroy_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<ContainerRecord> {
    ok(state.orchestrator.destroy(container_id(path)?).await?)
}

pub async fn start_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<ContainerRecord> {
    ok(state.orchestrator.start(container_id(path)?).await?)
}

pub async fn stop_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<ContainerRecord> {
    ok(state.orchestrator.stop(container_id(path)?).await?)
}

pub async fn restart_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<ContainerRecord> {
    ok(state.orchestrator.restart(container_id(path)?).await?)
}

pub async fn backup_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<BackupRecord> {
    ok(state.orchestrator.backup(container_id(path)?).await?)
}

pub async fn list_backups(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<Vec<BackupRecord>> {
    ok(state.orchestrator.backups(Some(container_id(path)?)).await)
}

/// Step failures come back inside `data`; only guard and lookup errors fail the request.
pub async fn apply_template(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
    payload: Result<Json<ApplyTemplateRequest>, JsonRejection>,
) -> ApiResult<ProvisioningResult> {
    let id = container_id(path)?;
    let Json(body) = payload?;
    ok(state.orchestrator.apply_template(id, &body.profile).await?)
}

pub async fn monitor_container(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
) -> ApiResult<MonitorReport> {
    ok(state.orchestrator.monitor_container(container_id(path)?).await?)
}

pub async fn configure_assistant(
    State(state): State<AppState>,
    path: Result<Path<ContainerId>, PathRejection>,
    payload: Option<Json<ConfigureAssistantRequest>>,
) -> ApiResult<AssistantReport> {
    let id = container_id(path)?;
    let providers = payload.map(|Json(body)| body.providers).unwrap_or_default();
    ok(state.orchestrator.configure_assistant(id, &providers).await?)
}
