use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::config::{load_config, BackendConfig, ConfigError};
use crate::dispatch::SetupError;
use crate::load_balancer::{Backend, BackendId, BackendSnapshot, RegistryError};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub active_sessions: u64,
    pub stream_sessions: usize,
    pub backends: usize,
}

/// Failure of an admin operation.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("backend '{0}' not found")]
    NotFound(String),
    #[error("no configuration file to reload")]
    NoConfigFile,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Apply(#[from] SetupError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::Registry(RegistryError::Duplicate(_)) => StatusCode::CONFLICT,
            AdminError::Registry(RegistryError::Address(_)) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::NoConfigFile => StatusCode::CONFLICT,
            AdminError::Config(_) | AdminError::Apply(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let gateway = &state.gateway;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        active_sessions: gateway.tracker().active_count(),
        stream_sessions: gateway.sessions().directory.len(),
        backends: gateway.registry().all().len(),
    })
}

pub async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendSnapshot>> {
    Json(state.gateway.registry().all())
}

pub async fn register_backend(
    State(state): State<AdminState>,
    Json(config): Json<BackendConfig>,
) -> Result<(StatusCode, Json<BackendSnapshot>), AdminError> {
    let backend = Backend::from_config(&config).map_err(RegistryError::from)?;
    let registered = state.gateway.registry().register(backend)?;
    tracing::info!(backend = %registered.id(), pool = registered.pool(), "Backend registered via admin API");
    Ok((StatusCode::CREATED, Json(registered.snapshot())))
}

pub async fn deregister_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let id = BackendId::from(id);
    if !state.gateway.registry().deregister(&id) {
        return Err(AdminError::NotFound(id.to_string()));
    }
    state.gateway.pools().drain(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reload_config(State(state): State<AdminState>) -> Result<StatusCode, AdminError> {
    let path = state.config_path.as_ref().ok_or(AdminError::NoConfigFile)?;
    let config = load_config(path)?;
    state.gateway.apply_config(&config)?;
    Ok(StatusCode::NO_CONTENT)
}
