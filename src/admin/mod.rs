//! Admin API.
//!
//! # Endpoints
//! ```text
//! GET    /admin/status          version, live sessions, backend count
//! GET    /admin/backends        every backend with health and load
//! POST   /admin/backends        register a backend (JSON BackendConfig)
//! DELETE /admin/backends/{id}   deregister and drain
//! POST   /admin/reload          re-read the configuration file
//! ```
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::dispatch::Gateway;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state of the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub api_key: Arc<str>,
    /// File re-read by `/admin/reload`; reload is refused without one.
    pub config_path: Option<Arc<PathBuf>>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>, api_key: &str, config_path: Option<PathBuf>) -> Self {
        Self {
            gateway,
            api_key: Arc::from(api_key),
            config_path: config_path.map(Arc::new),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(list_backends).post(register_backend))
        .route("/admin/backends/{id}", delete(deregister_backend))
        .route("/admin/reload", post(reload_config))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
