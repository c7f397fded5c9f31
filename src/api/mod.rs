pub mod audit;
pub mod health;
pub mod reconcile;

use crate::config::Config;
use crate::db::Repository;
use crate::scheduler::BatchRunner;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Config,
    pub runner: BatchRunner,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, config: Config, runner: BatchRunner) -> Self {
        Self {
            repo,
            config,
            runner,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/audit-logs", get(audit::get_audit_logs))
        .route("/v1/reconcile", post(reconcile::post_reconcile))
        .layer(cors)
        .with_state(state)
}
