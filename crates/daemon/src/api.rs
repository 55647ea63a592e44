use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use common::{LeaseResult, LeaseView, SetupEnvelope, SweepReport, TeardownEnvelope};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::BrokerError;
use crate::notify::Notifier;
use crate::orchestrator::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tunnels/setup", post(setup_tunnel))
        .route("/tunnels/teardown", post(teardown_tunnel))
        .route("/leases", get(list_leases))
        .route("/sweep", post(sweep))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn setup_tunnel(
    State(state): State<AppState>,
    Json(payload): Json<SetupEnvelope>,
) -> Result<Json<LeaseResult>, BrokerError> {
    let lease = state
        .broker
        .setup(&payload.context, payload.request, state.notifier.as_ref())
        .await?;
    Ok(Json(lease))
}

async fn teardown_tunnel(
    State(state): State<AppState>,
    Json(payload): Json<TeardownEnvelope>,
) -> Result<StatusCode, BrokerError> {
    state
        .broker
        .teardown(&payload.context, payload.request, state.notifier.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_leases(State(state): State<AppState>) -> Result<Json<Vec<LeaseView>>, BrokerError> {
    Ok(Json(state.broker.leases().await?))
}

async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, BrokerError> {
    Ok(Json(state.broker.gc().sweep(Utc::now()).await?))
}

async fn health() -> &'static str {
    "ok"
}
