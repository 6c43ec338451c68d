use crate::error::AppError;
use crate::state::StreamEngine;
use crate::store::DurableStore;
use crate::stream::types::ConnectionState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub store: &'static str,
    pub stream: ConnectionState,
}

pub async fn build_health_response(
    started_at: Instant,
    store: &dyn DurableStore,
    stream: ConnectionState,
) -> HealthResponse {
    let store_status = if store.is_reachable().await {
        "reachable"
    } else {
        "unreachable"
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        store: store_status,
        stream,
    }
}

pub async fn health(engine: &StreamEngine) -> Result<HealthResponse, AppError> {
    let stream = engine.publisher.status().await.state;
    Ok(build_health_response(engine.started_at, engine.store.as_ref(), stream).await)
}
