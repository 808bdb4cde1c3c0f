//! Health Reflector: `GET /health` reports whether each configured broker
//! connection (plus the local broker) is currently up. Built on `axum`, the
//! newer HTTP convention in the pack (`services/server` builds all its
//! surfaces this way; `forwarder::status_http` predates it with a hand-rolled
//! TCP server).

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::forwarder::Forwarder;

#[derive(Clone)]
pub struct HealthState {
    forwarders: Arc<HashMap<String, Arc<Forwarder>>>,
}

impl HealthState {
    pub fn new(forwarders: HashMap<String, Arc<Forwarder>>) -> Self {
        Self {
            forwarders: Arc::new(forwarders),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    brokers: HashMap<String, bool>,
    timestamp: String,
}

pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let mut brokers = HashMap::with_capacity(state.forwarders.len() + 1);
    let mut all_up = true;
    let mut local_up = true;

    for (broker_id, forwarder) in state.forwarders.iter() {
        let up = forwarder.cloud.is_connected();
        brokers.insert(broker_id.clone(), up);
        all_up &= up;
        local_up &= forwarder.local.is_connected();
    }
    brokers.insert("local".to_owned(), local_up);
    all_up &= local_up;

    Json(HealthResponse {
        status: if all_up { "ok" } else { "degraded" },
        brokers,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
