// src/server.rs
//
// HTTP trigger. The request is a pure "fire" signal: method, headers and body
// are ignored, and every hit runs exactly one rotation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::sys::rotator::Rotator;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(rotator: Arc<Rotator>) -> Router {
    Router::new()
        .route("/", any(trigger_rotation))
        .route("/healthz", get(healthz))
        .with_state(rotator)
}

async fn trigger_rotation(State(rotator): State<Arc<Rotator>>) -> (StatusCode, Json<TriggerResponse>) {
    match rotator.rotate().await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(TriggerResponse {
                message: "Updated secret",
                kid: Some(outcome.kid),
                version: Some(outcome.version),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(TriggerResponse {
                message: "Failed to update secret",
                kid: None,
                version: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

pub async fn serve(rotator: Arc<Rotator>, port: u16) -> std::io::Result<()> {
    let secret = rotator.settings().locator.to_string();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    info!(port, secret = %secret, "⚙️ Secret rotator listening for triggers");

    axum::serve(listener, router(rotator))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
