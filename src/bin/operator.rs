use std::future::IntoFuture as _;

use anyhow::Context as _;
use object_store_operator::{
    config::OperatorConfig,
    operator::{self, State},
    telemetry,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;
    let config = OperatorConfig::from_env()?;

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = operator::ObjectStoreController::new(state.clone(), config.clone());

    // Stops the bucket provisioner alongside the controllers
    let token = CancellationToken::new();
    tokio::spawn(operator::cancel_on_signal(token.clone()));

    // Start web server
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    info!("Serving diagnostics on {}", config.listen_addr);
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // The controllers only return on shutdown, the server should never return
    tokio::select! {
        c = controller.run(token) => c,
        s = server.into_future() => {
            s.context("server exited early")?;
            anyhow::bail!("server exited early")
        }
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use object_store_operator::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for inspecting the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
