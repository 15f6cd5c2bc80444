//! HTTP server
//!
//! Router, shared state and request middleware over the inference core.

pub mod api;
pub mod middleware;
pub mod state;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the LocalLab router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(api::health))
        .route("/system/info", get(api::system_info))
        .route("/generate", post(api::generate))
        .route("/generate/batch", post(api::batch_generate))
        .route("/chat", post(api::chat))
        .route("/models/load", post(api::load_model))
        .route("/models/unload", post(api::unload_model))
        .route("/models/current", get(api::current_model))
        .route("/models/available", get(api::available_models))
        .layer(from_fn_with_state(state.clone(), middleware::track_requests))
        .layer(TraceLayer::new_for_http());

    if state.settings.enable_cors {
        router = router.layer(middleware::cors_layer(&state.settings.cors_origins));
    }

    router.with_state(state)
}

/// Load the default model without blocking startup
pub fn spawn_default_model_load(state: &AppState) {
    let manager = state.manager().clone();
    let model_id = state.settings.default_model.clone();
    tokio::spawn(async move {
        tracing::info!("Loading default model {} in background", model_id);
        match manager.load(&model_id).await {
            Ok(()) => {
                if let Some(active) = manager.current_model_id().await {
                    tracing::info!("Default model ready: {}", active);
                }
            }
            Err(e) => tracing::error!("Failed to load default model: {}", e),
        }
    });
}

/// Serve until Ctrl-C, then unload the active model.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.settings.bind_address();
    let app = build_router(state.clone());

    tracing::info!("LocalLab server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, releasing model resources");
    if state.manager().unload().await {
        tracing::info!("Model unloaded");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
