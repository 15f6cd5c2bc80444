//! LocalLab server entry point

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use locallab::inference::{GenerationEngine, ModelBackend, ModelManager};
use locallab::server::{self, AppState};
use locallab::storage::huggingface::HuggingFaceResolver;
use locallab::storage::settings::load_settings;
use locallab::system::gpu::detect_gpu;
use locallab::system::resources::{cpu_count, get_resource_usage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("LocalLab v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    log_system_info();

    let backend = build_backend()?;
    let resolver = HuggingFaceResolver::new(
        settings.models_directory.clone(),
        settings.hf_token.clone(),
    )
    .context("Failed to set up model resolver")?;

    let manager = Arc::new(ModelManager::new(backend, Arc::new(resolver), &settings));
    let engine = Arc::new(GenerationEngine::new(manager, &settings));
    let state = AppState::new(engine, settings);

    server::spawn_default_model_load(&state);
    server::serve(state).await
}

#[cfg(feature = "llama")]
fn build_backend() -> anyhow::Result<Arc<dyn ModelBackend>> {
    Ok(Arc::new(locallab::inference::llama::LlamaCppBackend::new()))
}

#[cfg(not(feature = "llama"))]
fn build_backend() -> anyhow::Result<Arc<dyn ModelBackend>> {
    anyhow::bail!("LocalLab was built without a model backend; enable the `llama` feature")
}

fn log_system_info() {
    let ram = get_resource_usage();
    let gpu = detect_gpu();

    tracing::info!("CPU cores: {}", cpu_count());
    if ram.is_known() {
        tracing::info!(
            "RAM: {} MB total, {} MB available",
            ram.ram_total_mb,
            ram.ram_available_mb
        );
    }
    if gpu.is_available {
        tracing::info!("GPU: {} ({} MB VRAM)", gpu.name, gpu.vram_total_mb);
    } else {
        tracing::info!("No GPU detected, running on CPU");
    }
}
