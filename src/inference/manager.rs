//! Model lifecycle
//!
//! Owns the single active model. Loads are mutually exclusive and fail fast
//! with [`ModelError::LoadBusy`] rather than queueing; generation never waits
//! on a load and keeps using the model it snapshotted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::inference::backend::{AcceleratorInfo, LanguageModel, ModelBackend, ModelSource, Tokenizer};
use crate::inference::error::ModelError;
use crate::inference::optimizations::{apply_optimizations, OptimizationReport};
use crate::inference::quantization::{select_load_config, LoadConfig};
use crate::inference::registry;
use crate::storage::huggingface::ModelResolver;
use crate::storage::settings::{OptimizationSettings, Settings};
use crate::system::resources::{get_resource_usage, ResourceUsage};
use crate::types::model::{format_size, ModelConfig, ModelInfoView};

const MB: u64 = 1024 * 1024;

/// Reads current RAM availability
pub type ResourceSampler = Arc<dyn Fn() -> ResourceUsage + Send + Sync>;

/// A loaded model with its tokenizer and load-time metadata
pub struct ActiveModel {
    pub model_id: String,
    pub config: ModelConfig,
    pub model: Box<dyn LanguageModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub load_config: LoadConfig,
    pub weight_file: PathBuf,
    pub optimizations: OptimizationReport,
    pub loaded_at: DateTime<Utc>,
    pub load_time: Duration,
    /// Session epoch this model was loaded under
    pub epoch: u64,
}

impl ActiveModel {
    pub fn info(&self) -> ModelInfoView {
        let stats = self.model.stats();
        let device = if self.load_config.gpu_layers == 0 {
            "cpu"
        } else {
            self.load_config.device.device_label()
        };

        ModelInfoView {
            model_id: self.model_id.clone(),
            model_name: self.config.name.clone(),
            parameters: format!("{:.1}M", stats.parameter_count as f64 / 1e6),
            parameter_count: stats.parameter_count,
            architecture: stats.architecture,
            device: device.to_string(),
            max_length: self.config.max_length,
            ram_required: self.config.ram_mb,
            vram_required: self.config.vram_mb,
            memory_used: format!("{:.2} MB", stats.size_bytes as f64 / MB as f64),
            quantization: self.load_config.quantization_label().to_string(),
            weight_file: self
                .weight_file
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            optimizations: self
                .optimizations
                .entries
                .iter()
                .map(|(name, outcome)| (name.clone(), outcome.to_string()))
                .collect(),
            loaded_at: self.loaded_at,
            load_time_secs: self.load_time.as_secs_f64(),
        }
    }
}

struct Session {
    active: Option<Arc<ActiveModel>>,
    last_used: Instant,
}

/// Resets the loading flag when dropped
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lifecycle manager for the single active model
pub struct ModelManager {
    backend: Arc<dyn ModelBackend>,
    resolver: Arc<dyn ModelResolver>,
    optimizations: OptimizationSettings,
    fallback_model: String,
    resource_sampler: ResourceSampler,
    session: RwLock<Session>,
    loading: AtomicBool,
    epoch: AtomicU64,
}

impl ModelManager {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        resolver: Arc<dyn ModelResolver>,
        settings: &Settings,
    ) -> Self {
        Self {
            backend,
            resolver,
            optimizations: settings.optimizations.clone(),
            fallback_model: settings.fallback_model.clone(),
            resource_sampler: Arc::new(get_resource_usage),
            session: RwLock::new(Session {
                active: None,
                last_used: Instant::now(),
            }),
            loading: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Replace the RAM reading used by the pre-load resource check
    pub fn with_resource_sampler(mut self, sampler: ResourceSampler) -> Self {
        self.resource_sampler = sampler;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Load `model_id`, replacing any other active model.
    ///
    /// On failure the entry's fallback model is tried once. Loading the model
    /// that is already active is a no-op.
    pub async fn load(&self, model_id: &str) -> Result<(), ModelError> {
        let _guard = LoadingGuard::acquire(&self.loading).ok_or(ModelError::LoadBusy)?;

        if self.is_loaded(model_id).await {
            tracing::info!("Model {} is already loaded", model_id);
            return Ok(());
        }

        let config = registry::model_config(model_id, &self.fallback_model);
        let mut candidates = vec![config];
        if let Some(fallback) = candidates[0].fallback.clone() {
            candidates.push(registry::model_config(&fallback, &self.fallback_model));
        }

        let mut failures = Vec::with_capacity(candidates.len());
        for (attempt, config) in candidates.into_iter().enumerate() {
            if attempt > 0 {
                tracing::warn!("Attempting to load fallback model: {}", config.id);
            }
            let id = config.id.clone();
            match self.load_one(config).await {
                Ok(()) => return Ok(()),
                Err(reason) => {
                    tracing::error!("Error loading model {}: {}", id, reason);
                    failures.push(format!("{}: {}", id, reason));
                }
            }
        }

        Err(ModelError::LoadFailure {
            model_id: model_id.to_string(),
            reason: failures.join("; "),
        })
    }

    async fn load_one(&self, config: ModelConfig) -> Result<(), String> {
        if self.session.read().await.active.is_some() {
            self.unload().await;
        }

        tracing::info!("Loading model: {}", config.id);
        let started = std::time::Instant::now();

        let backend = self.backend.clone();
        let accelerator = tokio::task::spawn_blocking(move || backend.detect_accelerator())
            .await
            .map_err(|e| e.to_string())?;

        let load_config = select_load_config(&self.optimizations, &accelerator);
        check_resources(&config, &load_config, &accelerator, &(self.resource_sampler)())?;

        let path = self
            .resolver
            .resolve(&config, &load_config.weight_preference())
            .await
            .map_err(|e| e.to_string())?;

        let source = ModelSource {
            model_id: config.id.clone(),
            path: path.clone(),
        };
        let backend = self.backend.clone();
        let optimizations = self.optimizations.clone();
        let blocking_config = load_config.clone();
        let (loaded, report) = tokio::task::spawn_blocking(move || {
            let loaded = backend.load(&source, &blocking_config)?;
            let (model, report) = apply_optimizations(loaded.model, &optimizations);
            Ok::<_, crate::inference::backend::BackendError>(((model, loaded.tokenizer), report))
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

        let load_time = started.elapsed();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let active = ActiveModel {
            model_id: config.id.clone(),
            config,
            model: loaded.0,
            tokenizer: loaded.1,
            load_config,
            weight_file: path,
            optimizations: report,
            loaded_at: Utc::now(),
            load_time,
            epoch,
        };

        tracing::info!(
            "Model {} loaded in {:.2} seconds",
            active.model_id,
            load_time.as_secs_f64()
        );

        let mut session = self.session.write().await;
        session.active = Some(Arc::new(active));
        session.last_used = Instant::now();
        Ok(())
    }

    /// Drop the active model and release accelerator memory.
    ///
    /// Returns false when nothing was loaded.
    pub async fn unload(&self) -> bool {
        let previous = self.session.write().await.active.take();
        self.release(previous)
    }

    /// Unload only if the model has been idle for longer than `timeout`.
    /// Returns the id of the unloaded model.
    pub async fn unload_if_idle(&self, timeout: Duration) -> Option<String> {
        if self.is_loading() {
            return None;
        }

        let previous = {
            let mut session = self.session.write().await;
            if session.active.is_none() || session.last_used.elapsed() <= timeout {
                return None;
            }
            session.active.take()
        };

        let model_id = previous.as_ref().map(|m| m.model_id.clone());
        self.release(previous);
        model_id
    }

    fn release(&self, previous: Option<Arc<ActiveModel>>) -> bool {
        let Some(active) = previous else {
            return false;
        };

        let model_id = active.model_id.clone();
        drop(active);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.backend.clear_cache();
        tracing::info!("Model {} unloaded", model_id);
        true
    }

    /// True iff `model_id` is the active model
    pub async fn is_loaded(&self, model_id: &str) -> bool {
        self.session
            .read()
            .await
            .active
            .as_ref()
            .is_some_and(|m| m.model_id == model_id)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Snapshot of the active model
    pub async fn active(&self) -> Option<Arc<ActiveModel>> {
        self.session.read().await.active.clone()
    }

    pub async fn current_model_id(&self) -> Option<String> {
        self.active().await.map(|m| m.model_id.clone())
    }

    /// Info view of the active model
    pub async fn get_info(&self) -> Option<ModelInfoView> {
        self.active().await.map(|m| m.info())
    }

    /// Mark the model as used now
    pub async fn touch(&self) {
        self.session.write().await.last_used = Instant::now();
    }

    /// Time since the last load or generation
    pub async fn idle_time(&self) -> Duration {
        self.session.read().await.last_used.elapsed()
    }

    /// Increments on every load and unload
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

fn check_resources(
    config: &ModelConfig,
    load_config: &LoadConfig,
    accelerator: &AcceleratorInfo,
    ram: &ResourceUsage,
) -> Result<(), String> {
    if load_config.gpu_layers > 0 {
        if let (Some(required), Some(free)) = (config.vram_mb, accelerator.vram_free_mb) {
            if free < required {
                return Err(format!(
                    "Insufficient resources. Model requires ~{} VRAM, {} free",
                    format_size(required * MB),
                    format_size(free * MB)
                ));
            }
        }
        return Ok(());
    }

    if let Some(required) = config.ram_mb {
        if ram.is_known() && ram.ram_available_mb < required {
            return Err(format!(
                "Insufficient resources. Model requires ~{} RAM, {} available",
                format_size(required * MB),
                format_size(ram.ram_available_mb * MB)
            ));
        }
    }
    Ok(())
}
