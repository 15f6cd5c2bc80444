//! Backend seam
//!
//! Everything above this module talks to weights and tokenizers through these
//! traits. The llama.cpp implementation lives in `llama.rs`; tests use the
//! scripted backend in `fake.rs`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::inference::quantization::LoadConfig;
use crate::system::gpu::{GpuInfo, GpuKind};

/// Vocabulary index
pub type TokenId = u32;

/// Errors raised by a backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// Accelerator or KV-cache memory exhausted; the only recoverable variant
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl BackendError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, BackendError::OutOfMemory(_))
    }
}

/// Accelerator availability as seen by the backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub kind: GpuKind,
    pub name: String,
    pub vram_total_mb: u64,
    /// Live free-VRAM reading, when the platform offers one
    pub vram_free_mb: Option<u64>,
    /// Whether this backend build can offload layers to the accelerator
    pub offload_supported: bool,
}

impl AcceleratorInfo {
    /// No accelerator
    pub fn cpu() -> Self {
        Self {
            name: "CPU".to_string(),
            ..Self::default()
        }
    }

    pub fn from_gpu(gpu: &GpuInfo, offload_supported: bool) -> Self {
        if !gpu.is_available {
            return Self::cpu();
        }
        Self {
            available: true,
            kind: gpu.kind,
            name: gpu.name.clone(),
            vram_total_mb: gpu.vram_total_mb,
            vram_free_mb: gpu.vram_free_mb(),
            offload_supported,
        }
    }
}

/// Accelerator memory reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceleratorMemory {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl AcceleratorMemory {
    pub fn utilization(&self) -> f64 {
        if self.total_mb == 0 {
            0.0
        } else {
            self.used_mb as f64 / self.total_mb as f64
        }
    }
}

/// Where the weights for a model live on disk
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub model_id: String,
    pub path: PathBuf,
}

/// Which post-load optimizations a loaded model supports, fixed at load time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub attention_slicing: bool,
    pub cpu_offload: bool,
    pub graph_rewrite: bool,
    pub flash_attention: bool,
    pub memory_efficient_attention: bool,
    pub gradient_checkpointing: bool,
}

/// Static facts about loaded weights
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStats {
    pub parameter_count: u64,
    pub size_bytes: u64,
    pub architecture: String,
    /// Training context length
    pub context_length: u32,
}

/// Sampling parameters for one decode session
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    /// 0 picks a random seed
    pub seed: u32,
}

/// Text <-> token conversion for a loaded model
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Raw bytes of the given tokens, concatenated. Special tokens render as
    /// nothing. The bytes may end mid UTF-8 sequence.
    fn token_bytes(&self, tokens: &[TokenId]) -> Result<Vec<u8>, BackendError>;

    /// Lossy text of the given tokens
    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        let bytes = self.token_bytes(tokens)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A loaded model
pub trait LanguageModel: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn stats(&self) -> ModelStats;

    fn enable_attention_slicing(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("attention slicing".to_string()))
    }

    fn enable_cpu_offload(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("cpu offload".to_string()))
    }

    /// Replace the model with an optimized graph. On failure the original
    /// model is handed back untouched.
    fn rewrite_graph(
        self: Box<Self>,
    ) -> Result<Box<dyn LanguageModel>, (Box<dyn LanguageModel>, BackendError)>;

    fn enable_flash_attention(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("flash attention".to_string()))
    }

    fn enable_memory_efficient_attention(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("memory efficient attention".to_string()))
    }

    fn enable_gradient_checkpointing(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("gradient checkpointing".to_string()))
    }

    /// Switch to inference-only execution (no autograd state, eval dropout)
    fn set_inference_mode(&mut self);

    /// Prefill `prompt` and return a session that produces new tokens
    fn start(
        &self,
        prompt: &[TokenId],
        sampling: &SamplingConfig,
    ) -> Result<Box<dyn DecodeSession>, BackendError>;
}

/// An in-progress generation
pub trait DecodeSession: Send {
    /// Produce up to `max_new` tokens. An empty result means generation ended.
    fn step(&mut self, max_new: usize) -> Result<Vec<TokenId>, BackendError>;
}

/// Model and tokenizer produced by one load; always paired
pub struct LoadedModel {
    pub model: Box<dyn LanguageModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// Loads weights and reports accelerator state
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect the accelerator now
    fn detect_accelerator(&self) -> AcceleratorInfo;

    /// Blocking load of weights and tokenizer
    fn load(&self, source: &ModelSource, config: &LoadConfig)
        -> Result<LoadedModel, BackendError>;

    /// Current accelerator memory use, if there is an accelerator
    fn memory_usage(&self) -> Option<AcceleratorMemory>;

    /// Release cached accelerator memory. Best effort.
    fn clear_cache(&self);
}
