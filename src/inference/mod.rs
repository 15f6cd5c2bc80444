//! LLM inference core
//!
//! Model lifecycle, generation and the backend seam. llama.cpp is the
//! production backend; everything above `backend` is backend-agnostic.

pub mod backend;
pub mod cache;
pub mod engine;
pub mod error;
pub mod gguf;
pub mod manager;
pub mod optimizations;
pub mod params;
pub mod prompt;
pub mod quantization;
pub mod reaper;
pub mod registry;
pub mod streaming;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod fake;

pub use backend::{BackendError, ModelBackend};
pub use engine::{GenerationEngine, GenerationRequest};
pub use error::ModelError;
pub use manager::ModelManager;
pub use params::GenerationOptions;
pub use streaming::{StreamOutcome, TextStream};
