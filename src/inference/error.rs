use thiserror::Error;

/// Errors surfaced by the model lifecycle and generation core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// A load was requested while another one is in flight
    #[error("Another model is currently loading")]
    LoadBusy,

    #[error("Failed to load model {model_id}: {reason}")]
    LoadFailure { model_id: String, reason: String },

    #[error("Generation failed: {0}")]
    GenerationFailure(String),
}
