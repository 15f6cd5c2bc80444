//! Generation parameter resolution
//!
//! Precedence, lowest first: global defaults, per-model registry defaults,
//! speed-oriented clamps for values the caller left out, explicit request
//! values. Request values that fail to coerce are logged and ignored.

use serde::{Deserialize, Serialize};

use crate::inference::backend::SamplingConfig;
use crate::storage::settings::GenerationDefaults;
use crate::types::model::ModelConfig;

/// Cap on the generation budget when the caller gives none
pub const DEFAULT_MAX_LENGTH_CAP: usize = 512;
/// Cap on temperature when the caller gives none
pub const DEFAULT_TEMPERATURE_CAP: f32 = 0.7;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.1;

/// A loosely typed request value: clients send numbers or numeric strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    fn as_f64(&self) -> Option<f64> {
        let value = match self {
            ParamValue::Number(n) => *n,
            ParamValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    fn as_count(&self) -> Option<u64> {
        let value = match self {
            ParamValue::Text(s) => match s.trim().parse::<u64>() {
                Ok(n) => return Some(n),
                Err(_) => self.as_f64()?,
            },
            ParamValue::Number(_) => self.as_f64()?,
        };
        (value >= 0.0 && value.fract() == 0.0).then_some(value as u64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Optional per-request generation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub max_length: Option<ParamValue>,
    pub max_new_tokens: Option<ParamValue>,
    pub temperature: Option<ParamValue>,
    pub top_p: Option<ParamValue>,
    pub top_k: Option<ParamValue>,
    pub repetition_penalty: Option<ParamValue>,
    /// Replaces the system instructions for this request
    pub system_instructions: Option<String>,
}

impl GenerationOptions {
    /// True when no sampling parameter was supplied
    pub fn uses_defaults(&self) -> bool {
        self.max_length.is_none()
            && self.max_new_tokens.is_none()
            && self.temperature.is_none()
            && self.top_p.is_none()
            && self.top_k.is_none()
            && self.repetition_penalty.is_none()
    }
}

/// Fully resolved sampling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl ResolvedParams {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            seed: 0,
        }
    }
}

fn coerce<T>(name: &str, value: Option<&ParamValue>, parse: impl Fn(&ParamValue) -> Option<T>) -> Option<T> {
    let value = value?;
    let parsed = parse(value);
    if parsed.is_none() {
        tracing::warn!("Invalid {} value: {:?}. Using model default.", name, value);
    }
    parsed
}

/// Resolve the parameters for one request against `model`'s defaults
pub fn resolve_params(
    model: &ModelConfig,
    defaults: &GenerationDefaults,
    options: &GenerationOptions,
) -> ResolvedParams {
    let registry = &model.generation;

    let mut max_length = registry.max_length.unwrap_or(defaults.max_length);
    let mut temperature = registry.temperature.unwrap_or(defaults.temperature);
    let mut top_p = registry.top_p.unwrap_or(defaults.top_p);
    let mut top_k = registry.top_k.unwrap_or(DEFAULT_TOP_K);
    let mut repetition_penalty = registry
        .repetition_penalty
        .unwrap_or(DEFAULT_REPETITION_PENALTY);

    if options.max_length.is_none() && options.max_new_tokens.is_none() {
        max_length = max_length.min(DEFAULT_MAX_LENGTH_CAP);
    }
    if options.temperature.is_none() {
        temperature = temperature.min(DEFAULT_TEMPERATURE_CAP);
    }

    // max_new_tokens wins over max_length when both are given
    let explicit_length = coerce("max_new_tokens", options.max_new_tokens.as_ref(), ParamValue::as_count)
        .or_else(|| coerce("max_length", options.max_length.as_ref(), ParamValue::as_count));
    if let Some(v) = explicit_length {
        max_length = v as usize;
    }
    if let Some(v) = coerce("temperature", options.temperature.as_ref(), ParamValue::as_f32) {
        temperature = v;
    }
    if let Some(v) = coerce("top_p", options.top_p.as_ref(), ParamValue::as_f32) {
        top_p = v;
    }
    if let Some(v) = coerce("top_k", options.top_k.as_ref(), ParamValue::as_count) {
        top_k = v.min(u32::MAX as u64) as u32;
    }
    if let Some(v) = coerce(
        "repetition_penalty",
        options.repetition_penalty.as_ref(),
        ParamValue::as_f32,
    ) {
        repetition_penalty = v;
    }

    ResolvedParams {
        max_new_tokens: max_length.clamp(1, model.max_length.max(1)),
        temperature: temperature.clamp(0.0, 2.0),
        top_p: top_p.clamp(0.0, 1.0),
        top_k,
        repetition_penalty: repetition_penalty.clamp(1.0, 2.0),
    }
}
