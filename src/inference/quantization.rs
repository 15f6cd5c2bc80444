//! Load-time precision and placement
//!
//! Turns the optimization settings plus the detected accelerator into the
//! parameters a backend loads with. Never fails: an unusable request degrades
//! to a half-precision (GPU) or full-precision (CPU) config.

use serde::Serialize;

use crate::inference::backend::AcceleratorInfo;
use crate::storage::settings::OptimizationSettings;
use crate::system::gpu::GpuKind;
use crate::types::model::WeightVariant;

/// Offload every layer (llama.cpp clamps to the real layer count)
pub const ALL_LAYERS: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantScheme {
    Int8,
    Int4,
}

impl QuantScheme {
    /// Parse a configured scheme name; `None` for empty, "none" or unknown
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "int8" | "8bit" | "q8_0" => Some(QuantScheme::Int8),
            "int4" | "4bit" | "q4_k_m" => Some(QuantScheme::Int4),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QuantScheme::Int8 => "int8",
            QuantScheme::Int4 => "int4",
        }
    }
}

/// Parameters a model is loaded with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadConfig {
    pub precision: Precision,
    pub quantization: Option<QuantScheme>,
    pub device: GpuKind,
    /// Layers offloaded to the accelerator; 0 keeps everything on the CPU
    pub gpu_layers: u32,
}

impl LoadConfig {
    /// CPU-safe config: full precision, nothing offloaded
    pub fn cpu() -> Self {
        Self {
            precision: Precision::Full,
            quantization: None,
            device: GpuKind::None,
            gpu_layers: 0,
        }
    }

    /// Half precision with every layer on `device`
    pub fn half(device: GpuKind) -> Self {
        Self {
            precision: Precision::Half,
            quantization: None,
            device,
            gpu_layers: ALL_LAYERS,
        }
    }

    /// GGUF weight variants to look for, best match first
    pub fn weight_preference(&self) -> Vec<WeightVariant> {
        match (self.quantization, self.precision) {
            (Some(QuantScheme::Int8), _) => vec![
                WeightVariant::Q8_0,
                WeightVariant::Q4KM,
                WeightVariant::F16,
            ],
            (Some(QuantScheme::Int4), _) => vec![
                WeightVariant::Q4KM,
                WeightVariant::Q8_0,
                WeightVariant::F16,
            ],
            (None, Precision::Half) => vec![
                WeightVariant::F16,
                WeightVariant::F32,
                WeightVariant::Q8_0,
            ],
            (None, Precision::Full) => vec![
                WeightVariant::F32,
                WeightVariant::F16,
                WeightVariant::Q8_0,
            ],
        }
    }

    /// Label reported in model info
    pub fn quantization_label(&self) -> &'static str {
        self.quantization.map(|q| q.label()).unwrap_or("None")
    }
}

/// Pick load parameters for the current settings and hardware
pub fn select_load_config(
    settings: &OptimizationSettings,
    accelerator: &AcceleratorInfo,
) -> LoadConfig {
    if !accelerator.available {
        tracing::warn!("No accelerator available - quantized kernels require one");
        tracing::info!("Disabling quantization and using CPU-compatible settings");
        return LoadConfig::cpu();
    }

    if !settings.enable_quantization {
        tracing::info!("Quantization is disabled, using half precision on {}", accelerator.name);
        return LoadConfig::half(accelerator.kind);
    }

    if !accelerator.offload_supported {
        tracing::warn!(
            "Backend build cannot offload to {}; falling back to half precision",
            accelerator.name
        );
        return LoadConfig::half(accelerator.kind);
    }

    match QuantScheme::parse(&settings.quantization_type) {
        Some(scheme) => {
            tracing::info!("Using {} quantization", scheme.label().to_uppercase());
            LoadConfig {
                quantization: Some(scheme),
                ..LoadConfig::half(accelerator.kind)
            }
        }
        None => {
            let requested = settings.quantization_type.trim();
            if requested.is_empty() || requested.eq_ignore_ascii_case("none") {
                tracing::info!("No quantization type specified, defaulting to fp16");
            } else {
                tracing::info!(
                    "Unrecognized quantization type '{}', defaulting to fp16",
                    requested
                );
            }
            LoadConfig::half(accelerator.kind)
        }
    }
}
