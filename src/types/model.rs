//! Model types
//!
//! Registry metadata for servable models and the info view reported for the
//! active model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk weight format of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightVariant {
    F32,
    F16,
    Q8_0,
    Q4KM,
}

impl WeightVariant {
    /// Filename spellings used for the variant across GGUF publishers,
    /// canonical tag first
    pub fn file_tags(&self) -> &'static [&'static str] {
        match self {
            WeightVariant::F32 => &["f32", "fp32"],
            WeightVariant::F16 => &["f16", "fp16"],
            WeightVariant::Q8_0 => &["q8_0"],
            WeightVariant::Q4KM => &["q4_k_m"],
        }
    }
}

impl fmt::Display for WeightVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_tags()[0])
    }
}

/// Per-model generation defaults; unset fields fall through to the global
/// defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelGenerationDefaults {
    pub max_length: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f32>,
}

/// Static description of a servable model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier used in requests (`qwen-0.5b`, or a raw HF/path spec)
    pub id: String,
    /// Display name
    pub name: String,
    pub description: String,
    /// False for configs synthesized for ids missing from the registry
    pub registered: bool,
    /// HuggingFace repository holding the GGUF files
    pub repo: Option<String>,
    /// Available GGUF files by weight variant
    pub files: Vec<(WeightVariant, String)>,
    /// Approximate RAM needed, in MB
    pub ram_mb: Option<u64>,
    /// Approximate VRAM needed, in MB
    pub vram_mb: Option<u64>,
    /// Maximum context length
    pub max_length: usize,
    /// Model tried when this one fails to load
    pub fallback: Option<String>,
    /// Default system instructions for prompts
    pub system_instructions: Option<String>,
    pub generation: ModelGenerationDefaults,
}

impl ModelConfig {
    /// Config for an id the registry does not know
    pub fn synthesized(id: &str, fallback: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("Custom model: {}", id),
            registered: false,
            repo: None,
            files: Vec::new(),
            ram_mb: None,
            vram_mb: None,
            max_length: 2048,
            fallback: fallback.filter(|f| f != id),
            system_instructions: None,
            generation: ModelGenerationDefaults::default(),
        }
    }

    /// GGUF file for the first variant in `preference` this model ships,
    /// else the first file listed
    pub fn file_for(&self, preference: &[WeightVariant]) -> Option<(WeightVariant, &str)> {
        preference
            .iter()
            .find_map(|want| {
                self.files
                    .iter()
                    .find(|(v, _)| v == want)
                    .map(|(v, f)| (*v, f.as_str()))
            })
            .or_else(|| self.files.first().map(|(v, f)| (*v, f.as_str())))
    }
}

/// Snapshot of the active model, as reported by `/models/current`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoView {
    pub model_id: String,
    pub model_name: String,
    /// Parameter count formatted in millions, e.g. `494.0M`
    pub parameters: String,
    pub parameter_count: u64,
    pub architecture: String,
    pub device: String,
    pub max_length: usize,
    pub ram_required: Option<u64>,
    pub vram_required: Option<u64>,
    pub memory_used: String,
    pub quantization: String,
    /// GGUF file the weights were read from
    pub weight_file: String,
    /// Optimization name -> outcome (`applied`, `disabled`, `unsupported`, `failed: ...`)
    pub optimizations: Vec<(String, String)>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    pub load_time_secs: f64,
}

/// Format a byte count for humans
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(files: Vec<(WeightVariant, String)>) -> ModelConfig {
        ModelConfig {
            files,
            ..ModelConfig::synthesized("demo", None)
        }
    }

    #[test]
    fn test_file_for_prefers_in_order() {
        let config = config_with(vec![
            (WeightVariant::F16, "m-f16.gguf".to_string()),
            (WeightVariant::Q4KM, "m-q4_k_m.gguf".to_string()),
        ]);
        let (variant, file) = config
            .file_for(&[WeightVariant::Q8_0, WeightVariant::Q4KM])
            .unwrap();
        assert_eq!(variant, WeightVariant::Q4KM);
        assert_eq!(file, "m-q4_k_m.gguf");
    }

    #[test]
    fn test_file_for_falls_back_to_first() {
        let config = config_with(vec![(WeightVariant::Q8_0, "m-q8_0.gguf".to_string())]);
        let (variant, _) = config.file_for(&[WeightVariant::F32]).unwrap();
        assert_eq!(variant, WeightVariant::Q8_0);
        assert!(config_with(Vec::new()).file_for(&[WeightVariant::F16]).is_none());
    }

    #[test]
    fn test_synthesized_never_falls_back_to_itself() {
        let config = ModelConfig::synthesized("qwen-0.5b", Some("qwen-0.5b".to_string()));
        assert!(config.fallback.is_none());
        assert!(!config.registered);
        let config = ModelConfig::synthesized("x/y", Some("qwen-0.5b".to_string()));
        assert_eq!(config.fallback.as_deref(), Some("qwen-0.5b"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_variant_serialization() {
        assert_eq!(serde_json::to_string(&WeightVariant::Q4KM).unwrap(), "\"q4_km\"");
        assert_eq!(WeightVariant::Q4KM.to_string(), "q4_k_m");
        assert_eq!(WeightVariant::F16.to_string(), "f16");
    }
}
