//! Settings storage
//!
//! Server configuration persisted as JSON in the data directory and overlaid
//! by `LOCALLAB_*` environment variables at startup.

use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Model used when a request arrives and nothing is loaded
pub const DEFAULT_MODEL: &str = "qwen-0.5b";

/// Interpret a loose config string as a flag.
///
/// `"false"`, `"0"`, `"none"` and the empty string are disabled; anything else
/// is enabled.
pub fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    !matches!(v.as_str(), "false" | "0" | "none" | "")
}

/// Load-time optimization switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    pub enable_quantization: bool,
    /// `int8` or `int4`; anything else falls back to fp16
    pub quantization_type: String,
    pub enable_attention_slicing: bool,
    pub enable_cpu_offloading: bool,
    /// Graph rewrite pass (BetterTransformer in the HF world)
    pub enable_better_transformer: bool,
    pub enable_flash_attention: bool,
    pub enable_memory_efficient_attention: bool,
    pub enable_gradient_checkpointing: bool,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            enable_quantization: false,
            quantization_type: "int8".to_string(),
            enable_attention_slicing: false,
            enable_cpu_offloading: false,
            enable_better_transformer: false,
            enable_flash_attention: false,
            enable_memory_efficient_attention: true,
            enable_gradient_checkpointing: true,
        }
    }
}

/// Global generation defaults, used when neither the request nor the model
/// registry supplies a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub max_length: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_length: 2048,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Model loaded at startup and on the first request when none is resident
    pub default_model: String,
    /// Fallback for ids that are not in the registry
    pub fallback_model: String,
    /// Directory where GGUF files are stored
    pub models_directory: PathBuf,
    /// HuggingFace access token for gated repos
    pub hf_token: Option<String>,
    pub optimizations: OptimizationSettings,
    pub generation: GenerationDefaults,
    /// Unload the model after `model_timeout_secs` without a generation call
    pub unload_unused_models: bool,
    pub model_timeout_secs: u64,
    /// Wall-clock cap on a non-streaming generation
    pub generation_timeout_secs: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    /// Replaces the per-model system instructions for every request
    pub system_instructions: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            default_model: DEFAULT_MODEL.to_string(),
            fallback_model: DEFAULT_MODEL.to_string(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            hf_token: None,
            optimizations: OptimizationSettings::default(),
            generation: GenerationDefaults::default(),
            unload_unused_models: true,
            model_timeout_secs: 1800,
            generation_timeout_secs: 30,
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            system_instructions: None,
        }
    }
}

impl Settings {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate settings values
    ///
    /// Clamps sampling defaults into range and repairs empty identifiers.
    pub fn validate(&mut self) {
        self.generation.temperature = self.generation.temperature.clamp(0.0, 2.0);
        self.generation.top_p = self.generation.top_p.clamp(0.0, 1.0);
        self.generation.max_length = self.generation.max_length.clamp(1, 32768);

        if self.port == 0 {
            self.port = 8000;
        }
        if self.default_model.trim().is_empty() {
            self.default_model = DEFAULT_MODEL.to_string();
        }
        if self.fallback_model.trim().is_empty() {
            self.fallback_model = DEFAULT_MODEL.to_string();
        }
        if self.model_timeout_secs == 0 {
            self.model_timeout_secs = 1800;
        }
        if self.generation_timeout_secs == 0 {
            self.generation_timeout_secs = 30;
        }

        self.optimizations.quantization_type =
            self.optimizations.quantization_type.trim().to_ascii_lowercase();

        if self.hf_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.hf_token = None;
        }
        if self
            .system_instructions
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            self.system_instructions = None;
        }
    }

    /// Overlay values from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary key lookup.
    ///
    /// Unparseable numbers are logged and ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw),
                }
            }
        }

        if let Some(host) = lookup("LOCALLAB_HOST") {
            self.host = host;
        }
        number("LOCALLAB_PORT", lookup("LOCALLAB_PORT"), &mut self.port);

        if let Some(model) = lookup("HUGGINGFACE_MODEL").or_else(|| lookup("LOCALLAB_DEFAULT_MODEL")) {
            self.default_model = model;
        }
        if let Some(model) = lookup("LOCALLAB_FALLBACK_MODEL") {
            self.fallback_model = model;
        }
        if let Some(dir) = lookup("LOCALLAB_MODELS_DIR") {
            self.models_directory = PathBuf::from(dir);
        }
        if let Some(token) = lookup("HUGGINGFACE_TOKEN") {
            self.hf_token = Some(token);
        }

        let opts = &mut self.optimizations;
        let flags: [(&str, &mut bool); 7] = [
            ("LOCALLAB_ENABLE_QUANTIZATION", &mut opts.enable_quantization),
            ("LOCALLAB_ENABLE_ATTENTION_SLICING", &mut opts.enable_attention_slicing),
            ("LOCALLAB_ENABLE_CPU_OFFLOADING", &mut opts.enable_cpu_offloading),
            ("LOCALLAB_ENABLE_BETTERTRANSFORMER", &mut opts.enable_better_transformer),
            ("LOCALLAB_ENABLE_FLASH_ATTENTION", &mut opts.enable_flash_attention),
            (
                "LOCALLAB_ENABLE_MEMORY_EFFICIENT_ATTENTION",
                &mut opts.enable_memory_efficient_attention,
            ),
            (
                "LOCALLAB_ENABLE_GRADIENT_CHECKPOINTING",
                &mut opts.enable_gradient_checkpointing,
            ),
        ];
        for (key, slot) in flags {
            if let Some(raw) = lookup(key) {
                *slot = parse_flag(&raw);
            }
        }
        if let Some(scheme) = lookup("LOCALLAB_QUANTIZATION_TYPE") {
            opts.quantization_type = scheme;
        }

        let defaults = &mut self.generation;
        number("LOCALLAB_DEFAULT_MAX_LENGTH", lookup("LOCALLAB_DEFAULT_MAX_LENGTH"), &mut defaults.max_length);
        number("LOCALLAB_DEFAULT_TEMPERATURE", lookup("LOCALLAB_DEFAULT_TEMPERATURE"), &mut defaults.temperature);
        number("LOCALLAB_DEFAULT_TOP_P", lookup("LOCALLAB_DEFAULT_TOP_P"), &mut defaults.top_p);

        if let Some(raw) = lookup("LOCALLAB_UNLOAD_UNUSED_MODELS") {
            self.unload_unused_models = parse_flag(&raw);
        }
        number("LOCALLAB_MODEL_TIMEOUT", lookup("LOCALLAB_MODEL_TIMEOUT"), &mut self.model_timeout_secs);
        number(
            "LOCALLAB_GENERATION_TIMEOUT",
            lookup("LOCALLAB_GENERATION_TIMEOUT"),
            &mut self.generation_timeout_secs,
        );

        if let Some(raw) = lookup("LOCALLAB_ENABLE_CORS") {
            self.enable_cors = parse_flag(&raw);
        }
        if let Some(raw) = lookup("LOCALLAB_CORS_ORIGINS") {
            self.cors_origins = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(text) = lookup("LOCALLAB_SYSTEM_INSTRUCTIONS") {
            self.system_instructions = Some(text);
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk, then apply environment overrides.
///
/// Falls back to defaults if the file doesn't exist or is corrupted.
pub fn load_settings() -> Settings {
    let mut settings = match get_settings_path().and_then(|p| load_settings_from(&p)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    // First run: write the defaults out so there is a file to edit
    if matches!(get_settings_path(), Ok(p) if !p.exists()) {
        if let Err(e) = save_settings(&settings) {
            tracing::warn!("Failed to write default settings: {}", e);
        }
    }

    settings.apply_env_overrides();
    settings.validate();
    settings
}

/// Read a settings file. A missing file yields defaults.
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found at {:?}, using defaults", path);
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&json)?;

    tracing::debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &Settings, path: &std::path::Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_flag() {
        for off in ["false", "FALSE", "0", "none", "", "  "] {
            assert!(!parse_flag(off), "{off:?} should be off");
        }
        for on in ["true", "1", "yes", "max"] {
            assert!(parse_flag(on), "{on:?} should be on");
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.default_model, "qwen-0.5b");
        assert_eq!(settings.port, 8000);
        assert!(!settings.optimizations.enable_quantization);
        assert!(settings.unload_unused_models);
        assert_eq!(settings.model_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.generation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        settings.generation.temperature = 5.0;
        settings.generation.top_p = -1.0;
        settings.generation.max_length = 0;
        settings.default_model = "  ".to_string();
        settings.optimizations.quantization_type = " INT4 ".to_string();
        settings.hf_token = Some(String::new());
        settings.validate();

        assert_eq!(settings.generation.temperature, 2.0);
        assert_eq!(settings.generation.top_p, 0.0);
        assert_eq!(settings.generation.max_length, 1);
        assert_eq!(settings.default_model, DEFAULT_MODEL);
        assert_eq!(settings.optimizations.quantization_type, "int4");
        assert!(settings.hf_token.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LOCALLAB_PORT", "9001"),
            ("HUGGINGFACE_MODEL", "phi-2"),
            ("LOCALLAB_ENABLE_QUANTIZATION", "true"),
            ("LOCALLAB_QUANTIZATION_TYPE", "int4"),
            ("LOCALLAB_ENABLE_ATTENTION_SLICING", "none"),
            ("LOCALLAB_ENABLE_FLASH_ATTENTION", "1"),
            ("LOCALLAB_MODEL_TIMEOUT", "not-a-number"),
            ("LOCALLAB_CORS_ORIGINS", "http://a, http://b,"),
        ]);

        let mut settings = Settings::default();
        settings.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.port, 9001);
        assert_eq!(settings.default_model, "phi-2");
        assert!(settings.optimizations.enable_quantization);
        assert_eq!(settings.optimizations.quantization_type, "int4");
        assert!(!settings.optimizations.enable_attention_slicing);
        assert!(settings.optimizations.enable_flash_attention);
        assert_eq!(settings.model_timeout_secs, 1800);
        assert_eq!(settings.cors_origins, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.default_model = "tinyllama-1.1b".to_string();
        settings.optimizations.enable_cpu_offloading = true;
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.default_model, "tinyllama-1.1b");
        assert!(loaded.optimizations.enable_cpu_offloading);
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"port": 7000, "optimizations": {"enable_flash_attention": true}}"#).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.port, 7000);
        assert!(loaded.optimizations.enable_flash_attention);
        assert_eq!(loaded.optimizations.quantization_type, "int8");
        assert_eq!(loaded.default_model, DEFAULT_MODEL);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.port, 8000);
    }
}
