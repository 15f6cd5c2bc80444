//! Model registry
//!
//! Static metadata for the models the server knows by short id. Anything else
//! (a HuggingFace repo, a URL, a local `.gguf` path) gets a synthesized entry.

use once_cell::sync::Lazy;

use crate::types::model::{ModelConfig, ModelGenerationDefaults, WeightVariant};

/// Instructions used when neither the request, the settings nor the registry
/// entry provide any
pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str = "You are a helpful virtual assistant. \
Your responses should be clear, concise, and direct. Answer the user's question \
without repeating it.";

fn files(entries: &[(WeightVariant, &str)]) -> Vec<(WeightVariant, String)> {
    entries.iter().map(|(v, f)| (*v, f.to_string())).collect()
}

pub static MODEL_REGISTRY: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig {
            id: "qwen-0.5b".to_string(),
            name: "Qwen2.5 0.5B Instruct".to_string(),
            description: "Small and fast instruction-tuned model, suitable for CPUs".to_string(),
            registered: true,
            repo: Some("Qwen/Qwen2.5-0.5B-Instruct-GGUF".to_string()),
            files: files(&[
                (WeightVariant::F16, "qwen2.5-0.5b-instruct-fp16.gguf"),
                (WeightVariant::Q8_0, "qwen2.5-0.5b-instruct-q8_0.gguf"),
                (WeightVariant::Q4KM, "qwen2.5-0.5b-instruct-q4_k_m.gguf"),
            ]),
            ram_mb: Some(1024),
            vram_mb: Some(1024),
            max_length: 32768,
            fallback: None,
            system_instructions: None,
            generation: ModelGenerationDefaults {
                max_length: Some(2048),
                temperature: Some(0.7),
                top_p: Some(0.9),
                top_k: Some(40),
                repetition_penalty: Some(1.1),
            },
        },
        ModelConfig {
            id: "qwen-1.5b".to_string(),
            name: "Qwen2.5 1.5B Instruct".to_string(),
            description: "Larger Qwen model with better reasoning, needs more memory".to_string(),
            registered: true,
            repo: Some("Qwen/Qwen2.5-1.5B-Instruct-GGUF".to_string()),
            files: files(&[
                (WeightVariant::F16, "qwen2.5-1.5b-instruct-fp16.gguf"),
                (WeightVariant::Q8_0, "qwen2.5-1.5b-instruct-q8_0.gguf"),
                (WeightVariant::Q4KM, "qwen2.5-1.5b-instruct-q4_k_m.gguf"),
            ]),
            ram_mb: Some(3072),
            vram_mb: Some(3072),
            max_length: 32768,
            fallback: Some("qwen-0.5b".to_string()),
            system_instructions: None,
            generation: ModelGenerationDefaults {
                max_length: Some(2048),
                temperature: Some(0.7),
                top_p: Some(0.9),
                top_k: Some(40),
                repetition_penalty: Some(1.1),
            },
        },
        ModelConfig {
            id: "phi-2".to_string(),
            name: "Microsoft Phi-2".to_string(),
            description: "2.7B model tuned for reasoning and code".to_string(),
            registered: true,
            repo: Some("TheBloke/phi-2-GGUF".to_string()),
            files: files(&[
                (WeightVariant::Q8_0, "phi-2.Q8_0.gguf"),
                (WeightVariant::Q4KM, "phi-2.Q4_K_M.gguf"),
            ]),
            ram_mb: Some(5632),
            vram_mb: Some(3072),
            max_length: 2048,
            fallback: Some("qwen-0.5b".to_string()),
            system_instructions: Some(
                "You are a precise assistant. Think step by step and keep answers short."
                    .to_string(),
            ),
            generation: ModelGenerationDefaults {
                max_length: Some(1024),
                temperature: Some(0.6),
                top_p: Some(0.9),
                top_k: None,
                repetition_penalty: Some(1.15),
            },
        },
        ModelConfig {
            id: "tinyllama-1.1b".to_string(),
            name: "TinyLlama 1.1B Chat".to_string(),
            description: "Compact Llama-architecture chat model".to_string(),
            registered: true,
            repo: Some("TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF".to_string()),
            files: files(&[
                (WeightVariant::Q8_0, "tinyllama-1.1b-chat-v1.0.Q8_0.gguf"),
                (WeightVariant::Q4KM, "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf"),
            ]),
            ram_mb: Some(2048),
            vram_mb: Some(1536),
            max_length: 2048,
            fallback: Some("qwen-0.5b".to_string()),
            system_instructions: None,
            generation: ModelGenerationDefaults {
                max_length: Some(1024),
                temperature: Some(0.7),
                top_p: Some(0.95),
                top_k: Some(50),
                repetition_penalty: None,
            },
        },
    ]
});

/// Registered entry for `id`, if any
pub fn registered(id: &str) -> Option<&'static ModelConfig> {
    MODEL_REGISTRY.iter().find(|m| m.id == id)
}

/// Config for `id`: the registry entry, or a synthesized one that falls back
/// to `fallback_model`
pub fn model_config(id: &str, fallback_model: &str) -> ModelConfig {
    match registered(id) {
        Some(config) => config.clone(),
        None => ModelConfig::synthesized(id, Some(fallback_model.to_string())),
    }
}
