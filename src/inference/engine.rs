//! Generation engine
//!
//! Entry point for every generation request. Runs the idle check, makes sure
//! the right model is loaded, formats the prompt, resolves parameters and
//! then either decodes to completion or hands back a [`TextStream`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::inference::backend::{BackendError, ModelBackend, SamplingConfig, TokenId};
use crate::inference::cache::{CacheKey, ResponseCache};
use crate::inference::error::ModelError;
use crate::inference::manager::{ActiveModel, ModelManager};
use crate::inference::params::{resolve_params, GenerationOptions, ResolvedParams};
use crate::inference::prompt::{clean_response, format_prompt, system_instructions, truncate_at_stop};
use crate::inference::reaper::InactivityReaper;
use crate::inference::streaming::TextStream;
use crate::storage::settings::{GenerationDefaults, Settings};
use crate::types::message::{flatten, ChatMessage};

/// Accelerator utilization above which the cache is cleared before prefill
pub const PREFILL_MEMORY_THRESHOLD: f64 = 0.8;
/// Tokens decoded between wall-clock checks in buffered mode
const BUFFERED_STEP_TOKENS: usize = 16;

/// One generation request
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Model to use; loaded first if it is not the active one
    pub model_id: Option<String>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

struct Prepared {
    active: Arc<ActiveModel>,
    instructions: String,
    formatted: String,
    params: ResolvedParams,
}

/// Clear the accelerator cache if utilization is above `threshold`
pub(crate) fn relieve_memory_pressure(backend: &dyn ModelBackend, threshold: f64) -> bool {
    match backend.memory_usage() {
        Some(memory) if memory.utilization() > threshold => {
            backend.clear_cache();
            tracing::info!(
                "Cleared accelerator cache at {:.0}% utilization",
                memory.utilization() * 100.0
            );
            true
        }
        _ => false,
    }
}

pub struct GenerationEngine {
    manager: Arc<ModelManager>,
    reaper: InactivityReaper,
    cache: ResponseCache,
    defaults: GenerationDefaults,
    default_model: String,
    system_instructions: Option<String>,
    generation_timeout: Duration,
}

impl GenerationEngine {
    pub fn new(manager: Arc<ModelManager>, settings: &Settings) -> Self {
        Self {
            manager,
            reaper: InactivityReaper::from_settings(settings),
            cache: ResponseCache::new(),
            defaults: settings.generation.clone(),
            default_model: settings.default_model.clone(),
            system_instructions: settings.system_instructions.clone(),
            generation_timeout: settings.generation_timeout(),
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Generate a complete response
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ModelError> {
        let prepared = self.prepare(request).await?;
        let active = &prepared.active;

        let cache_key = request
            .options
            .uses_defaults()
            .then(|| CacheKey::new(&active.model_id, &prepared.formatted));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key, active.epoch) {
                tracing::debug!("Response cache hit for {}", active.model_id);
                return Ok(hit);
            }
        }

        let backend = self.manager.backend().clone();
        let tokens = {
            let active = active.clone();
            let formatted = prepared.formatted.clone();
            tokio::task::spawn_blocking(move || active.tokenizer.encode(&formatted, true))
                .await
                .map_err(|e| ModelError::GenerationFailure(e.to_string()))?
                .map_err(|e| ModelError::GenerationFailure(e.to_string()))?
        };
        let tokens: Arc<[TokenId]> = Arc::from(tokens);

        let sampling = prepared.params.sampling();
        let generated = match self.decode(active, &backend, &tokens, &sampling).await {
            Ok(generated) => generated,
            Err(e) if e.is_out_of_memory() => {
                tracing::warn!("Out of memory during generation, clearing cache and retrying with a smaller budget");
                backend.clear_cache();
                let retry = SamplingConfig {
                    max_new_tokens: (sampling.max_new_tokens / 2).max(1),
                    ..sampling
                };
                self.decode(active, &backend, &tokens, &retry)
                    .await
                    .map_err(|e| ModelError::GenerationFailure(e.to_string()))?
            }
            Err(e) => {
                tracing::error!("Generation failed: {}", e);
                return Err(ModelError::GenerationFailure(e.to_string()));
            }
        };

        let mut text = active
            .tokenizer
            .decode(&generated)
            .map_err(|e| ModelError::GenerationFailure(e.to_string()))?;
        truncate_at_stop(&mut text);
        let response = clean_response(&text, &prepared.instructions, &request.prompt);

        if let Some(key) = cache_key {
            self.cache.insert(key, response.clone(), active.epoch);
        }
        Ok(response)
    }

    /// Start a streamed generation. Load failures surface here; failures
    /// after the first chunk only end the stream.
    pub async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, ModelError> {
        let prepared = self.prepare(request).await?;
        Ok(TextStream::new(
            prepared.active,
            self.manager.backend().clone(),
            prepared.formatted,
            prepared.params.sampling(),
        ))
    }

    /// Generate for each prompt in turn
    pub async fn batch_generate(
        &self,
        prompts: &[String],
        model_id: Option<String>,
        options: &GenerationOptions,
    ) -> Result<Vec<String>, ModelError> {
        let mut responses = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let request = GenerationRequest::new(prompt.clone())
                .with_model(model_id.clone())
                .with_options(options.clone());
            responses.push(self.generate(&request).await?);
        }
        Ok(responses)
    }

    /// Generate a reply to a conversation
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model_id: Option<String>,
        options: &GenerationOptions,
    ) -> Result<String, ModelError> {
        let request = GenerationRequest::new(flatten(messages))
            .with_model(model_id)
            .with_options(options.clone());
        self.generate(&request).await
    }

    async fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, ModelError> {
        self.reaper.check(&self.manager).await;

        if let Some(model_id) = &request.model_id {
            if !self.manager.is_loaded(model_id).await {
                self.manager.load(model_id).await?;
            }
        }

        let active = match self.manager.active().await {
            Some(active) => active,
            None => {
                tracing::info!("No model loaded, loading default model {}", self.default_model);
                self.manager.load(&self.default_model).await?;
                self.manager
                    .active()
                    .await
                    .ok_or_else(|| ModelError::GenerationFailure("No model loaded".to_string()))?
            }
        };
        self.manager.touch().await;

        let instructions = system_instructions(
            request.options.system_instructions.as_deref(),
            self.system_instructions.as_deref(),
            &active.config,
        )
        .to_string();
        let formatted = format_prompt(&instructions, &request.prompt);
        let params = resolve_params(&active.config, &self.defaults, &request.options);
        tracing::debug!("Resolved generation parameters for {}: {:?}", active.model_id, params);

        Ok(Prepared {
            active,
            instructions,
            formatted,
            params,
        })
    }

    async fn decode(
        &self,
        active: &Arc<ActiveModel>,
        backend: &Arc<dyn ModelBackend>,
        tokens: &Arc<[TokenId]>,
        sampling: &SamplingConfig,
    ) -> Result<Vec<TokenId>, BackendError> {
        let active = active.clone();
        let backend = backend.clone();
        let tokens = tokens.clone();
        let sampling = sampling.clone();
        let timeout = self.generation_timeout;

        tokio::task::spawn_blocking(move || {
            relieve_memory_pressure(backend.as_ref(), PREFILL_MEMORY_THRESHOLD);
            decode_until(&active, &tokens, &sampling, timeout)
        })
        .await
        .map_err(|e| BackendError::Worker(e.to_string()))?
    }
}

/// Decode up to the budget, stopping early at end of generation or once
/// `timeout` has elapsed. Tokens produced before the cap are kept.
fn decode_until(
    active: &ActiveModel,
    prompt: &[TokenId],
    sampling: &SamplingConfig,
    timeout: Duration,
) -> Result<Vec<TokenId>, BackendError> {
    let started = Instant::now();
    let mut session = active.model.start(prompt, sampling)?;
    let mut generated = Vec::new();

    while generated.len() < sampling.max_new_tokens {
        if started.elapsed() >= timeout {
            tracing::warn!(
                "Generation hit the {}s time cap after {} tokens",
                timeout.as_secs(),
                generated.len()
            );
            break;
        }
        let want = BUFFERED_STEP_TOKENS.min(sampling.max_new_tokens - generated.len());
        let chunk = session.step(want)?;
        if chunk.is_empty() {
            break;
        }
        generated.extend(chunk);
    }
    Ok(generated)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inference::fake::FakeScript;
    use crate::inference::manager::tests::fake_manager;
    use crate::types::message::Role;

    pub(crate) fn fake_engine(script: &FakeScript) -> GenerationEngine {
        GenerationEngine::new(Arc::new(fake_manager(script)), &Settings::default())
    }

    #[tokio::test]
    async fn test_lazy_loads_default_model() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);

        let text = engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert_eq!(text, "Hello from qwen-0.5b");
        assert_eq!(script.loads(), vec!["qwen-0.5b".to_string()]);
    }

    #[tokio::test]
    async fn test_request_model_is_loaded() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);
        engine.manager().load("qwen-0.5b").await.unwrap();

        let request = GenerationRequest::new("Hi").with_model(Some("phi-2".to_string()));
        assert_eq!(engine.generate(&request).await.unwrap(), "Hello from phi-2");
        assert!(engine.manager().is_loaded("phi-2").await);
    }

    #[tokio::test]
    async fn test_default_parameters_hit_cache() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);
        let request = GenerationRequest::new("Hi");

        let first = engine.generate(&request).await.unwrap();
        let second = engine.generate(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn test_explicit_parameters_bypass_cache() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);
        let request = GenerationRequest::new("Hi").with_options(GenerationOptions {
            temperature: Some(0.3.into()),
            ..GenerationOptions::default()
        });

        engine.generate(&request).await.unwrap();
        engine.generate(&request).await.unwrap();
        assert_eq!(script.starts(), 2);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_cache_not_shared_across_models() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);

        let a = GenerationRequest::new("Hi").with_model(Some("qwen-0.5b".to_string()));
        let b = GenerationRequest::new("Hi").with_model(Some("tinyllama-1.1b".to_string()));
        assert_eq!(engine.generate(&a).await.unwrap(), "Hello from qwen-0.5b");
        assert_eq!(engine.generate(&b).await.unwrap(), "Hello from tinyllama-1.1b");
        assert_eq!(engine.generate(&a).await.unwrap(), "Hello from qwen-0.5b");
        assert_eq!(script.starts(), 3);
    }

    #[tokio::test]
    async fn test_oom_retries_once_with_half_budget() {
        let script = FakeScript::default();
        script.oom_steps(1);
        let engine = fake_engine(&script);

        let text = engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert_eq!(text, "Hello from qwen-0.5b");
        let samplings = script.samplings();
        assert_eq!(samplings.len(), 2);
        assert_eq!(samplings[1].max_new_tokens, samplings[0].max_new_tokens / 2);
        assert_eq!(script.clear_cache_calls(), 1);
    }

    #[tokio::test]
    async fn test_second_oom_is_generation_failure() {
        let script = FakeScript::default();
        script.oom_steps(2);
        let engine = fake_engine(&script);

        let err = engine.generate(&GenerationRequest::new("Hi")).await.unwrap_err();
        assert!(matches!(err, ModelError::GenerationFailure(_)));
    }

    #[tokio::test]
    async fn test_other_errors_are_generation_failure() {
        let script = FakeScript::default();
        script.fail_steps();
        let engine = fake_engine(&script);

        let err = engine.generate(&GenerationRequest::new("Hi")).await.unwrap_err();
        assert!(matches!(err, ModelError::GenerationFailure(_)));
        assert_eq!(script.starts(), 1);
    }

    #[tokio::test]
    async fn test_output_cleanup() {
        let script = FakeScript::default();
        script.respond("qwen-0.5b", " Hi Paris is the capital.</s>extra");
        let engine = fake_engine(&script);

        let text = engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert_eq!(text, "Paris is the capital.");
    }

    #[tokio::test]
    async fn test_short_prompt_inside_answer_is_kept() {
        let script = FakeScript::default();
        script.respond("qwen-0.5b", "banana bread");
        let engine = fake_engine(&script);

        let text = engine.generate(&GenerationRequest::new("a")).await.unwrap();
        assert_eq!(text, "banana bread");
    }

    #[tokio::test]
    async fn test_memory_pressure_clears_cache_before_decode() {
        let script = FakeScript::default();
        script.memory(850, 1000);
        let engine = fake_engine(&script);

        engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert_eq!(script.clear_cache_calls(), 1);
    }

    #[tokio::test]
    async fn test_time_cap_returns_partial_output() {
        let script = FakeScript::default();
        script
            .respond("qwen-0.5b", &"x".repeat(64))
            .step_delay(Duration::from_millis(30));
        let engine = fake_engine(&script).with_generation_timeout(Duration::from_millis(50));

        let text = engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert!(!text.is_empty());
        assert!(text.len() < 64);
    }

    #[tokio::test]
    async fn test_load_failure_surfaces() {
        let script = FakeScript::default();
        script.fail_load("qwen-0.5b");
        let engine = fake_engine(&script);

        let err = engine.generate(&GenerationRequest::new("Hi")).await.unwrap_err();
        assert!(matches!(err, ModelError::LoadFailure { .. }));
    }

    #[tokio::test]
    async fn test_batch_and_chat() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);

        let prompts = vec!["a".to_string(), "b".to_string()];
        let out = engine
            .batch_generate(&prompts, None, &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);

        let messages = vec![ChatMessage::new(Role::User, "Hello")];
        let reply = engine
            .chat(&messages, None, &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "Hello from qwen-0.5b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_model_is_reaped_then_reloaded() {
        let script = FakeScript::default();
        let engine = fake_engine(&script);
        engine.generate(&GenerationRequest::new("Hi")).await.unwrap();

        tokio::time::advance(Duration::from_secs(1801)).await;
        engine.generate(&GenerationRequest::new("Hi")).await.unwrap();
        assert_eq!(script.loads().len(), 2);
        assert_eq!(script.clear_cache_calls(), 1);
    }
}
