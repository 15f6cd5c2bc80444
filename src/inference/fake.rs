//! Scripted backend for tests
//!
//! Tokens are bytes: a model "generates" its scripted response one byte per
//! token, so token counts and text lengths line up. `chars_per_token` widens
//! each token's rendered text for tests that need long output per token.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::inference::backend::{
    AcceleratorInfo, AcceleratorMemory, BackendError, Capabilities, DecodeSession, LanguageModel,
    LoadedModel, ModelBackend, ModelSource, ModelStats, SamplingConfig, TokenId, Tokenizer,
};
use crate::inference::quantization::LoadConfig;
use crate::storage::huggingface::{DownloadError, ModelResolver};
use crate::types::model::{ModelConfig, WeightVariant};

#[derive(Default)]
struct ScriptState {
    responses: HashMap<String, String>,
    failing_loads: HashSet<String>,
    failing_resolves: HashSet<String>,
    failing_optimizations: HashSet<String>,
    load_delay: Duration,
    step_delay: Duration,
    oom_steps: usize,
    fail_steps: bool,
    chars_per_token: usize,
    memory: Option<AcceleratorMemory>,
    accelerator: Option<AcceleratorInfo>,

    loads: Vec<String>,
    load_configs: Vec<LoadConfig>,
    samplings: Vec<SamplingConfig>,
    starts: usize,
    steps: usize,
    clear_cache_calls: usize,
    applied: Vec<String>,
    inference_mode: bool,
}

/// Shared handle used to script the fake and read its counters
#[derive(Clone, Default)]
pub struct FakeScript(Arc<Mutex<ScriptState>>);

impl FakeScript {
    fn with<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn respond(&self, model_id: &str, text: &str) -> &Self {
        self.with(|s| s.responses.insert(model_id.to_string(), text.to_string()));
        self
    }

    pub fn fail_load(&self, model_id: &str) -> &Self {
        self.with(|s| s.failing_loads.insert(model_id.to_string()));
        self
    }

    pub fn fail_resolve(&self, model_id: &str) -> &Self {
        self.with(|s| s.failing_resolves.insert(model_id.to_string()));
        self
    }

    pub fn fail_optimization(&self, name: &str) -> &Self {
        self.with(|s| s.failing_optimizations.insert(name.to_string()));
        self
    }

    pub fn load_delay(&self, delay: Duration) -> &Self {
        self.with(|s| s.load_delay = delay);
        self
    }

    pub fn step_delay(&self, delay: Duration) -> &Self {
        self.with(|s| s.step_delay = delay);
        self
    }

    /// The next `count` decode steps fail with out-of-memory
    pub fn oom_steps(&self, count: usize) -> &Self {
        self.with(|s| s.oom_steps = count);
        self
    }

    pub fn fail_steps(&self) -> &Self {
        self.with(|s| s.fail_steps = true);
        self
    }

    /// Render every token as its byte repeated `count` times
    pub fn chars_per_token(&self, count: usize) -> &Self {
        self.with(|s| s.chars_per_token = count);
        self
    }

    pub fn memory(&self, used_mb: u64, total_mb: u64) -> &Self {
        self.with(|s| s.memory = Some(AcceleratorMemory { used_mb, total_mb }));
        self
    }

    pub fn accelerator(&self, info: AcceleratorInfo) -> &Self {
        self.with(|s| s.accelerator = Some(info));
        self
    }

    pub fn loads(&self) -> Vec<String> {
        self.with(|s| s.loads.clone())
    }

    pub fn load_configs(&self) -> Vec<LoadConfig> {
        self.with(|s| s.load_configs.clone())
    }

    pub fn samplings(&self) -> Vec<SamplingConfig> {
        self.with(|s| s.samplings.clone())
    }

    pub fn starts(&self) -> usize {
        self.with(|s| s.starts)
    }

    pub fn steps(&self) -> usize {
        self.with(|s| s.steps)
    }

    pub fn clear_cache_calls(&self) -> usize {
        self.with(|s| s.clear_cache_calls)
    }

    pub fn applied(&self) -> Vec<String> {
        self.with(|s| s.applied.clone())
    }

    pub fn inference_mode(&self) -> bool {
        self.with(|s| s.inference_mode)
    }

    fn response_for(&self, model_id: &str) -> String {
        self.with(|s| {
            s.responses
                .get(model_id)
                .cloned()
                .unwrap_or_else(|| format!("Hello from {}", model_id))
        })
    }

    fn record_optimization(&self, name: &str) -> Result<(), BackendError> {
        self.with(|s| {
            if s.failing_optimizations.contains(name) {
                Err(BackendError::Inference(format!("{} exploded", name)))
            } else {
                s.applied.push(name.to_string());
                Ok(())
            }
        })
    }
}

pub struct FakeTokenizer {
    script: FakeScript,
}

impl Tokenizer for FakeTokenizer {
    fn encode(&self, text: &str, _add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn token_bytes(&self, tokens: &[TokenId]) -> Result<Vec<u8>, BackendError> {
        let width = self.script.with(|s| s.chars_per_token.max(1));
        Ok(tokens
            .iter()
            .flat_map(|t| std::iter::repeat(*t as u8).take(width))
            .collect())
    }
}

pub struct FakeModel {
    model_id: String,
    script: FakeScript,
    capabilities: Capabilities,
    rewritten: bool,
}

impl FakeModel {
    pub fn new(script: FakeScript) -> Self {
        Self {
            model_id: "fake".to_string(),
            script,
            capabilities: Capabilities::default(),
            rewritten: false,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl LanguageModel for FakeModel {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn stats(&self) -> ModelStats {
        ModelStats {
            parameter_count: 494_000_000,
            size_bytes: 988_000_000,
            architecture: if self.rewritten {
                "fake (rewritten)".to_string()
            } else {
                "fake".to_string()
            },
            context_length: 4096,
        }
    }

    fn enable_attention_slicing(&mut self) -> Result<(), BackendError> {
        self.script.record_optimization("attention_slicing")
    }

    fn enable_cpu_offload(&mut self) -> Result<(), BackendError> {
        self.script.record_optimization("cpu_offload")
    }

    fn rewrite_graph(
        mut self: Box<Self>,
    ) -> Result<Box<dyn LanguageModel>, (Box<dyn LanguageModel>, BackendError)> {
        match self.script.record_optimization("better_transformer") {
            Ok(()) => {
                self.rewritten = true;
                Ok(self)
            }
            Err(e) => Err((self, e)),
        }
    }

    fn enable_flash_attention(&mut self) -> Result<(), BackendError> {
        self.script.record_optimization("flash_attention")
    }

    fn enable_memory_efficient_attention(&mut self) -> Result<(), BackendError> {
        self.script.record_optimization("memory_efficient_attention")
    }

    fn enable_gradient_checkpointing(&mut self) -> Result<(), BackendError> {
        self.script.record_optimization("gradient_checkpointing")
    }

    fn set_inference_mode(&mut self) {
        self.script.with(|s| s.inference_mode = true);
    }

    fn start(
        &self,
        _prompt: &[TokenId],
        sampling: &SamplingConfig,
    ) -> Result<Box<dyn DecodeSession>, BackendError> {
        self.script.with(|s| {
            s.starts += 1;
            s.samplings.push(sampling.clone());
        });
        let tokens = self
            .script
            .response_for(&self.model_id)
            .bytes()
            .map(TokenId::from)
            .collect();
        Ok(Box::new(FakeSession {
            tokens,
            pos: 0,
            budget: sampling.max_new_tokens,
            script: self.script.clone(),
        }))
    }
}

struct FakeSession {
    tokens: Vec<TokenId>,
    pos: usize,
    budget: usize,
    script: FakeScript,
}

impl DecodeSession for FakeSession {
    fn step(&mut self, max_new: usize) -> Result<Vec<TokenId>, BackendError> {
        let (delay, oom, fail) = self.script.with(|s| {
            s.steps += 1;
            let oom = s.oom_steps > 0;
            if oom {
                s.oom_steps -= 1;
            }
            (s.step_delay, oom, s.fail_steps)
        });
        if oom {
            return Err(BackendError::OutOfMemory("scripted".to_string()));
        }
        if fail {
            return Err(BackendError::Inference("scripted failure".to_string()));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let take = max_new
            .min(self.budget)
            .min(self.tokens.len() - self.pos);
        let out = self.tokens[self.pos..self.pos + take].to_vec();
        self.pos += take;
        self.budget -= take;
        Ok(out)
    }
}

/// Backend whose behaviour is driven by a [`FakeScript`]
pub struct FakeBackend {
    script: FakeScript,
}

impl FakeBackend {
    pub fn new(script: FakeScript) -> Self {
        Self { script }
    }
}

impl ModelBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn detect_accelerator(&self) -> AcceleratorInfo {
        self.script
            .with(|s| s.accelerator.clone())
            .unwrap_or_else(AcceleratorInfo::cpu)
    }

    fn load(
        &self,
        source: &ModelSource,
        config: &LoadConfig,
    ) -> Result<LoadedModel, BackendError> {
        let (delay, fails) = self.script.with(|s| {
            s.loads.push(source.model_id.clone());
            s.load_configs.push(config.clone());
            (s.load_delay, s.failing_loads.contains(&source.model_id))
        });
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fails {
            return Err(BackendError::Load(format!(
                "scripted failure for {}",
                source.model_id
            )));
        }

        Ok(LoadedModel {
            model: Box::new(FakeModel {
                model_id: source.model_id.clone(),
                script: self.script.clone(),
                capabilities: Capabilities {
                    attention_slicing: true,
                    ..Capabilities::default()
                },
                rewritten: false,
            }),
            tokenizer: Arc::new(FakeTokenizer {
                script: self.script.clone(),
            }),
        })
    }

    fn memory_usage(&self) -> Option<AcceleratorMemory> {
        self.script.with(|s| s.memory)
    }

    fn clear_cache(&self) {
        self.script.with(|s| s.clear_cache_calls += 1);
    }
}

/// Resolver that maps every model to a path that is never read
pub struct FakeResolver {
    script: FakeScript,
}

impl FakeResolver {
    pub fn new(script: FakeScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl ModelResolver for FakeResolver {
    async fn resolve(
        &self,
        config: &ModelConfig,
        _preference: &[WeightVariant],
    ) -> Result<PathBuf, DownloadError> {
        if self.script.with(|s| s.failing_resolves.contains(&config.id)) {
            return Err(DownloadError::NoGgufFile(config.id.clone()));
        }
        Ok(PathBuf::from(format!("/fake/{}.gguf", config.id.replace('/', "--"))))
    }
}
