//! llama.cpp backend
//!
//! # Architecture
//!
//! llama-cpp-2 contexts hold raw pointers and borrow the model they were
//! created from, so every llama.cpp object lives on one dedicated worker
//! thread. The model, tokenizer and decode-session handles handed to the rest
//! of the crate are thin channel endpoints that send commands to that thread
//! and wait for the reply.
//!
//! The worker holds at most one model. Handles carry the load sequence number
//! they belong to; requests from a handle whose model has since been replaced
//! fail instead of silently running against the new weights.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;

use crate::inference::backend::{
    AcceleratorInfo, AcceleratorMemory, BackendError, Capabilities, DecodeSession, LanguageModel,
    LoadedModel, ModelBackend, ModelSource, ModelStats, SamplingConfig, TokenId, Tokenizer,
};
use crate::inference::gguf::validate_gguf;
use crate::inference::quantization::LoadConfig;
use crate::system::gpu::detect_gpu;

/// Tokens per prefill batch
const PREFILL_BATCH: usize = 512;
/// Prefill slice size with attention slicing enabled
const SLICED_PREFILL: usize = 64;
/// Smallest context window created for a session
const MIN_CONTEXT: usize = 512;
/// Tokens the repetition penalty looks back over
const PENALTY_LAST_N: i32 = 64;
/// How long an accelerator memory reading stays fresh
const MEMORY_READING_TTL: Duration = Duration::from_secs(2);

type Reply<T> = Sender<Result<T, BackendError>>;

/// Commands sent to the worker thread
enum Command {
    Load {
        path: PathBuf,
        gpu_layers: u32,
        sequence: u64,
        reply: Reply<ModelStats>,
    },
    Unload {
        sequence: u64,
    },
    Encode {
        sequence: u64,
        text: String,
        add_bos: bool,
        reply: Reply<Vec<TokenId>>,
    },
    TokenBytes {
        sequence: u64,
        tokens: Vec<TokenId>,
        reply: Reply<Vec<u8>>,
    },
    Begin {
        sequence: u64,
        prompt: Vec<TokenId>,
        sampling: SamplingConfig,
        prefill_slice: usize,
        reply: Reply<u64>,
    },
    Step {
        session: u64,
        max_new: usize,
        reply: Reply<Vec<TokenId>>,
    },
    End {
        session: u64,
    },
    ClearCache,
    Shutdown,
}

impl Command {
    /// Answer a command that needs a loaded model while none is
    fn reject(self, reason: &str) {
        let error = || BackendError::Inference(reason.to_string());
        match self {
            Command::Load { reply, .. } => {
                let _ = reply.send(Err(BackendError::Load(reason.to_string())));
            }
            Command::Encode { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::TokenBytes { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::Begin { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::Step { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::Unload { .. } | Command::End { .. } | Command::ClearCache | Command::Shutdown => {}
        }
    }
}

/// Sending side of the worker channel
#[derive(Clone)]
struct WorkerLink {
    tx: Sender<Command>,
}

impl WorkerLink {
    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, BackendError> {
        let (reply, response) = mpsc::channel();
        self.tx
            .send(build(reply))
            .map_err(|e| BackendError::Worker(e.to_string()))?;
        response
            .recv()
            .map_err(|e| BackendError::Worker(e.to_string()))?
    }

    fn notify(&self, command: Command) {
        let _ = self.tx.send(command);
    }
}

/// Backend that runs GGUF models through llama.cpp
pub struct LlamaCppBackend {
    link: WorkerLink,
    worker: Mutex<Option<JoinHandle<()>>>,
    sequence: AtomicU64,
    memory_reading: Mutex<Option<(Instant, Option<AcceleratorMemory>)>>,
}

impl LlamaCppBackend {
    /// Start the worker thread. llama.cpp allows one backend per process.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker_main(rx));

        let worker = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to spawn llama worker thread: {}", e);
                None
            }
        };
        tracing::info!("llama.cpp worker thread started");

        Self {
            link: WorkerLink { tx },
            worker: Mutex::new(worker),
            sequence: AtomicU64::new(0),
            memory_reading: Mutex::new(None),
        }
    }

    fn offload_supported() -> bool {
        cfg!(any(feature = "cuda", feature = "vulkan", feature = "metal"))
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        self.link.notify(Command::Shutdown);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl ModelBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn detect_accelerator(&self) -> AcceleratorInfo {
        AcceleratorInfo::from_gpu(&detect_gpu(), Self::offload_supported())
    }

    fn load(&self, source: &ModelSource, config: &LoadConfig) -> Result<LoadedModel, BackendError> {
        let metadata = validate_gguf(&source.path).map_err(|e| BackendError::Load(e.to_string()))?;
        tracing::debug!(
            "GGUF validation passed for {:?} (version {}, {} tensors)",
            source.path,
            metadata.version,
            metadata.tensor_count
        );

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let mut stats = self.link.request(|reply| Command::Load {
            path: source.path.clone(),
            gpu_layers: config.gpu_layers,
            sequence,
            reply,
        })?;
        if let Some(architecture) = metadata.architecture {
            stats.architecture = architecture;
        }

        tracing::info!(
            "Loaded {} ({} params, {} ctx, {} GPU layers)",
            source.model_id,
            stats.parameter_count,
            stats.context_length,
            config.gpu_layers
        );

        Ok(LoadedModel {
            model: Box::new(LlamaLanguageModel {
                link: self.link.clone(),
                sequence,
                stats,
                prefill_slice: PREFILL_BATCH,
            }),
            tokenizer: Arc::new(LlamaTokenizer {
                link: self.link.clone(),
                sequence,
            }),
        })
    }

    fn memory_usage(&self) -> Option<AcceleratorMemory> {
        let Ok(mut cached) = self.memory_reading.lock() else {
            return None;
        };
        if let Some((taken, reading)) = *cached {
            if taken.elapsed() < MEMORY_READING_TTL {
                return reading;
            }
        }

        let gpu = detect_gpu();
        let reading = gpu.utilization().map(|_| AcceleratorMemory {
            used_mb: gpu.vram_used_mb,
            total_mb: gpu.vram_total_mb,
        });
        *cached = Some((Instant::now(), reading));
        reading
    }

    fn clear_cache(&self) {
        self.link.notify(Command::ClearCache);
    }
}

struct LlamaTokenizer {
    link: WorkerLink,
    sequence: u64,
}

impl Tokenizer for LlamaTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        self.link.request(|reply| Command::Encode {
            sequence: self.sequence,
            text: text.to_string(),
            add_bos,
            reply,
        })
    }

    fn token_bytes(&self, tokens: &[TokenId]) -> Result<Vec<u8>, BackendError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        self.link.request(|reply| Command::TokenBytes {
            sequence: self.sequence,
            tokens: tokens.to_vec(),
            reply,
        })
    }
}

struct LlamaLanguageModel {
    link: WorkerLink,
    sequence: u64,
    stats: ModelStats,
    prefill_slice: usize,
}

impl LanguageModel for LlamaLanguageModel {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            attention_slicing: true,
            ..Capabilities::default()
        }
    }

    fn stats(&self) -> ModelStats {
        self.stats.clone()
    }

    fn enable_attention_slicing(&mut self) -> Result<(), BackendError> {
        self.prefill_slice = SLICED_PREFILL;
        Ok(())
    }

    fn rewrite_graph(
        self: Box<Self>,
    ) -> Result<Box<dyn LanguageModel>, (Box<dyn LanguageModel>, BackendError)> {
        Err((self, BackendError::Unsupported("graph rewrite".to_string())))
    }

    fn set_inference_mode(&mut self) {
        // llama.cpp contexts never track gradients
    }

    fn start(
        &self,
        prompt: &[TokenId],
        sampling: &SamplingConfig,
    ) -> Result<Box<dyn DecodeSession>, BackendError> {
        let session = self.link.request(|reply| Command::Begin {
            sequence: self.sequence,
            prompt: prompt.to_vec(),
            sampling: sampling.clone(),
            prefill_slice: self.prefill_slice,
            reply,
        })?;
        Ok(Box::new(LlamaDecodeSession {
            link: self.link.clone(),
            session,
            finished: false,
        }))
    }
}

impl Drop for LlamaLanguageModel {
    fn drop(&mut self) {
        self.link.notify(Command::Unload {
            sequence: self.sequence,
        });
    }
}

struct LlamaDecodeSession {
    link: WorkerLink,
    session: u64,
    finished: bool,
}

impl DecodeSession for LlamaDecodeSession {
    fn step(&mut self, max_new: usize) -> Result<Vec<TokenId>, BackendError> {
        if self.finished || max_new == 0 {
            return Ok(Vec::new());
        }
        let tokens = self.link.request(|reply| Command::Step {
            session: self.session,
            max_new,
            reply,
        })?;
        self.finished = tokens.is_empty();
        Ok(tokens)
    }
}

impl Drop for LlamaDecodeSession {
    fn drop(&mut self) {
        self.link.notify(Command::End {
            session: self.session,
        });
    }
}

enum ServeExit {
    Unloaded,
    Switch(Command),
    Shutdown,
}

/// Worker thread main loop
///
/// Owns the LlamaBackend. Each loaded model is served by [`serve_model`]
/// until it is unloaded or replaced.
fn worker_main(rx: Receiver<Command>) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => Some(backend),
        Err(e) => {
            tracing::error!("Failed to init llama.cpp backend: {}", e);
            None
        }
    };

    let mut next_session = 0u64;
    let mut pending: Option<Command> = None;

    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Load {
                path,
                gpu_layers,
                sequence,
                reply,
            } => {
                let Some(backend) = backend.as_ref() else {
                    let _ = reply.send(Err(BackendError::Load("Backend not initialized".to_string())));
                    continue;
                };

                let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                let model = match LlamaModel::load_from_file(backend, &path, &params) {
                    Ok(model) => model,
                    Err(e) => {
                        let _ = reply.send(Err(BackendError::Load(e.to_string())));
                        continue;
                    }
                };

                let _ = reply.send(Ok(ModelStats {
                    parameter_count: model.n_params() as u64,
                    size_bytes: model.size() as u64,
                    architecture: "llama.cpp".to_string(),
                    context_length: model.n_ctx_train(),
                }));

                let exit = serve_model(backend, &model, sequence, &rx, &mut next_session);
                drop(model);
                tracing::info!("Model unloaded in worker thread");

                match exit {
                    ServeExit::Unloaded => {}
                    ServeExit::Switch(command) => pending = Some(command),
                    ServeExit::Shutdown => break,
                }
            }
            Command::Shutdown => break,
            other => other.reject("No model loaded"),
        }
    }
    tracing::info!("Worker thread shutting down");
}

/// Serve requests against one loaded model
fn serve_model(
    backend: &LlamaBackend,
    model: &LlamaModel,
    sequence: u64,
    rx: &Receiver<Command>,
    next_session: &mut u64,
) -> ServeExit {
    let mut sessions: HashMap<u64, Session<'_>> = HashMap::new();
    let stale = |requested: u64| {
        if requested == sequence {
            Ok(())
        } else {
            Err(BackendError::Inference(
                "Model was replaced during generation".to_string(),
            ))
        }
    };

    loop {
        let Ok(command) = rx.recv() else {
            return ServeExit::Shutdown;
        };

        match command {
            command @ Command::Load { .. } => return ServeExit::Switch(command),
            Command::Shutdown => return ServeExit::Shutdown,
            Command::Unload { sequence: requested } => {
                if requested == sequence {
                    return ServeExit::Unloaded;
                }
            }
            Command::Encode {
                sequence: requested,
                text,
                add_bos,
                reply,
            } => {
                let result = stale(requested).and_then(|_| encode(model, &text, add_bos));
                let _ = reply.send(result);
            }
            Command::TokenBytes {
                sequence: requested,
                tokens,
                reply,
            } => {
                let result = stale(requested).and_then(|_| token_bytes(model, &tokens));
                let _ = reply.send(result);
            }
            Command::Begin {
                sequence: requested,
                prompt,
                sampling,
                prefill_slice,
                reply,
            } => {
                let result = stale(requested)
                    .and_then(|_| Session::start(backend, model, &prompt, &sampling, prefill_slice));
                match result {
                    Ok(session) => {
                        *next_session += 1;
                        sessions.insert(*next_session, session);
                        let _ = reply.send(Ok(*next_session));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Step {
                session,
                max_new,
                reply,
            } => {
                let result = match sessions.get_mut(&session) {
                    Some(active) => active.step(model, max_new),
                    None => Err(BackendError::Inference(
                        "Decode session is no longer available".to_string(),
                    )),
                };
                let _ = reply.send(result);
            }
            Command::End { session } => {
                sessions.remove(&session);
            }
            Command::ClearCache => {
                let before = sessions.len();
                sessions.retain(|_, session| !session.finished);
                tracing::debug!(
                    "Released {} finished decode contexts",
                    before - sessions.len()
                );
            }
        }
    }
}

fn encode(model: &LlamaModel, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
    let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
    let tokens = model
        .str_to_token(text, add_bos)
        .map_err(|e| BackendError::Tokenization(e.to_string()))?;
    Ok(tokens.into_iter().map(|t| t.0 as TokenId).collect())
}

fn token_bytes(model: &LlamaModel, tokens: &[TokenId]) -> Result<Vec<u8>, BackendError> {
    let mut bytes = Vec::new();
    for token in tokens {
        let piece = model
            .token_to_bytes(LlamaToken::new(*token as i32), Special::Plaintext)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        bytes.extend_from_slice(&piece);
    }
    Ok(bytes)
}

fn decode_error(e: DecodeError) -> BackendError {
    match e {
        DecodeError::NoKvCacheSlot => BackendError::OutOfMemory(e.to_string()),
        other => BackendError::Inference(other.to_string()),
    }
}

/// One live generation: a context with its KV cache plus sampler state
struct Session<'m> {
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    batch: LlamaBatch,
    n_past: i32,
    remaining: usize,
    finished: bool,
}

impl<'m> Session<'m> {
    fn start(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        prompt: &[TokenId],
        sampling: &SamplingConfig,
        prefill_slice: usize,
    ) -> Result<Self, BackendError> {
        if prompt.is_empty() {
            return Err(BackendError::Inference("Empty prompt".to_string()));
        }

        let train_ctx = model.n_ctx_train() as usize;
        if prompt.len() >= train_ctx {
            return Err(BackendError::Inference(format!(
                "Prompt of {} tokens exceeds the {} token context",
                prompt.len(),
                train_ctx
            )));
        }
        let n_ctx = (prompt.len() + sampling.max_new_tokens)
            .max(MIN_CONTEXT)
            .min(train_ctx);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx as u32))
            .with_n_batch(PREFILL_BATCH as u32);
        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| BackendError::OutOfMemory(format!("Failed to create context: {}", e)))?;

        let slice = prefill_slice.clamp(1, PREFILL_BATCH);
        let mut batch = LlamaBatch::new(PREFILL_BATCH, 1);
        let last = prompt.len() - 1;
        for (index, chunk) in prompt.chunks(slice).enumerate() {
            batch.clear();
            for (offset, token) in chunk.iter().enumerate() {
                let pos = index * slice + offset;
                batch
                    .add(LlamaToken::new(*token as i32), pos as i32, &[0], pos == last)
                    .map_err(|e| BackendError::Inference(e.to_string()))?;
            }
            ctx.decode(&mut batch).map_err(decode_error)?;
        }
        tracing::debug!("Prefilled {} prompt tokens in slices of {}", prompt.len(), slice);

        Ok(Self {
            ctx,
            sampler: build_sampler(sampling),
            batch,
            n_past: prompt.len() as i32,
            remaining: sampling.max_new_tokens.min(n_ctx - prompt.len()),
            finished: false,
        })
    }

    fn step(&mut self, model: &LlamaModel, max_new: usize) -> Result<Vec<TokenId>, BackendError> {
        let mut out = Vec::new();
        while !self.finished && out.len() < max_new {
            if self.remaining == 0 {
                self.finished = true;
                break;
            }

            let token = self.sampler.sample(&self.ctx, self.batch.n_tokens() - 1);
            self.sampler.accept(token);
            if model.is_eog_token(token) {
                self.finished = true;
                break;
            }
            out.push(token.0 as TokenId);
            self.remaining -= 1;

            self.batch.clear();
            self.batch
                .add(token, self.n_past, &[0], true)
                .map_err(|e| BackendError::Inference(e.to_string()))?;
            self.ctx.decode(&mut self.batch).map_err(decode_error)?;
            self.n_past += 1;
        }
        Ok(out)
    }
}

fn build_sampler(sampling: &SamplingConfig) -> LlamaSampler {
    let penalties = LlamaSampler::penalties(PENALTY_LAST_N, sampling.repetition_penalty, 0.0, 0.0);
    if sampling.temperature < 0.01 {
        return LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()]);
    }

    let seed = if sampling.seed == 0 {
        rand_seed()
    } else {
        sampling.seed
    };
    LlamaSampler::chain_simple([
        penalties,
        LlamaSampler::top_k(sampling.top_k as i32),
        LlamaSampler::top_p(sampling.top_p, 1),
        LlamaSampler::temp(sampling.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
