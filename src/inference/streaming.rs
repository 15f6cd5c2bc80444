//! Streaming generation
//!
//! A pull-based state machine: each `next().await` runs one decode step on the
//! blocking pool and hands back one chunk of text. Dropping the stream is the
//! cancellation mechanism. Failures never reach the consumer; the stream just
//! ends and [`TextStream::outcome`] records why.

use std::sync::Arc;

use futures::Stream;

use crate::inference::backend::{BackendError, DecodeSession, ModelBackend, SamplingConfig};
use crate::inference::engine::{relieve_memory_pressure, PREFILL_MEMORY_THRESHOLD};
use crate::inference::manager::ActiveModel;
use crate::inference::prompt::{partial_stop_suffix, truncate_at_stop};

/// Tokens requested per step
pub const STREAM_STEP_TOKENS: usize = 2;
/// Accelerator utilization above which the cache is cleared between steps
pub const STREAM_MEMORY_THRESHOLD: f64 = 0.9;
/// Characters of output allowed per token of budget before the stream is cut
pub const CHARS_PER_TOKEN_LIMIT: usize = 4;

const REPETITION_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing generated yet; the prompt has not been prefilled
    Idle,
    Generating,
    /// A stop marker, repetition or the length cap ended the stream
    StopConditionMet,
    /// A step failed; the stream ended early
    Errored,
    /// The model finished on its own
    Done,
}

/// Why a stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    StopMarker(&'static str),
    Repetition,
    LengthCap,
    Aborted(String),
}

struct StepOutput {
    session: Option<Box<dyn DecodeSession>>,
    result: Result<(usize, Vec<u8>), BackendError>,
}

/// Incremental text from one generation request
pub struct TextStream {
    state: StreamState,
    outcome: Option<StreamOutcome>,
    active: Arc<ActiveModel>,
    backend: Arc<dyn ModelBackend>,
    prompt: Arc<str>,
    sampling: SamplingConfig,
    session: Option<Box<dyn DecodeSession>>,
    step_tokens: usize,
    generated_tokens: usize,
    oom_retry: bool,
    pending: Vec<u8>,
    text: String,
    /// Bytes of `text` already handed to the consumer
    emitted: usize,
    char_limit: usize,
}

impl TextStream {
    pub(crate) fn new(
        active: Arc<ActiveModel>,
        backend: Arc<dyn ModelBackend>,
        formatted_prompt: String,
        sampling: SamplingConfig,
    ) -> Self {
        let char_limit = sampling.max_new_tokens.saturating_mul(CHARS_PER_TOKEN_LIMIT);
        Self {
            state: StreamState::Idle,
            outcome: None,
            active,
            backend,
            prompt: Arc::from(formatted_prompt),
            sampling,
            session: None,
            step_tokens: STREAM_STEP_TOKENS,
            generated_tokens: 0,
            oom_retry: false,
            pending: Vec::new(),
            text: String::new(),
            emitted: 0,
            char_limit,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Set once the stream has ended
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// Text generated so far, after stop-marker truncation
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn model_id(&self) -> &str {
        &self.active.model_id
    }

    /// Produce the next chunk, or None once the stream has ended
    pub async fn next(&mut self) -> Option<String> {
        while matches!(self.state, StreamState::Idle | StreamState::Generating) {
            if self.generated_tokens >= self.sampling.max_new_tokens {
                self.finish(StreamState::Done, StreamOutcome::Completed);
                return self.flush();
            }

            let output = self.run_step().await;
            self.session = output.session;

            match output.result {
                Ok((0, _)) => {
                    let tail = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
                    self.text.push_str(&tail);
                    let outcome = match truncate_at_stop(&mut self.text) {
                        Some(marker) => StreamOutcome::StopMarker(marker),
                        None => StreamOutcome::Completed,
                    };
                    self.finish(StreamState::Done, outcome);
                    return self.flush();
                }
                Ok((count, bytes)) => {
                    self.state = StreamState::Generating;
                    self.oom_retry = false;
                    self.generated_tokens += count;
                    self.pending.extend_from_slice(&bytes);

                    let new_text = take_valid_utf8(&mut self.pending);
                    if new_text.is_empty() && !self.pending.is_empty() {
                        continue;
                    }
                    if new_text.trim().is_empty() {
                        self.finish(StreamState::Done, StreamOutcome::Completed);
                        return self.flush();
                    }
                    if let Some(chunk) = self.accept(&new_text) {
                        return Some(chunk);
                    }
                }
                Err(e) if e.is_out_of_memory() && !self.oom_retry => {
                    tracing::warn!(
                        "Out of memory during streaming, clearing cache and dropping to 1 token per step"
                    );
                    self.backend.clear_cache();
                    self.step_tokens = 1;
                    self.oom_retry = true;
                }
                Err(e) => {
                    tracing::error!("Error in stream generation: {}", e);
                    self.finish(StreamState::Errored, StreamOutcome::Aborted(e.to_string()));
                    return self.flush();
                }
            }
        }
        None
    }

    /// Adapt into a `futures::Stream` of chunks
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let chunk = stream.next().await?;
            Some((chunk, stream))
        })
    }

    async fn run_step(&mut self) -> StepOutput {
        let session = self.session.take();
        let active = self.active.clone();
        let backend = self.backend.clone();
        let prompt = self.prompt.clone();
        let sampling = self.sampling.clone();
        let max_new = self
            .step_tokens
            .min(self.sampling.max_new_tokens - self.generated_tokens);

        let joined = tokio::task::spawn_blocking(move || {
            let mut session = match session {
                Some(session) => session,
                None => {
                    relieve_memory_pressure(backend.as_ref(), PREFILL_MEMORY_THRESHOLD);
                    let started = active
                        .tokenizer
                        .encode(&prompt, true)
                        .and_then(|tokens| active.model.start(&tokens, &sampling));
                    match started {
                        Ok(session) => session,
                        Err(e) => {
                            return StepOutput {
                                session: None,
                                result: Err(e),
                            }
                        }
                    }
                }
            };

            let result = session.step(max_new).and_then(|tokens| {
                let bytes = active.tokenizer.token_bytes(&tokens)?;
                Ok((tokens.len(), bytes))
            });
            relieve_memory_pressure(backend.as_ref(), STREAM_MEMORY_THRESHOLD);

            StepOutput {
                session: Some(session),
                result,
            }
        })
        .await;

        joined.unwrap_or_else(|e| StepOutput {
            session: None,
            result: Err(BackendError::Worker(e.to_string())),
        })
    }

    /// Append new text, apply the stop conditions and return what can be
    /// emitted. A tail that may be the start of a stop marker is held back.
    fn accept(&mut self, chunk: &str) -> Option<String> {
        self.text.push_str(chunk);

        if let Some(marker) = truncate_at_stop(&mut self.text) {
            tracing::debug!("Stop marker {} reached", marker);
            self.finish(StreamState::StopConditionMet, StreamOutcome::StopMarker(marker));
            return self.flush();
        }
        if detect_repetition(&self.text) {
            tracing::warn!("Detected repetition in streaming generation, stopping");
            self.finish(StreamState::StopConditionMet, StreamOutcome::Repetition);
            return self.flush();
        }
        if self.text.chars().count() > self.char_limit {
            tracing::warn!("Stream generation exceeded maximum length - stopping");
            self.finish(StreamState::StopConditionMet, StreamOutcome::LengthCap);
            return self.flush();
        }

        let ready = self.text.len() - partial_stop_suffix(&self.text[self.emitted..]);
        self.take_until(ready)
    }

    fn flush(&mut self) -> Option<String> {
        self.take_until(self.text.len())
    }

    fn take_until(&mut self, end: usize) -> Option<String> {
        let out = self.text.get(self.emitted..end).unwrap_or_default().to_string();
        self.emitted = end.max(self.emitted);
        (!out.is_empty()).then_some(out)
    }

    fn finish(&mut self, state: StreamState, outcome: StreamOutcome) {
        if self.outcome.is_none() {
            tracing::debug!("Stream for {} ended: {:?}", self.active.model_id, outcome);
            self.outcome = Some(outcome);
        }
        self.state = state;
        self.session = None;
    }
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next step. Invalid bytes become replacement characters.
fn take_valid_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let out = s.to_string();
            buf.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&buf[..valid]).into_owned();
            buf.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            out
        }
    }
}

/// True when the tail of `text` repeats a 10 to 19 character pattern
pub fn detect_repetition(text: &str) -> bool {
    let mut tail: Vec<char> = text.chars().rev().take(REPETITION_WINDOW + 1).collect();
    if tail.len() <= REPETITION_WINDOW {
        return false;
    }
    tail.truncate(REPETITION_WINDOW);
    tail.reverse();

    (10..20)
        .filter(|len| *len < tail.len() / 2)
        .any(|len| {
            let (head, pattern) = tail.split_at(tail.len() - len);
            head.windows(len).any(|w| w == pattern)
        })
}
