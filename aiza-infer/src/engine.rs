use crate::kv_cache::KvCache;
use crate::model_runner::ModelRunner;
use crate::sampler::Sampler;
use crate::{GenerateParams, InferenceConfig};
use aiza_core::error::{AizaError, Result};
use aiza_core::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop signal, checked once per generation step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// `max_tokens` reached.
    Length,
    /// End-of-sequence id sampled.
    Stop,
    Cancelled,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Length => "length",
            FinishReason::Stop => "stop",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
        }
    }
}

/// Result of a blocking [`InferenceEngine::complete`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
    pub truncations: u32,
}

pub struct InferenceEngine<M, T> {
    model: M,
    tokenizer: T,
    config: InferenceConfig,
}

impl<M: ModelRunner, T: Tokenizer> InferenceEngine<M, T> {
    pub fn new(model: M, tokenizer: T, config: InferenceConfig) -> Self {
        Self {
            model,
            tokenizer,
            config,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.config.eos_token_id.or_else(|| self.tokenizer.eos_token())
    }

    /// Context window: the model's limit, optionally narrowed by config.
    pub fn max_seq_len(&self) -> usize {
        let model = self.model.max_seq_len();
        self.config.max_seq_len.map_or(model, |cap| cap.min(model))
    }

    /// Lazily generate ids after `prompt_ids`. The stream owns the request's
    /// KV cache and stops after `max_tokens` ids or right after the EOS id.
    pub fn generate(&mut self, prompt_ids: &[u32], params: &GenerateParams) -> Result<TokenStream<'_, M>> {
        let eos = self.eos_token_id();
        let window = self.max_seq_len();
        TokenStream::start(&mut self.model, prompt_ids, params, eos, window)
    }

    /// Generate to completion and decode prompt plus continuation.
    pub fn generate_text(&mut self, prompt: &str, params: &GenerateParams) -> Result<String> {
        Ok(self.complete(prompt, params)?.text)
    }

    pub fn complete(&mut self, prompt: &str, params: &GenerateParams) -> Result<Completion> {
        let mut ids = self.tokenizer.encode(prompt);
        let prompt_tokens = ids.len() as u32;

        let mut stream = self.generate(&ids, params)?;
        let mut generated = Vec::new();
        for token in stream.by_ref() {
            generated.push(token?);
        }
        let finish_reason = stream.finish_reason().unwrap_or(FinishReason::Length);
        let truncations = stream.truncations();
        drop(stream);

        let completion_tokens = generated.len() as u32;
        ids.extend(generated);

        Ok(Completion {
            text: self.tokenizer.decode(&ids),
            prompt_tokens,
            completion_tokens,
            finish_reason,
            truncations,
        })
    }

    /// Like [`generate`](Self::generate) but yields decoded text fragments,
    /// one per new token, the EOS token's fragment included. The fragments
    /// concatenated onto the prompt equal [`generate_text`](Self::generate_text).
    pub fn generate_streaming(&mut self, prompt: &str, params: &GenerateParams) -> Result<TextStream<'_, M, T>> {
        let ids = self.tokenizer.encode(prompt);
        let eos = self.eos_token_id();
        let window = self.max_seq_len();
        let Self {
            model, tokenizer, ..
        } = self;
        let tokens = TokenStream::start(model, &ids, params, eos, window)?;
        Ok(TextStream { tokens, tokenizer })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Prompting,
    Generating,
    Completed,
}

/// Pull-based token generator for one request.
pub struct TokenStream<'m, M: ModelRunner> {
    model: &'m mut M,
    cache: KvCache,
    sampler: Sampler,
    context: Vec<u32>,
    window: usize,
    max_tokens: u32,
    generated: u32,
    eos: Option<u32>,
    cancel: CancelFlag,
    state: State,
    finish: Option<FinishReason>,
    truncations: u32,
}

impl<'m, M: ModelRunner> TokenStream<'m, M> {
    fn start(
        model: &'m mut M,
        prompt_ids: &[u32],
        params: &GenerateParams,
        eos: Option<u32>,
        window: usize,
    ) -> Result<Self> {
        if prompt_ids.is_empty() {
            return Err(AizaError::EmptyPrompt);
        }
        if window == 0 {
            return Err(AizaError::InvalidConfig("context window is zero".into()));
        }
        let sampler = Sampler::new(params.sampling.clone())?;
        // storage is allocated on the first insert
        let cache = KvCache::new(model.cache_config())?;

        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            max_tokens = params.max_tokens,
            window,
            temperature = params.sampling.temperature,
            top_k = ?params.sampling.top_k,
            "generation started"
        );

        Ok(Self {
            model,
            cache,
            sampler,
            context: prompt_ids.to_vec(),
            window,
            max_tokens: params.max_tokens,
            generated: 0,
            eos,
            cancel: CancelFlag::new(),
            state: State::Prompting,
            finish: None,
            truncations: 0,
        })
    }

    /// Handle that stops this stream from any thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn generated(&self) -> u32 {
        self.generated
    }

    /// Current (possibly windowed) token context.
    pub fn context(&self) -> &[u32] {
        &self.context
    }

    /// Times the context was cut back to the window.
    pub fn truncations(&self) -> u32 {
        self.truncations
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Completed
    }

    // Drop the oldest tokens so the context fits the window. Cached positions
    // describe the old alignment, so the cache is rewound and the whole
    // retained window is fed again on the next forward.
    fn fit_window(&mut self) {
        if self.context.len() <= self.window {
            return;
        }
        let excess = self.context.len() - self.window;
        self.context.drain(..excess);
        self.cache.reset();
        self.truncations += 1;
        tracing::debug!(dropped = excess, window = self.window, "context truncated, cache rewound");
    }

    fn step(&mut self) -> Result<u32> {
        // only an over-long prompt can exceed the window here
        self.fit_window();

        let cached = self.cache.position();
        if cached > self.context.len() {
            return Err(AizaError::Inference(format!(
                "cache holds {cached} positions but context has {}",
                self.context.len()
            )));
        }
        let logits = self.model.forward(&self.context[cached..], &mut self.cache)?;
        let vocab = self.model.vocab_size();
        if logits.len() != vocab {
            return Err(AizaError::Inference(format!(
                "model returned {} logits for a vocabulary of {vocab}",
                logits.len()
            )));
        }

        let token = self.sampler.sample(&logits)?;
        self.context.push(token);
        self.fit_window();
        self.state = State::Generating;
        tracing::trace!(token, step = self.generated, "sampled");
        Ok(token)
    }

    fn finish(&mut self, reason: FinishReason) {
        self.state = State::Completed;
        self.finish = Some(reason);
        self.cache.release();
        tracing::debug!(
            reason = reason.as_str(),
            generated = self.generated,
            truncations = self.truncations,
            "generation finished"
        );
    }
}

impl<M: ModelRunner> Iterator for TokenStream<'_, M> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == State::Completed {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish(FinishReason::Cancelled);
            return None;
        }
        if self.generated >= self.max_tokens {
            self.finish(FinishReason::Length);
            return None;
        }

        match self.step() {
            Ok(token) => {
                self.generated += 1;
                if Some(token) == self.eos {
                    self.finish(FinishReason::Stop);
                } else if self.generated >= self.max_tokens {
                    self.finish(FinishReason::Length);
                }
                Some(Ok(token))
            }
            Err(e) => {
                self.finish(FinishReason::Error);
                Some(Err(e))
            }
        }
    }
}

impl<M: ModelRunner> FusedIterator for TokenStream<'_, M> {}

/// Text fragments for each generated token, in order.
pub struct TextStream<'m, M: ModelRunner, T> {
    tokens: TokenStream<'m, M>,
    tokenizer: &'m T,
}

impl<M: ModelRunner, T: Tokenizer> TextStream<'_, M, T> {
    pub fn cancel_flag(&self) -> CancelFlag {
        self.tokens.cancel_flag()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.tokens.finish_reason()
    }

    pub fn generated(&self) -> u32 {
        self.tokens.generated()
    }
}

impl<M: ModelRunner, T: Tokenizer> Iterator for TextStream<'_, M, T> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        // the token stream itself ends right after EOS
        Some(self.tokens.next()?.map(|token| {
            self.tokenizer
                .decode_token(token)
                .unwrap_or_default()
                .to_string()
        }))
    }
}

impl<M: ModelRunner, T: Tokenizer> FusedIterator for TextStream<'_, M, T> {}
