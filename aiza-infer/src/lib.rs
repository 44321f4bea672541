pub mod engine;
pub mod kv_cache;
pub mod model_runner;
pub mod sampler;

use serde::{Deserialize, Serialize};

pub use engine::{CancelFlag, Completion, FinishReason, InferenceEngine, TextStream, TokenStream};
pub use kv_cache::{KvCache, KvCacheConfig, LayerKv};
pub use model_runner::{BigramRunner, ModelRunner};
pub use sampler::Sampler;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Overrides the tokenizer's end-of-sequence id.
    pub eos_token_id: Option<u32>,
    /// Caps the model's context window; the smaller of the two wins.
    pub max_seq_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    /// `None` or `Some(0)` disables top-k filtering.
    pub top_k: Option<usize>,
    /// Fixed seed for reproducible draws; OS entropy otherwise.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: Some(50),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateParams {
    pub max_tokens: u32,
    pub sampling: SamplingParams,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            sampling: SamplingParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let params: GenerateParams =
            serde_json::from_str(r#"{"sampling": {"temperature": 0.0}}"#).unwrap();
        assert_eq!(params.max_tokens, 100);
        assert_eq!(params.sampling.temperature, 0.0);
        assert_eq!(params.sampling.top_k, Some(50));
        assert_eq!(params.sampling.seed, None);

        let config: InferenceConfig = serde_json::from_str(r#"{"eos_token_id": 7}"#).unwrap();
        assert_eq!(config.eos_token_id, Some(7));
        assert_eq!(config.max_seq_len, None);
    }

    #[test]
    fn finish_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FinishReason::Cancelled).unwrap();
        assert_eq!(json, r#""cancelled""#);
    }
}
