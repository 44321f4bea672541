use crate::kv_cache::{KvCache, KvCacheConfig};
use aiza_core::error::{AizaError, Result};
use std::collections::HashMap;

/// Scoring contract between the engine and a decoder.
///
/// `tokens` are the context positions the cache has not seen yet, i.e.
/// `context[cache.position()..]`. The runner writes their keys/values through
/// [`KvCache::insert`] and returns logits for the position after the last one.
/// A runner that never touches the cache is handed the full context every step.
pub trait ModelRunner {
    fn vocab_size(&self) -> usize;
    fn max_seq_len(&self) -> usize;
    /// Shape of the per-request cache the engine allocates for this model.
    fn cache_config(&self) -> KvCacheConfig;
    fn forward(&mut self, tokens: &[u32], cache: &mut KvCache) -> Result<Vec<f32>>;
}

impl<M: ModelRunner + ?Sized> ModelRunner for Box<M> {
    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn max_seq_len(&self) -> usize {
        (**self).max_seq_len()
    }

    fn cache_config(&self) -> KvCacheConfig {
        (**self).cache_config()
    }

    fn forward(&mut self, tokens: &[u32], cache: &mut KvCache) -> Result<Vec<f32>> {
        (**self).forward(tokens, cache)
    }
}

/// Largest vocabulary whose ids survive the round trip through an `f32` key.
pub const MAX_BIGRAM_VOCAB: usize = 1 << f32::MANTISSA_DIGITS;

/// Add-alpha smoothed bigram model.
///
/// Each token id is cached as a one-dimensional key in a single-layer cache;
/// the last cached key selects the logit row, so the runner only ever needs
/// the new suffix of the context. Ids are exact as `f32` only up to
/// [`MAX_BIGRAM_VOCAB`], and `fit` rejects larger vocabularies.
#[derive(Debug, Clone)]
pub struct BigramRunner {
    vocab_size: usize,
    max_seq_len: usize,
    block_size: usize,
    alpha: f32,
    // prev → (next → count)
    bigrams: HashMap<u32, HashMap<u32, u32>>,
    unigrams: HashMap<u32, u32>,
    total: u64,
}

impl BigramRunner {
    pub fn fit<'a, I>(sequences: I, vocab_size: usize, max_seq_len: usize) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [u32]>,
    {
        if vocab_size == 0 || max_seq_len == 0 {
            return Err(AizaError::InvalidConfig(
                "bigram runner needs a non-empty vocabulary and window".into(),
            ));
        }
        if vocab_size > MAX_BIGRAM_VOCAB {
            return Err(AizaError::InvalidConfig(format!(
                "vocabulary of {vocab_size} exceeds the {MAX_BIGRAM_VOCAB} ids a bigram key can hold"
            )));
        }
        let mut runner = Self {
            vocab_size,
            max_seq_len,
            block_size: 1024,
            alpha: 0.1,
            bigrams: HashMap::new(),
            unigrams: HashMap::new(),
            total: 0,
        };
        for seq in sequences {
            for &t in seq {
                if t as usize >= vocab_size {
                    return Err(AizaError::InvalidConfig(format!(
                        "token {t} outside vocabulary of {vocab_size}"
                    )));
                }
                *runner.unigrams.entry(t).or_insert(0) += 1;
                runner.total += 1;
            }
            for w in seq.windows(2) {
                *runner
                    .bigrams
                    .entry(w[0])
                    .or_default()
                    .entry(w[1])
                    .or_insert(0) += 1;
            }
        }
        tracing::debug!(
            tokens = runner.total,
            contexts = runner.bigrams.len(),
            "bigram runner fitted"
        );
        Ok(runner)
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Log-probabilities of the token following `prev`; falls back to
    /// unigram statistics when `prev` was never seen as a context.
    pub fn logits_after(&self, prev: u32) -> Vec<f32> {
        let v = self.vocab_size as f32;
        let (counts, total) = match self.bigrams.get(&prev) {
            Some(row) => (row, row.values().map(|&c| c as f32).sum::<f32>()),
            None => (&self.unigrams, self.total as f32),
        };
        let denom = total + self.alpha * v;
        let mut logits = vec![(self.alpha / denom).ln(); self.vocab_size];
        for (&next, &c) in counts {
            logits[next as usize] = ((c as f32 + self.alpha) / denom).ln();
        }
        logits
    }
}

impl ModelRunner for BigramRunner {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn cache_config(&self) -> KvCacheConfig {
        KvCacheConfig {
            num_layers: 1,
            batch_size: 1,
            num_heads: 1,
            head_dim: 1,
            block_size: self.block_size,
            max_positions: Some(self.max_seq_len),
        }
    }

    fn forward(&mut self, tokens: &[u32], cache: &mut KvCache) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(AizaError::Inference("forward called with no new tokens".into()));
        }
        let keys: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        let view = cache.insert(0, &keys, &keys)?;
        let prev = view.key(0, 0, view.len() - 1)[0] as u32;
        Ok(self.logits_after(prev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::argmax;

    fn runner() -> BigramRunner {
        // 1 → 2 → 3 → 1 cycle
        let seq: Vec<u32> = [1, 2, 3].iter().cycle().take(30).copied().collect();
        BigramRunner::fit([seq.as_slice()], 5, 16).unwrap()
    }

    #[test]
    fn predicts_observed_successor() {
        let r = runner();
        assert_eq!(argmax(&r.logits_after(1)), 2);
        assert_eq!(argmax(&r.logits_after(3)), 1);
    }

    #[test]
    fn unseen_context_uses_unigrams() {
        let r = runner();
        let logits = r.logits_after(4);
        assert!(logits[0] < logits[1]);
        assert!(logits[4] < logits[2]);
    }

    #[test]
    fn forward_reads_last_token_from_cache() {
        let mut r = runner();
        let mut cache = KvCache::new(r.cache_config()).unwrap();
        let logits = r.forward(&[3, 1], &mut cache).unwrap();
        assert_eq!(cache.position(), 2);
        assert_eq!(argmax(&logits), 2);
        // next step only feeds the new token
        let logits = r.forward(&[2], &mut cache).unwrap();
        assert_eq!(cache.position(), 3);
        assert_eq!(argmax(&logits), 3);
    }

    #[test]
    fn rejects_out_of_vocab_training_data() {
        let seq = [1u32, 9];
        assert!(BigramRunner::fit([&seq[..]], 5, 8).is_err());
    }

    #[test]
    fn rejects_vocab_beyond_exact_f32_ids() {
        let empty: [&[u32]; 0] = [];
        assert!(matches!(
            BigramRunner::fit(empty, MAX_BIGRAM_VOCAB + 1, 8),
            Err(AizaError::InvalidConfig(_))
        ));
        let top = (MAX_BIGRAM_VOCAB - 1) as u32;
        assert_eq!(top as f32 as u32, top);
        let seq = [top, 3];
        assert!(BigramRunner::fit([&seq[..]], MAX_BIGRAM_VOCAB, 8).is_ok());
    }

    #[test]
    fn window_bounds_cache() {
        let mut r = runner();
        let mut cache = KvCache::new(r.cache_config()).unwrap();
        let too_long: Vec<u32> = vec![1; 17];
        assert!(matches!(
            r.forward(&too_long, &mut cache),
            Err(AizaError::CacheExhausted { .. })
        ));
    }
}
