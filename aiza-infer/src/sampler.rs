use crate::SamplingParams;
use aiza_core::error::{AizaError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Temperature / top-k sampler with its own RNG stream.
pub struct Sampler {
    params: SamplingParams,
    rng: ChaCha8Rng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Result<Self> {
        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(AizaError::InvalidConfig(format!(
                "temperature must be finite and >= 0, got {}",
                params.temperature
            )));
        }
        let rng = match params.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => {
                let mut seed = [0u8; 32];
                getrandom::fill(&mut seed)
                    .map_err(|e| AizaError::Inference(format!("os entropy failed: {e}")))?;
                ChaCha8Rng::from_seed(seed)
            }
        };
        Ok(Self { params, rng })
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(AizaError::Inference("empty logits".into()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(AizaError::Inference("logits contain NaN".into()));
        }

        if self.params.temperature == 0.0 {
            return Ok(argmax(logits));
        }

        let inv_t = 1.0 / self.params.temperature;
        let candidates: Vec<u32> = match self.params.top_k {
            Some(k) if k > 0 => top_k(logits, k),
            _ => (0..logits.len() as u32).collect(),
        };
        let scaled: Vec<f32> = candidates
            .iter()
            .map(|&id| logits[id as usize] * inv_t)
            .collect();
        let probs = softmax(&scaled);

        // all-masked rows (every logit -inf) fall back to the best raw logit
        if probs.iter().all(|p| !p.is_finite() || *p == 0.0) {
            return Ok(argmax(logits));
        }

        let r: f32 = self.rng.random();
        Ok(candidates[pick(&probs, r)])
    }
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx as u32
}

/// Ids of the `min(k, len)` largest logits, best first, ties to the lower id.
pub fn top_k(logits: &[f32], k: usize) -> Vec<u32> {
    let k = k.min(logits.len());
    let mut ids: Vec<u32> = (0..logits.len() as u32).collect();
    let by_logit = |a: &u32, b: &u32| {
        logits[*b as usize]
            .total_cmp(&logits[*a as usize])
            .then(a.cmp(b))
    };
    if k < ids.len() {
        ids.select_nth_unstable_by(k, by_logit);
        ids.truncate(k);
    }
    ids.sort_unstable_by(by_logit);
    ids
}

/// Numerically stable softmax (max subtracted first).
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    let inv_sum = 1.0 / sum;
    for p in &mut probs {
        *p *= inv_sum;
    }
    probs
}

// first index whose cumulative probability reaches r
fn pick(probs: &[f32], r: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    // rounding left the total just under 1.0; take the last non-zero entry
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(probs.len() - 1)
}
