use crate::error::{AizaError, Result};
use crate::pretokenize::{CHUNK_PATTERN, Piece, PreTokenizer};
use crate::tokenizer::{RESERVED_BYTES, Vocabulary};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_EOS: &str = "<|endoftext|>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Target size of the whole vocabulary, reserved bytes and specials included.
    pub vocab_size: u32,
    pub special_tokens: Vec<String>,
    /// Must be one of `special_tokens`.
    pub eos_token: Option<String>,
    pub pattern: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10_000,
            special_tokens: vec![DEFAULT_EOS.to_string()],
            eos_token: Some(DEFAULT_EOS.to_string()),
            pattern: CHUNK_PATTERN.to_string(),
        }
    }
}

impl TrainerConfig {
    /// Config with no special tokens and no end-of-sequence marker.
    pub fn plain(vocab_size: u32) -> Self {
        Self {
            vocab_size,
            special_tokens: Vec::new(),
            eos_token: None,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for special in &self.special_tokens {
            if special.is_empty() {
                return Err(AizaError::InvalidConfig("empty special token".into()));
            }
            if !seen.insert(special.as_str()) {
                return Err(AizaError::InvalidConfig(format!(
                    "special token {special:?} listed twice"
                )));
            }
        }
        if let Some(eos) = &self.eos_token {
            if !seen.contains(eos.as_str()) {
                return Err(AizaError::InvalidConfig(format!(
                    "eos token {eos:?} is not a special token"
                )));
            }
        }
        Ok(())
    }
}

/// Learn a BPE vocabulary from `corpus`.
///
/// Each round merges the adjacent pair with the highest word-frequency-weighted
/// count. Ties go to the lexicographically smallest `(left, right)` pair, so
/// the result is a pure function of the corpus and config. Training stops at
/// `vocab_size` entries or once no pair occurs more than once.
pub fn train<I>(corpus: I, config: &TrainerConfig) -> Result<Vocabulary>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    config.validate()?;
    let pretokenizer = PreTokenizer::new(&config.pattern, &config.special_tokens)?;

    // word → frequency; specials in the corpus are not part of any word
    let mut word_freqs: HashMap<String, u64> = HashMap::new();
    for text in corpus {
        for piece in pretokenizer.split_specials(text.as_ref()) {
            if let Piece::Text(t) = piece {
                for chunk in pretokenizer.chunks(t) {
                    *word_freqs.entry(chunk.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    // base vocabulary: reserved byte range, then every other observed character
    let mut symbols: Vec<String> = (0..RESERVED_BYTES)
        .map(|b| char::from(b as u8).to_string())
        .collect();
    let observed: BTreeSet<char> = word_freqs.keys().flat_map(|w| w.chars()).collect();
    for c in observed {
        if c as u32 >= RESERVED_BYTES {
            symbols.push(c.to_string());
        }
    }
    let mut ids: HashMap<String, u32> = symbols
        .iter()
        .enumerate()
        .map(|(id, s)| (s.clone(), id as u32))
        .collect();

    for special in &config.special_tokens {
        if !ids.contains_key(special) {
            ids.insert(special.clone(), symbols.len() as u32);
            symbols.push(special.clone());
        }
    }
    let eos_id = config.eos_token.as_ref().and_then(|e| ids.get(e).copied());

    // sorted so every pass walks words in the same order
    let mut words: Vec<(String, u64)> = word_freqs.into_iter().collect();
    words.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let mut splits: Vec<(Vec<u32>, u64)> = words
        .iter()
        .map(|(w, f)| (w.chars().map(|c| ids[c.to_string().as_str()]).collect(), *f))
        .collect();

    let base_len = symbols.len();
    let mut merges: Vec<(u32, u32)> = Vec::new();
    let mut merged_pairs: BTreeSet<(u32, u32)> = BTreeSet::new();

    while symbols.len() < config.vocab_size as usize {
        let counts = count_pairs(&splits);
        let Some((pair, freq)) = best_pair(&counts, &symbols) else {
            break;
        };
        if freq < 2 {
            break;
        }

        let mut merged = symbols[pair.0 as usize].clone();
        merged.push_str(&symbols[pair.1 as usize]);
        let merged_id = match ids.get(&merged) {
            Some(&id) => id,
            None => {
                let id = symbols.len() as u32;
                ids.insert(merged.clone(), id);
                symbols.push(merged);
                id
            }
        };

        // a pair can resurface once a merge collapses into an existing symbol;
        // its first rank stays authoritative
        if merged_pairs.insert(pair) {
            merges.push(pair);
        }
        for (split, _) in &mut splits {
            apply_merge(split, pair, merged_id);
        }

        if merges.len() % 500 == 0 {
            tracing::debug!(merges = merges.len(), vocab = symbols.len(), freq, "bpe progress");
        }
    }

    tracing::info!(
        words = splits.len(),
        base = base_len,
        merges = merges.len(),
        vocab = symbols.len(),
        "bpe training complete"
    );

    Vocabulary::assemble(
        symbols,
        merges,
        config.special_tokens.clone(),
        eos_id,
        &config.pattern,
    )
}

fn count_pairs(splits: &[(Vec<u32>, u64)]) -> HashMap<(u32, u32), u64> {
    let mut counts = HashMap::new();
    for (split, freq) in splits {
        for w in split.windows(2) {
            *counts.entry((w[0], w[1])).or_insert(0) += freq;
        }
    }
    counts
}

// highest count; ties broken by the smaller (left, right) string pair
fn best_pair(counts: &HashMap<(u32, u32), u64>, symbols: &[String]) -> Option<((u32, u32), u64)> {
    let key = |p: &(u32, u32)| (symbols[p.0 as usize].as_str(), symbols[p.1 as usize].as_str());
    let mut best: Option<((u32, u32), u64)> = None;
    for (&pair, &freq) in counts {
        best = match best {
            None => Some((pair, freq)),
            Some((bp, bf)) if freq > bf || (freq == bf && key(&pair) < key(&bp)) => {
                Some((pair, freq))
            }
            keep => keep,
        };
    }
    best
}

// replace non-overlapping occurrences left to right
fn apply_merge(split: &mut Vec<u32>, pair: (u32, u32), merged: u32) {
    if split.len() < 2 {
        return;
    }
    let mut out = Vec::with_capacity(split.len());
    let mut i = 0;
    while i < split.len() {
        if i + 1 < split.len() && split[i] == pair.0 && split[i + 1] == pair.1 {
            out.push(merged);
            i += 2;
        } else {
            out.push(split[i]);
            i += 1;
        }
    }
    *split = out;
}
