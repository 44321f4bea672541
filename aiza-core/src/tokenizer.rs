use crate::error::{AizaError, Result};
use crate::pretokenize::{Piece, PreTokenizer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Id substituted for symbols never seen in training.
pub const UNK_ID: u32 = 0;
/// Size of the reserved byte range at the bottom of every vocabulary.
pub const RESERVED_BYTES: u32 = 256;

pub const ARTIFACT_FORMAT: &str = "aiza-bpe";
pub const ARTIFACT_VERSION: u32 = 1;

pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
    /// Text of a single token, for incremental streaming.
    fn decode_token(&self, token: u32) -> Option<&str>;
    fn vocab_size(&self) -> u32;
    fn eos_token(&self) -> Option<u32>;
}

/// Trained BPE state: symbols, merge ranks and special tokens.
/// Built once by [`crate::bpe::train`] or [`Vocabulary::load`], immutable afterwards.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    // token_id → symbol
    symbols: Vec<String>,
    // symbol → token_id
    ids: HashMap<String, u32>,
    // merge pairs in rank order
    merges: Vec<(u32, u32)>,
    // (left, right) → (rank, merged token_id)
    ranks: HashMap<(u32, u32), (u32, u32)>,
    special_tokens: Vec<String>,
    eos_id: Option<u32>,
    pretokenizer: PreTokenizer,
}

impl Vocabulary {
    /// Build and validate a vocabulary from its raw parts.
    pub(crate) fn assemble(
        symbols: Vec<String>,
        merges: Vec<(u32, u32)>,
        special_tokens: Vec<String>,
        eos_id: Option<u32>,
        pattern: &str,
    ) -> Result<Self> {
        let n = symbols.len() as u32;
        if n < RESERVED_BYTES {
            return Err(AizaError::InvalidArtifact(format!(
                "vocabulary has {n} entries, fewer than the {RESERVED_BYTES} reserved bytes"
            )));
        }
        for (i, sym) in symbols.iter().take(RESERVED_BYTES as usize).enumerate() {
            let expected = char::from(i as u8);
            if sym.chars().ne(std::iter::once(expected)) {
                return Err(AizaError::InvalidArtifact(format!(
                    "reserved id {i} must hold U+{:04X}, found {sym:?}",
                    expected as u32
                )));
            }
        }

        let mut ids = HashMap::with_capacity(symbols.len());
        for (id, sym) in symbols.iter().enumerate() {
            if sym.is_empty() {
                return Err(AizaError::InvalidArtifact(format!("token {id} is empty")));
            }
            if ids.insert(sym.clone(), id as u32).is_some() {
                return Err(AizaError::InvalidArtifact(format!(
                    "symbol {sym:?} appears more than once"
                )));
            }
        }

        let mut ranks = HashMap::with_capacity(merges.len());
        for (rank, &(a, b)) in merges.iter().enumerate() {
            if a >= n || b >= n {
                return Err(AizaError::InvalidArtifact(format!(
                    "merge {rank} references token outside vocabulary"
                )));
            }
            let mut merged = symbols[a as usize].clone();
            merged.push_str(&symbols[b as usize]);
            let merged_id = *ids.get(&merged).ok_or_else(|| {
                AizaError::InvalidArtifact(format!("merge {rank} produces unknown symbol {merged:?}"))
            })?;
            if ranks.insert((a, b), (rank as u32, merged_id)).is_some() {
                return Err(AizaError::InvalidArtifact(format!(
                    "merge {rank} duplicates an earlier pair"
                )));
            }
        }

        for special in &special_tokens {
            if !ids.contains_key(special) {
                return Err(AizaError::InvalidArtifact(format!(
                    "special token {special:?} missing from vocabulary"
                )));
            }
        }
        if let Some(eos) = eos_id {
            if eos >= n {
                return Err(AizaError::InvalidArtifact(format!(
                    "eos id {eos} outside vocabulary of {n}"
                )));
            }
            let sym = &symbols[eos as usize];
            if !special_tokens.contains(sym) {
                return Err(AizaError::InvalidArtifact(format!(
                    "eos id {eos} ({sym:?}) is not a special token"
                )));
            }
        }

        let pretokenizer = PreTokenizer::new(pattern, &special_tokens)
            .map_err(|e| AizaError::InvalidArtifact(e.to_string()))?;

        Ok(Self {
            symbols,
            ids,
            merges,
            ranks,
            special_tokens,
            eos_id,
            pretokenizer,
        })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, id: u32) -> Option<&str> {
        self.symbols.get(id as usize).map(String::as_str)
    }

    pub fn id_of(&self, symbol: &str) -> Option<u32> {
        self.ids.get(symbol).copied()
    }

    pub fn merge_count(&self) -> usize {
        self.merges.len()
    }

    /// Merges in rank order as `(left, right, rank)`.
    pub fn merges(&self) -> impl Iterator<Item = (&str, &str, u32)> + '_ {
        self.merges.iter().enumerate().map(|(rank, &(a, b))| {
            (
                self.symbols[a as usize].as_str(),
                self.symbols[b as usize].as_str(),
                rank as u32,
            )
        })
    }

    pub fn merge_rank(&self, left: &str, right: &str) -> Option<u32> {
        let a = self.id_of(left)?;
        let b = self.id_of(right)?;
        self.ranks.get(&(a, b)).map(|&(rank, _)| rank)
    }

    pub fn special_tokens(&self) -> &[String] {
        &self.special_tokens
    }

    pub fn unk_id(&self) -> u32 {
        UNK_ID
    }

    pub fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    pub fn pattern(&self) -> &str {
        self.pretokenizer.pattern()
    }

    /// Text → token ids. Unknown symbols become [`UNK_ID`]; never fails.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut out = Vec::new();
        for piece in self.pretokenizer.split_specials(text) {
            match piece {
                Piece::Special(s) => out.push(self.ids.get(s).copied().unwrap_or(UNK_ID)),
                Piece::Text(t) => {
                    for chunk in self.pretokenizer.chunks(t) {
                        self.encode_chunk(chunk, &mut out);
                    }
                }
            }
        }
        out
    }

    // Start from single characters, then repeatedly apply the lowest-ranked
    // merge present until none applies. `None` marks a character outside the
    // vocabulary; it can never take part in a merge.
    fn encode_chunk(&self, chunk: &str, out: &mut Vec<u32>) {
        let mut buf = [0u8; 4];
        let mut parts: Vec<Option<u32>> = chunk
            .chars()
            .map(|c| self.ids.get(&*c.encode_utf8(&mut buf)).copied())
            .collect();

        while parts.len() > 1 {
            let mut best: Option<(u32, (u32, u32), u32)> = None;
            for w in parts.windows(2) {
                if let (Some(a), Some(b)) = (w[0], w[1]) {
                    if let Some(&(rank, merged)) = self.ranks.get(&(a, b)) {
                        if best.is_none_or(|(r, _, _)| rank < r) {
                            best = Some((rank, (a, b), merged));
                        }
                    }
                }
            }
            let Some((_, pair, merged)) = best else {
                break;
            };

            let mut next = Vec::with_capacity(parts.len());
            let mut i = 0;
            while i < parts.len() {
                if i + 1 < parts.len() && parts[i] == Some(pair.0) && parts[i + 1] == Some(pair.1) {
                    next.push(Some(merged));
                    i += 2;
                } else {
                    next.push(parts[i]);
                    i += 1;
                }
            }
            parts = next;
        }

        out.extend(parts.into_iter().map(|p| p.unwrap_or(UNK_ID)));
    }

    /// Token ids → text. Ids outside the vocabulary decode to nothing.
    pub fn decode(&self, tokens: &[u32]) -> String {
        let mut text = String::new();
        for &id in tokens {
            if let Some(sym) = self.symbols.get(id as usize) {
                text.push_str(sym);
            }
        }
        text
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_artifact())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let artifact: Artifact = serde_json::from_str(json)?;
        Self::from_artifact(artifact)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)?;
        tracing::debug!(path = %path.display(), tokens = self.len(), "tokenizer saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AizaError::ArtifactNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let vocab = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            tokens = vocab.len(),
            merges = vocab.merge_count(),
            "tokenizer loaded"
        );
        Ok(vocab)
    }

    fn to_artifact(&self) -> Artifact {
        Artifact {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            pattern: self.pattern().to_string(),
            unk_id: UNK_ID,
            eos_id: self.eos_id,
            special_tokens: self.special_tokens.clone(),
            vocab: self
                .symbols
                .iter()
                .enumerate()
                .map(|(id, sym)| (sym.clone(), id as u32))
                .collect(),
            merges: self
                .merges
                .iter()
                .enumerate()
                .map(|(rank, &(a, b))| MergeEntry {
                    pair: (
                        self.symbols[a as usize].clone(),
                        self.symbols[b as usize].clone(),
                    ),
                    rank: rank as u32,
                })
                .collect(),
        }
    }

    fn from_artifact(artifact: Artifact) -> Result<Self> {
        if artifact.format != ARTIFACT_FORMAT {
            return Err(AizaError::InvalidArtifact(format!(
                "unknown format {:?}",
                artifact.format
            )));
        }
        if artifact.version != ARTIFACT_VERSION {
            return Err(AizaError::InvalidArtifact(format!(
                "unsupported version {}",
                artifact.version
            )));
        }
        if artifact.unk_id != UNK_ID {
            return Err(AizaError::InvalidArtifact(format!(
                "unk id must be {UNK_ID}, got {}",
                artifact.unk_id
            )));
        }

        // ids must be exactly 0..n; the map's keys are already unique
        let n = artifact.vocab.len();
        let mut slots: Vec<Option<String>> = vec![None; n];
        for (sym, id) in artifact.vocab {
            let slot = slots.get_mut(id as usize).ok_or_else(|| {
                AizaError::InvalidArtifact(format!("id {id} outside vocabulary of {n}"))
            })?;
            if slot.replace(sym).is_some() {
                return Err(AizaError::InvalidArtifact(format!("id {id} assigned twice")));
            }
        }
        let symbols: Vec<String> = slots.into_iter().flatten().collect();

        let lookup: HashMap<&str, u32> = symbols
            .iter()
            .enumerate()
            .map(|(id, s)| (s.as_str(), id as u32))
            .collect();

        let mut merges = Vec::with_capacity(artifact.merges.len());
        for (expected, entry) in artifact.merges.iter().enumerate() {
            if entry.rank as usize != expected {
                return Err(AizaError::InvalidArtifact(format!(
                    "merge ranks must be 0..{} in order, found {} at position {expected}",
                    artifact.merges.len(),
                    entry.rank
                )));
            }
            let (left, right) = &entry.pair;
            let a = lookup.get(left.as_str()).copied();
            let b = lookup.get(right.as_str()).copied();
            match (a, b) {
                (Some(a), Some(b)) => merges.push((a, b)),
                _ => {
                    return Err(AizaError::InvalidArtifact(format!(
                        "merge {expected} ({left:?}, {right:?}) references unknown symbol"
                    )));
                }
            }
        }

        Self::assemble(
            symbols,
            merges,
            artifact.special_tokens,
            artifact.eos_id,
            &artifact.pattern,
        )
    }
}

impl Tokenizer for Vocabulary {
    fn encode(&self, text: &str) -> Vec<u32> {
        Vocabulary::encode(self, text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        Vocabulary::decode(self, tokens)
    }

    fn decode_token(&self, token: u32) -> Option<&str> {
        self.symbol(token)
    }

    fn vocab_size(&self) -> u32 {
        self.symbols.len() as u32
    }

    fn eos_token(&self) -> Option<u32> {
        self.eos_id
    }
}

/// Text → ids against a trained vocabulary.
pub fn encode(vocab: &Vocabulary, text: &str) -> Vec<u32> {
    vocab.encode(text)
}

/// Ids → text against a trained vocabulary.
pub fn decode(vocab: &Vocabulary, tokens: &[u32]) -> String {
    vocab.decode(tokens)
}

// On-disk form. Merges are a list because pairs are not valid JSON keys.
#[derive(Debug, Serialize, Deserialize)]
struct Artifact {
    format: String,
    version: u32,
    pattern: String,
    unk_id: u32,
    eos_id: Option<u32>,
    special_tokens: Vec<String>,
    vocab: BTreeMap<String, u32>,
    merges: Vec<MergeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeEntry {
    pair: (String, String),
    rank: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pretokenize::CHUNK_PATTERN;

    fn base_symbols() -> Vec<String> {
        (0..=255u8).map(|b| char::from(b).to_string()).collect()
    }

    // reserved bytes + "ab"(256) + "abc"(257) + "<eos>"(258)
    fn make_vocab() -> Vocabulary {
        let mut symbols = base_symbols();
        symbols.push("ab".into());
        symbols.push("abc".into());
        symbols.push("<eos>".into());
        let merges = vec![(b'a' as u32, b'b' as u32), (256, b'c' as u32)];
        Vocabulary::assemble(
            symbols,
            merges,
            vec!["<eos>".into()],
            Some(258),
            CHUNK_PATTERN,
        )
        .unwrap()
    }

    #[test]
    fn encode_applies_merges_by_rank() {
        let v = make_vocab();
        assert_eq!(v.encode("abc"), vec![257]);
        assert_eq!(v.encode("ab"), vec![256]);
        assert_eq!(v.encode("ba"), vec![b'b' as u32, b'a' as u32]);
    }

    #[test]
    fn encode_merges_every_occurrence() {
        let v = make_vocab();
        assert_eq!(v.encode("abab"), vec![256, 256]);
    }

    #[test]
    fn unknown_symbol_maps_to_unk() {
        let v = make_vocab();
        // U+4E2D is outside the reserved range and was never added
        assert_eq!(v.encode("a\u{4e2d}"), vec![b'a' as u32, UNK_ID]);
        // lossy round trip: the unknown char comes back as U+0000
        assert_eq!(v.decode(&v.encode("a\u{4e2d}")), "a\u{0}");
    }

    #[test]
    fn unknown_id_decodes_to_nothing() {
        let v = make_vocab();
        assert_eq!(v.decode(&[b'a' as u32, 9999, b'b' as u32]), "ab");
    }

    #[test]
    fn special_tokens_encode_whole() {
        let v = make_vocab();
        assert_eq!(v.encode("ab<eos>c"), vec![256, 258, b'c' as u32]);
        assert_eq!(v.decode(&[256, 258]), "ab<eos>");
    }

    #[test]
    fn json_round_trip_is_identical() {
        let v = make_vocab();
        let json = v.to_json().unwrap();
        let back = Vocabulary::from_json(&json).unwrap();
        assert_eq!(back.len(), v.len());
        assert_eq!(back.eos_id(), Some(258));
        assert_eq!(back.merges().collect::<Vec<_>>(), v.merges().collect::<Vec<_>>());
        for text in ["abc", "abab c", "x<eos>ab"] {
            assert_eq!(back.encode(text), v.encode(text));
        }
    }

    #[test]
    fn artifact_is_human_readable() {
        let json = make_vocab().to_json().unwrap();
        assert!(json.contains("\"format\": \"aiza-bpe\""));
        assert!(json.contains("\"rank\": 1"));
    }

    #[test]
    fn rejects_out_of_order_ranks() {
        let json = make_vocab().to_json().unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        doc["merges"][0]["rank"] = serde_json::json!(5);
        let err = Vocabulary::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, AizaError::InvalidArtifact(_)));
    }

    #[test]
    fn rejects_merge_with_missing_symbol() {
        let json = make_vocab().to_json().unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        doc["vocab"].as_object_mut().unwrap().remove("abc");
        let err = Vocabulary::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, AizaError::InvalidArtifact(_)));
    }

    #[test]
    fn rejects_wrong_format_and_garbage() {
        let json = make_vocab().to_json().unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        doc["format"] = serde_json::json!("tiktoken");
        assert!(matches!(
            Vocabulary::from_json(&doc.to_string()),
            Err(AizaError::InvalidArtifact(_))
        ));
        assert!(matches!(
            Vocabulary::from_json("{ not json"),
            Err(AizaError::Json(_))
        ));
    }

    #[test]
    fn rejects_eos_that_is_not_special() {
        let json = make_vocab().to_json().unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        doc["eos_id"] = serde_json::json!(b'a');
        let err = Vocabulary::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, AizaError::InvalidArtifact(_)));

        doc["eos_id"] = serde_json::Value::Null;
        assert_eq!(Vocabulary::from_json(&doc.to_string()).unwrap().eos_id(), None);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Vocabulary::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, AizaError::ArtifactNotFound(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tok.json");
        let v = make_vocab();
        v.save(&path).unwrap();
        let back = Vocabulary::load(&path).unwrap();
        assert_eq!(back.encode("abcab"), v.encode("abcab"));
        assert_eq!(back.decode(&[257, 256]), "abcab");
    }
}
