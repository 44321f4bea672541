use crate::error::{AizaError, Result};
use fancy_regex::Regex;

/// Chunk pattern shared by training and encoding: contractions, letter runs,
/// digit runs, punctuation runs and whitespace runs. The `(?!\S)` lookahead
/// keeps a trailing space attached to the following word.
pub const CHUNK_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece<'t> {
    /// Literal occurrence of a registered special token.
    Special(&'t str),
    /// Ordinary text between special tokens, still to be chunked.
    Text(&'t str),
}

/// Splits raw text into special tokens and word-like chunks.
#[derive(Debug, Clone)]
pub struct PreTokenizer {
    regex: Regex,
    pattern: String,
    // longest first, so overlapping specials resolve to the longer literal
    specials: Vec<String>,
}

impl PreTokenizer {
    pub fn new(pattern: &str, specials: &[String]) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| AizaError::InvalidConfig(format!("chunk pattern: {e}")))?;
        let mut specials: Vec<String> = specials.to_vec();
        specials.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            specials,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Split on special tokens (leftmost match, longest on ties).
    pub fn split_specials<'t>(&self, text: &'t str) -> Vec<Piece<'t>> {
        if self.specials.is_empty() {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![Piece::Text(text)]
            };
        }

        let mut pieces = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let mut hit: Option<(usize, &str)> = None;
            for special in &self.specials {
                if let Some(at) = rest.find(special.as_str()) {
                    // specials are sorted longest first, so only a strictly earlier
                    // start replaces the current hit
                    if hit.is_none_or(|(best, _)| at < best) {
                        hit = Some((at, special.as_str()));
                    }
                }
            }
            match hit {
                Some((at, special)) => {
                    if at > 0 {
                        pieces.push(Piece::Text(&rest[..at]));
                    }
                    let end = at + special.len();
                    pieces.push(Piece::Special(&rest[at..end]));
                    rest = &rest[end..];
                }
                None => {
                    pieces.push(Piece::Text(rest));
                    break;
                }
            }
        }
        pieces
    }

    /// Chunk plain text with the pattern. Never drops input: gaps between
    /// matches become chunks of their own, and if the regex engine gives up
    /// the remainder is kept as a single chunk.
    pub fn chunks<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut out = Vec::new();
        let mut last = 0;
        for found in self.regex.find_iter(text) {
            match found {
                Ok(m) => {
                    if m.start() > last {
                        out.push(&text[last..m.start()]);
                    }
                    if m.end() > m.start() {
                        out.push(m.as_str());
                    }
                    last = m.end();
                }
                Err(e) => {
                    tracing::warn!(offset = last, "chunk pattern failed: {e}, keeping remainder whole");
                    break;
                }
            }
        }
        if last < text.len() {
            out.push(&text[last..]);
        }
        out
    }
}
