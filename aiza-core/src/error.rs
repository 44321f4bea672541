use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AizaError {
    #[error("tokenizer artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("invalid tokenizer artifact: {0}")]
    InvalidArtifact(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid cache write: {0}")]
    InvalidCacheWrite(String),

    #[error("kv cache exhausted: requested {requested} positions, max {max}")]
    CacheExhausted { requested: usize, max: usize },

    #[error("prompt encodes to zero tokens")]
    EmptyPrompt,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AizaError>;
