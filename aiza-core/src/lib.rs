pub mod bpe;
pub mod error;
pub mod pretokenize;
pub mod tokenizer;

pub use bpe::{TrainerConfig, train};
pub use error::{AizaError, Result};
pub use tokenizer::{Tokenizer, UNK_ID, Vocabulary, decode, encode};
