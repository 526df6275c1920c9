//! Tokenization service boundary.
//!
//! The dispatcher only needs `text -> token ids`. Two implementations ship
//! with the server:
//! - `VocabTokenizer`: word-level lookup in a JSON vocabulary
//!   (`{"word": id, ...}`), framed by CLS/SEP ids.
//! - `ByteTokenizer`: every UTF-8 byte is its own id. Needs no vocabulary,
//!   useful for link bring-up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Upper bound on ids per reply, framing ids included.
pub const MAX_SEQUENCE_LENGTH: usize = 512;

/// Tokenizer failure, absorbed by the dispatcher into an empty reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("word '{0}' is not in the vocabulary")]
    UnknownWord(String),
    #[error("tokenizer panicked: {0}")]
    Panicked(String),
}

/// Vocabulary loading errors
#[derive(Debug, Error)]
pub enum VocabError {
    #[error("failed to read vocabulary '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse vocabulary '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError>;
}

/// Special ids wrapped around (or substituted into) a tokenized sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls_id: Option<u32>,
    pub sep_id: Option<u32>,
    /// Id for out-of-vocabulary words; `None` makes them an error.
    pub unk_id: Option<u32>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            cls_id: Some(101),
            sep_id: Some(102),
            unk_id: Some(100),
        }
    }
}

/// Word-level vocabulary tokenizer.
#[derive(Debug)]
pub struct VocabTokenizer {
    vocab: HashMap<String, u32>,
    special: SpecialTokens,
}

impl VocabTokenizer {
    pub fn new(vocab: HashMap<String, u32>, special: SpecialTokens) -> Self {
        Self { vocab, special }
    }

    /// Load a JSON object mapping words to ids.
    pub fn load(path: &Path, special: SpecialTokens) -> Result<Self, VocabError> {
        let contents = std::fs::read_to_string(path).map_err(|source| VocabError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let vocab: HashMap<String, u32> =
            serde_json::from_str(&contents).map_err(|source| VocabError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), entries = vocab.len(), "Loaded vocabulary");
        Ok(Self::new(vocab, special))
    }
}

impl Tokenizer for VocabTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
        let SpecialTokens {
            cls_id,
            sep_id,
            unk_id,
        } = self.special;
        let budget = MAX_SEQUENCE_LENGTH - usize::from(sep_id.is_some());

        let mut ids = Vec::with_capacity(text.len() / 4 + 2);
        ids.extend(cls_id);
        for word in text.split_whitespace() {
            if ids.len() >= budget {
                break;
            }
            match self.vocab.get(word).copied().or(unk_id) {
                Some(id) => ids.push(id),
                None => return Err(TokenizeError::UnknownWord(word.to_string())),
            }
        }
        ids.extend(sep_id);
        Ok(ids)
    }
}

/// Byte-level tokenizer: id = byte value.
#[derive(Debug, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
        Ok(text
            .bytes()
            .take(MAX_SEQUENCE_LENGTH)
            .map(u32::from)
            .collect())
    }
}
