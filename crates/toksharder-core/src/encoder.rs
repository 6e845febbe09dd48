//! Text → token ID encoders.
//!
//! Encoders are treated as not shareable across threads: the pool builds one
//! instance per worker through a factory closure and each worker owns its own.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::EncodeError;

/// Largest token ID a shard can hold
pub const MAX_TOKEN_ID: u32 = u16::MAX as u32;

/// Encodes one record's text into token IDs.
pub trait Encoder: Send {
    fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError>;
}

impl Encoder for Box<dyn Encoder> {
    fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError> {
        (**self).encode(text)
    }
}

/// Encode and narrow to the u16 shard representation.
///
/// Any ID above [`MAX_TOKEN_ID`] fails the whole record.
pub fn encode_u16<E: Encoder + ?Sized>(encoder: &mut E, text: &str) -> Result<Vec<u16>, EncodeError> {
    encoder
        .encode(text)?
        .into_iter()
        .map(|id| {
            if id <= MAX_TOKEN_ID {
                Ok(id as u16)
            } else {
                Err(EncodeError::TokenOutOfRange { token: id })
            }
        })
        .collect()
}

/// UTF-8 bytes as token IDs (vocabulary of 256).
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteEncoder;

impl Encoder for ByteEncoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError> {
        Ok(text.bytes().map(u32::from).collect())
    }
}

/// Hugging Face `tokenizer.json` encoder.
pub struct TokenizerEncoder {
    tokenizer: tokenizers::Tokenizer,
}

impl TokenizerEncoder {
    pub fn from_file(path: &Path) -> Result<Self, EncodeError> {
        let tokenizer =
            tokenizers::Tokenizer::from_file(path).map_err(|e| EncodeError::Load {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self { tokenizer })
    }
}

impl Encoder for TokenizerEncoder {
    fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EncodeError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Which encoder each worker instantiates
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EncoderSpec {
    #[default]
    Bytes,
    Tokenizer {
        path: PathBuf,
    },
}

impl EncoderSpec {
    /// Build a fresh, independently owned encoder instance.
    pub fn build(&self) -> Result<Box<dyn Encoder>, EncodeError> {
        match self {
            Self::Bytes => Ok(Box::new(ByteEncoder)),
            Self::Tokenizer { path } => Ok(Box::new(TokenizerEncoder::from_file(path)?)),
        }
    }
}

impl std::fmt::Display for EncoderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes => write!(f, "bytes"),
            Self::Tokenizer { path } => write!(f, "tokenizer ({})", path.display()),
        }
    }
}
