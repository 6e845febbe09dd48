//! Error types for the tokenize-and-shard pipeline

use std::path::PathBuf;

use crate::stream::StreamError;

/// Failure to encode one record, or to build an encoder instance.
#[derive(Debug)]
pub enum EncodeError {
    /// Encoder could not be instantiated (missing or invalid vocabulary file)
    Load { path: PathBuf, message: String },
    /// Encoder rejected the input text
    Tokenizer(String),
    /// Encoder produced an ID that does not fit the u16 shard format
    TokenOutOfRange { token: u32 },
    /// Encoder panicked on the input
    Panicked(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load { path, message } => {
                write!(f, "failed to load encoder from {}: {message}", path.display())
            }
            Self::Tokenizer(message) => write!(f, "tokenizer error: {message}"),
            Self::TokenOutOfRange { token } => {
                write!(f, "token id {token} exceeds u16 range")
            }
            Self::Panicked(message) => write!(f, "encoder panicked: {message}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Error from pulling records out of a source.
#[derive(Debug)]
pub enum SourceError {
    /// Network stream failure (open or mid-stream)
    Stream(StreamError),
    /// Local file read failure
    Io { path: PathBuf, source: std::io::Error },
    /// Parquet/Arrow decoding failure
    Parquet(String),
    /// A single record could not be parsed; the stream itself is intact
    Malformed { record: u64, message: String },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "{e}"),
            Self::Io { path, source } => write!(f, "IO error reading {}: {source}", path.display()),
            Self::Parquet(message) => write!(f, "parquet: {message}"),
            Self::Malformed { record, message } => {
                write!(f, "malformed record {record}: {message}")
            }
        }
    }
}

impl std::error::Error for SourceError {}

impl SourceError {
    /// Malformed records are skipped; everything else ends the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

impl From<StreamError> for SourceError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

/// Fatal pipeline error. Per-record failures never surface as this type.
#[derive(Debug)]
pub enum PipelineError {
    /// Invalid configuration, detected before any work starts
    Config(String),
    /// Output directory or shard file I/O failure
    Io { path: PathBuf, source: std::io::Error },
    /// Source failed in a way that cannot be skipped
    Source(SourceError),
    /// Encoder could not be instantiated for a worker
    Encoder(EncodeError),
    /// The token channel closed before the source was exhausted
    ChannelClosed,
    /// A pipeline thread panicked
    WorkerPanic(&'static str),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(message) => write!(f, "invalid configuration: {message}"),
            Self::Io { path, source } => write!(f, "IO: {}: {source}", path.display()),
            Self::Source(e) => write!(f, "source: {e}"),
            Self::Encoder(e) => write!(f, "encoder: {e}"),
            Self::ChannelClosed => {
                write!(f, "token channel closed before source was exhausted")
            }
            Self::WorkerPanic(name) => write!(f, "{name} thread panicked"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Source(e) => Some(e),
            Self::Encoder(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<EncodeError> for PipelineError {
    fn from(e: EncodeError) -> Self {
        Self::Encoder(e)
    }
}

impl PipelineError {
    /// Attach the path an I/O error happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
