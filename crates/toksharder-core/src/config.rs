//! Pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::sink::ShardFormat;

/// Runtime configuration for one tokenize-and-shard run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tokens per shard file (the last shard may be shorter)
    pub shard_size: usize,
    /// Directory receiving shard files, created if absent
    pub output_dir: PathBuf,
    /// Encoder worker count
    pub workers: usize,
    /// Pending token batches between the pool and the accumulator
    pub channel_capacity: usize,
    /// Records handed to a worker per submission
    pub chunk_size: usize,
    pub shard_format: ShardFormat,
    /// Accumulator wait before re-checking the draining signal
    pub poll_interval_ms: u64,
    /// Remove shards left by a previous run instead of refusing to start
    pub overwrite: bool,
    /// Stop after this many source records
    pub max_records: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_size: 100_000_000,
            output_dir: PathBuf::from("shards"),
            workers: 8,
            channel_capacity: 100,
            chunk_size: 10,
            shard_format: ShardFormat::Npy,
            poll_interval_ms: 1000,
            overwrite: false,
            max_records: None,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("shard_size", self.shard_size),
            ("workers", self.workers),
            ("channel_capacity", self.channel_capacity),
            ("chunk_size", self.chunk_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::Config(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
