//! Toksharder Core - streaming tokenization into fixed-size shards
//!
//! Records flow from a [`RecordSource`] through a pool of encoder workers
//! into a single [`ShardAccumulator`], which writes contiguous token shards
//! of a fixed size. Every stage is connected by bounded queues, so memory
//! stays flat regardless of input size.

pub mod accumulator;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod stream;

// Re-exports for convenience
pub use accumulator::{AccumulatorSummary, ShardAccumulator, ShardInfo, ShardKind, TokenBatch};
pub use config::PipelineConfig;
pub use dispatcher::{DispatchConfig, DispatchStats, Record, dispatch};
pub use encoder::{ByteEncoder, Encoder, EncoderSpec, MAX_TOKEN_ID, TokenizerEncoder, encode_u16};
pub use error::{EncodeError, PipelineError, SourceError};
pub use logging::{IndicatifLogger, Verbosity, init_logging};
pub use pipeline::{Summary, prepare_output_dir, run, run_with_sink};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use sink::{
    ShardFormat, ShardSink, ShardWriter, cleanup_tmp_files, list_shards, read_shard, shard_filename,
};
pub use source::{ChainSource, InputFormat, InputSpec, IterSource, RecordSource, expand_inputs};
pub use state::{Phase, PipelineState};
pub use stream::{HttpConfig, StreamError, http_config, set_http_config};
