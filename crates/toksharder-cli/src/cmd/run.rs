//! `toksharder run` - tokenize inputs into shard files

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Args;
use signal_hook::consts::{SIGINT, SIGTERM};

use toksharder_core::{
    ChainSource, EncoderSpec, InputFormat, InputSpec, PipelineConfig, PipelineState,
    ShardFormat, SharedProgress, expand_inputs,
};

use crate::config::Config;

/// Exit code after a cancelled run (128 + SIGINT)
const EXIT_CANCELLED: i32 = 130;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Input files, glob patterns or HTTP(S) URLs, read in order
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Input format (default: detected from extension, else jsonl)
    #[arg(long)]
    pub format: Option<InputFormat>,

    /// JSON field or Parquet column holding the text
    #[arg(long)]
    pub text_field: Option<String>,

    /// Hugging Face tokenizer.json (default: raw UTF-8 bytes)
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Output directory for shard files
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Tokens per shard
    #[arg(short, long)]
    pub shard_size: Option<usize>,

    /// Shard file format (npy or bin)
    #[arg(long)]
    pub shard_format: Option<ShardFormat>,

    /// Number of encoder workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Token batches buffered between encoders and the shard writer
    #[arg(long)]
    pub channel_capacity: Option<usize>,

    /// Records handed to a worker at a time
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Stop after this many records
    #[arg(long)]
    pub limit: Option<u64>,

    /// Replace shards left in the output directory by a previous run
    #[arg(long)]
    pub overwrite: bool,
}

impl RunArgs {
    /// File/env configuration with command-line flags applied on top
    fn pipeline_config(&self, base: &PipelineConfig) -> PipelineConfig {
        PipelineConfig {
            shard_size: self.shard_size.unwrap_or(base.shard_size),
            output_dir: self.output_dir.clone().unwrap_or_else(|| base.output_dir.clone()),
            workers: self.workers.unwrap_or(base.workers),
            channel_capacity: self.channel_capacity.unwrap_or(base.channel_capacity),
            chunk_size: self.chunk_size.unwrap_or(base.chunk_size),
            shard_format: self.shard_format.unwrap_or(base.shard_format),
            poll_interval_ms: base.poll_interval_ms,
            overwrite: self.overwrite || base.overwrite,
            max_records: self.limit.or(base.max_records),
        }
    }

    fn encoder_spec(&self, base: &EncoderSpec) -> EncoderSpec {
        match &self.tokenizer {
            Some(path) => EncoderSpec::Tokenizer { path: path.clone() },
            None => base.clone(),
        }
    }
}

/// SIGINT/SIGTERM request a graceful stop; a second signal exits at once.
fn install_signal_handlers(cancel: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        // Registration order matters: the shutdown check runs before the flag is set
        signal_hook::flag::register_conditional_shutdown(signal, EXIT_CANCELLED, Arc::clone(cancel))
            .context("failed to register signal handler")?;
        signal_hook::flag::register(signal, Arc::clone(cancel))
            .context("failed to register signal handler")?;
    }
    Ok(())
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let pipeline_config = args.pipeline_config(&config.pipeline);
    pipeline_config.validate()?;
    let encoder = args.encoder_spec(&config.encoder);
    let text_field = args
        .text_field
        .clone()
        .unwrap_or_else(|| config.input.text_field.clone());

    let locations = expand_inputs(&args.inputs).context("failed to resolve inputs")?;
    let inputs: Vec<InputSpec> = locations
        .iter()
        .map(|location| InputSpec::detect(location, args.format))
        .collect();
    log::info!(
        "{} inputs, encoder: {encoder}, {} workers",
        inputs.len(),
        pipeline_config.workers
    );
    let mut source = ChainSource::new(inputs, text_field);

    let cancel = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&cancel)?;
    let state = PipelineState::with_cancel_flag(cancel);

    let pb = progress.stage_line("shard");
    let summary = toksharder_core::run(
        &pipeline_config,
        &mut source,
        || encoder.build(),
        &state,
        &pb,
    )
    .context("pipeline failed")?;

    summary.log();
    if summary.cancelled {
        log::warn!("Interrupted; shards written so far are kept");
        std::process::exit(EXIT_CANCELLED);
    }
    Ok(())
}
