//! End-to-end run: source → encoder pool → bounded channel → shard files

use std::fs;
use std::path::Path;
use std::sync::mpsc::sync_channel;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use crate::accumulator::{ShardAccumulator, ShardInfo};
use crate::config::PipelineConfig;
use crate::dispatcher::{DispatchConfig, dispatch};
use crate::encoder::Encoder;
use crate::error::{EncodeError, PipelineError};
use crate::progress::fmt_num;
use crate::sink::{ShardSink, ShardWriter, cleanup_tmp_files, list_shards};
use crate::source::RecordSource;
use crate::state::PipelineState;

/// Pipeline execution summary
#[derive(Debug)]
pub struct Summary {
    pub records: u64,
    pub failed_records: u64,
    pub skipped_records: u64,
    pub tokens_encoded: u64,
    pub tokens_written: u64,
    pub shards: Vec<ShardInfo>,
    pub peak_buffer_len: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl Summary {
    pub fn log(&self) {
        log::info!("=== Sharding Summary ===");
        log::info!(
            "Records: {} ({} failed, {} skipped)",
            fmt_num(self.records as usize),
            fmt_num(self.failed_records as usize),
            fmt_num(self.skipped_records as usize)
        );
        log::info!(
            "Tokens: {} written in {} shards",
            fmt_num(self.tokens_written as usize),
            self.shards.len()
        );
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
        if self.tokens_written > 0 && self.elapsed.as_secs_f64() > 0.0 {
            let rate = self.tokens_written as f64 / self.elapsed.as_secs_f64();
            log::info!("Throughput: {rate:.0} tokens/sec");
        }
        if self.cancelled {
            log::warn!(
                "Run was cancelled; {} encoded tokens were not written",
                fmt_num(self.tokens_encoded.saturating_sub(self.tokens_written) as usize)
            );
        }
    }
}

/// Create the output directory and make sure it holds no previous shards.
pub fn prepare_output_dir(config: &PipelineConfig) -> Result<(), PipelineError> {
    let dir = &config.output_dir;
    fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    cleanup_tmp_files(dir).map_err(|e| PipelineError::io(dir, e))?;

    let existing = list_shards(dir).map_err(|e| PipelineError::io(dir, e))?;
    if existing.is_empty() {
        return Ok(());
    }
    if !config.overwrite {
        return Err(PipelineError::Config(format!(
            "{} already contains {} shard files (use overwrite to replace them)",
            dir.display(),
            existing.len()
        )));
    }
    log::warn!(
        "Removing {} existing shard files from {}",
        existing.len(),
        dir.display()
    );
    for (_, path) in existing {
        fs::remove_file(&path).map_err(|e| PipelineError::io(&path, e))?;
    }
    Ok(())
}

/// Run the pipeline, writing shard files into `config.output_dir`.
pub fn run<S, F, E>(
    config: &PipelineConfig,
    source: &mut S,
    new_encoder: F,
    state: &PipelineState,
    pb: &ProgressBar,
) -> Result<Summary, PipelineError>
where
    S: RecordSource + ?Sized,
    F: Fn() -> Result<E, EncodeError>,
    E: Encoder,
{
    config.validate()?;
    prepare_output_dir(config)?;
    let sink = ShardWriter::new(&config.output_dir, config.shard_format);
    log::info!(
        "Writing {} shards of {} tokens to {}",
        config.shard_format,
        fmt_num(config.shard_size),
        config.output_dir.display()
    );
    run_with_sink(config, source, new_encoder, sink, state, pb)
}

/// Same as [`run`] with a caller-provided sink; the output directory is not touched.
pub fn run_with_sink<S, F, E, K>(
    config: &PipelineConfig,
    source: &mut S,
    new_encoder: F,
    sink: K,
    state: &PipelineState,
    pb: &ProgressBar,
) -> Result<Summary, PipelineError>
where
    S: RecordSource + ?Sized,
    F: Fn() -> Result<E, EncodeError>,
    E: Encoder,
    K: ShardSink + Send,
{
    config.validate()?;
    let start = Instant::now();
    let (tx, rx) = sync_channel(config.channel_capacity);
    let dispatch_config = DispatchConfig {
        workers: config.workers,
        chunk_size: config.chunk_size,
        max_records: config.max_records,
    };
    let accumulator = ShardAccumulator::new(sink, config.shard_size)?.with_progress(pb.clone());
    let poll_interval = config.poll_interval();

    let (dispatched, accumulated) = std::thread::scope(|s| {
        let writer = std::thread::Builder::new()
            .name("shard-accumulator".to_string())
            .spawn_scoped(s, || accumulator.run(rx, state, poll_interval))
            .map_err(|e| PipelineError::io(Path::new("shard-accumulator"), e));
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => return (Err(e), None),
        };

        let dispatched = dispatch(source, new_encoder, &tx, &dispatch_config, state, pb);
        match &dispatched {
            Ok(_) => {
                state.begin_draining();
            }
            Err(e) => {
                log::error!("Aborting pipeline: {e}");
                state.abort();
            }
        }
        // Last sender: once dropped the accumulator sees the channel close
        drop(tx);

        (dispatched, Some(writer.join()))
    });

    let dispatch_stats = dispatched?;
    let acc_summary = match accumulated {
        Some(Ok(result)) => result?,
        Some(Err(_)) => return Err(PipelineError::WorkerPanic("shard accumulator")),
        None => return Err(PipelineError::WorkerPanic("shard accumulator")),
    };
    pb.finish_and_clear();

    let summary = Summary {
        records: dispatch_stats.records,
        failed_records: dispatch_stats.failed_records,
        skipped_records: dispatch_stats.skipped_records,
        tokens_encoded: dispatch_stats.tokens_encoded,
        tokens_written: acc_summary.tokens_written,
        shards: acc_summary.shards,
        peak_buffer_len: acc_summary.peak_buffer_len,
        cancelled: acc_summary.cancelled || state.is_cancelled(),
        elapsed: start.elapsed(),
    };

    if !summary.cancelled && summary.tokens_written != summary.tokens_encoded {
        log::error!(
            "Token accounting mismatch: {} encoded, {} written",
            summary.tokens_encoded,
            summary.tokens_written
        );
    }
    Ok(summary)
}
