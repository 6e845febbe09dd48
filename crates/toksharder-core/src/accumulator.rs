//! Shard accumulator: single consumer turning token batches into fixed-size shards

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use indicatif::ProgressBar;

use crate::error::PipelineError;
use crate::progress::fmt_num;
use crate::sink::ShardSink;
use crate::state::PipelineState;

/// Encoded tokens of one source record, contiguous and in encoder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    /// Position of the record in the source stream
    pub seq: u64,
    pub tokens: Vec<u16>,
}

/// Why a shard was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    /// Exactly `shard_size` tokens
    Full,
    /// Remainder at end of stream
    Final,
    /// Remainder flushed on cancellation
    Partial,
}

/// One shard written by the accumulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub index: usize,
    pub path: PathBuf,
    pub tokens: usize,
    pub kind: ShardKind,
}

/// Totals from one accumulator run
#[derive(Debug, Default)]
pub struct AccumulatorSummary {
    pub batches: u64,
    pub tokens_written: u64,
    pub shards: Vec<ShardInfo>,
    /// Largest buffer length observed, before flushing
    pub peak_buffer_len: usize,
    pub cancelled: bool,
}

/// Buffers tokens and writes a shard every time `shard_size` is reached.
///
/// Owns the shard index: indices are assigned in emission order, start at 0
/// and never skip.
pub struct ShardAccumulator<S: ShardSink> {
    sink: S,
    shard_size: usize,
    buffer: Vec<u16>,
    next_index: usize,
    summary: AccumulatorSummary,
    pb: ProgressBar,
}

impl<S: ShardSink> ShardAccumulator<S> {
    pub fn new(sink: S, shard_size: usize) -> Result<Self, PipelineError> {
        if shard_size == 0 {
            return Err(PipelineError::Config("shard_size must be at least 1".to_string()));
        }
        Ok(Self {
            sink,
            shard_size,
            buffer: Vec::new(),
            next_index: 0,
            summary: AccumulatorSummary::default(),
            pb: ProgressBar::hidden(),
        })
    }

    /// Report shard emissions on a progress line.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.pb = pb;
        self
    }

    /// Tokens currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append one batch and emit every full shard it completes.
    pub fn push(&mut self, tokens: &[u16]) -> Result<(), PipelineError> {
        self.summary.batches += 1;
        self.buffer.extend_from_slice(tokens);
        self.summary.peak_buffer_len = self.summary.peak_buffer_len.max(self.buffer.len());

        while self.buffer.len() >= self.shard_size {
            self.emit(self.shard_size, ShardKind::Full)?;
            self.buffer.drain(..self.shard_size);
        }
        Ok(())
    }

    /// Flush the remainder (if any) and return the run totals.
    pub fn finish(mut self, kind: ShardKind) -> Result<AccumulatorSummary, PipelineError> {
        if !self.buffer.is_empty() {
            self.emit(self.buffer.len(), kind)?;
            self.buffer.clear();
        }
        self.summary.cancelled = kind == ShardKind::Partial;
        Ok(self.summary)
    }

    fn emit(&mut self, len: usize, kind: ShardKind) -> Result<(), PipelineError> {
        let index = self.next_index;
        let path = self
            .sink
            .write_shard(index, &self.buffer[..len])
            .map_err(|e| PipelineError::io(format!("shard {index:05}"), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match kind {
            ShardKind::Full => log::info!("Saved {name} ({} tokens)", fmt_num(len)),
            ShardKind::Final => log::info!("Saved final {name} ({} tokens)", fmt_num(len)),
            ShardKind::Partial => {
                log::warn!("Saved partial {name} ({} tokens) after cancellation", fmt_num(len))
            }
        }

        self.next_index += 1;
        self.summary.tokens_written += len as u64;
        self.summary.shards.push(ShardInfo {
            index,
            path,
            tokens: len,
            kind,
        });
        self.pb.set_message(format!(
            "{} shards, {} tokens written",
            self.next_index,
            fmt_num(self.summary.tokens_written as usize)
        ));
        Ok(())
    }

    /// Consume batches until the source is drained, then write the final shard.
    ///
    /// Terminates only once the draining signal is set *and* the channel is
    /// empty. A receive timeout is never an error: it re-checks the state.
    /// On cancellation the buffer is flushed as a partial shard and the
    /// receiver is dropped, which closes the channel for the producers.
    pub fn run(
        mut self,
        rx: Receiver<TokenBatch>,
        state: &PipelineState,
        poll_interval: Duration,
    ) -> Result<AccumulatorSummary, PipelineError> {
        loop {
            if state.is_cancelled() {
                drop(rx);
                let summary = self.finish(ShardKind::Partial)?;
                state.terminate();
                return Ok(summary);
            }

            match rx.recv_timeout(poll_interval) {
                Ok(batch) => self.push(&batch.tokens)?,
                Err(RecvTimeoutError::Timeout) => {
                    if state.is_draining() {
                        // Producers are done; whatever is queued is the tail
                        self.drain_queued(&rx)?;
                        break;
                    }
                    if state.is_aborted() {
                        return Ok(self.discard());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if state.is_draining() {
                        break;
                    }
                    if state.is_aborted() {
                        return Ok(self.discard());
                    }
                    return Err(PipelineError::ChannelClosed);
                }
            }
        }

        let summary = self.finish(ShardKind::Final)?;
        state.terminate();
        Ok(summary)
    }

    fn drain_queued(&mut self, rx: &Receiver<TokenBatch>) -> Result<(), PipelineError> {
        loop {
            match rx.try_recv() {
                Ok(batch) => self.push(&batch.tokens)?,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn discard(self) -> AccumulatorSummary {
        if !self.buffer.is_empty() {
            log::warn!(
                "Discarding {} buffered tokens after pipeline failure",
                fmt_num(self.buffer.len())
            );
        }
        self.summary
    }
}
