//! Dispatcher and encoder pool.
//!
//! The calling thread pulls records from the source and hands them out in
//! chunks over a bounded job channel. A fixed set of rayon workers, each
//! owning its own encoder, turns records into token batches and forwards
//! them on the bounded token channel in completion order. A full token
//! channel blocks the workers, which stops the job channel draining, which
//! blocks the dispatcher: that chain is the only backpressure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use indicatif::ProgressBar;

use crate::accumulator::TokenBatch;
use crate::encoder::{Encoder, encode_u16};
use crate::error::{EncodeError, PipelineError};
use crate::progress::fmt_num;
use crate::source::RecordSource;
use crate::state::PipelineState;

/// One unit of input text, numbered in source order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub text: String,
}

/// Dispatcher settings
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub workers: usize,
    pub chunk_size: usize,
    pub max_records: Option<u64>,
}

/// Totals from one dispatch run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records pulled from the source
    pub records: u64,
    /// Records whose encoding failed (contributed no tokens)
    pub failed_records: u64,
    /// Malformed source records skipped before encoding
    pub skipped_records: u64,
    /// Tokens handed to the token channel
    pub tokens_encoded: u64,
    /// Dispatch stopped early (cancellation or closed token channel)
    pub interrupted: bool,
}

#[derive(Default)]
struct Counters {
    failed: AtomicU64,
    tokens: AtomicU64,
    /// Token channel receiver is gone; stop feeding
    closed: AtomicBool,
}

/// Run the source through the encoder pool, forwarding batches to `tx`.
///
/// Returns only after every worker has exited, so every encode call has
/// either delivered its batch or found the channel closed. Encoder
/// construction happens before any record is pulled; a failure there is
/// fatal. Per-record encode failures are logged and counted.
pub fn dispatch<S, F, E>(
    source: &mut S,
    new_encoder: F,
    tx: &SyncSender<TokenBatch>,
    config: &DispatchConfig,
    state: &PipelineState,
    pb: &ProgressBar,
) -> Result<DispatchStats, PipelineError>
where
    S: RecordSource + ?Sized,
    F: Fn() -> Result<E, EncodeError>,
    E: Encoder,
{
    let encoders = (0..config.workers)
        .map(|_| new_encoder())
        .collect::<Result<Vec<E>, _>>()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|i| format!("encoder-{i}"))
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to build encoder pool: {e}")))?;

    // Room for one waiting chunk per worker
    let (job_tx, job_rx) = sync_channel::<Vec<Record>>(config.workers);
    let job_rx = Mutex::new(job_rx);
    let counters = Counters::default();

    log::info!(
        "Encoding with {} workers, {} records per chunk",
        config.workers,
        config.chunk_size
    );

    let fed = pool.in_place_scope(|s| {
        for (worker_id, encoder) in encoders.into_iter().enumerate() {
            let tx = tx.clone();
            let job_rx = &job_rx;
            let counters = &counters;
            s.spawn(move |_| worker_loop(worker_id, encoder, job_rx, tx, counters));
        }
        // Dropping job_tx at the end of feed lets idle workers exit
        feed(source, job_tx, config, state, &counters, pb)
    })?;

    let stats = DispatchStats {
        records: fed.records,
        failed_records: counters.failed.load(Ordering::Relaxed),
        skipped_records: fed.skipped,
        tokens_encoded: counters.tokens.load(Ordering::Relaxed),
        interrupted: fed.interrupted || counters.closed.load(Ordering::Relaxed),
    };
    log::debug!("Dispatch finished: {stats:?}");
    Ok(stats)
}

struct Fed {
    records: u64,
    skipped: u64,
    interrupted: bool,
}

fn feed<S: RecordSource + ?Sized>(
    source: &mut S,
    job_tx: SyncSender<Vec<Record>>,
    config: &DispatchConfig,
    state: &PipelineState,
    counters: &Counters,
    pb: &ProgressBar,
) -> Result<Fed, PipelineError> {
    let mut fed = Fed {
        records: 0,
        skipped: 0,
        interrupted: false,
    };
    let mut chunk = Vec::with_capacity(config.chunk_size);

    loop {
        if state.is_cancelled() || counters.closed.load(Ordering::Relaxed) {
            log::info!("Dispatcher stopping after {} records", fmt_num(fed.records as usize));
            fed.interrupted = true;
            return Ok(fed);
        }
        if config.max_records.is_some_and(|max| fed.records >= max) {
            log::info!("Reached record limit ({})", fmt_num(fed.records as usize));
            break;
        }

        match source.next_record() {
            Ok(Some(text)) => {
                chunk.push(Record {
                    seq: fed.records,
                    text,
                });
                fed.records += 1;
            }
            Ok(None) => break,
            Err(e) if e.is_recoverable() => {
                log::warn!("Skipping record: {e}");
                fed.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if chunk.len() >= config.chunk_size {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(config.chunk_size));
            if job_tx.send(full).is_err() {
                fed.interrupted = true;
                return Ok(fed);
            }
            pb.set_message(format!(
                "{} records, {} tokens",
                fmt_num(fed.records as usize),
                fmt_num(counters.tokens.load(Ordering::Relaxed) as usize)
            ));
        }
    }

    if !chunk.is_empty() && job_tx.send(chunk).is_err() {
        fed.interrupted = true;
    }
    Ok(fed)
}

fn worker_loop<E: Encoder>(
    worker_id: usize,
    mut encoder: E,
    jobs: &Mutex<Receiver<Vec<Record>>>,
    tx: SyncSender<TokenBatch>,
    counters: &Counters,
) {
    loop {
        let next = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(chunk) = next else {
            break;
        };

        // Keep draining jobs after the token channel closed so the
        // dispatcher never blocks on a job nobody will take
        if counters.closed.load(Ordering::Relaxed) {
            continue;
        }

        for record in chunk {
            // A panic costs only this record; the encoder instance is reused
            let encoded = panic::catch_unwind(AssertUnwindSafe(|| {
                encode_u16(&mut encoder, &record.text)
            }))
            .unwrap_or_else(|payload| Err(EncodeError::Panicked(panic_message(&*payload))));
            match encoded {
                Ok(tokens) if tokens.is_empty() => {}
                Ok(tokens) => {
                    let n = tokens.len() as u64;
                    let batch = TokenBatch {
                        seq: record.seq,
                        tokens,
                    };
                    if tx.send(batch).is_err() {
                        log::debug!("encoder-{worker_id}: token channel closed");
                        counters.closed.store(true, Ordering::Relaxed);
                        break;
                    }
                    counters.tokens.fetch_add(n, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("Record {} failed to encode: {e}", record.seq);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    log::debug!("encoder-{worker_id}: exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ByteEncoder;
    use crate::source::IterSource;

    struct Numbers;

    impl Encoder for Numbers {
        fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError> {
            text.split_whitespace()
                .map(|t| t.parse().map_err(|_| EncodeError::Tokenizer(format!("bad token {t}"))))
                .collect()
        }
    }

    /// Panics on the record "boom"
    struct Fragile;

    impl Encoder for Fragile {
        fn encode(&mut self, text: &str) -> Result<Vec<u32>, EncodeError> {
            if text == "boom" {
                panic!("cannot encode {text}");
            }
            Numbers.encode(text)
        }
    }

    fn config(workers: usize) -> DispatchConfig {
        DispatchConfig {
            workers,
            chunk_size: 2,
            max_records: None,
        }
    }

    fn records(texts: &[&str]) -> IterSource<std::vec::IntoIter<String>> {
        IterSource::new(texts.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    fn run(texts: &[&str], cfg: DispatchConfig) -> (DispatchStats, Vec<TokenBatch>) {
        let (tx, rx) = sync_channel(1024);
        let state = PipelineState::new();
        let stats = dispatch(
            &mut records(texts),
            || Ok(Numbers),
            &tx,
            &cfg,
            &state,
            &ProgressBar::hidden(),
        )
        .unwrap();
        drop(tx);
        let mut batches: Vec<TokenBatch> = rx.iter().collect();
        batches.sort_by_key(|b| b.seq);
        (stats, batches)
    }

    #[test]
    fn every_record_arrives_intact() {
        let (stats, batches) = run(&["1 2 3", "4 5", "6", "7 8 9 10", "11"], config(3));
        assert_eq!(stats.records, 5);
        assert_eq!(stats.failed_records, 0);
        assert_eq!(stats.tokens_encoded, 11);
        assert!(!stats.interrupted);
        assert_eq!(batches[0].tokens, vec![1, 2, 3]);
        assert_eq!(batches[3].tokens, vec![7, 8, 9, 10]);
    }

    #[test]
    fn failed_record_contributes_nothing() {
        let (stats, batches) = run(&["1 2", "oops", "3"], config(2));
        assert_eq!(stats.records, 3);
        assert_eq!(stats.failed_records, 1);
        assert_eq!(stats.tokens_encoded, 3);
        let seqs: Vec<u64> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
    }

    #[test]
    fn out_of_range_token_fails_record() {
        let (stats, batches) = run(&["70000", "1"], config(1));
        assert_eq!(stats.failed_records, 1);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn record_limit() {
        let cfg = DispatchConfig {
            max_records: Some(2),
            ..config(1)
        };
        let (stats, batches) = run(&["1", "2", "3", "4"], cfg);
        assert_eq!(stats.records, 2);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn encoder_construction_failure_is_fatal() {
        let (tx, _rx) = sync_channel(4);
        let err = dispatch(
            &mut records(&["a"]),
            || {
                Err::<ByteEncoder, _>(EncodeError::Load {
                    path: "missing.json".into(),
                    message: "no such file".to_string(),
                })
            },
            &tx,
            &config(2),
            &PipelineState::new(),
            &ProgressBar::hidden(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Encoder(_)));
    }

    #[test]
    fn closed_channel_stops_dispatch() {
        let (tx, rx) = sync_channel(1);
        drop(rx);
        let texts: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        let stats = dispatch(
            &mut IterSource::new(texts),
            || Ok(Numbers),
            &tx,
            &config(2),
            &PipelineState::new(),
            &ProgressBar::hidden(),
        )
        .unwrap();
        assert!(stats.interrupted);
        assert_eq!(stats.tokens_encoded, 0);
    }

    #[test]
    fn cancelled_before_start_pulls_nothing() {
        let (tx, _rx) = sync_channel(4);
        let state = PipelineState::new();
        state.request_cancel();
        let stats = dispatch(
            &mut records(&["1", "2"]),
            || Ok(Numbers),
            &tx,
            &config(1),
            &state,
            &ProgressBar::hidden(),
        )
        .unwrap();
        assert_eq!(stats.records, 0);
        assert!(stats.interrupted);
    }

    #[test]
    fn encoder_panic_is_a_record_failure() {
        let mut texts: Vec<String> = (1..=50).map(|i| i.to_string()).collect();
        texts.insert(10, "boom".to_string());
        let (tx, rx) = sync_channel(1);
        let cfg = DispatchConfig {
            workers: 1,
            chunk_size: 1,
            max_records: None,
        };

        let stats = std::thread::scope(|s| {
            let reader = s.spawn(move || rx.iter().map(|b: TokenBatch| b.tokens.len()).sum::<usize>());
            let stats = dispatch(
                &mut IterSource::new(texts),
                || Ok(Fragile),
                &tx,
                &cfg,
                &PipelineState::new(),
                &ProgressBar::hidden(),
            )
            .unwrap();
            drop(tx);
            assert_eq!(reader.join().unwrap(), 50);
            stats
        });

        assert_eq!(stats.records, 51);
        assert_eq!(stats.failed_records, 1);
        assert_eq!(stats.tokens_encoded, 50);
        assert!(!stats.interrupted);
    }

    #[test]
    fn panic_message_from_payload() {
        let payload = panic::catch_unwind(|| panic!("bad {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "bad 7");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}
