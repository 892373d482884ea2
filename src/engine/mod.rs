//! Ingest-and-dispatch engine
//!
//! The concurrent skeleton shared by all three format decoders: driver
//! threads `submit` raw buffers, a pool of worker threads decodes them, and
//! consumers `drain` the accumulated events.
//!
//! Locking discipline: `submit` takes the input mutex only to enqueue;
//! workers take it only to pop the front buffer and always release it
//! before decoding (and before the empty-queue sleep); the output mutex is
//! held only to splice a locally built batch or to drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::{DataType, EventData, RawData};
use crate::decoder::{psd2, Classification, DecoderSettings, FormatDecoder, Generation};

/// Poll interval of an idle worker
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Engine construction parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Decoder worker count; values below 1 fall back to 1
    pub threads: usize,
    /// Time step in ns per sample
    pub time_step_ns: u32,
    /// Module number stamped on decoded events
    pub module_id: u8,
    /// Verbose decode logging and hex dumps
    pub debug: bool,
    /// Input queue bound; 0 means unbounded. On overflow the oldest buffer
    /// is dropped with a counted warning.
    pub input_queue_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            time_step_ns: 2,
            module_id: 0,
            debug: false,
            input_queue_limit: 0,
        }
    }
}

/// Engine statistics counters
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Event buffers accepted into the input queue
    pub buffers_submitted: AtomicU64,
    /// Buffers dropped: queue overflow plus events discarded while stopped
    pub buffers_dropped: AtomicU64,
    /// Total decoded events appended to the output
    pub events_decoded: AtomicU64,
    /// Validation failures reported by the decoder
    pub decode_errors: AtomicU64,
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub buffers_submitted: u64,
    pub buffers_dropped: u64,
    pub events_decoded: u64,
    pub decode_errors: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            buffers_submitted: self.buffers_submitted.load(Ordering::Relaxed),
            buffers_dropped: self.buffers_dropped.load(Ordering::Relaxed),
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    decoder: FormatDecoder,
    input: Mutex<VecDeque<RawData>>,
    output: Mutex<Vec<EventData>>,
    settings: Mutex<DecoderSettings>,
    running: AtomicBool,
    stop: AtomicBool,
    /// Aggregate counter of the previous buffer, single-worker mode only
    last_counter: Mutex<Option<u32>>,
    single_worker: bool,
    input_queue_limit: usize,
    stats: EngineStats,
}

/// Decode engine: owns the queues and the worker pool for one digitizer
pub struct DecodeEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodeEngine {
    /// Construct the engine and spawn its workers.
    ///
    /// Gen-1 formats have no Start frames on the wire, so their running
    /// flag starts true; gen-2 waits for a Start.
    pub fn new(decoder: FormatDecoder, config: EngineConfig) -> Self {
        let threads = config.threads.max(1);
        let running = decoder.generation() == Generation::Dig1;

        let shared = Arc::new(Shared {
            decoder,
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(Vec::new()),
            settings: Mutex::new(DecoderSettings::new(
                config.time_step_ns,
                config.module_id,
                config.debug,
            )),
            running: AtomicBool::new(running),
            stop: AtomicBool::new(false),
            last_counter: Mutex::new(None),
            single_worker: threads == 1,
            input_queue_limit: config.input_queue_limit,
            stats: EngineStats::default(),
        });

        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("decode-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn decode worker")
            })
            .collect();

        info!(threads, running, "decode engine started");
        Self { shared, workers }
    }

    /// Classify and ingest one raw buffer.
    ///
    /// Start sets the running flag, Stop clears it and flushes the input
    /// queue, Event enqueues if and only if running. The tag is returned
    /// for telemetry either way.
    pub fn submit(&self, mut raw: RawData) -> DataType {
        let generation = self.shared.decoder.generation();
        if !raw.size.is_multiple_of(generation.word_size()) {
            warn!(
                size = raw.size,
                word_size = generation.word_size(),
                "buffer size not word-aligned"
            );
            return DataType::Unknown;
        }

        // Gen-2 boards emit big-endian words; swap before classification
        if generation == Generation::Dig2 {
            psd2::byte_swap_words(&mut raw.data[..raw.size]);
        }

        let classification = self.shared.decoder.classify(&raw);
        match classification {
            Classification::Start => {
                self.shared.running.store(true, Ordering::SeqCst);
                info!("start signal received, decoder running");
            }
            Classification::Stop { dead_time_ns } => {
                self.shared.running.store(false, Ordering::SeqCst);
                let flushed = {
                    let mut input = self.shared.input.lock().unwrap();
                    let n = input.len();
                    input.clear();
                    n
                };
                if flushed > 0 {
                    self.shared
                        .stats
                        .buffers_dropped
                        .fetch_add(flushed as u64, Ordering::Relaxed);
                }
                info!(dead_time_ns, flushed, "stop signal received, decoder stopped");
            }
            Classification::Event => {
                if self.shared.running.load(Ordering::SeqCst) {
                    let mut input = self.shared.input.lock().unwrap();
                    if self.shared.input_queue_limit > 0
                        && input.len() >= self.shared.input_queue_limit
                    {
                        input.pop_front();
                        self.shared
                            .stats
                            .buffers_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            limit = self.shared.input_queue_limit,
                            "input queue full, dropping oldest buffer"
                        );
                    }
                    input.push_back(raw);
                    self.shared
                        .stats
                        .buffers_submitted
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    self.shared
                        .stats
                        .buffers_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!("decoder not running, discarding event buffer");
                }
            }
            Classification::Unknown => {
                warn!(size = raw.size, "unknown data type, nothing enqueued");
            }
        }

        classification.data_type()
    }

    /// Take ownership of all events accumulated since the last drain
    pub fn drain(&self) -> Vec<EventData> {
        std::mem::take(&mut *self.shared.output.lock().unwrap())
    }

    /// Whether Start/Stop bookkeeping currently allows event ingestion
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of raw buffers waiting to be decoded
    pub fn input_backlog(&self) -> usize {
        self.shared.input.lock().unwrap().len()
    }

    /// Update the time step; applies before the next buffer is decoded
    pub fn set_time_step(&self, time_step_ns: u32) {
        self.shared.settings.lock().unwrap().set_time_step(time_step_ns);
    }

    /// Update the module number stamped on decoded events
    pub fn set_module_number(&self, module_id: u8) {
        self.shared.settings.lock().unwrap().module_id = module_id;
    }

    /// Toggle verbose decode logging
    pub fn set_debug(&self, debug: bool) {
        self.shared.settings.lock().unwrap().debug = debug;
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Block until the input queue is empty or the deadline passes.
    /// Intended for tests and orderly shutdown, not for back-pressure.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.input_backlog() == 0 {
                return true;
            }
            thread::sleep(IDLE_SLEEP);
        }
        self.input_backlog() == 0
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let leftover = self.shared.input.lock().unwrap().len();
        if leftover > 0 {
            debug!(leftover, "dropping undecoded buffers at shutdown");
        }
    }
}

/// Worker loop: pop under the lock, decode outside it, splice the batch.
///
/// The decoder returns the batch already sorted by timestamp, so a
/// single-worker engine yields globally time-ordered output.
fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let raw = shared.input.lock().unwrap().pop_front();
        let Some(raw) = raw else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        let settings = *shared.settings.lock().unwrap();
        let output = shared.decoder.decode(&raw, &settings);

        if output.errors > 0 {
            shared
                .stats
                .decode_errors
                .fetch_add(u64::from(output.errors), Ordering::Relaxed);
        }

        // Counter continuity is meaningful only when one worker preserves
        // buffer order
        if shared.single_worker {
            if let Some(counter) = output.aggregate_counter {
                let mut last = shared.last_counter.lock().unwrap();
                if let Some(prev) = *last {
                    let expected = (prev + 1) % shared.decoder.counter_modulus();
                    if counter != expected {
                        warn!(
                            previous = prev,
                            current = counter,
                            "aggregate counter discontinuity"
                        );
                    }
                }
                *last = Some(counter);
            }
        }

        if !output.events.is_empty() {
            shared
                .stats
                .events_decoded
                .fetch_add(output.events.len() as u64, Ordering::Relaxed);
            shared.output.lock().unwrap().extend(output.events);
        }
    }
}
