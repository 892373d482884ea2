//! Format decoders for digitizer raw data
//!
//! Three wire formats share one contract: classify a raw buffer as
//! Start/Stop/Event/Unknown, then decode event buffers into
//! [`EventData`](crate::common::EventData) records. Dispatch is a tagged
//! variant; the dispatch rate is one call per raw buffer, not per event.

pub mod pha1;
pub mod psd1;
pub mod psd2;
pub mod reader;
pub mod validate;

pub use pha1::Pha1Decoder;
pub use psd1::Psd1Decoder;
pub use psd2::Psd2Decoder;

use crate::common::{DataType, EventData, RawData};

/// Decoder configuration snapshot
///
/// The engine hands one snapshot to the worker per buffer, so setter calls
/// apply atomically before the next buffer is decoded.
#[derive(Debug, Clone, Copy)]
pub struct DecoderSettings {
    /// Time step in nanoseconds per sample (from the board ADC rate)
    pub time_step_ns: u32,
    /// Fine-time contribution per LSB: `time_step_ns / 1024`
    pub fine_time_multiplier: f64,
    /// Module number written into every decoded event
    pub module_id: u8,
    /// Enable hex dumps and verbose decode logging
    pub debug: bool,
}

impl DecoderSettings {
    pub fn new(time_step_ns: u32, module_id: u8, debug: bool) -> Self {
        Self {
            time_step_ns,
            fine_time_multiplier: f64::from(time_step_ns) / 1024.0,
            module_id,
            debug,
        }
    }

    /// Update the time step, refreshing the cached fine-time multiplier
    pub fn set_time_step(&mut self, time_step_ns: u32) {
        self.time_step_ns = time_step_ns;
        self.fine_time_multiplier = f64::from(time_step_ns) / 1024.0;
    }
}

impl Default for DecoderSettings {
    fn default() -> Self {
        // 500 MS/s boards: 2 ns per sample
        Self::new(2, 0, false)
    }
}

/// Buffer classification with format-specific side information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Start,
    /// Stop signal; gen-2 stops carry a dead-time count in 8 ns units
    Stop { dead_time_ns: u64 },
    Event,
    Unknown,
}

impl Classification {
    pub fn data_type(self) -> DataType {
        match self {
            Classification::Start => DataType::Start,
            Classification::Stop { .. } => DataType::Stop,
            Classification::Event => DataType::Event,
            Classification::Unknown => DataType::Unknown,
        }
    }
}

/// Result of decoding one raw buffer
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// Decoded events, sorted by timestamp ascending
    pub events: Vec<EventData>,
    /// Aggregate counter of the buffer, for continuity checks
    pub aggregate_counter: Option<u32>,
    /// Validation failures hit while decoding this buffer
    pub errors: u32,
}

/// Digitizer generation, determining word width and ingest behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// 32-bit little-endian words, nested aggregates, no control frames
    Dig1,
    /// 64-bit big-endian words (swapped at ingest), flat event pairs
    Dig2,
}

impl Generation {
    pub fn word_size(self) -> usize {
        match self {
            Generation::Dig1 => 4,
            Generation::Dig2 => 8,
        }
    }
}

/// Tagged dispatch over the three format decoders
pub enum FormatDecoder {
    Psd1(Psd1Decoder),
    Pha1(Pha1Decoder),
    Psd2(Psd2Decoder),
}

impl FormatDecoder {
    pub fn generation(&self) -> Generation {
        match self {
            Self::Psd1(_) | Self::Pha1(_) => Generation::Dig1,
            Self::Psd2(_) => Generation::Dig2,
        }
    }

    /// Modulus of the aggregate counter field (16 bits on gen-2, 23 on gen-1)
    pub fn counter_modulus(&self) -> u32 {
        match self {
            Self::Psd1(_) | Self::Pha1(_) => 1 << 23,
            Self::Psd2(_) => 1 << 16,
        }
    }

    /// Classify a raw buffer; gen-2 buffers must already be byte-swapped
    pub fn classify(&self, raw: &RawData) -> Classification {
        match self {
            Self::Psd1(d) => d.classify(raw),
            Self::Pha1(d) => d.classify(raw),
            Self::Psd2(d) => d.classify(raw),
        }
    }

    /// Decode an event buffer into timestamp-sorted records
    pub fn decode(&self, raw: &RawData, settings: &DecoderSettings) -> DecodeOutput {
        match self {
            Self::Psd1(d) => d.decode(raw, settings),
            Self::Pha1(d) => d.decode(raw, settings),
            Self::Psd2(d) => d.decode(raw, settings),
        }
    }
}
