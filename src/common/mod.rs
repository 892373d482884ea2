//! Common data types shared across the decoding pipeline
//!
//! This module defines the raw-buffer input, the decoded-event output and
//! the classification tags exchanged between driver, engine and consumers.

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{DecodeError, DecodeResult, EngineError};

/// Raw data block read from a digitizer
///
/// An opaque byte sequence as delivered by the driver. `size` is the number
/// of valid bytes in `data`; `n_events` is the driver-reported event count
/// (zero when the endpoint does not provide it).
#[derive(Debug, Clone)]
pub struct RawData {
    pub data: Vec<u8>,
    pub size: usize,
    pub n_events: u32,
}

impl RawData {
    /// Create RawData from a byte vector
    pub fn new(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data,
            size,
            n_events: 0,
        }
    }

    /// Create RawData with a driver-reported event count
    pub fn with_events(data: Vec<u8>, n_events: u32) -> Self {
        let size = data.len();
        Self {
            data,
            size,
            n_events,
        }
    }
}

/// Data type classification returned by `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Start of run signal
    Start,
    /// End of run signal
    Stop,
    /// Normal event data
    Event,
    /// Unknown or invalid data
    Unknown,
}

/// Flag bit definitions for event status
///
/// Gen-1 extras/charge words map into the reserved low bits. Gen-2 packs
/// its low-priority (11 bits) and high-priority (8 bits) flag groups into
/// the same field, high priority at bits 11-18.
pub mod flags {
    /// Pileup detected
    pub const FLAG_PILEUP: u64 = 0x01;
    /// Trigger lost
    pub const FLAG_TRIGGER_LOST: u64 = 0x02;
    /// Signal saturation (over range)
    pub const FLAG_OVER_RANGE: u64 = 0x04;
    /// 1024 trigger count marker
    pub const FLAG_1024_TRIGGER: u64 = 0x08;
    /// N lost triggers marker
    pub const FLAG_N_LOST_TRIGGER: u64 = 0x10;
}

/// Decoded event record
///
/// The normalized output entity of every format decoder. Construction with
/// a waveform size allocates all six trace vectors to that length; decoders
/// write directly into the typed slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventData {
    /// Timestamp in nanoseconds (includes fine-time correction)
    pub timestamp_ns: f64,
    /// Number of waveform samples (0 = no waveform)
    pub waveform_size: usize,
    /// Analog probe 1 samples
    pub analog_probe1: Vec<i32>,
    /// Analog probe 2 samples
    pub analog_probe2: Vec<i32>,
    /// Digital probe 1 samples (0 or 1)
    pub digital_probe1: Vec<u8>,
    /// Digital probe 2 samples (0 or 1)
    pub digital_probe2: Vec<u8>,
    /// Digital probe 3 samples (0 or 1)
    pub digital_probe3: Vec<u8>,
    /// Digital probe 4 samples (0 or 1)
    pub digital_probe4: Vec<u8>,
    /// Primary energy (long gate charge for PSD, trapezoid energy for PHA)
    pub energy: u16,
    /// Short gate charge (PSD) or extras residual (PHA)
    pub energy_short: u16,
    /// Hardware module ID (externally configured)
    pub module: u8,
    /// Channel within module (< 16 for gen-1 boards, < 128 for gen-2)
    pub channel: u8,
    /// Time step in ns per sample, copied from the board sample rate
    pub time_resolution: u8,
    /// Waveform decimation factor (gen-2: 1, 2, 4 or 8)
    pub down_sample_factor: u8,
    /// Analog probe 1 signal selector
    pub analog_probe1_type: u8,
    /// Analog probe 2 signal selector
    pub analog_probe2_type: u8,
    /// Digital probe 1 signal selector
    pub digital_probe1_type: u8,
    /// Digital probe 2 signal selector
    pub digital_probe2_type: u8,
    /// Digital probe 3 signal selector
    pub digital_probe3_type: u8,
    /// Digital probe 4 signal selector
    pub digital_probe4_type: u8,
    /// Bit-encoded status (see [`flags`])
    pub flags: u64,
}

impl EventData {
    /// Create an event with all six trace vectors sized to `waveform_size`
    pub fn new(waveform_size: usize) -> Self {
        Self {
            waveform_size,
            analog_probe1: vec![0; waveform_size],
            analog_probe2: vec![0; waveform_size],
            digital_probe1: vec![0; waveform_size],
            digital_probe2: vec![0; waveform_size],
            digital_probe3: vec![0; waveform_size],
            digital_probe4: vec![0; waveform_size],
            down_sample_factor: 1,
            ..Default::default()
        }
    }

    /// Drop all waveform data and reset the size to zero
    pub fn clear_waveform(&mut self) {
        self.waveform_size = 0;
        self.analog_probe1.clear();
        self.analog_probe2.clear();
        self.digital_probe1.clear();
        self.digital_probe2.clear();
        self.digital_probe3.clear();
        self.digital_probe4.clear();
    }

    pub fn has_pileup(&self) -> bool {
        (self.flags & flags::FLAG_PILEUP) != 0
    }

    pub fn has_trigger_lost(&self) -> bool {
        (self.flags & flags::FLAG_TRIGGER_LOST) != 0
    }

    pub fn has_over_range(&self) -> bool {
        (self.flags & flags::FLAG_OVER_RANGE) != 0
    }

    /// Format event data for display
    pub fn display(&self) -> String {
        format!(
            "Mod:{:3} Ch:{:3} T:{:15.3}ns E:{:5} Es:{:5} F:0x{:05x}{}",
            self.module,
            self.channel,
            self.timestamp_ns,
            self.energy,
            self.energy_short,
            self.flags,
            if self.waveform_size > 0 { " [WF]" } else { "" }
        )
    }
}

impl std::fmt::Display for EventData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
