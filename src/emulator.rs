//! Emulated gen-2 data source
//!
//! Implements [`DeviceHandle`] without hardware: synthesizes conforming
//! PSD2 buffers (big-endian on the wire, like the real boards), honours
//! the arm/start/stop command sequence, and answers the parameter reads
//! the orchestration layer performs. Event pulses follow a
//! baseline → fast rise → exponential decay shape.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::common::RawData;
use crate::driver::{paths, DeviceHandle, DriverError};

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Events per generated buffer
    pub events_per_read: usize,
    /// Number of channels to cycle through
    pub channels: u8,
    /// Attach a waveform to every event
    pub enable_waveform: bool,
    /// Samples per waveform (rounded down to an even count)
    pub waveform_samples: usize,
    /// Coarse timestamp increment between events, in samples
    pub timestamp_increment: u64,
    /// Reported ADC sample rate in MHz
    pub sample_rate_mhz: u32,
    /// RNG seed for reproducible runs
    pub seed: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            events_per_read: 16,
            channels: 16,
            enable_waveform: false,
            waveform_samples: 64,
            timestamp_increment: 1_000,
            sample_rate_mhz: 500,
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Default)]
struct EmulatorState {
    armed: bool,
    acquiring: bool,
    start_pending: bool,
    stop_pending: bool,
    next_timestamp: u64,
    aggregate_counter: u16,
    sw_triggers: u32,
    parameters: std::collections::BTreeMap<String, String>,
}

/// In-memory stand-in for an opened gen-2 digitizer
pub struct EmulatorSource {
    config: EmulatorConfig,
    state: Mutex<EmulatorState>,
    rng: Mutex<StdRng>,
}

impl EmulatorSource {
    pub fn new(config: EmulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(EmulatorState::default()),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EmulatorConfig::default())
    }

    /// Number of software triggers received since the last reset
    pub fn sw_trigger_count(&self) -> u32 {
        self.state.lock().unwrap().sw_triggers
    }

    fn push_be(buf: &mut Vec<u8>, word: u64) {
        buf.extend_from_slice(&word.to_be_bytes());
    }

    /// 4-word Start frame, wire order
    fn start_frame() -> RawData {
        let mut data = Vec::with_capacity(32);
        Self::push_be(&mut data, 0x3 << 60);
        Self::push_be(&mut data, 0x2 << 56);
        Self::push_be(&mut data, 0x1 << 56);
        Self::push_be(&mut data, 0x1 << 56);
        RawData::new(data)
    }

    /// 3-word Stop frame carrying a dead-time count, wire order
    fn stop_frame(dead_time_units: u32) -> RawData {
        let mut data = Vec::with_capacity(24);
        Self::push_be(&mut data, (0x3 << 60) | (0x2 << 56));
        Self::push_be(&mut data, 0);
        Self::push_be(&mut data, (0x1 << 56) | u64::from(dead_time_units));
        RawData::new(data)
    }

    /// Simulated pulse: flat baseline, 5-sample linear rise, exponential
    /// decay with a 50-sample time constant
    fn pulse_sample(i: usize, pulse_start: usize, baseline: i32, amplitude: f64) -> u32 {
        const RISE_SAMPLES: usize = 5;
        const DECAY_TAU: f64 = 50.0;

        let value = if i < pulse_start {
            baseline
        } else if i < pulse_start + RISE_SAMPLES {
            let frac = (i - pulse_start) as f64 / RISE_SAMPLES as f64;
            baseline + (amplitude * frac) as i32
        } else {
            let t = (i - pulse_start - RISE_SAMPLES) as f64;
            baseline + (amplitude * (-t / DECAY_TAU).exp()) as i32
        };
        (value.clamp(0, 0x3FFF)) as u32
    }

    /// Build one event pair plus optional waveform block, wire order
    fn write_event(&self, data: &mut Vec<u8>, rng: &mut StdRng, timestamp: u64, channel: u8) {
        let energy: u16 = rng.gen_range(100..60_000);
        let energy_short = u64::from(energy) * 3 / 4;
        let fine_time: u64 = rng.gen_range(0..1024);

        let first = (1u64 << 63) | (u64::from(channel & 0x7F) << 56) | (timestamp & 0xFFFF_FFFF_FFFF);
        let mut second = (1u64 << 63)
            | (energy_short << 26)
            | (fine_time << 16)
            | u64::from(energy);
        if self.config.enable_waveform {
            second |= 1 << 62;
        }

        Self::push_be(data, first);
        Self::push_be(data, second);

        if self.config.enable_waveform {
            // Waveform header: check bit, trigger probe on analog 1
            Self::push_be(data, 1u64 << 63);

            let samples = self.config.waveform_samples & !1;
            let n_words = samples / 2;
            Self::push_be(data, n_words as u64);

            let baseline: i32 = rng.gen_range(50..150);
            let amplitude = f64::from(energy) / 65_535.0 * 8_000.0;
            let pulse_start = if samples >= 4 {
                rng.gen_range(samples / 4..samples / 2)
            } else {
                0
            };

            for word_i in 0..n_words {
                let s0 = Self::pulse_sample(word_i * 2, pulse_start, baseline, amplitude);
                let s1 = Self::pulse_sample(word_i * 2 + 1, pulse_start, baseline, amplitude);
                Self::push_be(data, u64::from(s0) | (u64::from(s1) << 32));
            }
        }
    }

    /// Build one aggregate buffer of `events_per_read` events, wire order
    fn event_buffer(&self, state: &mut EmulatorState) -> RawData {
        let mut rng = self.rng.lock().unwrap();

        let mut body = Vec::new();
        for i in 0..self.config.events_per_read {
            let channel = (i as u8) % self.config.channels.max(1);
            let timestamp = state.next_timestamp;
            state.next_timestamp += self.config.timestamp_increment;
            self.write_event(&mut body, &mut rng, timestamp, channel);
        }

        let total_words = 1 + body.len() / 8;
        state.aggregate_counter = state.aggregate_counter.wrapping_add(1);
        let header = (0x2u64 << 60)
            | (u64::from(state.aggregate_counter) << 32)
            | total_words as u64;

        let mut data = Vec::with_capacity(total_words * 8);
        Self::push_be(&mut data, header);
        data.extend_from_slice(&body);
        RawData::with_events(data, self.config.events_per_read as u32)
    }
}

impl DeviceHandle for EmulatorSource {
    fn send_command(&self, path: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        match path {
            paths::CMD_RESET => {
                *state = EmulatorState::default();
                Ok(())
            }
            paths::CMD_ARM_ACQUISITION => {
                state.armed = true;
                Ok(())
            }
            paths::CMD_DISARM_ACQUISITION => {
                state.armed = false;
                Ok(())
            }
            paths::CMD_SW_START_ACQUISITION => {
                if !state.armed {
                    return Err(DriverError::command(path, "not armed"));
                }
                state.acquiring = true;
                state.start_pending = true;
                Ok(())
            }
            paths::CMD_SW_STOP_ACQUISITION => {
                if state.acquiring {
                    state.acquiring = false;
                    state.stop_pending = true;
                }
                Ok(())
            }
            paths::CMD_SEND_SW_TRIGGER => {
                state.sw_triggers += 1;
                Ok(())
            }
            other => Err(DriverError::command(other, "unsupported command")),
        }
    }

    fn get_parameter(&self, path: &str) -> Result<String, DriverError> {
        let state = self.state.lock().unwrap();
        match path {
            paths::PAR_MAX_RAW_DATA_SIZE => Ok((1024 * 1024).to_string()),
            paths::PAR_ADC_SAMPLE_RATE => Ok(self.config.sample_rate_mhz.to_string()),
            paths::PAR_RECORD_LENGTH => Ok(self.config.waveform_samples.to_string()),
            paths::PAR_START_MODE => Ok(START_MODE.to_string()),
            other => state
                .parameters
                .get(other)
                .cloned()
                .ok_or_else(|| DriverError::parameter(other, "unknown parameter")),
        }
    }

    fn set_parameter(&self, path: &str, value: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.parameters.insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn device_tree(&self) -> Result<serde_json::Value, DriverError> {
        Ok(json!({
            "par": {
                "fwtype": { "value": "DPP_PSD" },
                "modelname": { "value": "VX2730" },
                "numch": { "value": self.config.channels.to_string() },
            }
        }))
    }

    fn has_data(&self, _timeout_ms: i32) -> Result<bool, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state.start_pending || state.stop_pending || state.acquiring)
    }

    fn read_data(&self, _timeout_ms: i32, max_size: usize) -> Result<Option<RawData>, DriverError> {
        let mut state = self.state.lock().unwrap();

        if state.start_pending {
            state.start_pending = false;
            return Ok(Some(Self::start_frame()));
        }
        if !state.acquiring {
            if state.stop_pending {
                state.stop_pending = false;
                return Ok(Some(Self::stop_frame(1_250)));
            }
            return Ok(None);
        }

        let buffer = self.event_buffer(&mut state);
        if buffer.size > max_size {
            return Err(DriverError::parameter(
                paths::PAR_MAX_RAW_DATA_SIZE,
                format!("generated buffer of {} exceeds {}", buffer.size, max_size),
            ));
        }
        Ok(Some(buffer))
    }
}

const START_MODE: &str = "START_MODE_SW";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;
    use crate::decoder::{DecoderSettings, Psd2Decoder};

    fn started_emulator(config: EmulatorConfig) -> EmulatorSource {
        let emulator = EmulatorSource::new(config);
        emulator.send_command(paths::CMD_ARM_ACQUISITION).unwrap();
        emulator
            .send_command(paths::CMD_SW_START_ACQUISITION)
            .unwrap();
        emulator
    }

    fn swap(raw: &mut RawData) {
        crate::decoder::psd2::byte_swap_words(&mut raw.data);
    }

    #[test]
    fn test_start_requires_arm() {
        let emulator = EmulatorSource::with_defaults();
        assert!(emulator
            .send_command(paths::CMD_SW_START_ACQUISITION)
            .is_err());
    }

    #[test]
    fn test_first_read_is_start_frame() {
        let emulator = started_emulator(EmulatorConfig::default());
        let mut raw = emulator.read_data(10, 1 << 20).unwrap().unwrap();
        swap(&mut raw);
        let decoder = Psd2Decoder::new();
        assert_eq!(decoder.classify(&raw).data_type(), DataType::Start);
    }

    #[test]
    fn test_event_buffers_decode() {
        let config = EmulatorConfig {
            events_per_read: 8,
            ..Default::default()
        };
        let emulator = started_emulator(config);
        let _start = emulator.read_data(10, 1 << 20).unwrap().unwrap();

        let mut raw = emulator.read_data(10, 1 << 20).unwrap().unwrap();
        swap(&mut raw);
        let decoder = Psd2Decoder::new();
        assert_eq!(decoder.classify(&raw).data_type(), DataType::Event);

        let out = decoder.decode(&raw, &DecoderSettings::default());
        assert_eq!(out.events.len(), 8);
        assert_eq!(out.errors, 0);
        for e in &out.events {
            assert!(e.timestamp_ns >= 0.0);
            assert!(e.channel < 128);
        }
    }

    #[test]
    fn test_waveform_buffers_decode_with_traces() {
        let config = EmulatorConfig {
            events_per_read: 2,
            enable_waveform: true,
            waveform_samples: 32,
            ..Default::default()
        };
        let emulator = started_emulator(config);
        let _start = emulator.read_data(10, 1 << 20).unwrap().unwrap();

        let mut raw = emulator.read_data(10, 1 << 20).unwrap().unwrap();
        swap(&mut raw);
        let out = Psd2Decoder::new().decode(&raw, &DecoderSettings::default());
        assert_eq!(out.events.len(), 2);
        for e in &out.events {
            assert_eq!(e.waveform_size, 32);
            assert_eq!(e.analog_probe1.len(), 32);
            // Pulse stays within the 14-bit unsigned range
            assert!(e.analog_probe1.iter().all(|&s| (0..0x4000).contains(&s)));
        }
    }

    #[test]
    fn test_stop_emits_stop_frame_then_idles() {
        let emulator = started_emulator(EmulatorConfig::default());
        let _start = emulator.read_data(10, 1 << 20).unwrap().unwrap();
        emulator
            .send_command(paths::CMD_SW_STOP_ACQUISITION)
            .unwrap();

        let mut raw = emulator.read_data(10, 1 << 20).unwrap().unwrap();
        swap(&mut raw);
        assert_eq!(
            Psd2Decoder::new().classify(&raw).data_type(),
            DataType::Stop
        );
        assert!(emulator.read_data(10, 1 << 20).unwrap().is_none());
    }

    #[test]
    fn test_sw_trigger_counted() {
        let emulator = EmulatorSource::with_defaults();
        emulator.send_command(paths::CMD_SEND_SW_TRIGGER).unwrap();
        emulator.send_command(paths::CMD_SEND_SW_TRIGGER).unwrap();
        assert_eq!(emulator.sw_trigger_count(), 2);
        emulator.send_command(paths::CMD_RESET).unwrap();
        assert_eq!(emulator.sw_trigger_count(), 0);
    }

    #[test]
    fn test_parameters_round_trip() {
        let emulator = EmulatorSource::with_defaults();
        emulator.set_parameter("/ch/0/par/ChEnable", "True").unwrap();
        assert_eq!(
            emulator.get_parameter("/ch/0/par/ChEnable").unwrap(),
            "True"
        );
        assert_eq!(
            emulator.get_parameter(paths::PAR_ADC_SAMPLE_RATE).unwrap(),
            "500"
        );
        assert!(emulator.get_parameter("/par/nonexistent").is_err());
    }

    #[test]
    fn test_device_tree_identifies_gen2() {
        let emulator = EmulatorSource::with_defaults();
        let tree = emulator.device_tree().unwrap();
        use crate::factory::FirmwareType;
        assert_eq!(
            FirmwareType::from_device_tree(&tree),
            Some(FirmwareType::Psd2)
        );
    }

    #[test]
    fn test_timestamps_increase_across_reads() {
        let emulator = started_emulator(EmulatorConfig {
            events_per_read: 4,
            ..Default::default()
        });
        let _start = emulator.read_data(10, 1 << 20).unwrap().unwrap();

        let decoder = Psd2Decoder::new();
        let settings = DecoderSettings::default();
        let mut last = f64::MIN;
        for _ in 0..3 {
            let mut raw = emulator.read_data(10, 1 << 20).unwrap().unwrap();
            swap(&mut raw);
            let out = decoder.decode(&raw, &settings);
            for e in &out.events {
                assert!(e.timestamp_ns > last);
                last = e.timestamp_ns;
            }
        }
    }
}
