//! PSD2 decoder for x27xx series digitizers (DPP-PSD firmware, gen-2)
//!
//! Decodes the 64-bit word format: one aggregate header word followed by
//! flat event pairs, each optionally trailed by a waveform block. The wire
//! is big-endian; [`byte_swap_words`] reverses each 64-bit word in place at
//! ingest, so the decoder itself reads little-endian words.
//!
//! Gen-2 is also the only format with Start/Stop control frames: fixed
//! short buffers of 4 and 3 words identified by type/subtype patterns in
//! the top byte of each word.

use tracing::{debug, error, warn};

use super::reader::Word64Reader;
use super::{Classification, DecodeOutput, DecoderSettings};
use crate::common::{DecodeError, DecodeResult, EventData, RawData};

mod constants {
    pub const WORD_SIZE: usize = 8;

    // Aggregate header
    pub const HEADER_TYPE_SHIFT: u32 = 60;
    pub const HEADER_TYPE_MASK: u64 = 0xF;
    pub const HEADER_TYPE_DATA: u64 = 0x2;
    pub const HEADER_FAIL_SHIFT: u32 = 56;
    pub const AGGREGATE_COUNTER_SHIFT: u32 = 32;
    pub const AGGREGATE_COUNTER_MASK: u64 = 0xFFFF;
    pub const TOTAL_SIZE_MASK: u64 = 0xFFFF_FFFF;

    // Event first word
    pub const CHANNEL_SHIFT: u32 = 56;
    pub const CHANNEL_MASK: u64 = 0x7F;
    pub const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

    // Event second word
    pub const WAVEFORM_FLAG_SHIFT: u32 = 62;
    pub const FLAGS_LOW_SHIFT: u32 = 50;
    pub const FLAGS_LOW_MASK: u64 = 0x7FF;
    pub const FLAGS_HIGH_SHIFT: u32 = 42;
    pub const FLAGS_HIGH_MASK: u64 = 0xFF;
    pub const FLAGS_HIGH_OFFSET: u32 = 11;
    pub const ENERGY_SHORT_SHIFT: u32 = 26;
    pub const ENERGY_SHORT_MASK: u64 = 0xFFFF;
    pub const FINE_TIME_SHIFT: u32 = 16;
    pub const FINE_TIME_MASK: u64 = 0x3FF;
    pub const FINE_TIME_SCALE: f64 = 1024.0;
    pub const ENERGY_MASK: u64 = 0xFFFF;

    // Waveform header
    pub const WAVEFORM_CHECK1_SHIFT: u32 = 63;
    pub const WAVEFORM_CHECK2_SHIFT: u32 = 60;
    pub const WAVEFORM_CHECK2_MASK: u64 = 0x7;
    pub const TIME_RESOLUTION_SHIFT: u32 = 44;
    pub const TIME_RESOLUTION_MASK: u64 = 0x3;
    pub const AP1_TYPE_MASK: u64 = 0x7;
    pub const AP1_SIGNED_SHIFT: u32 = 3;
    pub const AP1_MUL_SHIFT: u32 = 4;
    pub const AP2_TYPE_SHIFT: u32 = 6;
    pub const AP2_TYPE_MASK: u64 = 0x7;
    pub const AP2_SIGNED_SHIFT: u32 = 9;
    pub const AP2_MUL_SHIFT: u32 = 10;
    pub const MUL_MASK: u64 = 0x3;
    pub const DP1_TYPE_SHIFT: u32 = 12;
    pub const DP2_TYPE_SHIFT: u32 = 16;
    pub const DP3_TYPE_SHIFT: u32 = 20;
    pub const DP4_TYPE_SHIFT: u32 = 24;
    pub const DP_TYPE_MASK: u64 = 0xF;

    // Waveform size word
    pub const WAVEFORM_WORDS_MASK: u64 = 0xFFF;

    // Waveform samples (two 32-bit points per word)
    pub const ANALOG_SAMPLE_MASK: u32 = 0x3FFF;
    pub const ANALOG_SIGN_BIT: u32 = 0x2000;
    pub const AP2_SAMPLE_SHIFT: u32 = 16;
    pub const DP1_SAMPLE_SHIFT: u32 = 14;
    pub const DP2_SAMPLE_SHIFT: u32 = 15;
    pub const DP3_SAMPLE_SHIFT: u32 = 30;
    pub const DP4_SAMPLE_SHIFT: u32 = 31;

    // Start/Stop control frames
    pub const SIGNAL_TYPE_SHIFT: u32 = 60;
    pub const SIGNAL_SUBTYPE_SHIFT: u32 = 56;
    pub const SIGNAL_NIBBLE_MASK: u64 = 0xF;
    pub const SIGNAL_TYPE: u64 = 0x3;
    pub const START_SUBTYPE: u64 = 0x0;
    pub const STOP_SUBTYPE: u64 = 0x2;
    pub const DEAD_TIME_UNIT_NS: u64 = 8;

    pub const MIN_DATA_SIZE: usize = 3 * WORD_SIZE;
    pub const START_SIGNAL_SIZE: usize = 4 * WORD_SIZE;
    pub const STOP_SIGNAL_SIZE: usize = 3 * WORD_SIZE;
}

/// Reverse every 64-bit word in place: device big-endian → host little-endian.
///
/// Swapping twice is a no-op. Buffers whose length is not a multiple of
/// eight are left untouched; the classifier rejects them as Unknown.
pub fn byte_swap_words(data: &mut [u8]) {
    if !data.len().is_multiple_of(constants::WORD_SIZE) {
        return;
    }
    for word in data.chunks_exact_mut(constants::WORD_SIZE) {
        word.reverse();
    }
}

/// Per-event analog probe scaling from the waveform header
#[derive(Debug, Clone, Copy)]
struct WaveformConfig {
    ap1_signed: bool,
    ap1_mul: i32,
    ap2_signed: bool,
    ap2_mul: i32,
}

/// Map the 2-bit multiplication code onto the factor {1, 4, 8, 16}
fn multiplication_factor(code: u64) -> i32 {
    match code {
        0 => 1,
        1 => 4,
        2 => 8,
        _ => 16,
    }
}

/// PSD2 decoder
#[derive(Debug, Default)]
pub struct Psd2Decoder;

impl Psd2Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Classify a (byte-swapped) buffer as Start/Stop/Event/Unknown
    pub fn classify(&self, raw: &RawData) -> Classification {
        if raw.size < constants::MIN_DATA_SIZE
            || !raw.size.is_multiple_of(constants::WORD_SIZE)
        {
            return Classification::Unknown;
        }

        let reader = Word64Reader::new(&raw.data[..raw.size]);

        if raw.size == constants::STOP_SIGNAL_SIZE {
            if let Some(dead_time_ns) = check_stop(&reader) {
                return Classification::Stop { dead_time_ns };
            }
        }
        if raw.size == constants::START_SIGNAL_SIZE && check_start(&reader) {
            return Classification::Start;
        }

        Classification::Event
    }

    /// Decode a (byte-swapped) event buffer
    pub fn decode(&self, raw: &RawData, settings: &DecoderSettings) -> DecodeOutput {
        let mut output = DecodeOutput::default();

        match self.classify(raw) {
            Classification::Event => {}
            other => {
                debug!(?other, size = raw.size, "non-event buffer, nothing to decode");
                return output;
            }
        }
        if settings.debug {
            dump_raw_data(raw);
        }

        let reader = Word64Reader::new(&raw.data[..raw.size]);
        let Ok(header) = reader.read(0) else {
            return output;
        };

        let header_type = (header >> constants::HEADER_TYPE_SHIFT) & constants::HEADER_TYPE_MASK;
        if header_type != constants::HEADER_TYPE_DATA {
            error!(
                header_type = format_args!("0x{:x}", header_type),
                "invalid aggregate header type"
            );
            output.errors += 1;
            return output;
        }

        if (header >> constants::HEADER_FAIL_SHIFT) & 0x1 != 0 {
            warn!("board fail bit set");
        }

        let counter =
            ((header >> constants::AGGREGATE_COUNTER_SHIFT) & constants::AGGREGATE_COUNTER_MASK) as u32;
        output.aggregate_counter = Some(counter);

        let declared_words = (header & constants::TOTAL_SIZE_MASK) as usize;
        let actual_words = reader.total_words();
        if declared_words != actual_words {
            warn!(
                declared_bytes = declared_words * constants::WORD_SIZE,
                actual_bytes = raw.size,
                "aggregate size mismatch, decoding the overlap"
            );
        }
        let total_words = declared_words.min(actual_words);

        output.events.reserve(total_words / 2);
        let mut index = 1usize;
        while index < total_words {
            match decode_event(&reader, &mut index, total_words, settings) {
                Ok(event) => output.events.push(event),
                Err(err) => {
                    error!(%err, word = index, "event decode failed, abandoning buffer remainder");
                    output.errors += 1;
                    break;
                }
            }
        }

        output.events.sort_by(|a, b| {
            a.timestamp_ns
                .partial_cmp(&b.timestamp_ns)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(events = output.events.len(), "PSD2 buffer decoded");
        output
    }
}

/// Decode one event pair plus its optional waveform block
fn decode_event(
    reader: &Word64Reader<'_>,
    index: &mut usize,
    total_words: usize,
    settings: &DecoderSettings,
) -> DecodeResult<EventData> {
    if *index + 2 > total_words {
        return Err(DecodeError::InsufficientData);
    }

    let first_word = reader.read(*index)?;
    let second_word = reader.read(*index + 1)?;
    *index += 2;

    let channel = ((first_word >> constants::CHANNEL_SHIFT) & constants::CHANNEL_MASK) as u8;
    let raw_timestamp = first_word & constants::TIMESTAMP_MASK;

    let flags_low = (second_word >> constants::FLAGS_LOW_SHIFT) & constants::FLAGS_LOW_MASK;
    let flags_high = (second_word >> constants::FLAGS_HIGH_SHIFT) & constants::FLAGS_HIGH_MASK;
    let flags = (flags_high << constants::FLAGS_HIGH_OFFSET) | flags_low;

    let energy = (second_word & constants::ENERGY_MASK) as u16;
    let energy_short =
        ((second_word >> constants::ENERGY_SHORT_SHIFT) & constants::ENERGY_SHORT_MASK) as u16;
    let fine_time = ((second_word >> constants::FINE_TIME_SHIFT) & constants::FINE_TIME_MASK) as u16;

    let coarse_ns = raw_timestamp as f64 * f64::from(settings.time_step_ns);
    let fine_ns =
        (f64::from(fine_time) / constants::FINE_TIME_SCALE) * f64::from(settings.time_step_ns);
    let timestamp_ns = coarse_ns + fine_ns;

    let has_waveform = (second_word >> constants::WAVEFORM_FLAG_SHIFT) & 0x1 != 0;

    let mut event = if has_waveform {
        decode_waveform(reader, index, total_words)?
    } else {
        EventData::new(0)
    };

    event.channel = channel;
    event.module = settings.module_id;
    event.time_resolution = settings.time_step_ns as u8;
    event.energy = energy;
    event.energy_short = energy_short;
    event.timestamp_ns = timestamp_ns;
    event.flags = flags;

    if settings.debug {
        debug!(
            channel,
            timestamp_ns,
            energy,
            energy_short,
            fine_time,
            flags = format_args!("0x{:05x}", flags),
            waveform = event.waveform_size,
            "PSD2 event"
        );
    }

    Ok(event)
}

/// Decode the waveform header, length word and sample body into a sized event
fn decode_waveform(
    reader: &Word64Reader<'_>,
    index: &mut usize,
    total_words: usize,
) -> DecodeResult<EventData> {
    if *index + 2 > total_words {
        error!("insufficient data for waveform header");
        return Err(DecodeError::InsufficientData);
    }

    let wf_header = reader.read(*index)?;
    *index += 1;

    let check1 = (wf_header >> constants::WAVEFORM_CHECK1_SHIFT) & 0x1;
    let check2 = (wf_header >> constants::WAVEFORM_CHECK2_SHIFT) & constants::WAVEFORM_CHECK2_MASK;
    if check1 != 1 || check2 != 0 {
        error!(check1, check2, "invalid waveform header");
        return Err(DecodeError::InvalidHeader);
    }

    let time_resolution =
        ((wf_header >> constants::TIME_RESOLUTION_SHIFT) & constants::TIME_RESOLUTION_MASK) as u8;

    let config = WaveformConfig {
        ap1_signed: (wf_header >> constants::AP1_SIGNED_SHIFT) & 0x1 != 0,
        ap1_mul: multiplication_factor((wf_header >> constants::AP1_MUL_SHIFT) & constants::MUL_MASK),
        ap2_signed: (wf_header >> constants::AP2_SIGNED_SHIFT) & 0x1 != 0,
        ap2_mul: multiplication_factor((wf_header >> constants::AP2_MUL_SHIFT) & constants::MUL_MASK),
    };

    let size_word = reader.read(*index)?;
    *index += 1;
    let n_words = (size_word & constants::WAVEFORM_WORDS_MASK) as usize;

    if *index + n_words > total_words {
        error!(
            needed = n_words,
            available = total_words.saturating_sub(*index),
            "insufficient data for waveform body"
        );
        return Err(DecodeError::InsufficientData);
    }

    // Two samples per 64-bit word
    let mut event = EventData::new(n_words * 2);
    event.down_sample_factor = 1 << time_resolution;
    event.analog_probe1_type = (wf_header & constants::AP1_TYPE_MASK) as u8;
    event.analog_probe2_type =
        ((wf_header >> constants::AP2_TYPE_SHIFT) & constants::AP2_TYPE_MASK) as u8;
    event.digital_probe1_type =
        ((wf_header >> constants::DP1_TYPE_SHIFT) & constants::DP_TYPE_MASK) as u8;
    event.digital_probe2_type =
        ((wf_header >> constants::DP2_TYPE_SHIFT) & constants::DP_TYPE_MASK) as u8;
    event.digital_probe3_type =
        ((wf_header >> constants::DP3_TYPE_SHIFT) & constants::DP_TYPE_MASK) as u8;
    event.digital_probe4_type =
        ((wf_header >> constants::DP4_TYPE_SHIFT) & constants::DP_TYPE_MASK) as u8;

    for word_i in 0..n_words {
        let word = reader.read(*index)?;
        *index += 1;

        for (half, shift) in [0u32, 32u32].into_iter().enumerate() {
            let point = ((word >> shift) & 0xFFFF_FFFF) as u32;
            let sample_index = word_i * 2 + half;
            decode_waveform_point(point, sample_index, &config, &mut event);
        }
    }

    Ok(event)
}

/// Unpack one 32-bit waveform point into the six trace slots
fn decode_waveform_point(
    point: u32,
    sample_index: usize,
    config: &WaveformConfig,
    event: &mut EventData,
) {
    let ap1_raw = point & constants::ANALOG_SAMPLE_MASK;
    let ap2_raw = (point >> constants::AP2_SAMPLE_SHIFT) & constants::ANALOG_SAMPLE_MASK;

    event.analog_probe1[sample_index] = scale_analog(ap1_raw, config.ap1_signed, config.ap1_mul);
    event.analog_probe2[sample_index] = scale_analog(ap2_raw, config.ap2_signed, config.ap2_mul);

    event.digital_probe1[sample_index] = ((point >> constants::DP1_SAMPLE_SHIFT) & 0x1) as u8;
    event.digital_probe2[sample_index] = ((point >> constants::DP2_SAMPLE_SHIFT) & 0x1) as u8;
    event.digital_probe3[sample_index] = ((point >> constants::DP3_SAMPLE_SHIFT) & 0x1) as u8;
    event.digital_probe4[sample_index] = ((point >> constants::DP4_SAMPLE_SHIFT) & 0x1) as u8;
}

/// Sign-extend a 14-bit sample when configured and apply the ×-factor
fn scale_analog(raw: u32, signed: bool, mul: i32) -> i32 {
    let value = if signed && raw & constants::ANALOG_SIGN_BIT != 0 {
        (raw | 0xFFFF_C000) as i32
    } else {
        raw as i32
    };
    value * mul
}

/// Match the 3-word Stop frame; returns the dead time in nanoseconds
fn check_stop(reader: &Word64Reader<'_>) -> Option<u64> {
    let w0 = reader.read(0).ok()?;
    let w1 = reader.read(1).ok()?;
    let w2 = reader.read(2).ok()?;

    let first = (w0 >> constants::SIGNAL_TYPE_SHIFT) & constants::SIGNAL_NIBBLE_MASK
        == constants::SIGNAL_TYPE
        && (w0 >> constants::SIGNAL_SUBTYPE_SHIFT) & constants::SIGNAL_NIBBLE_MASK
            == constants::STOP_SUBTYPE;
    let second = (w1 >> constants::SIGNAL_SUBTYPE_SHIFT) & 0xFF == 0x0;
    let third = (w2 >> constants::SIGNAL_SUBTYPE_SHIFT) & 0xFF == 0x1;

    if first && second && third {
        let dead_time = w2 & 0xFFFF_FFFF;
        Some(dead_time * constants::DEAD_TIME_UNIT_NS)
    } else {
        None
    }
}

/// Match the 4-word Start frame
fn check_start(reader: &Word64Reader<'_>) -> bool {
    let (Ok(w0), Ok(w1), Ok(w2), Ok(w3)) = (
        reader.read(0),
        reader.read(1),
        reader.read(2),
        reader.read(3),
    ) else {
        return false;
    };

    (w0 >> constants::SIGNAL_TYPE_SHIFT) & constants::SIGNAL_NIBBLE_MASK == constants::SIGNAL_TYPE
        && (w0 >> constants::SIGNAL_SUBTYPE_SHIFT) & constants::SIGNAL_NIBBLE_MASK
            == constants::START_SUBTYPE
        && (w1 >> constants::SIGNAL_SUBTYPE_SHIFT) & 0xFF == 0x2
        && (w2 >> constants::SIGNAL_SUBTYPE_SHIFT) & 0xFF == 0x1
        && (w3 >> constants::SIGNAL_SUBTYPE_SHIFT) & 0xFF == 0x1
}

/// Dump the buffer word-by-word at debug level
fn dump_raw_data(raw: &RawData) {
    debug!(
        size = raw.size,
        n_events = raw.n_events,
        "PSD2 raw data dump"
    );
    let reader = Word64Reader::new(&raw.data[..raw.size]);
    for i in 0..reader.total_words().min(20) {
        if let Ok(w) = reader.read(i) {
            debug!(word = i, value = format_args!("0x{:016x}", w));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;

    fn push_u64(buf: &mut Vec<u8>, value: u64) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Aggregate header: type 0x2, counter, total size in words
    fn make_header(counter: u16, total_words: u64) -> u64 {
        (constants::HEADER_TYPE_DATA << 60) | (u64::from(counter) << 32) | total_words
    }

    fn make_first_word(channel: u8, timestamp: u64) -> u64 {
        (1u64 << 63) | (u64::from(channel & 0x7F) << 56) | (timestamp & constants::TIMESTAMP_MASK)
    }

    fn make_second_word(
        energy: u16,
        fine_time: u16,
        energy_short: u16,
        flags_high: u8,
        flags_low: u16,
        waveform: bool,
    ) -> u64 {
        let mut w = (1u64 << 63)
            | (u64::from(flags_low & 0x7FF) << 50)
            | (u64::from(flags_high) << 42)
            | (u64::from(energy_short) << 26)
            | (u64::from(fine_time & 0x3FF) << 16)
            | u64::from(energy);
        if waveform {
            w |= 1 << 62;
        }
        w
    }

    fn make_waveform_header(
        time_resolution: u8,
        ap1_type: u8,
        ap1_signed: bool,
        ap1_mul_code: u8,
        ap2_type: u8,
    ) -> u64 {
        let mut w = 1u64 << 63;
        w |= u64::from(time_resolution & 0x3) << 44;
        w |= u64::from(ap1_type & 0x7);
        if ap1_signed {
            w |= 1 << 3;
        }
        w |= u64::from(ap1_mul_code & 0x3) << 4;
        w |= u64::from(ap2_type & 0x7) << 6;
        w
    }

    fn make_sample(ap1: u32, ap2: u32, dp_bits: u32) -> u32 {
        (ap1 & 0x3FFF) | ((ap2 & 0x3FFF) << 16) | dp_bits
    }

    fn settings() -> DecoderSettings {
        DecoderSettings::new(2, 0, false)
    }

    fn decoder() -> Psd2Decoder {
        Psd2Decoder::new()
    }

    // -----------------------------------------------------------------------
    // Byte swap
    // -----------------------------------------------------------------------

    #[test]
    fn test_byte_swap_reverses_words() {
        let mut data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        byte_swap_words(&mut data);
        assert_eq!(data, vec![8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_byte_swap_twice_is_noop() {
        let original: Vec<u8> = (0..32).collect();
        let mut data = original.clone();
        byte_swap_words(&mut data);
        byte_swap_words(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_byte_swap_unaligned_untouched() {
        let original = vec![1u8, 2, 3];
        let mut data = original.clone();
        byte_swap_words(&mut data);
        assert_eq!(data, original);
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    #[test]
    fn test_classify_too_small() {
        let raw = RawData::new(vec![0; 16]);
        assert_eq!(decoder().classify(&raw).data_type(), DataType::Unknown);
    }

    #[test]
    fn test_classify_unaligned() {
        let raw = RawData::new(vec![0; 25]);
        assert_eq!(decoder().classify(&raw).data_type(), DataType::Unknown);
    }

    #[test]
    fn test_classify_minimum_event() {
        let raw = RawData::new(vec![0; 24]);
        assert_eq!(decoder().classify(&raw).data_type(), DataType::Event);
    }

    #[test]
    fn test_classify_stop_signal_with_dead_time() {
        let mut data = Vec::new();
        push_u64(&mut data, (0x3u64 << 60) | (0x2u64 << 56));
        push_u64(&mut data, 0);
        push_u64(&mut data, (0x1u64 << 56) | 12_500);
        let raw = RawData::new(data);
        match decoder().classify(&raw) {
            Classification::Stop { dead_time_ns } => assert_eq!(dead_time_ns, 100_000),
            other => panic!("expected Stop, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_start_signal() {
        let mut data = Vec::new();
        push_u64(&mut data, 0x3u64 << 60);
        push_u64(&mut data, 0x2u64 << 56);
        push_u64(&mut data, 0x1u64 << 56);
        push_u64(&mut data, 0x1u64 << 56);
        let raw = RawData::new(data);
        assert_eq!(decoder().classify(&raw).data_type(), DataType::Start);
    }

    #[test]
    fn test_classify_three_words_not_stop_is_event() {
        let mut data = Vec::new();
        push_u64(&mut data, make_header(0, 3));
        push_u64(&mut data, make_first_word(0, 0));
        push_u64(&mut data, make_second_word(0, 0, 0, 0, 0, false));
        let raw = RawData::new(data);
        assert_eq!(decoder().classify(&raw).data_type(), DataType::Event);
    }

    // -----------------------------------------------------------------------
    // Event decoding
    // -----------------------------------------------------------------------

    #[test]
    fn test_decode_single_event_no_waveform() {
        // channel 5, coarse 1000, energy 4200, fine 512, short 100
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 3));
        push_u64(&mut data, make_first_word(5, 1000));
        push_u64(&mut data, make_second_word(4200, 512, 100, 0, 0, false));

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.aggregate_counter, Some(1));

        let e = &out.events[0];
        assert_eq!(e.channel, 5);
        assert_eq!(e.energy, 4200);
        assert_eq!(e.energy_short, 100);
        assert_eq!(e.waveform_size, 0);
        assert_eq!(e.flags, 0);
        assert_eq!(e.time_resolution, 2);
        assert!((e.timestamp_ns - 2001.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_flags_packing_round_trip() {
        let flags_high: u8 = 0xA5;
        let flags_low: u16 = 0x4C3;
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 3));
        push_u64(&mut data, make_first_word(0, 0));
        push_u64(
            &mut data,
            make_second_word(0, 0, 0, flags_high, flags_low, false),
        );

        let out = decoder().decode(&RawData::new(data), &settings());
        let flags = out.events[0].flags;
        // Re-encode the 19-bit payload from the decoded field
        let high = ((flags >> 11) & 0xFF) as u8;
        let low = (flags & 0x7FF) as u16;
        assert_eq!(high, flags_high);
        assert_eq!(low, flags_low);
    }

    #[test]
    fn test_decode_invalid_header_type() {
        let mut data = Vec::new();
        push_u64(&mut data, 0x1u64 << 60);
        push_u64(&mut data, 0);
        push_u64(&mut data, 0);
        let out = decoder().decode(&RawData::new(data), &settings());
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_decode_size_mismatch_decodes_overlap() {
        // Header declares 5 words but the buffer holds 3: decode one event
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 5));
        push_u64(&mut data, make_first_word(2, 100));
        push_u64(&mut data, make_second_word(10, 0, 0, 0, 0, false));

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].channel, 2);
    }

    #[test]
    fn test_decode_multiple_events_sorted() {
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 5));
        push_u64(&mut data, make_first_word(1, 9_000));
        push_u64(&mut data, make_second_word(100, 0, 0, 0, 0, false));
        push_u64(&mut data, make_first_word(2, 1_000));
        push_u64(&mut data, make_second_word(200, 0, 0, 0, 0, false));

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events.len(), 2);
        assert!(out.events[0].timestamp_ns <= out.events[1].timestamp_ns);
        assert_eq!(out.events[0].channel, 2);
    }

    #[test]
    fn test_decode_start_stop_yield_no_events() {
        let mut data = Vec::new();
        push_u64(&mut data, (0x3u64 << 60) | (0x2u64 << 56));
        push_u64(&mut data, 0);
        push_u64(&mut data, 0x1u64 << 56);
        let out = decoder().decode(&RawData::new(data), &settings());
        assert!(out.events.is_empty());
    }

    // -----------------------------------------------------------------------
    // Waveforms
    // -----------------------------------------------------------------------

    fn make_waveform_event(
        wf_header: u64,
        samples: &[u32],
    ) -> Vec<u8> {
        assert!(samples.len().is_multiple_of(2));
        let n_words = samples.len() / 2;
        let total = 4 + n_words as u64;
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, total));
        push_u64(&mut data, make_first_word(3, 500));
        push_u64(&mut data, make_second_word(1000, 0, 0, 0, 0, true));
        push_u64(&mut data, wf_header);
        push_u64(&mut data, n_words as u64);
        for pair in samples.chunks(2) {
            push_u64(&mut data, u64::from(pair[0]) | (u64::from(pair[1]) << 32));
        }
        data
    }

    #[test]
    fn test_decode_waveform_unsigned() {
        let wf_header = make_waveform_header(0, 1, false, 0, 2);
        let samples = [
            make_sample(100, 200, 0),
            make_sample(300, 400, 0),
        ];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events.len(), 1);
        let e = &out.events[0];
        assert_eq!(e.waveform_size, 2);
        assert_eq!(e.analog_probe1, vec![100, 300]);
        assert_eq!(e.analog_probe2, vec![200, 400]);
        assert_eq!(e.analog_probe1_type, 1);
        assert_eq!(e.analog_probe2_type, 2);
        assert_eq!(e.down_sample_factor, 1);
    }

    #[test]
    fn test_decode_waveform_signed_sign_extension() {
        // ap1 signed with factor 1: raw 0x3FFF = -1 as signed 14-bit
        let wf_header = make_waveform_header(0, 0, true, 0, 0);
        let samples = [make_sample(0x3FFF, 0, 0), make_sample(0x2000, 0, 0)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        let e = &out.events[0];
        assert_eq!(e.analog_probe1[0], -1);
        assert_eq!(e.analog_probe1[1], -8192);
    }

    #[test]
    fn test_decode_waveform_multiplication_factor() {
        // mul code 2 -> factor 8
        let wf_header = make_waveform_header(0, 0, false, 2, 0);
        let samples = [make_sample(10, 0, 0), make_sample(20, 0, 0)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        let e = &out.events[0];
        assert_eq!(e.analog_probe1[0], 80);
        assert_eq!(e.analog_probe1[1], 160);
    }

    #[test]
    fn test_decode_waveform_down_sample_factor() {
        let wf_header = make_waveform_header(3, 0, false, 0, 0);
        let samples = [make_sample(0, 0, 0), make_sample(0, 0, 0)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events[0].down_sample_factor, 8);
    }

    #[test]
    fn test_decode_waveform_digital_probes() {
        let wf_header = make_waveform_header(0, 0, false, 0, 0);
        let dp_bits = (1 << 14) | (1 << 31); // dp1 and dp4 on the first point
        let samples = [make_sample(0, 0, dp_bits), make_sample(0, 0, 1 << 15)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        let e = &out.events[0];
        assert_eq!(e.digital_probe1, vec![1, 0]);
        assert_eq!(e.digital_probe2, vec![0, 1]);
        assert_eq!(e.digital_probe3, vec![0, 0]);
        assert_eq!(e.digital_probe4, vec![1, 0]);
    }

    #[test]
    fn test_decode_waveform_probe_types() {
        let mut wf_header = make_waveform_header(0, 3, false, 0, 5);
        wf_header |= 0x4u64 << 12; // dp1 type
        wf_header |= 0x7u64 << 16; // dp2 type
        wf_header |= 0x9u64 << 20; // dp3 type
        wf_header |= 0xBu64 << 24; // dp4 type
        let samples = [make_sample(0, 0, 0), make_sample(0, 0, 0)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        let e = &out.events[0];
        assert_eq!(e.analog_probe1_type, 3);
        assert_eq!(e.analog_probe2_type, 5);
        assert_eq!(e.digital_probe1_type, 0x4);
        assert_eq!(e.digital_probe2_type, 0x7);
        assert_eq!(e.digital_probe3_type, 0x9);
        assert_eq!(e.digital_probe4_type, 0xB);
    }

    #[test]
    fn test_decode_waveform_bad_header_keeps_earlier_events() {
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 7));
        // Good event without waveform
        push_u64(&mut data, make_first_word(1, 100));
        push_u64(&mut data, make_second_word(10, 0, 0, 0, 0, false));
        // Event claiming a waveform but followed by a bad waveform header
        push_u64(&mut data, make_first_word(2, 200));
        push_u64(&mut data, make_second_word(20, 0, 0, 0, 0, true));
        push_u64(&mut data, 0); // check1 bit missing
        push_u64(&mut data, 0);

        let out = decoder().decode(&RawData::new(data), &settings());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].channel, 1);
    }

    #[test]
    fn test_decode_waveform_truncated_body() {
        let mut data = Vec::new();
        push_u64(&mut data, make_header(1, 5));
        push_u64(&mut data, make_first_word(1, 100));
        push_u64(&mut data, make_second_word(10, 0, 0, 0, 0, true));
        push_u64(&mut data, make_waveform_header(0, 0, false, 0, 0));
        push_u64(&mut data, 8); // declares 8 waveform words, none present

        let out = decoder().decode(&RawData::new(data), &settings());
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_trace_lengths_match_waveform_size() {
        let wf_header = make_waveform_header(1, 0, false, 0, 0);
        let samples = [make_sample(1, 2, 0), make_sample(3, 4, 0)];
        let data = make_waveform_event(wf_header, &samples);

        let out = decoder().decode(&RawData::new(data), &settings());
        let e = &out.events[0];
        assert!(e.waveform_size > 0);
        assert_eq!(e.analog_probe1.len(), e.waveform_size);
        assert_eq!(e.analog_probe2.len(), e.waveform_size);
        assert_eq!(e.digital_probe1.len(), e.waveform_size);
        assert_eq!(e.digital_probe2.len(), e.waveform_size);
        assert_eq!(e.digital_probe3.len(), e.waveform_size);
        assert_eq!(e.digital_probe4.len(), e.waveform_size);
    }
}
