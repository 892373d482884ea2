//! PHA1 decoder for x725/x730 series digitizers (DPP-PHA firmware)
//!
//! Shares the nested board → channel pair → event shape with PSD1, with
//! PHA-specific differences:
//! - dual-channel aggregate size uses bits [0:30] (PSD1: [0:21])
//! - one 4-bit digital probe selector and two 2-bit analog probe selectors
//! - event wire order is time-tag, extras, waveform, energy
//! - the energy word carries energy [0:14], pile-up [15] and an extras
//!   residual [16:25] that lands in `energy_short`

use tracing::{debug, error, warn};

use super::reader::Word32Reader;
use super::validate;
use super::{Classification, DecodeOutput, DecoderSettings};
use crate::common::{flags, DecodeError, DecodeResult, EventData, RawData};

mod constants {
    pub const WORD_SIZE: usize = 4;

    pub mod board_header {
        pub const HEADER_SIZE_WORDS: usize = 4;
        pub const HEADER_SIZE_BYTES: usize = HEADER_SIZE_WORDS * super::WORD_SIZE;

        pub const TYPE_DATA: u32 = 0xA;
        pub const AGGREGATE_SIZE_MASK: u32 = 0x0FFF_FFFF;

        pub const DUAL_CHANNEL_MASK: u32 = 0xFF;
        pub const BOARD_FAIL_SHIFT: u32 = 26;
        pub const BOARD_ID_SHIFT: u32 = 27;
        pub const BOARD_ID_MASK: u32 = 0x1F;

        pub const COUNTER_MASK: u32 = 0x7F_FFFF;
    }

    pub mod channel_header {
        pub const HEADER_SIZE_WORDS: usize = 2;

        // PHA1 uses bits [0:30] for the pair aggregate size
        pub const DUAL_CHANNEL_SIZE_MASK: u32 = 0x7FFF_FFFF;

        pub const NUM_SAMPLES_MASK: u32 = 0xFFFF;
        pub const DIGITAL_PROBE_SHIFT: u32 = 16;
        pub const DIGITAL_PROBE_MASK: u32 = 0xF;
        pub const ANALOG_PROBE2_SHIFT: u32 = 20;
        pub const ANALOG_PROBE2_MASK: u32 = 0x3;
        pub const ANALOG_PROBE1_SHIFT: u32 = 22;
        pub const ANALOG_PROBE1_MASK: u32 = 0x3;
        pub const EXTRA_OPTION_SHIFT: u32 = 24;
        pub const EXTRA_OPTION_MASK: u32 = 0x7;
        pub const SAMPLES_ENABLED_SHIFT: u32 = 27; // ES
        pub const EXTRAS2_ENABLED_SHIFT: u32 = 28; // E2
        pub const TIME_ENABLED_SHIFT: u32 = 29; // ET
        pub const ENERGY_ENABLED_SHIFT: u32 = 30; // EE
        pub const DUAL_TRACE_SHIFT: u32 = 31; // DT
    }

    pub mod event {
        pub const TRIGGER_TIME_MASK: u32 = 0x7FFF_FFFF;
        pub const CHANNEL_FLAG_SHIFT: u32 = 31;

        pub const FINE_TIME_MASK: u32 = 0x3FF;
        pub const FLAGS_SHIFT: u32 = 10;
        pub const FLAGS_MASK: u32 = 0x3F;
        pub const EXTENDED_TIME_SHIFT: u32 = 16;
        pub const EXTENDED_TIME_MASK: u32 = 0xFFFF;
        pub const EXTENDED_TIME_LEFT_SHIFT: u32 = 31;

        pub const OPTION_EXTENDED_ONLY: u8 = 0b000;
        pub const OPTION_EXTENDED_ONLY1: u8 = 0b001;
        pub const OPTION_EXTENDED_FLAGS_FINE: u8 = 0b010;

        // PHA energy word
        pub const ENERGY_MASK: u32 = 0x7FFF;
        pub const PILEUP_SHIFT: u32 = 15;
        pub const EXTRA_SHIFT: u32 = 16;
        pub const EXTRA_MASK: u32 = 0x3FF;
    }

    pub mod waveform {
        pub const ANALOG_SAMPLE_MASK: u32 = 0x3FFF;
        pub const DIGITAL_PROBE_SHIFT: u32 = 14;
        pub const TRIGGER_FLAG_SHIFT: u32 = 15;
        pub const SECOND_SAMPLE_SHIFT: u32 = 16;
        pub const SAMPLES_PER_GROUP: usize = 8;
        pub const WORDS_PER_GROUP: usize = 2;
    }
}

#[derive(Debug, Clone)]
struct BoardHeader {
    aggregate_size: u32,
    dual_channel_mask: u8,
    board_fail: bool,
    board_id: u8,
    aggregate_counter: u32,
}

#[derive(Debug, Clone)]
struct DualChannelHeader {
    block_size: u32,
    num_samples_wave: u16,
    digital_probe: u8,
    analog_probe1: u8,
    analog_probe2: u8,
    extra_option: u8,
    samples_enabled: bool,
    extras_enabled: bool,
    time_enabled: bool,
    energy_enabled: bool,
    dual_trace: bool,
}

impl DualChannelHeader {
    fn event_size_words(&self) -> usize {
        let mut size = 0;
        if self.time_enabled {
            size += 1;
        }
        if self.extras_enabled {
            size += 1;
        }
        if self.samples_enabled {
            size += self.num_samples_wave as usize * constants::waveform::WORDS_PER_GROUP;
        }
        if self.energy_enabled {
            size += 1;
        }
        size
    }

    fn waveform_samples(&self) -> usize {
        self.num_samples_wave as usize * constants::waveform::SAMPLES_PER_GROUP
    }
}

/// PHA1 decoder
#[derive(Debug, Default)]
pub struct Pha1Decoder;

impl Pha1Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Classify the data type; PHA1 has no Start/Stop control frames.
    /// Like PSD1, classification is permissive and header validation
    /// happens in the decoder.
    pub fn classify(&self, raw: &RawData) -> Classification {
        if raw.size < constants::board_header::HEADER_SIZE_BYTES
            || !raw.size.is_multiple_of(constants::WORD_SIZE)
        {
            return Classification::Unknown;
        }
        Classification::Event
    }

    /// Decode raw data into timestamp-sorted events
    pub fn decode(&self, raw: &RawData, settings: &DecoderSettings) -> DecodeOutput {
        let mut output = DecodeOutput::default();

        if validate::validate_raw_buffer(&raw.data[..raw.size], constants::WORD_SIZE).is_err() {
            output.errors += 1;
            return output;
        }

        let reader = Word32Reader::new(&raw.data[..raw.size]);
        let total_words = reader.total_words();
        let mut index = 0usize;

        while index + constants::board_header::HEADER_SIZE_WORDS <= total_words {
            match decode_board_aggregate(&reader, &mut index, settings, &mut output) {
                Ok(()) => {}
                Err(err) => {
                    error!(%err, word = index, "PHA1 board aggregate decode failed");
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

        debug!(
            events = output.events.len(),
            words = total_words,
            "PHA1 buffer decoded"
        );
        output
    }
}

fn decode_board_aggregate(
    reader: &Word32Reader<'_>,
    index: &mut usize,
    settings: &DecoderSettings,
    output: &mut DecodeOutput,
) -> DecodeResult<()> {
    let header = decode_board_header(reader, *index)?;

    let mut board_end = *index + header.aggregate_size as usize;
    if board_end > reader.total_words() {
        error!(
            board_end,
            total = reader.total_words(),
            "board aggregate extends beyond data, clamping"
        );
        board_end = reader.total_words();
    }

    if header.board_fail {
        warn!(board_id = header.board_id, "board fail bit set");
    }
    output.aggregate_counter = Some(header.aggregate_counter);

    *index += constants::board_header::HEADER_SIZE_WORDS;

    for pair in 0u8..8 {
        if header.dual_channel_mask & (1 << pair) == 0 {
            continue;
        }
        if *index >= board_end {
            error!(pair, "unexpected end of board aggregate block");
            break;
        }

        if let Err(err) = decode_dual_channel_block(
            reader,
            index,
            pair,
            board_end,
            settings,
            &mut output.events,
        ) {
            error!(%err, pair, "dual channel block decode failed, skipping to board end");
            output.errors += 1;
            break;
        }
    }

    *index = board_end;
    Ok(())
}

fn decode_board_header(reader: &Word32Reader<'_>, index: usize) -> DecodeResult<BoardHeader> {
    if reader.remaining(index) < constants::board_header::HEADER_SIZE_WORDS {
        error!("insufficient data for board header");
        return Err(DecodeError::InsufficientData);
    }

    let words = [
        reader.read(index)?,
        reader.read(index + 1)?,
        reader.read(index + 2)?,
        reader.read(index + 3)?,
    ];

    validate::validate_board_header(&words, constants::board_header::TYPE_DATA)?;

    Ok(BoardHeader {
        aggregate_size: words[0] & constants::board_header::AGGREGATE_SIZE_MASK,
        dual_channel_mask: (words[1] & constants::board_header::DUAL_CHANNEL_MASK) as u8,
        board_fail: ((words[1] >> constants::board_header::BOARD_FAIL_SHIFT) & 1) != 0,
        board_id: ((words[1] >> constants::board_header::BOARD_ID_SHIFT)
            & constants::board_header::BOARD_ID_MASK) as u8,
        aggregate_counter: words[2] & constants::board_header::COUNTER_MASK,
    })
}

fn decode_dual_channel_block(
    reader: &Word32Reader<'_>,
    index: &mut usize,
    pair: u8,
    board_end: usize,
    settings: &DecoderSettings,
    events: &mut Vec<EventData>,
) -> DecodeResult<()> {
    let header = decode_dual_channel_header(reader, *index)?;

    let mut pair_end = *index + header.block_size as usize;
    if pair_end > board_end {
        error!(
            pair_end,
            board_end, "channel aggregate extends beyond board, clamping"
        );
        pair_end = board_end;
    }

    *index += constants::channel_header::HEADER_SIZE_WORDS;

    let event_size = header.event_size_words();
    if event_size == 0 {
        *index = pair_end;
        return Ok(());
    }

    while *index < pair_end {
        if validate::validate_event_fit(event_size, pair_end - *index).is_err() {
            break;
        }
        let mut event = decode_event(reader, index, &header, settings)?;
        event.channel += pair * 2;
        events.push(event);
    }

    *index = pair_end;
    Ok(())
}

fn decode_dual_channel_header(
    reader: &Word32Reader<'_>,
    index: usize,
) -> DecodeResult<DualChannelHeader> {
    if reader.remaining(index) < constants::channel_header::HEADER_SIZE_WORDS {
        error!("insufficient data for dual channel header");
        return Err(DecodeError::InsufficientData);
    }

    let w0 = reader.read(index)?;
    let w1 = reader.read(index + 1)?;

    validate::validate_dual_channel_header(
        w0,
        w1,
        constants::channel_header::DUAL_CHANNEL_SIZE_MASK,
    )?;

    Ok(DualChannelHeader {
        block_size: w0 & constants::channel_header::DUAL_CHANNEL_SIZE_MASK,
        num_samples_wave: (w1 & constants::channel_header::NUM_SAMPLES_MASK) as u16,
        digital_probe: ((w1 >> constants::channel_header::DIGITAL_PROBE_SHIFT)
            & constants::channel_header::DIGITAL_PROBE_MASK) as u8,
        analog_probe2: ((w1 >> constants::channel_header::ANALOG_PROBE2_SHIFT)
            & constants::channel_header::ANALOG_PROBE2_MASK) as u8,
        analog_probe1: ((w1 >> constants::channel_header::ANALOG_PROBE1_SHIFT)
            & constants::channel_header::ANALOG_PROBE1_MASK) as u8,
        extra_option: ((w1 >> constants::channel_header::EXTRA_OPTION_SHIFT)
            & constants::channel_header::EXTRA_OPTION_MASK) as u8,
        samples_enabled: ((w1 >> constants::channel_header::SAMPLES_ENABLED_SHIFT) & 1) != 0,
        extras_enabled: ((w1 >> constants::channel_header::EXTRAS2_ENABLED_SHIFT) & 1) != 0,
        time_enabled: ((w1 >> constants::channel_header::TIME_ENABLED_SHIFT) & 1) != 0,
        energy_enabled: ((w1 >> constants::channel_header::ENERGY_ENABLED_SHIFT) & 1) != 0,
        dual_trace: ((w1 >> constants::channel_header::DUAL_TRACE_SHIFT) & 1) != 0,
    })
}

fn decode_event(
    reader: &Word32Reader<'_>,
    index: &mut usize,
    header: &DualChannelHeader,
    settings: &DecoderSettings,
) -> DecodeResult<EventData> {
    let mut trigger_time_tag = 0u32;
    let mut odd_channel = 0u8;
    if header.time_enabled {
        let w = reader.read(*index)?;
        *index += 1;
        trigger_time_tag = w & constants::event::TRIGGER_TIME_MASK;
        odd_channel = ((w >> constants::event::CHANNEL_FLAG_SHIFT) & 1) as u8;
    }

    let waveform_size = if header.samples_enabled {
        header.waveform_samples()
    } else {
        0
    };
    let mut event = EventData::new(waveform_size);
    event.channel = odd_channel;
    event.module = settings.module_id;
    event.time_resolution = settings.time_step_ns as u8;
    event.digital_probe1_type = header.digital_probe;
    // PHA1 has a single digital probe selector
    event.digital_probe2_type = 0;
    event.analog_probe1_type = header.analog_probe1;
    event.analog_probe2_type = header.analog_probe2;

    // PHA1 wire order: extras directly after the time tag
    let mut extended_time = 0u16;
    let mut fine_time = 0u16;
    if header.extras_enabled {
        let w = reader.read(*index)?;
        *index += 1;
        (extended_time, fine_time) = decode_extras_word(w, header.extra_option, &mut event.flags);
        validate::validate_fine_time(fine_time)?;
    }

    let combined = u64::from(trigger_time_tag)
        + (u64::from(extended_time) << constants::event::EXTENDED_TIME_LEFT_SHIFT);
    let mut timestamp_ns = combined as f64 * f64::from(settings.time_step_ns);
    if header.extras_enabled
        && header.extra_option == constants::event::OPTION_EXTENDED_FLAGS_FINE
    {
        timestamp_ns += f64::from(fine_time) * settings.fine_time_multiplier;
    }
    event.timestamp_ns = timestamp_ns;

    if waveform_size > 0 {
        decode_waveform(reader, index, header, &mut event)?;
    }

    if header.energy_enabled {
        let w = reader.read(*index)?;
        *index += 1;
        decode_energy_word(w, &mut event);
    }

    if settings.debug {
        debug!(
            channel = event.channel,
            timestamp_ns = event.timestamp_ns,
            energy = event.energy,
            extra = event.energy_short,
            flags = format_args!("0x{:x}", event.flags),
            "PHA1 event"
        );
    }

    Ok(event)
}

/// Decode the extras word based on the extras-option selector
fn decode_extras_word(word: u32, extra_option: u8, event_flags: &mut u64) -> (u16, u16) {
    let extended_time = ((word >> constants::event::EXTENDED_TIME_SHIFT)
        & constants::event::EXTENDED_TIME_MASK) as u16;

    match extra_option {
        constants::event::OPTION_EXTENDED_FLAGS_FINE => {
            let fine_time = (word & constants::event::FINE_TIME_MASK) as u16;
            let group = (word >> constants::event::FLAGS_SHIFT) & constants::event::FLAGS_MASK;
            if group & 0x20 != 0 {
                *event_flags |= flags::FLAG_TRIGGER_LOST;
            }
            if group & 0x10 != 0 {
                *event_flags |= flags::FLAG_OVER_RANGE;
            }
            if group & 0x08 != 0 {
                *event_flags |= flags::FLAG_1024_TRIGGER;
            }
            if group & 0x04 != 0 {
                *event_flags |= flags::FLAG_N_LOST_TRIGGER;
            }
            (extended_time, fine_time)
        }
        constants::event::OPTION_EXTENDED_ONLY | constants::event::OPTION_EXTENDED_ONLY1 => {
            (extended_time, 0)
        }
        other => {
            warn!(
                extra_option = other,
                "unknown extras option, treating as extended timestamp only"
            );
            (extended_time, 0)
        }
    }
}

/// Decode the PHA energy word; the extras residual reuses `energy_short`
fn decode_energy_word(word: u32, event: &mut EventData) {
    event.energy = (word & constants::event::ENERGY_MASK) as u16;
    event.energy_short =
        ((word >> constants::event::EXTRA_SHIFT) & constants::event::EXTRA_MASK) as u16;
    if (word >> constants::event::PILEUP_SHIFT) & 1 != 0 {
        event.flags |= flags::FLAG_PILEUP;
    }
}

/// Decode the waveform block.
///
/// Each 16-bit sample packs 14 analog bits, the digital probe at bit 14 and
/// the trigger flag at bit 15; they land in digital probes 1 and 2
/// respectively. Dual trace de-interleaves like PSD1.
fn decode_waveform(
    reader: &Word32Reader<'_>,
    index: &mut usize,
    header: &DualChannelHeader,
    event: &mut EventData,
) -> DecodeResult<()> {
    let num_words = header.num_samples_wave as usize * constants::waveform::WORDS_PER_GROUP;
    // Two 16-bit wire samples per word; trailing trace slots stay zero
    validate::validate_waveform(num_words * 2, reader.remaining(*index))?;

    for word_i in 0..num_words {
        let w = reader.read(*index)?;
        *index += 1;

        let halves = [
            w & 0xFFFF,
            (w >> constants::waveform::SECOND_SAMPLE_SHIFT) & 0xFFFF,
        ];
        for (half, sample) in halves.into_iter().enumerate() {
            let sample_index = word_i * 2 + half;
            if sample_index >= event.waveform_size {
                continue;
            }

            let analog = (sample & constants::waveform::ANALOG_SAMPLE_MASK) as i32;
            event.digital_probe1[sample_index] =
                ((sample >> constants::waveform::DIGITAL_PROBE_SHIFT) & 1) as u8;
            event.digital_probe2[sample_index] =
                ((sample >> constants::waveform::TRIGGER_FLAG_SHIFT) & 1) as u8;

            if header.dual_trace {
                if sample_index % 2 == 1 {
                    event.analog_probe2[sample_index] = analog;
                    event.analog_probe1[sample_index] = event.analog_probe1[sample_index - 1];
                } else {
                    event.analog_probe1[sample_index] = analog;
                    if sample_index > 0 {
                        event.analog_probe2[sample_index] = event.analog_probe2[sample_index - 1];
                    }
                }
            } else {
                event.analog_probe1[sample_index] = analog;
            }
        }
    }

    Ok(())
}
