//! Validation helpers for the gen-1 (32-bit) wire formats
//!
//! Stateless checks over already-read words. Each failure is logged with
//! context and mapped onto the [`DecodeError`] taxonomy; the caller decides
//! whether to drop the buffer, abandon the block or skip the event.

use tracing::{error, warn};

use crate::common::{DecodeError, DecodeResult};

/// Maximum board id carried in the board header (5-bit field)
pub const MAX_BOARD_ID: u32 = 31;
/// Maximum waveform samples per event
pub const MAX_WAVEFORM_SAMPLES: usize = 65_536;
/// Maximum fine-time value (10-bit field)
pub const MAX_FINE_TIME: u16 = 0x3FF;
/// Board aggregate header length in words
pub const BOARD_HEADER_WORDS: usize = 4;
/// Dual-channel pair header length in words
pub const CHANNEL_HEADER_WORDS: usize = 2;

/// Check basic raw-buffer validity: non-empty, minimum length, alignment
pub fn validate_raw_buffer(data: &[u8], word_size: usize) -> DecodeResult<()> {
    if data.is_empty() {
        error!(word_size, "raw buffer is empty");
        return Err(DecodeError::InsufficientData);
    }
    if data.len() < BOARD_HEADER_WORDS * word_size {
        error!(
            size = data.len(),
            needed = BOARD_HEADER_WORDS * word_size,
            "raw buffer smaller than a board header"
        );
        return Err(DecodeError::InsufficientData);
    }
    if !data.len().is_multiple_of(word_size) {
        error!(
            size = data.len(),
            word_size, "raw buffer size not word-aligned"
        );
        return Err(DecodeError::CorruptedData);
    }
    Ok(())
}

/// Validate the four words of a board aggregate header
///
/// Checks the type nibble, the aggregate size and the board id. An empty
/// dual-channel mask is unusual but legal, so it only warns.
pub fn validate_board_header(words: &[u32; 4], type_data: u32) -> DecodeResult<()> {
    let header_type = (words[0] >> 28) & 0xF;
    if header_type != type_data {
        error!(
            header_type = format_args!("0x{:x}", header_type),
            expected = format_args!("0x{:x}", type_data),
            "invalid board header type"
        );
        return Err(DecodeError::InvalidHeader);
    }

    let aggregate_size = words[0] & 0x0FFF_FFFF;
    if (aggregate_size as usize) < BOARD_HEADER_WORDS {
        error!(aggregate_size, "board aggregate size too small");
        return Err(DecodeError::CorruptedData);
    }

    let board_id = (words[1] >> 27) & 0x1F;
    if board_id > MAX_BOARD_ID {
        error!(board_id, "board id out of range");
        return Err(DecodeError::CorruptedData);
    }

    let dual_channel_mask = words[1] & 0xFF;
    if dual_channel_mask == 0 {
        warn!("no active channel pairs in dual channel mask");
    }

    Ok(())
}

/// Validate a dual-channel pair header
///
/// `size_mask` differs between formats (22 bits for PSD1, 31 bits for
/// PHA1). Bit 31 of word 0 must be set; the declared samples-per-event
/// must stay within the supported waveform size.
pub fn validate_dual_channel_header(
    word0: u32,
    word1: u32,
    size_mask: u32,
) -> DecodeResult<()> {
    if (word0 >> 31) & 0x1 == 0 {
        error!("dual channel header flag not set");
        return Err(DecodeError::InvalidChannelPair);
    }

    let aggregate_size = word0 & size_mask;
    if (aggregate_size as usize) < CHANNEL_HEADER_WORDS {
        error!(aggregate_size, "dual channel aggregate size too small");
        return Err(DecodeError::CorruptedData);
    }

    let num_samples_wave = (word1 & 0xFFFF) as usize;
    if num_samples_wave * 8 > MAX_WAVEFORM_SAMPLES {
        error!(
            samples = num_samples_wave * 8,
            max = MAX_WAVEFORM_SAMPLES,
            "declared waveform samples too large"
        );
        return Err(DecodeError::InvalidWaveformSize);
    }

    Ok(())
}

/// Validate probe selector values against their documented ranges
pub fn validate_probe_selectors(
    digital_probe1: u8,
    digital_probe2: u8,
    analog_probe: u8,
) -> DecodeResult<()> {
    if digital_probe1 > 7 {
        error!(digital_probe1, "digital probe 1 selector out of range");
        return Err(DecodeError::CorruptedData);
    }
    if digital_probe2 > 7 {
        error!(digital_probe2, "digital probe 2 selector out of range");
        return Err(DecodeError::CorruptedData);
    }
    if analog_probe > 3 {
        error!(analog_probe, "analog probe selector out of range");
        return Err(DecodeError::CorruptedData);
    }
    Ok(())
}

/// Check that the remaining block can hold one event of `required_words`
pub fn validate_event_fit(required_words: usize, available_words: usize) -> DecodeResult<()> {
    if required_words > available_words {
        error!(
            required_words,
            available_words, "block too small for declared event layout"
        );
        return Err(DecodeError::InsufficientData);
    }
    Ok(())
}

/// Validate a waveform declaration against the data left in the block
pub fn validate_waveform(num_samples: usize, available_words: usize) -> DecodeResult<()> {
    if num_samples == 0 {
        return Ok(());
    }
    if num_samples > MAX_WAVEFORM_SAMPLES {
        error!(
            num_samples,
            max = MAX_WAVEFORM_SAMPLES,
            "waveform samples exceed maximum"
        );
        return Err(DecodeError::InvalidWaveformSize);
    }
    let required_words = num_samples.div_ceil(2);
    if required_words > available_words {
        error!(
            required_words,
            available_words, "insufficient data for waveform"
        );
        return Err(DecodeError::InsufficientData);
    }
    Ok(())
}

/// Validate the 10-bit fine-time field
pub fn validate_fine_time(fine_time: u16) -> DecodeResult<()> {
    if fine_time > MAX_FINE_TIME {
        error!(fine_time, "fine time stamp out of range");
        return Err(DecodeError::TimestampError);
    }
    Ok(())
}

/// Validate nested block bounds: `start <= end <= total`
pub fn validate_block_bounds(start: usize, end: usize, total: usize) -> DecodeResult<()> {
    if start > end {
        error!(start, end, "block start past block end");
        return Err(DecodeError::CorruptedData);
    }
    if end > total {
        error!(end, total, "block extends beyond data");
        return Err(DecodeError::OutOfBounds);
    }
    Ok(())
}
