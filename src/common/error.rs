//! Error types for the decoding pipeline
//!
//! Decode failures are never fatal to the engine: buffer-level errors drop
//! the buffer, block-level errors abandon the block and keep what was
//! decoded, value-level errors skip the event. Everything is logged.

use thiserror::Error;

/// Decode failure taxonomy
///
/// The success case is expressed as `Ok(())`; these variants cover every
/// way a raw buffer can fail validation or decoding.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Header magic/type field does not match the expected pattern
    #[error("invalid header")]
    InvalidHeader,

    /// Buffer or block too small for the declared content
    #[error("insufficient data")]
    InsufficientData,

    /// Structurally inconsistent data (bad sizes, bad field values)
    #[error("corrupted data")]
    CorruptedData,

    /// Read past the end of the buffer
    #[error("out of bounds access")]
    OutOfBounds,

    /// Dual-channel pair header failed validation
    #[error("invalid channel pair")]
    InvalidChannelPair,

    /// Waveform sample count outside the supported range
    #[error("invalid waveform size")]
    InvalidWaveformSize,

    /// Timestamp field outside its valid range
    #[error("timestamp calculation error")]
    TimestampError,

    /// Buffer could not be classified
    #[error("unknown data type")]
    UnknownDataType,
}

/// Result alias for decode operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Engine construction and configuration errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Required configuration key missing
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    /// Configuration value rejected
    #[error("invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },
}

impl EngineError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
