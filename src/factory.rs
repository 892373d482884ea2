//! Format-selection factory
//!
//! Decides which wire format a digitizer speaks and builds the matching
//! decode engine. The decision procedure, in order: explicit `Type`
//! parameter, URL scheme, device-tree JSON analysis, and finally a PSD2
//! default with a warning.

use tracing::warn;

use crate::common::EngineError;
use crate::config::ParameterMap;
use crate::decoder::{FormatDecoder, Generation, Pha1Decoder, Psd1Decoder, Psd2Decoder};
use crate::engine::{DecodeEngine, EngineConfig};

/// Firmware families across both digitizer generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    Psd1,
    Pha1,
    Qdc1,
    Scope1,
    Psd2,
    Pha2,
    Scope2,
}

impl FirmwareType {
    /// Parse an explicit `Type` configuration value (case-insensitive)
    pub fn from_type_str(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PSD1" => Some(Self::Psd1),
            "PHA1" => Some(Self::Pha1),
            "QDC1" => Some(Self::Qdc1),
            "SCOPE1" => Some(Self::Scope1),
            "PSD2" => Some(Self::Psd2),
            "PHA2" => Some(Self::Pha2),
            "SCOPE2" => Some(Self::Scope2),
            _ => None,
        }
    }

    /// Detect the firmware family from the URL scheme.
    ///
    /// `dig1://` selects the gen-1 default (PSD1) and `dig2://` the gen-2
    /// default (PSD2). Legacy schemes defer to device-tree analysis.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("dig1://") {
            Some(Self::Psd1)
        } else if lower.starts_with("dig2://") {
            Some(Self::Psd2)
        } else {
            None
        }
    }

    /// Detect the firmware family from device-tree JSON.
    ///
    /// Inspects `par.fwtype.value` and `par.modelname.value`. Gen-1 PSD
    /// firmware spells its name with a hyphen (`dpp-psd`), gen-2 with an
    /// underscore (`dpp_psd`); the model name is the fallback, with
    /// 27xx-series models indicating gen-2 and 25xx/x730 gen-1.
    pub fn from_device_tree(tree: &serde_json::Value) -> Option<Self> {
        let fw_type = tree
            .pointer("/par/fwtype/value")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        let model_name = tree
            .pointer("/par/modelname/value")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();

        Self::analyze_firmware(&fw_type, &model_name)
    }

    fn analyze_firmware(fw_type: &str, model_name: &str) -> Option<Self> {
        if fw_type.contains("dpp-psd") {
            return Some(Self::Psd1);
        }
        if fw_type.contains("dpp_psd") || fw_type.contains("dpp-pha-psd") {
            return Some(Self::Psd2);
        }
        if fw_type.contains("dpp-pha") && !fw_type.contains("psd") {
            if fw_type.contains("_v2") || model_name.contains("27") {
                return Some(Self::Pha2);
            }
            return Some(Self::Pha1);
        }
        if fw_type.contains("dpp-qdc") {
            return Some(Self::Qdc1);
        }
        if fw_type.contains("scope") || fw_type.contains("oscilloscope") {
            if model_name.contains("27") || fw_type.contains("_v2") {
                return Some(Self::Scope2);
            }
            return Some(Self::Scope1);
        }

        // Model-name fallback: four-digit names starting with 2 are gen-2
        if model_name.contains("27") {
            return Some(Self::Psd2);
        }
        if model_name.contains("25") || model_name.contains("73") {
            return Some(Self::Psd1);
        }

        None
    }

    pub fn generation(self) -> Generation {
        match self {
            Self::Psd1 | Self::Pha1 | Self::Qdc1 | Self::Scope1 => Generation::Dig1,
            Self::Psd2 | Self::Pha2 | Self::Scope2 => Generation::Dig2,
        }
    }

    /// Build the format decoder for this firmware family.
    ///
    /// QDC1 and SCOPE1 currently decode through the PSD1 state machine,
    /// PHA2 and SCOPE2 through PSD2, matching the per-generation defaults.
    pub fn decoder(self) -> FormatDecoder {
        match self {
            Self::Pha1 => FormatDecoder::Pha1(Pha1Decoder::new()),
            Self::Psd1 | Self::Qdc1 | Self::Scope1 => FormatDecoder::Psd1(Psd1Decoder::new()),
            Self::Psd2 | Self::Pha2 | Self::Scope2 => FormatDecoder::Psd2(Psd2Decoder::new()),
        }
    }
}

/// Resolve the firmware type from the parameter map alone.
///
/// Returns `None` when neither the `Type` parameter nor the URL scheme is
/// conclusive; callers with driver access should then consult
/// [`FirmwareType::from_device_tree`].
pub fn detect_firmware(params: &ParameterMap) -> Option<FirmwareType> {
    if let Some(type_str) = params.firmware_type() {
        if let Some(fw) = FirmwareType::from_type_str(type_str) {
            return Some(fw);
        }
        warn!(type_str, "unrecognised Type parameter, falling back to URL");
    }
    params.url().and_then(FirmwareType::from_url)
}

/// Build a decode engine for an explicitly known firmware type
pub fn build_engine_for(firmware: FirmwareType, params: &ParameterMap) -> DecodeEngine {
    let config = EngineConfig {
        threads: params.threads(),
        module_id: params.module_id(),
        debug: params.debug(),
        ..Default::default()
    };
    DecodeEngine::new(firmware.decoder(), config)
}

/// Build a decode engine from the parameter map.
///
/// Requires a URL. If the firmware type cannot be resolved from `Type` or
/// the URL scheme, falls back to PSD2 with a warning; callers that opened
/// the device first can avoid the fallback by resolving through the device
/// tree and using [`build_engine_for`].
pub fn build_engine(params: &ParameterMap) -> Result<(FirmwareType, DecodeEngine), EngineError> {
    let url = params
        .url()
        .ok_or_else(|| EngineError::MissingParameter("URL".to_string()))?;

    let firmware = match detect_firmware(params) {
        Some(fw) => fw,
        None => {
            warn!(url, "could not determine digitizer type, defaulting to PSD2");
            FirmwareType::Psd2
        }
    };

    Ok((firmware, build_engine_for(firmware, params)))
}
