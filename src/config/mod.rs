//! Parameter-map consumption
//!
//! The textual configuration loader lives outside this crate; by the time
//! the map arrives here it is already parsed into string key/value pairs.
//! This module gives the pairs a typed surface: the keys the factory and
//! engine recognise, plus the `/`-prefixed passthrough parameters that are
//! forwarded verbatim to the device driver.

use std::collections::BTreeMap;

use tracing::warn;

/// Recognised configuration keys
pub mod keys {
    /// Driver connection string, required by the factory
    pub const URL: &str = "URL";
    /// Optional explicit firmware type (PSD1/PSD2/PHA1/PHA2/QDC1/SCOPE1/SCOPE2)
    pub const TYPE: &str = "Type";
    /// Enables hex dumps and verbose logs
    pub const DEBUG: &str = "Debug";
    /// Decoder worker count
    pub const THREADS: &str = "Threads";
    /// Module number written to every decoded event
    pub const MOD_ID: &str = "ModID";
}

/// An already-parsed configuration parameter map
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    parameters: BTreeMap<String, String>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Driver connection string, if configured
    pub fn url(&self) -> Option<&str> {
        self.get(keys::URL)
    }

    /// Explicit firmware type string, if configured
    pub fn firmware_type(&self) -> Option<&str> {
        self.get(keys::TYPE)
    }

    /// Debug flag: `true`, `1` and `yes` enable (case-insensitive)
    pub fn debug(&self) -> bool {
        self.get(keys::DEBUG)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    /// Decoder worker count; anything unparsable or below 1 falls back to 1
    pub fn threads(&self) -> usize {
        match self.get(keys::THREADS) {
            None => 1,
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    warn!(value, "invalid Threads value, falling back to 1");
                    1
                }
            },
        }
    }

    /// Module number; 0-255, default 0
    pub fn module_id(&self) -> u8 {
        match self.get(keys::MOD_ID) {
            None => 0,
            Some(value) => match value.trim().parse::<u8>() {
                Ok(n) => n,
                Err(_) => {
                    warn!(value, "invalid ModID value, falling back to 0");
                    0
                }
            },
        }
    }

    /// Parameters whose keys begin with `/`, to be forwarded to the driver
    /// via `set_parameter` in map order
    pub fn driver_parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters
            .iter()
            .filter(|(k, _)| k.starts_with('/'))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for ParameterMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            parameters: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ParameterMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self {
            parameters: iter
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ParameterMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_url() {
        let params = map(&[("URL", "dig2://172.18.4.56")]);
        assert_eq!(params.url(), Some("dig2://172.18.4.56"));
        assert_eq!(ParameterMap::new().url(), None);
    }

    #[test]
    fn test_debug_accepts_true_one_yes() {
        for value in ["true", "1", "yes", "TRUE", "Yes"] {
            assert!(map(&[("Debug", value)]).debug(), "{value} should enable");
        }
        for value in ["false", "0", "no", "2", ""] {
            assert!(!map(&[("Debug", value)]).debug(), "{value} should disable");
        }
        assert!(!ParameterMap::new().debug());
    }

    #[test]
    fn test_threads_default_and_fallback() {
        assert_eq!(ParameterMap::new().threads(), 1);
        assert_eq!(map(&[("Threads", "4")]).threads(), 4);
        assert_eq!(map(&[("Threads", "0")]).threads(), 1);
        assert_eq!(map(&[("Threads", "-3")]).threads(), 1);
        assert_eq!(map(&[("Threads", "many")]).threads(), 1);
    }

    #[test]
    fn test_module_id_default_and_fallback() {
        assert_eq!(ParameterMap::new().module_id(), 0);
        assert_eq!(map(&[("ModID", "17")]).module_id(), 17);
        assert_eq!(map(&[("ModID", "255")]).module_id(), 255);
        assert_eq!(map(&[("ModID", "256")]).module_id(), 0);
        assert_eq!(map(&[("ModID", "x")]).module_id(), 0);
    }

    #[test]
    fn test_driver_parameters_filter() {
        let params = map(&[
            ("URL", "dig2://host"),
            ("/par/reclen", "512"),
            ("/ch/0/par/ChEnable", "True"),
            ("Threads", "2"),
        ]);
        let driver: Vec<_> = params.driver_parameters().collect();
        assert_eq!(driver.len(), 2);
        assert!(driver.contains(&("/par/reclen", "512")));
        assert!(driver.contains(&("/ch/0/par/ChEnable", "True")));
    }

    #[test]
    fn test_set_and_get() {
        let mut params = ParameterMap::new();
        params.set("Type", "PHA1");
        assert_eq!(params.firmware_type(), Some("PHA1"));
        assert!(params.contains("Type"));
        assert_eq!(params.len(), 1);
    }
}
