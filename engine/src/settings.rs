//! Bounded integer settings, read once when the bridge opens.
//!
//! The file is flat TOML, e.g.
//!
//! ```toml
//! NrIns = 0       # zero based number of stereo input pairs
//! NrOuts = 0
//! NrSamples = 64  # period length in frames
//! FifoSize = 64   # hardware output FIFO depth in frames
//! ```

use crate::error::{BridgeError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingSpec {
    pub name: &'static str,
    pub default: i64,
    pub min: i64,
    pub max: i64,
    pub comment: &'static str,
}

pub const NR_INS: SettingSpec = SettingSpec {
    name: "NrIns",
    default: 15,
    min: 0,
    max: 15,
    comment: "zero based number of stereo input pairs",
};
pub const NR_OUTS: SettingSpec = SettingSpec {
    name: "NrOuts",
    default: 15,
    min: 0,
    max: 15,
    comment: "zero based number of stereo output pairs",
};
pub const NR_SAMPLES: SettingSpec = SettingSpec {
    name: "NrSamples",
    default: 64,
    min: 64,
    max: 256,
    comment: "period length in frames",
};
pub const FIFO_SIZE: SettingSpec = SettingSpec {
    name: "FifoSize",
    default: 64,
    min: 64,
    max: 256,
    comment: "hardware output FIFO depth in frames",
};

pub const SPECS: [SettingSpec; 4] = [NR_INS, NR_OUTS, NR_SAMPLES, FIFO_SIZE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<&'static str, i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            values: SPECS.iter().map(|s| (s.name, s.default)).collect(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: HashMap<String, i64> =
            toml::from_str(text).map_err(|e| BridgeError::Settings(e.to_string()))?;
        let mut settings = Self::default();
        for (key, value) in raw {
            let Some(spec) = SPECS.iter().find(|s| s.name == key) else {
                warn!("ignoring unknown setting '{}'", key);
                continue;
            };
            let clamped = value.clamp(spec.min, spec.max);
            if clamped != value {
                warn!(
                    "setting {} = {} out of range [{}, {}], using {}",
                    spec.name, value, spec.min, spec.max, clamped
                );
            }
            settings.values.insert(spec.name, clamped);
        }
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Settings(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn get(&self, spec: SettingSpec) -> i64 {
        self.values.get(spec.name).copied().unwrap_or(spec.default)
    }

    pub fn input_channels(&self) -> usize {
        ((self.get(NR_INS) + 1) * 2) as usize
    }

    pub fn output_channels(&self) -> usize {
        ((self.get(NR_OUTS) + 1) * 2) as usize
    }

    pub fn period_frames(&self) -> usize {
        self.get(NR_SAMPLES) as usize
    }

    pub fn fifo_frames(&self) -> usize {
        self.get(FIFO_SIZE) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_declared_specs() {
        let s = Settings::default();
        assert_eq!(s.input_channels(), 32);
        assert_eq!(s.output_channels(), 32);
        assert_eq!(s.period_frames(), 64);
        assert_eq!(s.fifo_frames(), 64);
    }

    #[test]
    fn values_are_clamped_and_unknown_keys_ignored() {
        let s = Settings::from_toml_str(
            "NrIns = 0\nNrOuts = 99\nNrSamples = 8\nFifoSize = 128\nColour = 3\n",
        )
        .unwrap();
        assert_eq!(s.input_channels(), 2);
        assert_eq!(s.output_channels(), 32);
        assert_eq!(s.period_frames(), 64);
        assert_eq!(s.fifo_frames(), 128);
    }

    #[test]
    fn non_integer_values_are_rejected() {
        assert!(matches!(
            Settings::from_toml_str("NrSamples = \"lots\""),
            Err(BridgeError::Settings(_))
        ));
    }

    #[test]
    fn missing_file_is_a_settings_error() {
        assert!(matches!(
            Settings::load("/nonexistent/isobridge.toml"),
            Err(BridgeError::Settings(_))
        ));
    }
}
