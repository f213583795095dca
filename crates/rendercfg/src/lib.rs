//! Engine configuration for the frame graph.
//!
//! `EngineConfig` is the TOML document read at start-up (display size plus the
//! rendering toggles). The rendering section is also the live state behind
//! [`Settings`], which broadcasts per-key changes to render nodes.

mod broadcast;

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub use broadcast::{
    ListenerError, SettingChange, Settings, SettingsRemote, Subscription, SubscriptionId,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unknown setting '{0}'")]
    UnknownKey(String),
    #[error("setting '{key}' expects a {expected} value, got {actual}")]
    TypeMismatch {
        key: SettingKey,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Names of the live rendering settings nodes can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Bloom,
    BloomHighPassThreshold,
}

impl SettingKey {
    pub const ALL: [SettingKey; 2] = [SettingKey::Bloom, SettingKey::BloomHighPassThreshold];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::Bloom => "bloom",
            SettingKey::BloomHighPassThreshold => "bloom_high_pass_threshold",
        }
    }

    /// Parses a raw CLI/string value into the type this key stores.
    pub fn parse_value(self, raw: &str) -> Result<SettingValue, ConfigError> {
        match self {
            SettingKey::Bloom => parse_toggle(raw)
                .map(SettingValue::Bool)
                .map_err(ConfigError::Invalid),
            SettingKey::BloomHighPassThreshold => raw
                .trim()
                .parse::<f32>()
                .map(SettingValue::Float)
                .map_err(|_| {
                    ConfigError::Invalid(format!("invalid number '{raw}' for setting '{self}'"))
                }),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownKey(s.trim().to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Float(f32),
}

impl SettingValue {
    fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "boolean",
            SettingValue::Float(_) => "number",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(value) => Some(*value),
            SettingValue::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            SettingValue::Float(value) => Some(*value),
            SettingValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(value) => write!(f, "{value}"),
            SettingValue::Float(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderingConfig {
    #[serde(default = "default_true", deserialize_with = "deserialize_toggle")]
    pub bloom: bool,
    #[serde(default = "default_high_pass_threshold")]
    pub bloom_high_pass_threshold: f32,
    /// Intermediate targets use half-float storage when set. Read once when
    /// the graph is built, so it is not a [`SettingKey`].
    #[serde(default = "default_true", deserialize_with = "deserialize_toggle")]
    pub hdr: bool,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            bloom: true,
            bloom_high_pass_threshold: default_high_pass_threshold(),
            hdr: true,
        }
    }
}

impl RenderingConfig {
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::Bloom => SettingValue::Bool(self.bloom),
            SettingKey::BloomHighPassThreshold => SettingValue::Float(self.bloom_high_pass_threshold),
        }
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<SettingValue, ConfigError> {
        let previous = self.get(key);
        match (key, value) {
            (SettingKey::Bloom, SettingValue::Bool(flag)) => self.bloom = flag,
            (SettingKey::BloomHighPassThreshold, SettingValue::Float(threshold)) => {
                validate_threshold(threshold)?;
                self.bloom_high_pass_threshold = threshold;
            }
            (key, value) => {
                return Err(ConfigError::TypeMismatch {
                    key,
                    expected: previous.type_name(),
                    actual: value.type_name(),
                })
            }
        }
        Ok(previous)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.bloom_high_pass_threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    pub version: u32,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            display: DisplayConfig::default(),
            rendering: RenderingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: EngineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.display.width == 0 || self.display.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "display size {}x{} must be non-zero in both dimensions",
                self.display.width, self.display.height
            )));
        }

        self.rendering.validate()
    }
}

fn validate_threshold(threshold: f32) -> Result<(), ConfigError> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "bloom_high_pass_threshold must be a finite value >= 0 (got {threshold})"
        )));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_high_pass_threshold() -> f32 {
    0.75
}

fn deserialize_toggle<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Bool(bool),
        Str(String),
    }

    match Helper::deserialize(deserializer)? {
        Helper::Bool(flag) => Ok(flag),
        Helper::Str(raw) => parse_toggle(&raw).map_err(de::Error::custom),
    }
}

fn parse_toggle(raw: &str) -> Result<bool, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "true" | "on" | "yes" | "enable" | "enabled" | "1" => Ok(true),
        "false" | "off" | "no" | "disable" | "disabled" | "0" => Ok(false),
        other => Err(format!("invalid toggle '{other}'; expected on/off or true/false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[display]
width = 1280
height = 720

[rendering]
bloom = "off"
bloom_high_pass_threshold = 0.5
hdr = false
"#;

    #[test]
    fn parses_sample_config() {
        let config = EngineConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.display, DisplayConfig { width: 1280, height: 720 });
        assert!(!config.rendering.bloom);
        assert!(!config.rendering.hdr);
        assert_eq!(config.rendering.bloom_high_pass_threshold, 0.5);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = EngineConfig::from_toml_str("version = 1").unwrap();
        assert_eq!(config.display, DisplayConfig::default());
        assert_eq!(config.rendering, RenderingConfig::default());
    }

    #[test]
    fn rejects_unknown_version() {
        let err = EngineConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_sized_display() {
        let err = EngineConfig::from_toml_str(
            r#"
version = 1
[display]
width = 0
height = 720
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_negative_threshold() {
        let err = EngineConfig::from_toml_str(
            r#"
version = 1
[rendering]
bloom_high_pass_threshold = -1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn set_rejects_mismatched_type() {
        let mut rendering = RenderingConfig::default();
        let err = rendering
            .set(SettingKey::Bloom, SettingValue::Float(1.0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { key: SettingKey::Bloom, .. }));
        assert!(rendering.bloom);
    }

    #[test]
    fn set_returns_previous_value() {
        let mut rendering = RenderingConfig::default();
        let previous = rendering
            .set(SettingKey::Bloom, SettingValue::Bool(false))
            .unwrap();
        assert_eq!(previous, SettingValue::Bool(true));
        assert_eq!(rendering.get(SettingKey::Bloom), SettingValue::Bool(false));
    }

    #[test]
    fn parses_setting_keys_and_values() {
        assert_eq!("bloom".parse::<SettingKey>().unwrap(), SettingKey::Bloom);
        assert_eq!(
            "bloom-high-pass-threshold".parse::<SettingKey>().unwrap(),
            SettingKey::BloomHighPassThreshold
        );
        assert!(matches!(
            "lens_flare".parse::<SettingKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
        assert_eq!(
            SettingKey::Bloom.parse_value("off").unwrap(),
            SettingValue::Bool(false)
        );
        assert_eq!(
            SettingKey::BloomHighPassThreshold.parse_value("0.25").unwrap(),
            SettingValue::Float(0.25)
        );
        assert!(SettingKey::Bloom.parse_value("maybe").is_err());
    }

    #[test]
    fn hdr_is_not_a_live_setting() {
        assert!(matches!(
            "hdr".parse::<SettingKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
        let config = EngineConfig::from_toml_str("version = 1\n[rendering]\nhdr = false\n").unwrap();
        assert!(!config.rendering.hdr);
    }
}
