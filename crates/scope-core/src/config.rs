//! Configuration surface consumed by the acquisition engine.
//!
//! All structs deserialize from TOML with sensible defaults, so a minimal
//! configuration only needs a sample rate and a channel list:
//!
//! ```toml
//! sample_rate = 1_000_000.0
//!
//! [[channels]]
//! id = "A"
//! range = 5.0
//!
//! [trigger]
//! source = "A"
//! threshold = 1.5
//! direction = "rising"
//! ```

use serde::{Deserialize, Serialize};

/// Input coupling of an analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    #[default]
    Dc,
    Ac,
}

/// Edge polarity the trigger comparator looks for.
///
/// `High`/`Low` behave like `Rising`/`Falling` level triggers: the first
/// sample at or beyond the threshold fires, then the comparator re-arms only
/// after the signal leaves the hysteresis band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    #[default]
    Rising,
    Falling,
    High,
    Low,
}

/// Per-channel acquisition settings. Immutable once the device is armed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware channel id, e.g. `"A"`.
    pub id: String,
    /// Full-scale voltage range.
    #[serde(default = "default_range")]
    pub range: f32,
    /// Voltage offset added after scaling.
    #[serde(default)]
    pub offset: f32,
    #[serde(default)]
    pub coupling: Coupling,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Signal name published in the channel descriptor; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            range: default_range(),
            offset: 0.0,
            coupling: Coupling::default(),
            enabled: true,
            name: None,
            unit: default_unit(),
        }
    }

    /// Signal name for descriptor tags.
    pub fn signal_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Software trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Channel id the edge detector runs on.
    pub source: String,
    #[serde(default)]
    pub threshold: f32,
    #[serde(default)]
    pub direction: TriggerDirection,
    /// Hysteresis band width in volts. Defaults to `range / 100` of the
    /// source channel when unset.
    #[serde(default)]
    pub band: Option<f32>,
}

/// Acquisition mode selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Continuous acquisition; the driver is polled every `poll_interval_ms`.
    Streaming {
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// Segmented acquisition of `n_captures` trigger-aligned windows of
    /// `pre_samples + post_samples` samples each.
    RapidBlock {
        pre_samples: u32,
        post_samples: u32,
        #[serde(default = "default_one")]
        n_captures: u32,
        /// Stop after the first completed set of captures.
        #[serde(default)]
        trigger_once: bool,
    },
}

impl Default for AcquisitionMode {
    fn default() -> Self {
        AcquisitionMode::Streaming {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Top-level acquisition configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    #[serde(default)]
    pub mode: AcquisitionMode,
    /// Ring-channel capacity per channel, in samples. Must cover the
    /// worst-case consumer latency; publishing beyond it is an overrun.
    #[serde(default = "default_buffer_samples")]
    pub buffer_samples: usize,
    /// Time after which the matcher gives up pairing an event with a pulse.
    #[serde(default = "default_matcher_timeout_ns")]
    pub matcher_timeout_ns: u64,
    /// Arm immediately after configuring in `start()`.
    #[serde(default = "default_true")]
    pub auto_arm: bool,
}

impl AcquisitionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Enabled channels in configuration order.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Nanoseconds between consecutive samples.
    pub fn sample_period_ns(&self) -> f64 {
        1e9 / self.sample_rate
    }
}

fn default_range() -> f32 {
    5.0
}

fn default_unit() -> String {
    "V".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_buffer_samples() -> usize {
    65_536
}

fn default_matcher_timeout_ns() -> u64 {
    10_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_config_parses_with_defaults() {
        let cfg = AcquisitionConfig::from_toml_str(
            r#"
            sample_rate = 1000000.0

            [[channels]]
            id = "A"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.channels.len(), 1);
        assert_eq!(cfg.channels[0].range, 5.0);
        assert!(cfg.channels[0].enabled);
        assert_eq!(cfg.channels[0].signal_name(), "A");
        assert!(cfg.trigger.is_none());
        assert_eq!(
            cfg.mode,
            AcquisitionMode::Streaming {
                poll_interval_ms: 1
            }
        );
        assert_eq!(cfg.matcher_timeout_ns, 10_000_000);
        assert!(cfg.auto_arm);
    }

    #[test]
    fn rapid_block_mode_parses() {
        let cfg = AcquisitionConfig::from_toml_str(
            r#"
            sample_rate = 500000.0

            [mode]
            type = "rapid_block"
            pre_samples = 100
            post_samples = 900
            n_captures = 4
            trigger_once = true

            [[channels]]
            id = "A"

            [[channels]]
            id = "B"
            enabled = false

            [trigger]
            source = "A"
            threshold = 0.5
            direction = "falling"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.mode,
            AcquisitionMode::RapidBlock {
                pre_samples: 100,
                post_samples: 900,
                n_captures: 4,
                trigger_once: true
            }
        );
        assert_eq!(cfg.enabled_channels().count(), 1);
        let trigger = cfg.trigger.unwrap();
        assert_eq!(trigger.direction, TriggerDirection::Falling);
        assert_eq!(trigger.band, None);
    }

    #[test]
    fn config_loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition.toml");
        std::fs::write(
            &path,
            "sample_rate = 2e6\n\n[[channels]]\nid = \"B\"\nname = \"beam\"\n",
        )
        .unwrap();
        let cfg = AcquisitionConfig::load(&path).unwrap();
        assert_eq!(cfg.sample_rate, 2e6);
        assert_eq!(cfg.channels[0].signal_name(), "beam");

        let err = AcquisitionConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn sample_period_matches_rate() {
        let mut cfg = AcquisitionConfig::from_toml_str("sample_rate = 1e8\nchannels = []").unwrap();
        assert_eq!(cfg.sample_period_ns(), 10.0);
        cfg.sample_rate = 1e6;
        assert_eq!(cfg.sample_period_ns(), 1000.0);
    }
}
