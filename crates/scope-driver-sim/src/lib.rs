//! Simulated digitizer driver.
//!
//! Produces a deterministic pulse train with optional seeded noise, so the
//! acquisition stack can be developed and tested without hardware. Tests can
//! also bypass the generator entirely and inject prepared chunks with
//! [`SimDigitizer::inject_chunk`], or fake a device-side gap with
//! [`SimDigitizer::skip_samples`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scope_core::config::AcquisitionMode;
use scope_core::data::RawChunk;
use scope_core::driver::{DigitizerDriver, DriverFactory, DriverSetup};
use scope_core::error::{DriverError, DriverErrorKind};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

const DRIVER_TYPE: &str = "sim";
const MAX_CHANNELS: usize = 8;
const CHANNEL_IDS: [&str; MAX_CHANNELS] = ["A", "B", "C", "D", "E", "F", "G", "H"];
const MAX_ADC_CODE: i16 = 32_767;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for the simulated device.
#[derive(Debug, Clone, Deserialize)]
pub struct SimDigitizerConfig {
    /// Number of hardware channels the device pretends to have (1..=8).
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,

    /// Samples per generated streaming chunk.
    #[serde(default = "default_chunk_samples")]
    pub chunk_samples: usize,

    /// Pulse train period in samples.
    #[serde(default = "default_pulse_period")]
    pub pulse_period_samples: usize,

    /// Pulse width in samples.
    #[serde(default = "default_pulse_width")]
    pub pulse_width_samples: usize,

    /// ADC code at the top of a pulse.
    #[serde(default = "default_pulse_code")]
    pub pulse_code: i16,

    /// Peak amplitude of the additive noise, in ADC codes. Zero disables it.
    #[serde(default)]
    pub noise_code: i16,

    /// Seed for the noise generator, so runs are reproducible.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SimDigitizerConfig {
    fn default() -> Self {
        Self {
            channel_count: default_channel_count(),
            chunk_samples: default_chunk_samples(),
            pulse_period_samples: default_pulse_period(),
            pulse_width_samples: default_pulse_width(),
            pulse_code: default_pulse_code(),
            noise_code: 0,
            seed: default_seed(),
        }
    }
}

fn default_channel_count() -> usize {
    2
}

fn default_chunk_samples() -> usize {
    1024
}

fn default_pulse_period() -> usize {
    250
}

fn default_pulse_width() -> usize {
    10
}

fn default_pulse_code() -> i16 {
    20_000
}

fn default_seed() -> u64 {
    42
}

// =============================================================================
// Driver
// =============================================================================

struct SimState {
    initialized: bool,
    armed: bool,
    closed: bool,
    setup: Option<DriverSetup>,
    /// Absolute sample counter of the next generated sample.
    next_sample: u64,
    injected: VecDeque<RawChunk>,
    block_ready: bool,
    rng: StdRng,
}

/// In-process digitizer that fabricates its own data.
pub struct SimDigitizer {
    config: SimDigitizerConfig,
    state: Mutex<SimState>,
}

impl SimDigitizer {
    pub fn with_config(config: SimDigitizerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(SimState {
                initialized: false,
                armed: false,
                closed: false,
                setup: None,
                next_sample: 0,
                injected: VecDeque::new(),
                block_ready: false,
                rng,
            }),
        }
    }

    /// Queue a prepared chunk; `poll_streaming` serves injected chunks before
    /// falling back to the generator. The chunk's `start_sample` is assigned
    /// when it is served.
    pub fn inject_chunk(&self, samples: Vec<Vec<i16>>, overflow: u16) {
        self.state.lock().injected.push_back(RawChunk {
            samples,
            start_sample: 0,
            overflow,
        });
    }

    /// Advance the device's sample counter without producing data, as a real
    /// device does when its internal buffer wraps.
    pub fn skip_samples(&self, n: u64) {
        self.state.lock().next_sample += n;
    }

    fn guard_open(&self, state: &SimState, op: DriverErrorKind) -> Result<(), DriverError> {
        if state.closed {
            return Err(DriverError::new(DRIVER_TYPE, op, "device is closed"));
        }
        Ok(())
    }

    fn fill_channel(&self, state: &mut SimState, start: u64, n: usize) -> Vec<i16> {
        let period = self.config.pulse_period_samples as u64;
        let width = self.config.pulse_width_samples as u64;
        (0..n as u64)
            .map(|i| {
                let base = if (start + i) % period < width {
                    self.config.pulse_code
                } else {
                    0
                };
                if self.config.noise_code > 0 {
                    base.saturating_add(
                        state.rng.gen_range(-self.config.noise_code..=self.config.noise_code),
                    )
                } else {
                    base
                }
            })
            .collect()
    }
}

#[async_trait]
impl DigitizerDriver for SimDigitizer {
    async fn initialize(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Initialization)?;
        state.initialized = true;
        debug!(driver = DRIVER_TYPE, "simulated device opened");
        Ok(())
    }

    async fn configure(&self, setup: &DriverSetup) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Configuration)?;
        if !state.initialized {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Configuration,
                "configure before initialize",
            ));
        }
        for channel in &setup.channels {
            if self.channel_index(&channel.id).is_none() {
                return Err(DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Configuration,
                    format!("no such channel '{}'", channel.id),
                ));
            }
        }
        state.setup = Some(setup.clone());
        Ok(())
    }

    async fn arm(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Arm)?;
        if state.setup.is_none() {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Arm,
                "arm before configure",
            ));
        }
        state.armed = true;
        // the simulated trigger condition is always met
        if matches!(
            state.setup.as_ref().map(|s| &s.mode),
            Some(AcquisitionMode::RapidBlock { .. })
        ) {
            state.block_ready = true;
        }
        Ok(())
    }

    async fn disarm(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.armed = false;
        state.block_ready = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.armed = false;
        state.closed = true;
        debug!(driver = DRIVER_TYPE, "simulated device closed");
        Ok(())
    }

    fn poll_streaming(&self) -> Result<Option<RawChunk>, DriverError> {
        let mut state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Poll)?;
        if !state.armed {
            return Ok(None);
        }
        if let Some(mut chunk) = state.injected.pop_front() {
            chunk.start_sample = state.next_sample;
            state.next_sample += chunk.len() as u64;
            return Ok(Some(chunk));
        }
        let n = self.config.chunk_samples;
        let start = state.next_sample;
        let samples = (0..self.config.channel_count)
            .map(|_| self.fill_channel(&mut state, start, n))
            .collect();
        state.next_sample += n as u64;
        Ok(Some(RawChunk {
            samples,
            start_sample: start,
            overflow: 0,
        }))
    }

    fn block_ready(&self) -> Result<bool, DriverError> {
        let state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Poll)?;
        Ok(state.armed && state.block_ready)
    }

    fn rapid_block_capture(&self, index: u32) -> Result<RawChunk, DriverError> {
        let mut state = self.state.lock();
        self.guard_open(&state, DriverErrorKind::Poll)?;
        let Some(AcquisitionMode::RapidBlock {
            pre_samples,
            post_samples,
            n_captures,
            ..
        }) = state.setup.as_ref().map(|s| s.mode.clone())
        else {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Poll,
                "rapid block capture outside rapid block mode",
            ));
        };
        if index >= n_captures {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Poll,
                format!("capture index {index} out of {n_captures}"),
            ));
        }
        let n = (pre_samples + post_samples) as usize;
        let width = self.config.pulse_width_samples;
        // trigger-aligned window: the pulse edge sits at `pre_samples`
        let samples: Vec<Vec<i16>> = (0..self.config.channel_count)
            .map(|_| {
                let mut row = vec![0i16; n];
                let pulse_start = pre_samples as usize;
                let pulse_end = (pulse_start + width).min(n);
                for value in &mut row[pulse_start..pulse_end] {
                    *value = self.config.pulse_code;
                }
                if self.config.noise_code > 0 {
                    for value in &mut row {
                        *value = value.saturating_add(
                            state.rng.gen_range(-self.config.noise_code..=self.config.noise_code),
                        );
                    }
                }
                row
            })
            .collect();
        let start = state.next_sample;
        state.next_sample += n as u64;
        if index + 1 == n_captures {
            state.block_ready = false;
        }
        Ok(RawChunk {
            samples,
            start_sample: start,
            overflow: 0,
        })
    }

    fn channel_index(&self, id: &str) -> Option<usize> {
        CHANNEL_IDS[..self.config.channel_count]
            .iter()
            .position(|&c| c == id)
    }

    fn channel_count(&self) -> usize {
        self.config.channel_count
    }

    fn max_adc_code(&self) -> i16 {
        MAX_ADC_CODE
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory for [`SimDigitizer`] instances.
pub struct SimDigitizerFactory;

impl DriverFactory for SimDigitizerFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Simulated Digitizer"
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SimDigitizerConfig = config.clone().try_into()?;
        if cfg.channel_count == 0 || cfg.channel_count > MAX_CHANNELS {
            bail!(
                "channel_count {} outside supported range 1..={}",
                cfg.channel_count,
                MAX_CHANNELS
            );
        }
        if cfg.chunk_samples == 0 {
            bail!("chunk_samples must be positive");
        }
        if cfg.pulse_width_samples >= cfg.pulse_period_samples {
            bail!(
                "pulse width {} must be shorter than period {}",
                cfg.pulse_width_samples,
                cfg.pulse_period_samples
            );
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<Arc<dyn DigitizerDriver>>> {
        Box::pin(async move {
            let cfg: SimDigitizerConfig = config.try_into()?;
            Ok(Arc::new(SimDigitizer::with_config(cfg)) as Arc<dyn DigitizerDriver>)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::config::ChannelConfig;

    fn streaming_setup(channels: &[&str]) -> DriverSetup {
        DriverSetup {
            sample_rate: 1e6,
            channels: channels.iter().map(|&id| ChannelConfig::new(id)).collect(),
            trigger: None,
            mode: AcquisitionMode::Streaming {
                poll_interval_ms: 1,
            },
        }
    }

    async fn armed_driver(config: SimDigitizerConfig) -> SimDigitizer {
        let driver = SimDigitizer::with_config(config);
        driver.initialize().await.unwrap();
        driver.configure(&streaming_setup(&["A", "B"])).await.unwrap();
        driver.arm().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn pulse_train_is_deterministic_without_noise() {
        let driver = armed_driver(SimDigitizerConfig {
            chunk_samples: 500,
            pulse_period_samples: 250,
            pulse_width_samples: 10,
            noise_code: 0,
            ..SimDigitizerConfig::default()
        })
        .await;

        let chunk = driver.poll_streaming().unwrap().unwrap();
        assert_eq!(chunk.start_sample, 0);
        assert_eq!(chunk.len(), 500);
        let row = &chunk.samples[0];
        assert_eq!(row[0], 20_000);
        assert_eq!(row[9], 20_000);
        assert_eq!(row[10], 0);
        assert_eq!(row[250], 20_000);
        assert_eq!(row[260], 0);

        // counter keeps running across chunks
        let next = driver.poll_streaming().unwrap().unwrap();
        assert_eq!(next.start_sample, 500);
        assert_eq!(next.samples[0][0], 20_000);
    }

    #[tokio::test]
    async fn injected_chunks_are_served_before_generated_ones() {
        let driver = armed_driver(SimDigitizerConfig::default()).await;
        driver.inject_chunk(vec![vec![1, 2, 3], vec![4, 5, 6]], 0b01);

        let chunk = driver.poll_streaming().unwrap().unwrap();
        assert_eq!(chunk.samples[0], vec![1, 2, 3]);
        assert_eq!(chunk.overflow, 0b01);
        assert_eq!(chunk.start_sample, 0);

        let generated = driver.poll_streaming().unwrap().unwrap();
        assert_eq!(generated.start_sample, 3);
        assert_eq!(generated.overflow, 0);
    }

    #[tokio::test]
    async fn skip_samples_creates_a_counter_gap() {
        let driver = armed_driver(SimDigitizerConfig {
            chunk_samples: 100,
            ..SimDigitizerConfig::default()
        })
        .await;
        driver.poll_streaming().unwrap().unwrap();
        driver.skip_samples(40);
        let chunk = driver.poll_streaming().unwrap().unwrap();
        assert_eq!(chunk.start_sample, 140);
    }

    #[tokio::test]
    async fn poll_without_arm_yields_no_data() {
        let driver = SimDigitizer::with_config(SimDigitizerConfig::default());
        driver.initialize().await.unwrap();
        driver.configure(&streaming_setup(&["A"])).await.unwrap();
        assert!(driver.poll_streaming().unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_device_rejects_polling() {
        let driver = armed_driver(SimDigitizerConfig::default()).await;
        driver.close().await.unwrap();
        let err = driver.poll_streaming().unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Poll);
    }

    #[tokio::test]
    async fn rapid_block_serves_all_captures_then_clears_ready() {
        let driver = SimDigitizer::with_config(SimDigitizerConfig::default());
        driver.initialize().await.unwrap();
        let mut setup = streaming_setup(&["A"]);
        setup.mode = AcquisitionMode::RapidBlock {
            pre_samples: 20,
            post_samples: 80,
            n_captures: 2,
            trigger_once: true,
        };
        driver.configure(&setup).await.unwrap();
        driver.arm().await.unwrap();

        assert!(driver.block_ready().unwrap());
        let first = driver.rapid_block_capture(0).unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first.samples[0][19], 0);
        assert_eq!(first.samples[0][20], 20_000);
        assert!(driver.block_ready().unwrap());

        driver.rapid_block_capture(1).unwrap();
        assert!(!driver.block_ready().unwrap());
        assert!(driver.rapid_block_capture(2).is_err());
    }

    #[test]
    fn factory_rejects_bad_channel_count() {
        let factory = SimDigitizerFactory;
        let good: toml::Value = toml::from_str("channel_count = 4").unwrap();
        assert!(factory.validate(&good).is_ok());
        let bad: toml::Value = toml::from_str("channel_count = 9").unwrap();
        assert!(factory.validate(&bad).is_err());
    }
}
