//! Digitizer driver trait and factory plugin API.
//!
//! Hardware backends implement [`DigitizerDriver`] and are registered with the
//! [`DeviceRegistry`](crate::registry::DeviceRegistry) at startup via explicit
//! `registry.register_factory(factory)` calls. The acquisition engine only
//! ever talks to `Arc<dyn DigitizerDriver>`, so simulated and real hardware
//! are interchangeable.
//!
//! # Lifecycle
//!
//! ```text
//! initialize -> configure -> arm -> { poll_streaming | block_ready/rapid_block_capture }*
//!            -> disarm -> close
//! ```
//!
//! Drivers report failures through [`DriverError`]; they never panic on
//! hardware faults. Lifecycle methods are async because opening and
//! configuring real instruments involves USB round trips; the polling
//! methods are sync so the engine can call them from a tight loop.

use crate::config::{AcquisitionMode, ChannelConfig, TriggerConfig};
use crate::data::RawChunk;
use crate::error::DriverError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

// =============================================================================
// Driver Setup
// =============================================================================

/// Hardware-facing subset of the acquisition configuration.
///
/// The engine resolves defaults and validates the user config before handing
/// this to [`DigitizerDriver::configure`], so drivers can trust the contents.
#[derive(Debug, Clone)]
pub struct DriverSetup {
    /// Requested sample rate in Hz. Drivers may coerce to the nearest
    /// supported rate and expose the actual value through their own config.
    pub sample_rate: f64,
    /// Channels to enable, in engine order.
    pub channels: Vec<ChannelConfig>,
    /// Hardware trigger, if the acquisition uses one.
    pub trigger: Option<TriggerConfig>,
    /// Streaming or rapid-block operation.
    pub mode: AcquisitionMode,
}

// =============================================================================
// Digitizer Driver Trait
// =============================================================================

/// Interface every digitizer backend implements.
///
/// # Thread Safety
///
/// The engine holds the driver as `Arc<dyn DigitizerDriver>` and calls it
/// from a single acquisition task, but `Send + Sync` is required so the
/// registry can hand the same instance to inspection code.
#[async_trait]
pub trait DigitizerDriver: Send + Sync {
    /// Open the device. Must be called exactly once before `configure`.
    async fn initialize(&self) -> Result<(), DriverError>;

    /// Apply channel, trigger and mode settings. May be called repeatedly
    /// while the device is not armed; a failed call must leave the previous
    /// hardware configuration intact.
    async fn configure(&self, setup: &DriverSetup) -> Result<(), DriverError>;

    /// Start the configured acquisition.
    async fn arm(&self) -> Result<(), DriverError>;

    /// Stop the acquisition without closing the device.
    async fn disarm(&self) -> Result<(), DriverError>;

    /// Release the device. The driver is unusable afterwards.
    async fn close(&self) -> Result<(), DriverError>;

    /// Fetch the next chunk of streamed samples, or `None` when the device
    /// has nothing new. Only meaningful in streaming mode.
    fn poll_streaming(&self) -> Result<Option<RawChunk>, DriverError>;

    /// Whether a rapid-block acquisition has completed all captures.
    fn block_ready(&self) -> Result<bool, DriverError>;

    /// Fetch one completed capture of a rapid-block acquisition.
    /// `index` runs from 0 to `n_captures - 1`.
    fn rapid_block_capture(&self, index: u32) -> Result<RawChunk, DriverError>;

    /// Map a channel id such as `"A"` to its row in [`RawChunk::samples`].
    fn channel_index(&self, id: &str) -> Option<usize>;

    /// Number of analog channels the device exposes.
    fn channel_count(&self) -> usize;

    /// Full-scale ADC code, used to convert raw counts to volts.
    fn max_adc_code(&self) -> i16;
}

impl std::fmt::Debug for dyn DigitizerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn DigitizerDriver")
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Factory for dynamically registered digitizer drivers.
///
/// Each driver crate implements this trait so the registry can instantiate
/// devices from TOML config. Factories are registered once at startup and
/// live for the program's lifetime.
///
/// # Example
///
/// ```rust,ignore
/// pub struct Ps4000aFactory;
///
/// impl DriverFactory for Ps4000aFactory {
///     fn driver_type(&self) -> &'static str { "ps4000a" }
///     fn name(&self) -> &'static str { "PicoScope 4000A series" }
///
///     fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
///         let table = config.as_table().ok_or_else(|| anyhow::anyhow!("expected table"))?;
///         if !table.contains_key("serial") {
///             anyhow::bail!("missing 'serial' field");
///         }
///         Ok(())
///     }
///
///     fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<Arc<dyn DigitizerDriver>>> {
///         Box::pin(async move {
///             let serial = config.get("serial").and_then(|v| v.as_str()).unwrap_or_default();
///             let driver = Ps4000aDriver::open(serial).await?;
///             Ok(Arc::new(driver) as Arc<dyn DigitizerDriver>)
///         })
///     }
/// }
/// ```
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name matching the TOML `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Validate configuration without instantiating.
    ///
    /// Called before `build()` to provide early error feedback. Should check
    /// that all required fields exist and have valid types.
    fn validate(&self, config: &toml::Value) -> anyhow::Result<()>;

    /// Async instantiation of the driver. Called after validation passes.
    /// Opens hardware connections and returns the driver handle; the device
    /// is not yet initialized or configured.
    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, anyhow::Result<Arc<dyn DigitizerDriver>>>;
}
