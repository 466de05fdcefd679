//! Acquisition core: engine, timing matcher, trigger detection and the
//! single-producer single-consumer ring channels that carry samples and tags
//! to downstream consumers.
//!
//! The crate is driver-agnostic: anything implementing
//! [`scope_core::DigitizerDriver`] can feed an [`AcquisitionEngine`].
//!
//! ```no_run
//! use scope_acquisition::{AcquisitionEngine, PollOutcome};
//! use scope_core::AcquisitionConfig;
//! # async fn demo(driver: std::sync::Arc<dyn scope_core::DigitizerDriver>) -> anyhow::Result<()> {
//! let config = AcquisitionConfig::from_toml_str(
//!     "sample_rate = 1e6\n[[channels]]\nid = \"A\"\n",
//! )?;
//! let mut engine = AcquisitionEngine::new(driver, config);
//! engine.initialize().await?;
//! engine.configure().await?;
//! let outputs = engine.take_outputs().unwrap();
//! engine.arm().await?;
//! while let PollOutcome::Processed(_) | PollOutcome::Idle = engine.poll_once().await? {
//!     // drain `outputs` here
//! }
//! # Ok(())
//! # }
//! ```

pub use scope_core;

pub mod engine;
pub mod matcher;
pub mod ring;
pub mod trigger;

pub use engine::{AcquisitionEngine, ChannelOutput, EngineState, PollOutcome, ShutdownHandle};
pub use matcher::{MatchResult, TimingMatcher};
pub use ring::{ring_channel, Overrun, RingConsumer, RingProducer};
pub use trigger::{EdgeDetector, TriggerState};
