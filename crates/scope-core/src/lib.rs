//! Core types for the scope acquisition stack.
//!
//! This crate defines the shared vocabulary of the workspace:
//!
//! - [`config`]: TOML-deserializable acquisition configuration
//! - [`data`]: raw sample chunks, timing events, tags, channel descriptors
//! - [`driver`]: the [`DigitizerDriver`] trait and factory plugin API
//! - [`error`]: driver and engine error taxonomy
//! - [`registry`]: runtime device management
//!
//! Hardware crates depend on this crate only; the acquisition engine lives
//! in `scope-acquisition` and consumes drivers through [`DigitizerDriver`].

pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod registry;

pub use config::{
    AcquisitionConfig, AcquisitionMode, ChannelConfig, Coupling, TriggerConfig, TriggerDirection,
};
pub use data::{ChannelDescriptor, MalformedTimingEvent, RawChunk, Tag, TagPayload, TimingEvent};
pub use driver::{DigitizerDriver, DriverFactory, DriverSetup};
pub use error::{AcqResult, AcquisitionError, DriverError, DriverErrorKind, ErrorRecord};
pub use registry::DeviceRegistry;
