//! # bladerf-core
//!
//! Driver-independent building blocks for talking to a bladeRF transceiver:
//!
//! - [`error`]: the closed error taxonomy and native status translation
//! - [`types`]: channels, layouts, formats, gain/loopback modes, descriptors
//! - [`metadata`]: per-transfer timestamp, flags and status
//! - [`iq`]: SC16 Q11 to complex conversion
//! - [`wire`]: little-endian sample and metadata header encoding
//! - [`config`]: YAML session configuration
//! - [`logging`]: `tracing` subscriber setup
//!
//! Nothing here touches the native library; see `bladerf-hal` for the
//! device handle and transfer engines.

pub mod config;
pub mod error;
pub mod iq;
pub mod logging;
pub mod metadata;
pub mod types;
pub mod wire;

pub use config::{BladeRfConfig, ChannelSettings, ConfigError, DeviceSettings, StreamConfig, SyncConfig};
pub use error::{check_count, translate, Error, ErrorKind, Result};
pub use metadata::Metadata;
pub use types::{
    Backend, Channel, ChannelLayout, DevInfo, Direction, Format, GainMode, GainModeInfo, Loopback,
    LoopbackInfo, Range, Sc16, Verbosity, Version,
};
