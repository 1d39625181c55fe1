//! Core value types shared by the device, transfer and streaming layers.
//!
//! Every enum here mirrors a libbladeRF enumeration and carries its native
//! integer value through `native()` / `from_native()`.

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One SC16 Q11 sample: I and Q as signed 16-bit integers, full scale 2048.
pub type Sc16 = Complex<i16>;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Rx,
    Tx,
}

impl Direction {
    /// Low bit of an encoded channel.
    pub fn native(self) -> i32 {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(Direction::Rx),
            1 => Some(Direction::Tx),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// A single RF path: direction plus zero-based index.
///
/// Encoded for the driver as `(index << 1) | direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub direction: Direction,
    pub index: u8,
}

impl Channel {
    pub const RX0: Channel = Channel::rx(0);
    pub const RX1: Channel = Channel::rx(1);
    pub const TX0: Channel = Channel::tx(0);
    pub const TX1: Channel = Channel::tx(1);

    pub const fn rx(index: u8) -> Self {
        Self {
            direction: Direction::Rx,
            index,
        }
    }

    pub const fn tx(index: u8) -> Self {
        Self {
            direction: Direction::Tx,
            index,
        }
    }

    pub fn new(direction: Direction, index: u8) -> Self {
        Self { direction, index }
    }

    pub fn encode(self) -> i32 {
        ((self.index as i32) << 1) | self.direction.native()
    }

    /// Decode a native channel value. Negative values are rejected.
    pub fn decode(value: i32) -> Option<Self> {
        const MAX: i32 = ((u8::MAX as i32) << 1) | 1;
        if !(0..=MAX).contains(&value) {
            return None;
        }
        let direction = Direction::from_native(value & 1)?;
        Some(Self {
            direction,
            index: (value >> 1) as u8,
        })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.direction, self.index + 1)
    }
}

/// Stream channel layout: direction and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    #[default]
    RxX1,
    TxX1,
    RxX2,
    TxX2,
}

impl ChannelLayout {
    pub fn native(self) -> i32 {
        match self {
            ChannelLayout::RxX1 => 0,
            ChannelLayout::TxX1 => 1,
            ChannelLayout::RxX2 => 2,
            ChannelLayout::TxX2 => 3,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(ChannelLayout::RxX1),
            1 => Some(ChannelLayout::TxX1),
            2 => Some(ChannelLayout::RxX2),
            3 => Some(ChannelLayout::TxX2),
            _ => None,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::RxX2 => Direction::Rx,
            ChannelLayout::TxX1 | ChannelLayout::TxX2 => Direction::Tx,
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::TxX1 => 1,
            ChannelLayout::RxX2 | ChannelLayout::TxX2 => 2,
        }
    }
}

/// Sample format on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Format {
    /// Interleaved SC16 Q11 samples.
    #[default]
    #[serde(rename = "sc16_q11")]
    Sc16Q11,
    /// SC16 Q11 samples framed with a timestamp/flags header. Sync only.
    #[serde(rename = "sc16_q11_meta")]
    Sc16Q11Meta,
}

impl Format {
    pub fn native(self) -> i32 {
        match self {
            Format::Sc16Q11 => 0,
            Format::Sc16Q11Meta => 1,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(Format::Sc16Q11),
            1 => Some(Format::Sc16Q11Meta),
            _ => None,
        }
    }

    pub fn has_metadata(self) -> bool {
        self == Format::Sc16Q11Meta
    }
}

/// Gain control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainMode {
    #[default]
    Default,
    /// Manual gain control
    Mgc,
    FastAttackAgc,
    SlowAttackAgc,
    HybridAgc,
}

impl GainMode {
    pub fn native(self) -> i32 {
        match self {
            GainMode::Default => 0,
            GainMode::Mgc => 1,
            GainMode::FastAttackAgc => 2,
            GainMode::SlowAttackAgc => 3,
            GainMode::HybridAgc => 4,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(GainMode::Default),
            1 => Some(GainMode::Mgc),
            2 => Some(GainMode::FastAttackAgc),
            3 => Some(GainMode::SlowAttackAgc),
            4 => Some(GainMode::HybridAgc),
            _ => None,
        }
    }
}

/// Loopback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loopback {
    #[default]
    None,
    Firmware,
    BbTxlpfRxvga2,
    BbTxvga1Rxvga2,
    BbTxlpfRxlpf,
    BbTxvga1Rxlpf,
    RfLna1,
    RfLna2,
    RfLna3,
    RficBist,
}

impl Loopback {
    pub fn native(self) -> i32 {
        match self {
            Loopback::None => 0,
            Loopback::Firmware => 1,
            Loopback::BbTxlpfRxvga2 => 2,
            Loopback::BbTxvga1Rxvga2 => 3,
            Loopback::BbTxlpfRxlpf => 4,
            Loopback::BbTxvga1Rxlpf => 5,
            Loopback::RfLna1 => 6,
            Loopback::RfLna2 => 7,
            Loopback::RfLna3 => 8,
            Loopback::RficBist => 9,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(Loopback::None),
            1 => Some(Loopback::Firmware),
            2 => Some(Loopback::BbTxlpfRxvga2),
            3 => Some(Loopback::BbTxvga1Rxvga2),
            4 => Some(Loopback::BbTxlpfRxlpf),
            5 => Some(Loopback::BbTxvga1Rxlpf),
            6 => Some(Loopback::RfLna1),
            7 => Some(Loopback::RfLna2),
            8 => Some(Loopback::RfLna3),
            9 => Some(Loopback::RficBist),
            _ => None,
        }
    }
}

/// Driver backend a device was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Any,
    Linux,
    Libusb,
    Cypress,
    Dummy,
}

impl Backend {
    pub fn native(self) -> i32 {
        match self {
            Backend::Any => 0,
            Backend::Linux => 1,
            Backend::Libusb => 2,
            Backend::Cypress => 3,
            Backend::Dummy => 100,
        }
    }

    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(Backend::Any),
            1 => Some(Backend::Linux),
            2 => Some(Backend::Libusb),
            3 => Some(Backend::Cypress),
            100 => Some(Backend::Dummy),
            _ => None,
        }
    }

    /// Prefix used in device identifier strings.
    pub fn identifier_prefix(self) -> &'static str {
        match self {
            Backend::Any => "*",
            Backend::Linux => "linux",
            Backend::Libusb => "libusb",
            Backend::Cypress => "cypress",
            Backend::Dummy => "dummy",
        }
    }
}

/// Driver log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Verbose,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
    Silent,
}

impl Verbosity {
    pub fn native(self) -> i32 {
        match self {
            Verbosity::Verbose => 0,
            Verbosity::Debug => 1,
            Verbosity::Info => 2,
            Verbosity::Warning => 3,
            Verbosity::Error => 4,
            Verbosity::Critical => 5,
            Verbosity::Silent => 6,
        }
    }
}

/// A discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevInfo {
    pub backend: Backend,
    pub serial: String,
    pub usb_bus: u8,
    pub usb_addr: u8,
    pub instance: u32,
    pub manufacturer: String,
    pub product: String,
}

impl DevInfo {
    /// Identifier string accepted by `bladerf_open`, selecting this device by
    /// serial number.
    pub fn identifier(&self) -> String {
        format!("{}:serial={}", self.backend.identifier_prefix(), self.serial)
    }
}

/// Supported values for a parameter. Real values are `raw * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub scale: f32,
}

impl Range {
    pub fn min_value(&self) -> f64 {
        self.min as f64 * self.scale as f64
    }

    pub fn max_value(&self) -> f64 {
        self.max as f64 * self.scale as f64
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min_value() && value <= self.max_value()
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_value(), self.max_value())
    }
}

/// A named gain mode offered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainModeInfo {
    pub name: String,
    pub mode: GainMode,
}

/// A named loopback mode offered by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    pub name: String,
    pub mode: Loopback,
}

/// libbladeRF version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub describe: String,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.describe.is_empty() {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            f.write_str(&self.describe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_encoding() {
        assert_eq!(Channel::RX0.encode(), 0);
        assert_eq!(Channel::TX0.encode(), 1);
        assert_eq!(Channel::RX1.encode(), 2);
        assert_eq!(Channel::TX1.encode(), 3);
        assert_eq!(Channel::decode(3), Some(Channel::TX1));
        assert_eq!(Channel::decode(4), Some(Channel::rx(2)));
        assert_eq!(Channel::decode(-1), None);
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::RX0.to_string(), "RX1");
        assert_eq!(Channel::TX1.to_string(), "TX2");
    }

    #[test]
    fn test_layout_direction() {
        assert_eq!(ChannelLayout::RxX2.direction(), Direction::Rx);
        assert_eq!(ChannelLayout::TxX1.direction(), Direction::Tx);
        assert_eq!(ChannelLayout::TxX2.channel_count(), 2);
        for v in 0..4 {
            assert_eq!(ChannelLayout::from_native(v).unwrap().native(), v);
        }
    }

    #[test]
    fn test_native_values() {
        assert_eq!(Format::Sc16Q11Meta.native(), 1);
        assert_eq!(GainMode::from_native(2), Some(GainMode::FastAttackAgc));
        assert_eq!(Loopback::RficBist.native(), 9);
        assert_eq!(Backend::from_native(100), Some(Backend::Dummy));
        assert_eq!(Backend::from_native(42), None);
        assert_eq!(Verbosity::Silent.native(), 6);
    }

    #[test]
    fn test_devinfo_identifier() {
        let info = DevInfo {
            backend: Backend::Any,
            serial: "a662".to_string(),
            ..Default::default()
        };
        assert_eq!(info.identifier(), "*:serial=a662");
    }

    #[test]
    fn test_range() {
        let r = Range {
            min: 70_000_000,
            max: 6_000_000_000,
            step: 2,
            scale: 1.0,
        };
        assert!(r.contains(96.6e6));
        assert!(!r.contains(10e6));
        assert_eq!(r.clamp(10e9), 6e9);
    }

    #[test]
    fn test_format_serde() {
        let f: Format = serde_yaml::from_str("sc16_q11_meta").unwrap();
        assert_eq!(f, Format::Sc16Q11Meta);
        let l: ChannelLayout = serde_yaml::from_str("rx_x2").unwrap();
        assert_eq!(l, ChannelLayout::RxX2);
    }
}
