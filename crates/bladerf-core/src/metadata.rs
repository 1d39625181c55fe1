//! Per-transfer metadata.
//!
//! Passed to and returned from every sync transfer. With the
//! `Sc16Q11Meta` format the driver fills in `timestamp`, `status` and
//! `actual_count`; with plain `Sc16Q11` only `actual_count` is meaningful.

/// TX: first buffer of a burst.
pub const TX_BURST_START: u32 = 1 << 0;
/// TX: last buffer of a burst; the driver zero-pads the final block.
pub const TX_BURST_END: u32 = 1 << 1;
/// TX: transmit immediately instead of at `timestamp`.
pub const TX_NOW: u32 = 1 << 2;
/// TX: pad with zeros up to `timestamp` before transmitting.
pub const TX_UPDATE_TIMESTAMP: u32 = 1 << 3;

/// RX: return samples as soon as possible, ignoring `timestamp`.
pub const RX_NOW: u32 = 1 << 31;
/// RX (returned): the FPGA detected an underflow.
pub const RX_HW_UNDERFLOW: u32 = 1 << 0;
/// RX (returned): mini expansion GPIO 1 was high.
pub const RX_HW_MINIEXP1: u32 = 1 << 16;
/// RX (returned): mini expansion GPIO 2 was high.
pub const RX_HW_MINIEXP2: u32 = 1 << 17;

/// Status: samples were discarded on receive.
pub const STATUS_OVERRUN: u32 = 1 << 0;
/// Status: the transmit queue ran dry.
pub const STATUS_UNDERRUN: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Sample clock timestamp of the first sample in the block.
    pub timestamp: u64,
    pub flags: u32,
    pub status: u32,
    /// Samples actually transferred. Never exceeds the requested count.
    pub actual_count: u32,
}

impl Metadata {
    /// Receive whatever arrives next.
    pub fn rx_now() -> Self {
        Self {
            flags: RX_NOW,
            ..Default::default()
        }
    }

    /// Receive starting at `timestamp`.
    pub fn rx_at(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// A complete single-buffer burst sent immediately.
    pub fn tx_burst_now() -> Self {
        Self {
            flags: TX_BURST_START | TX_BURST_END | TX_NOW,
            ..Default::default()
        }
    }

    /// A complete single-buffer burst scheduled at `timestamp`.
    pub fn tx_burst_at(timestamp: u64) -> Self {
        Self {
            timestamp,
            flags: TX_BURST_START | TX_BURST_END,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn overrun(&self) -> bool {
        self.status & STATUS_OVERRUN != 0
    }

    pub fn underrun(&self) -> bool {
        self.status & STATUS_UNDERRUN != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(TX_BURST_START, 0x1);
        assert_eq!(TX_UPDATE_TIMESTAMP, 0x8);
        assert_eq!(RX_NOW, 0x8000_0000);
        assert_eq!(RX_HW_MINIEXP2, 0x2_0000);
    }

    #[test]
    fn test_constructors() {
        let md = Metadata::tx_burst_at(1000);
        assert!(md.has_flag(TX_BURST_START));
        assert!(md.has_flag(TX_BURST_END));
        assert!(!md.has_flag(TX_NOW));
        assert_eq!(md.timestamp, 1000);

        assert!(Metadata::rx_now().has_flag(RX_NOW));
        assert!(!Metadata::rx_at(5).has_flag(RX_NOW));
    }

    #[test]
    fn test_status_bits() {
        let md = Metadata {
            status: STATUS_OVERRUN,
            ..Default::default()
        };
        assert!(md.overrun());
        assert!(!md.underrun());
    }
}
