//! # Synchronous Transfers
//!
//! Blocking single-shot RX and TX over `bladerf_sync_*`.
//!
//! Each call owns a transient native buffer for its whole duration: it is
//! allocated, filled or drained, and dropped inside the call, on every exit
//! path. Results are copied out of it before it goes away, so nothing the
//! caller gets back aliases driver memory.
//!
//! ```text
//!   tx(&[i16]) ──► LE buffer ──► sync_tx ──► Metadata
//!   rx(n)      ──► buffer[n*2] ──► sync_rx ──► copy actual_count ──► Vec<Sc16>
//! ```

use std::ffi::c_void;
use std::time::Duration;

use bladerf_core::config::SyncConfig;
use bladerf_core::error::{translate, Error, ErrorKind, Result};
use bladerf_core::metadata::Metadata;
use bladerf_core::types::{Direction, Format, Sc16};

use crate::device::DeviceHandle;
use crate::driver::RawMetadata;

fn to_raw(meta: &Metadata) -> RawMetadata {
    RawMetadata {
        timestamp: meta.timestamp,
        flags: meta.flags,
        status: meta.status,
        actual_count: meta.actual_count,
        ..Default::default()
    }
}

fn from_raw(raw: &RawMetadata) -> Metadata {
    Metadata {
        timestamp: raw.timestamp,
        flags: raw.flags,
        status: raw.status,
        actual_count: raw.actual_count,
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

/// Blocking RX/TX on one device.
///
/// Calls on one handle must be serialized by the caller; the engine takes
/// `&mut self` for that reason.
#[derive(Debug)]
pub struct SyncTransferEngine {
    device: DeviceHandle,
    config: [Option<SyncConfig>; 2],
    last_timestamp: [Option<u64>; 2],
    timestamp_regressions: u64,
}

impl SyncTransferEngine {
    pub fn new(device: &DeviceHandle) -> Self {
        Self {
            device: device.clone(),
            config: [None, None],
            last_timestamp: [None, None],
            timestamp_regressions: 0,
        }
    }

    /// Apply `config` for the direction of its layout. Must be called, and
    /// the channel module enabled, before the first transfer.
    pub fn configure(&mut self, config: &SyncConfig) -> Result<()> {
        config.validate()?;
        self.device.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe {
                drv.sync_config(
                    dev,
                    config.layout.native(),
                    config.format.native(),
                    config.num_buffers,
                    config.buffer_size,
                    config.num_transfers,
                    config.timeout_ms,
                )
            })
        })?;

        let direction = config.layout.direction();
        self.config[direction.native() as usize] = Some(*config);
        self.last_timestamp[direction.native() as usize] = None;
        tracing::info!(
            layout = ?config.layout,
            format = ?config.format,
            num_buffers = config.num_buffers,
            buffer_size = config.buffer_size,
            num_transfers = config.num_transfers,
            "Sync interface configured"
        );
        Ok(())
    }

    pub fn config(&self, direction: Direction) -> Option<&SyncConfig> {
        self.config[direction.native() as usize].as_ref()
    }

    fn format(&self, direction: Direction) -> Result<Format> {
        self.config(direction)
            .map(|c| c.format)
            .ok_or_else(|| Error::native(ErrorKind::NotInitialized))
    }

    /// Metadata timestamps that went backwards since the engine was created.
    /// Tracking restarts for a direction when it is reconfigured.
    pub fn timestamp_regressions(&self) -> u64 {
        self.timestamp_regressions
    }

    /// Warn when the device hands back a timestamp that went backwards.
    fn track_timestamp(&mut self, direction: Direction, meta: &Metadata) {
        let slot = &mut self.last_timestamp[direction.native() as usize];
        if let Some(prev) = *slot {
            if meta.timestamp < prev {
                tracing::warn!(%direction, prev, timestamp = meta.timestamp, "Timestamp went backwards");
                self.timestamp_regressions += 1;
            }
        }
        *slot = Some(meta.timestamp);
    }

    /// Transmit interleaved I/Q samples (`samples[2i]` = I, `samples[2i+1]` = Q).
    ///
    /// An odd-length slice is rejected before the driver is called.
    pub fn tx(&mut self, samples: &[i16], meta: Metadata, timeout: Duration) -> Result<Metadata> {
        if samples.len() % 2 != 0 {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        let format = self.format(Direction::Tx)?;
        let count = samples.len() / 2;
        let num_samples =
            u32::try_from(count).map_err(|_| Error::native(ErrorKind::InvalidParameter))?;

        let updated = self.device.with_raw(|drv, dev| {
            let buffer: Vec<i16> = samples.iter().map(|s| s.to_le()).collect();
            let mut raw_meta = to_raw(&meta);
            // SAFETY: `buffer` holds `num_samples` pairs and outlives the call.
            translate(unsafe {
                drv.sync_tx(
                    dev,
                    buffer.as_ptr() as *const c_void,
                    num_samples,
                    &mut raw_meta,
                    timeout_ms(timeout),
                )
            })?;

            let mut updated = from_raw(&raw_meta);
            if !format.has_metadata() {
                updated.actual_count = num_samples;
            }
            Ok(updated)
        })?;

        if format.has_metadata() {
            self.track_timestamp(Direction::Tx, &updated);
        }
        tracing::trace!(samples = count, timestamp = updated.timestamp, "sync tx");
        Ok(updated)
    }

    /// Receive up to `count` samples.
    ///
    /// The result holds exactly `actual_count` samples. A failed call returns
    /// no samples.
    pub fn rx(
        &mut self,
        count: usize,
        meta: Metadata,
        timeout: Duration,
    ) -> Result<(Vec<Sc16>, Metadata)> {
        if count == 0 {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        let format = self.format(Direction::Rx)?;
        let num_samples =
            u32::try_from(count).map_err(|_| Error::native(ErrorKind::InvalidParameter))?;

        let (samples, updated) = self.device.with_raw(|drv, dev| {
            let mut buffer = vec![0i16; count * 2];
            let mut raw_meta = to_raw(&meta);
            // SAFETY: `buffer` has room for `num_samples` pairs.
            translate(unsafe {
                drv.sync_rx(
                    dev,
                    buffer.as_mut_ptr() as *mut c_void,
                    num_samples,
                    &mut raw_meta,
                    timeout_ms(timeout),
                )
            })?;

            let mut updated = from_raw(&raw_meta);
            if !format.has_metadata() {
                updated.actual_count = num_samples;
            }
            let actual = updated.actual_count as usize;
            if actual > count {
                return Err(Error::BufferSizeMismatch {
                    requested: count,
                    actual,
                });
            }

            let samples: Vec<Sc16> = buffer[..actual * 2]
                .chunks_exact(2)
                .map(|pair| Sc16::new(i16::from_le(pair[0]), i16::from_le(pair[1])))
                .collect();
            Ok((samples, updated))
        })?;

        if format.has_metadata() {
            self.track_timestamp(Direction::Rx, &updated);
        }
        tracing::trace!(requested = count, actual = samples.len(), "sync rx");
        Ok((samples, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use bladerf_core::metadata::{TX_BURST_END, TX_BURST_START};
    use bladerf_core::types::{Channel, ChannelLayout, Loopback};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn setup(format: Format) -> (Arc<SimDriver>, DeviceHandle, SyncTransferEngine) {
        let sim = Arc::new(SimDriver::new());
        let dev = DeviceHandle::open(sim.clone(), "").unwrap();
        let mut engine = SyncTransferEngine::new(&dev);
        for layout in [ChannelLayout::RxX1, ChannelLayout::TxX1] {
            engine
                .configure(&SyncConfig {
                    layout,
                    format,
                    ..Default::default()
                })
                .unwrap();
        }
        dev.enable_module(Channel::RX0, true).unwrap();
        dev.enable_module(Channel::TX0, true).unwrap();
        (sim, dev, engine)
    }

    #[test]
    fn test_odd_tx_rejected_before_native_call() {
        let (sim, _dev, mut engine) = setup(Format::Sc16Q11);
        let err = engine.tx(&[1, 2, 3], Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(sim.calls("sync_tx"), 0);
    }

    #[test]
    fn test_unconfigured_is_not_initialized() {
        let sim = Arc::new(SimDriver::new());
        let dev = DeviceHandle::open(sim.clone(), "").unwrap();
        let mut engine = SyncTransferEngine::new(&dev);
        let err = engine.rx(16, Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(sim.calls("sync_rx"), 0);
    }

    #[test]
    fn test_rx_length_matches_actual_count() {
        let (sim, _dev, mut engine) = setup(Format::Sc16Q11Meta);
        let (samples, meta) = engine.rx(4096, Metadata::rx_now(), TIMEOUT).unwrap();
        assert_eq!(samples.len(), 4096);
        assert_eq!(meta.actual_count, 4096);

        sim.set_short_read(Some(100));
        let (samples, meta) = engine.rx(4096, Metadata::rx_now(), TIMEOUT).unwrap();
        assert_eq!(meta.actual_count, 100);
        assert_eq!(samples.len(), 100);
    }

    #[test]
    fn test_rx_overreport_is_mismatch() {
        let (sim, _dev, mut engine) = setup(Format::Sc16Q11Meta);
        sim.set_overreport(true);
        let err = engine.rx(1024, Metadata::rx_now(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BufferSizeMismatch);
    }

    #[test]
    fn test_rx_tone() {
        let (_sim, _dev, mut engine) = setup(Format::Sc16Q11);
        let (samples, meta) = engine.rx(64, Metadata::default(), TIMEOUT).unwrap();
        assert_eq!(meta.actual_count, 64);
        assert_eq!(samples[0], Sc16::new(1024, 0));
        assert_eq!(samples[8], Sc16::new(0, 1024));
    }

    #[test]
    fn test_native_error_returns_no_samples() {
        let (sim, _dev, mut engine) = setup(Format::Sc16Q11);
        sim.fail_next("sync_rx", ErrorKind::Timeout, 1);
        let err = engine.rx(1024, Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), Some(-6));
    }

    #[test]
    fn test_disabled_module_times_out() {
        let (_sim, dev, mut engine) = setup(Format::Sc16Q11);
        dev.enable_module(Channel::RX0, false).unwrap();
        let err = engine.rx(1024, Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_closed_handle() {
        let (_sim, dev, mut engine) = setup(Format::Sc16Q11);
        dev.close().unwrap();
        let err = engine.tx(&[0, 0], Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        let err = engine.rx(16, Metadata::default(), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_tx_timestamp_in_past() {
        let (_sim, _dev, mut engine) = setup(Format::Sc16Q11Meta);
        let burst = vec![100i16; 2048];
        let meta = engine.tx(&burst, Metadata::tx_burst_at(5000), TIMEOUT).unwrap();
        assert_eq!(meta.actual_count, 1024);

        let err = engine.tx(&burst, Metadata::tx_burst_at(10), TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimestampInPast);
    }

    #[test]
    fn test_loopback_round_trip() {
        let (sim, dev, mut engine) = setup(Format::Sc16Q11Meta);
        dev.set_loopback(Loopback::Firmware).unwrap();

        let burst: Vec<i16> = (0..512).map(|i| i as i16).collect();
        let meta = Metadata {
            flags: TX_BURST_START | TX_BURST_END,
            ..Metadata::tx_burst_at(2000)
        };
        engine.tx(&burst, meta, TIMEOUT).unwrap();
        assert_eq!(sim.transmitted(), burst);

        let (samples, meta) = engine.rx(256, Metadata::rx_now(), TIMEOUT).unwrap();
        assert_eq!(meta.timestamp, 2000);
        assert_eq!(samples[0], Sc16::new(0, 1));
        assert_eq!(samples[255], Sc16::new(510, 511));
    }

    #[test]
    fn test_timestamp_regression_tracking() {
        let (_sim, dev, mut engine) = setup(Format::Sc16Q11Meta);
        let (_, first) = engine.rx(1024, Metadata::rx_now(), TIMEOUT).unwrap();
        let (_, second) = engine.rx(1024, Metadata::rx_now(), TIMEOUT).unwrap();
        assert!(second.timestamp > first.timestamp);
        assert_eq!(engine.timestamp_regressions(), 0);

        // A looped-back burst carries the earlier TX clock
        dev.set_loopback(Loopback::Firmware).unwrap();
        let burst = vec![7i16; 1024]; // 512 samples
        engine.tx(&burst, Metadata::tx_burst_now(), TIMEOUT).unwrap();
        let (_, looped) = engine.rx(512, Metadata::rx_now(), TIMEOUT).unwrap();
        assert!(looped.timestamp < second.timestamp);
        assert_eq!(engine.timestamp_regressions(), 1);

        // Back on the generator clock, ahead of the next burst
        let (_, ahead) = engine.rx(512, Metadata::rx_now(), TIMEOUT).unwrap();
        assert_eq!(engine.timestamp_regressions(), 1);

        // Reconfiguring RX forgets the previous timestamp
        engine
            .configure(&SyncConfig {
                layout: ChannelLayout::RxX1,
                format: Format::Sc16Q11Meta,
                ..Default::default()
            })
            .unwrap();
        engine.tx(&burst, Metadata::tx_burst_now(), TIMEOUT).unwrap();
        let (_, after) = engine.rx(512, Metadata::rx_now(), TIMEOUT).unwrap();
        assert!(after.timestamp < ahead.timestamp);
        assert_eq!(engine.timestamp_regressions(), 1);
    }

    #[test]
    fn test_invalid_sync_config() {
        let (sim, _dev, mut engine) = setup(Format::Sc16Q11);
        let before = sim.calls("sync_config");
        let err = engine
            .configure(&SyncConfig {
                num_transfers: 16,
                num_buffers: 16,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(sim.calls("sync_config"), before);
    }
}
