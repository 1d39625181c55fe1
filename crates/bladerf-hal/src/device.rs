//! # Device Handle
//!
//! [`DeviceHandle`] owns one open libbladeRF session. It is the lifecycle
//! anchor for the enumerator and both transfer engines: each of them holds a
//! clone of the handle and reaches the native device through it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bladerf_hal::{DeviceHandle, SimDriver};
//! use bladerf_core::Channel;
//!
//! let dev = DeviceHandle::open(Arc::new(SimDriver::new()), "")?;
//! dev.set_frequency(Channel::RX0, 96_600_000)?;
//! let actual = dev.set_sample_rate(Channel::RX0, 4_000_000)?;
//! dev.close()?;
//! ```
//!
//! After [`close`](DeviceHandle::close) every operation returns
//! `NotInitialized`; the native pointer is never touched again.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bladerf_core::config::ChannelSettings;
use bladerf_core::error::{translate, Error, ErrorKind, Result};
use bladerf_core::types::{
    Backend, Channel, DevInfo, Direction, GainMode, Loopback, Verbosity, Version,
};

use crate::driver::{fixed_str, write_fixed_str, DevicePtr, NativeDriver, RawDevInfo, RawVersion};
use crate::enumerate::CapabilityEnumerator;

struct DeviceShared {
    driver: Arc<dyn NativeDriver>,
    dev: RwLock<Option<DevicePtr>>,
    identifier: String,
    /// Streams initialized on this device and not yet torn down
    active_streams: AtomicUsize,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let slot = self.dev.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(dev) = slot.take() {
            // SAFETY: the pointer came from a successful open and was not closed.
            unsafe { self.driver.close(dev.0) };
            tracing::debug!(driver = self.driver.name(), identifier = %self.identifier, "Device closed on drop");
        }
    }
}

/// An open bladeRF device.
///
/// Cloning is cheap and shares the session. The device is closed by
/// [`close`](Self::close) or when the last clone is dropped.
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
}

impl DeviceHandle {
    /// Open a device by identifier string. An empty identifier opens the
    /// first device found.
    pub fn open(driver: Arc<dyn NativeDriver>, identifier: &str) -> Result<Self> {
        let c_identifier = CString::new(identifier)
            .map_err(|_| Error::native(ErrorKind::InvalidParameter))?;
        let id_ptr: *const c_char = if identifier.is_empty() {
            ptr::null()
        } else {
            c_identifier.as_ptr()
        };

        let mut dev: *mut c_void = ptr::null_mut();
        // SAFETY: `dev` is a valid out-pointer and `id_ptr` is null or a
        // NUL-terminated string that outlives the call.
        translate(unsafe { driver.open(&mut dev, id_ptr) })?;
        Self::from_raw(driver, dev, identifier.to_string())
    }

    /// Open the device described by `info`.
    pub fn open_with_devinfo(driver: Arc<dyn NativeDriver>, info: &DevInfo) -> Result<Self> {
        let mut raw = RawDevInfo {
            backend: info.backend.native(),
            usb_bus: info.usb_bus,
            usb_addr: info.usb_addr,
            instance: info.instance,
            ..Default::default()
        };
        write_fixed_str(&mut raw.serial, &info.serial);

        let mut dev: *mut c_void = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        translate(unsafe { driver.open_with_devinfo(&mut dev, &mut raw) })?;
        Self::from_raw(driver, dev, info.identifier())
    }

    fn from_raw(driver: Arc<dyn NativeDriver>, dev: *mut c_void, identifier: String) -> Result<Self> {
        if dev.is_null() {
            return Err(Error::native(ErrorKind::Unexpected));
        }
        tracing::info!(driver = driver.name(), identifier = %identifier, "Device opened");
        Ok(Self {
            shared: Arc::new(DeviceShared {
                driver,
                dev: RwLock::new(Some(DevicePtr(dev))),
                identifier,
                active_streams: AtomicUsize::new(0),
            }),
        })
    }

    /// Close the device. Closing twice is a no-op.
    ///
    /// Refused with `InvalidParameter` while a stream on this device is
    /// initialized.
    pub fn close(&self) -> Result<()> {
        let mut slot = self.shared.dev.write().unwrap_or_else(PoisonError::into_inner);
        // Streams register under the read lock, so the count is stable here.
        if self.shared.active_streams.load(Ordering::Acquire) > 0 {
            tracing::warn!(identifier = %self.shared.identifier, "Close refused: stream still initialized");
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        if let Some(dev) = slot.take() {
            // SAFETY: the pointer came from a successful open and was not closed.
            unsafe { self.shared.driver.close(dev.0) };
            tracing::info!(identifier = %self.shared.identifier, "Device closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .dev
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Identifier the device was opened with.
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub(crate) fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.shared.driver
    }

    /// Run `f` with the native device pointer, or fail with `NotInitialized`
    /// if the handle was closed. The device stays open for the duration.
    pub(crate) fn with_raw<T>(
        &self,
        f: impl FnOnce(&dyn NativeDriver, *mut c_void) -> Result<T>,
    ) -> Result<T> {
        let slot = self.shared.dev.read().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Some(dev) => f(self.shared.driver.as_ref(), dev.0),
            None => Err(Error::native(ErrorKind::NotInitialized)),
        }
    }

    /// Pin the device open for a new stream. Call from inside
    /// [`with_raw`](Self::with_raw) so it is ordered against `close`.
    pub(crate) fn stream_started(&self) {
        self.shared.active_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_released(&self) {
        self.shared.active_streams.fetch_sub(1, Ordering::AcqRel);
    }

    /// Capability queries on this device.
    pub fn capabilities(&self) -> CapabilityEnumerator<'_> {
        CapabilityEnumerator::new(self)
    }

    pub fn devinfo(&self) -> Result<DevInfo> {
        self.with_raw(|drv, dev| {
            let mut raw = RawDevInfo::default();
            // SAFETY: `raw` is a valid out-pointer.
            translate(unsafe { drv.get_devinfo(dev, &mut raw) })?;
            Ok(devinfo_from_raw(&raw))
        })
    }

    pub fn set_frequency(&self, channel: Channel, frequency_hz: u64) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.set_frequency(dev, channel.encode(), frequency_hz) })
        })
    }

    pub fn frequency(&self, channel: Channel) -> Result<u64> {
        self.with_raw(|drv, dev| {
            let mut value = 0u64;
            // SAFETY: `value` is a valid out-pointer.
            translate(unsafe { drv.get_frequency(dev, channel.encode(), &mut value) })?;
            Ok(value)
        })
    }

    /// Returns the rate the device actually settled on.
    pub fn set_sample_rate(&self, channel: Channel, rate_hz: u32) -> Result<u32> {
        self.with_raw(|drv, dev| {
            let mut actual: c_uint = 0;
            // SAFETY: `actual` is a valid out-pointer.
            translate(unsafe { drv.set_sample_rate(dev, channel.encode(), rate_hz, &mut actual) })?;
            Ok(actual)
        })
    }

    /// Returns the bandwidth the device actually settled on.
    pub fn set_bandwidth(&self, channel: Channel, bandwidth_hz: u32) -> Result<u32> {
        self.with_raw(|drv, dev| {
            let mut actual: c_uint = 0;
            // SAFETY: `actual` is a valid out-pointer.
            translate(unsafe { drv.set_bandwidth(dev, channel.encode(), bandwidth_hz, &mut actual) })?;
            Ok(actual)
        })
    }

    pub fn set_gain(&self, channel: Channel, gain_db: i32) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.set_gain(dev, channel.encode(), gain_db) })
        })
    }

    pub fn gain(&self, channel: Channel) -> Result<i32> {
        self.with_raw(|drv, dev| {
            let mut value: c_int = 0;
            // SAFETY: `value` is a valid out-pointer.
            translate(unsafe { drv.get_gain(dev, channel.encode(), &mut value) })?;
            Ok(value)
        })
    }

    pub fn set_gain_mode(&self, channel: Channel, mode: GainMode) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.set_gain_mode(dev, channel.encode(), mode.native()) })
        })
    }

    pub fn set_gain_stage(&self, channel: Channel, stage: &str, gain_db: i32) -> Result<()> {
        let stage = stage_name(stage)?;
        self.with_raw(|drv, dev| {
            // SAFETY: `stage` is NUL-terminated and outlives the call.
            translate(unsafe { drv.set_gain_stage(dev, channel.encode(), stage.as_ptr(), gain_db) })
        })
    }

    pub fn gain_stage(&self, channel: Channel, stage: &str) -> Result<i32> {
        let stage = stage_name(stage)?;
        self.with_raw(|drv, dev| {
            let mut value: c_int = 0;
            // SAFETY: as above; `value` is a valid out-pointer.
            translate(unsafe {
                drv.get_gain_stage(dev, channel.encode(), stage.as_ptr(), &mut value)
            })?;
            Ok(value)
        })
    }

    pub fn set_loopback(&self, mode: Loopback) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.set_loopback(dev, mode.native()) })
        })
    }

    pub fn loopback(&self) -> Result<Loopback> {
        self.with_raw(|drv, dev| {
            let mut value: c_int = 0;
            // SAFETY: `value` is a valid out-pointer.
            translate(unsafe { drv.get_loopback(dev, &mut value) })?;
            Loopback::from_native(value).ok_or_else(|| Error::native(ErrorKind::Unexpected))
        })
    }

    pub fn enable_module(&self, channel: Channel, enable: bool) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.enable_module(dev, channel.encode(), enable) })?;
            tracing::debug!(%channel, enable, "Module enable changed");
            Ok(())
        })
    }

    pub fn set_stream_timeout(&self, direction: Direction, timeout_ms: u32) -> Result<()> {
        self.with_raw(|drv, dev| {
            // SAFETY: `dev` is open.
            translate(unsafe { drv.set_stream_timeout(dev, direction.native(), timeout_ms) })
        })
    }

    pub fn stream_timeout(&self, direction: Direction) -> Result<u32> {
        self.with_raw(|drv, dev| {
            let mut value: c_uint = 0;
            // SAFETY: `value` is a valid out-pointer.
            translate(unsafe { drv.get_stream_timeout(dev, direction.native(), &mut value) })?;
            Ok(value)
        })
    }

    /// Apply frequency, sample rate, bandwidth, gain mode and gain, in that
    /// order, and return the settings the device actually accepted.
    ///
    /// Gain mode is only applied to RX channels; TX has no AGC.
    pub fn apply_channel_config(&self, settings: &ChannelSettings) -> Result<ChannelSettings> {
        let channel = settings.channel();
        let mut applied = settings.clone();

        self.set_frequency(channel, settings.frequency_hz)?;
        applied.frequency_hz = self.frequency(channel)?;
        applied.sample_rate_hz = self.set_sample_rate(channel, settings.sample_rate_hz)?;
        applied.bandwidth_hz = self.set_bandwidth(channel, settings.bandwidth_hz)?;
        if channel.direction == Direction::Rx {
            self.set_gain_mode(channel, settings.gain_mode)?;
        }
        if let Some(gain) = settings.gain_db {
            self.set_gain(channel, gain)?;
            applied.gain_db = Some(self.gain(channel)?);
        }

        tracing::info!(
            %channel,
            frequency_hz = applied.frequency_hz,
            sample_rate_hz = applied.sample_rate_hz,
            bandwidth_hz = applied.bandwidth_hz,
            gain_db = ?applied.gain_db,
            "Channel configured"
        );
        Ok(applied)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("driver", &self.shared.driver.name())
            .field("identifier", &self.shared.identifier)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Version of the loaded library.
pub fn library_version(driver: &dyn NativeDriver) -> Version {
    let mut raw = RawVersion::default();
    // SAFETY: `raw` is a valid out-pointer.
    unsafe { driver.version(&mut raw) };
    let describe = if raw.describe.is_null() {
        String::new()
    } else {
        // SAFETY: libbladeRF returns a static NUL-terminated string.
        unsafe { CStr::from_ptr(raw.describe) }
            .to_string_lossy()
            .into_owned()
    };
    Version {
        major: raw.major,
        minor: raw.minor,
        patch: raw.patch,
        describe,
    }
}

/// Set the library's own log level.
pub fn set_native_verbosity(driver: &dyn NativeDriver, level: Verbosity) {
    driver.log_set_verbosity(level.native());
}

pub(crate) fn devinfo_from_raw(raw: &RawDevInfo) -> DevInfo {
    DevInfo {
        backend: Backend::from_native(raw.backend).unwrap_or_default(),
        serial: fixed_str(&raw.serial),
        usb_bus: raw.usb_bus,
        usb_addr: raw.usb_addr,
        instance: raw.instance,
        manufacturer: fixed_str(&raw.manufacturer),
        product: fixed_str(&raw.product),
    }
}

pub(crate) fn stage_name(stage: &str) -> Result<CString> {
    CString::new(stage).map_err(|_| Error::native(ErrorKind::InvalidParameter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;

    fn open_sim() -> (Arc<SimDriver>, DeviceHandle) {
        let sim = Arc::new(SimDriver::new());
        let dev = DeviceHandle::open(sim.clone(), "").unwrap();
        (sim, dev)
    }

    #[test]
    fn test_open_close() {
        let (sim, dev) = open_sim();
        assert!(dev.is_open());
        assert_eq!(sim.open_devices(), 1);

        dev.close().unwrap();
        assert!(!dev.is_open());
        assert_eq!(sim.open_devices(), 0);

        // Second close is a no-op
        dev.close().unwrap();
        assert_eq!(sim.invalid_releases(), 0);
    }

    #[test]
    fn test_closed_handle_is_not_initialized() {
        let (sim, dev) = open_sim();
        dev.close().unwrap();

        let err = dev.set_frequency(Channel::RX0, 96_600_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(dev.devinfo().unwrap_err().kind(), ErrorKind::NotInitialized);
        assert_eq!(sim.calls("set_frequency"), 0);
    }

    #[test]
    fn test_drop_closes() {
        let sim = Arc::new(SimDriver::new());
        {
            let dev = DeviceHandle::open(sim.clone(), "").unwrap();
            let _clone = dev.clone();
            assert_eq!(sim.open_devices(), 1);
        }
        assert_eq!(sim.open_devices(), 0);
    }

    #[test]
    fn test_close_waits_for_stream_registration() {
        let (sim, dev) = open_sim();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let closer = dev.clone();
        let handle = std::thread::spawn(move || {
            ready_rx.recv().unwrap();
            closer.close()
        });

        // A stream registering while a close is already waiting on the lock
        dev.with_raw(|_, _| {
            ready_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            dev.stream_started();
            Ok(())
        })
        .unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(dev.is_open());
        assert_eq!(sim.open_devices(), 1);

        dev.stream_released();
        dev.close().unwrap();
        assert_eq!(sim.open_devices(), 0);
    }

    #[test]
    fn test_open_missing_device() {
        let sim = Arc::new(SimDriver::with_devices(Vec::new()));
        let err = DeviceHandle::open(sim, "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
    }

    #[test]
    fn test_open_with_devinfo() {
        let sim = Arc::new(SimDriver::new());
        let info = SimDriver::default_devinfo();
        let dev = DeviceHandle::open_with_devinfo(sim, &info).unwrap();
        let got = dev.devinfo().unwrap();
        assert_eq!(got.serial, info.serial);
        assert_eq!(got.backend, Backend::Dummy);
        assert_eq!(dev.identifier(), "dummy:serial=0000000000000000000000000000a662");
    }

    #[test]
    fn test_passthroughs() {
        let (_sim, dev) = open_sim();
        dev.set_gain_stage(Channel::RX0, "lna", 3).unwrap();
        assert_eq!(dev.gain_stage(Channel::RX0, "lna").unwrap(), 3);
        assert_eq!(
            dev.gain_stage(Channel::RX0, "txvga1").unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );

        dev.set_loopback(Loopback::Firmware).unwrap();
        assert_eq!(dev.loopback().unwrap(), Loopback::Firmware);

        dev.set_stream_timeout(Direction::Tx, 250).unwrap();
        assert_eq!(dev.stream_timeout(Direction::Tx).unwrap(), 250);

        assert_eq!(
            dev.set_gain_mode(Channel::TX0, GainMode::Mgc).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_apply_channel_config() {
        let (_sim, dev) = open_sim();
        let settings = ChannelSettings {
            bandwidth_hz: 100_000,
            gain_db: Some(200),
            ..Default::default()
        };
        let applied = dev.apply_channel_config(&settings).unwrap();
        assert_eq!(applied.frequency_hz, 96_600_000);
        assert_eq!(applied.sample_rate_hz, 4_000_000);
        // Clamped by the device
        assert_eq!(applied.bandwidth_hz, 200_000);
        assert_eq!(applied.gain_db, Some(60));
    }

    #[test]
    fn test_library_version_and_verbosity() {
        let sim = SimDriver::new();
        let version = library_version(&sim);
        assert_eq!((version.major, version.minor, version.patch), (2, 5, 0));
        assert_eq!(version.to_string(), "2.5.0-sim");

        set_native_verbosity(&sim, Verbosity::Debug);
        assert_eq!(sim.native_verbosity(), 1);
    }
}
