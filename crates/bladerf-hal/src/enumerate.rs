//! # Capability Enumeration
//!
//! Decodes the driver's counted arrays into owned collections: gain stages,
//! gain modes, loopback modes, ranges, and device lists.
//!
//! libbladeRF arrays carry no terminator and no record size. The driver
//! returns a base pointer and a count, and every record is read at
//! `base + i * stride`. The stride used here is `size_of` of the
//! `#[repr(C)]` mirror, which is pinned at compile time in `driver.rs` and
//! checked again at run time by [`decode_records`]. Only fields inside a
//! record (names, serials) are NUL-scanned.
//!
//! Nothing is cached: every call goes to the driver, since a firmware or
//! FPGA change can alter what the device reports.

use std::ffi::{c_char, CStr};
use std::mem::size_of;
use std::ptr;

use bladerf_core::error::{check_count, translate, Error, ErrorKind, Result};
use bladerf_core::types::{Channel, DevInfo, GainMode, GainModeInfo, Loopback, LoopbackInfo, Range};

use crate::device::{devinfo_from_raw, stage_name, DeviceHandle};
use crate::driver::{NativeDriver, RawDevInfo, RawGainMode, RawLoopbackMode, RawRange};

/// Expected native record sizes on 64-bit targets.
const DEVINFO_STRIDE: usize = 112;
const GAIN_MODE_STRIDE: usize = 16;
const LOOPBACK_MODE_STRIDE: usize = 16;

/// Read `count` records of `T` starting at `base`.
///
/// Fails with `Unexpected` when `T`'s size differs from the stride the
/// native side is known to use, or when a non-empty array has a null base.
///
/// # Safety
///
/// `base` must point to at least `count` initialized records of `T`.
unsafe fn decode_records<T: Copy>(base: *const T, count: usize, stride: usize) -> Result<Vec<T>> {
    if cfg!(target_pointer_width = "64") && size_of::<T>() != stride {
        tracing::error!(
            expected = stride,
            actual = size_of::<T>(),
            "Native record size mismatch"
        );
        return Err(Error::native(ErrorKind::Unexpected));
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    if base.is_null() {
        return Err(Error::native(ErrorKind::Unexpected));
    }
    Ok((0..count).map(|i| *base.add(i)).collect())
}

/// Copy a NUL-terminated name out of driver memory.
///
/// # Safety
///
/// `name` must be null or point to a NUL-terminated string.
unsafe fn c_name(name: *const c_char) -> String {
    if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

fn to_range(raw: &RawRange) -> Range {
    Range {
        min: raw.min,
        max: raw.max,
        step: raw.step,
        scale: raw.scale,
    }
}

/// Capability queries against one open device.
pub struct CapabilityEnumerator<'a> {
    device: &'a DeviceHandle,
}

impl<'a> CapabilityEnumerator<'a> {
    pub fn new(device: &'a DeviceHandle) -> Self {
        Self { device }
    }

    /// Names of the gain stages on `channel`, in driver order.
    pub fn gain_stages(&self, channel: Channel) -> Result<Vec<String>> {
        let ch = channel.encode();
        self.device.with_raw(|drv, dev| {
            // SAFETY: a null array with capacity 0 only asks for the count.
            let count = check_count(unsafe { drv.get_gain_stages(dev, ch, ptr::null_mut(), 0) })?;
            if count == 0 {
                return Ok(Vec::new());
            }

            let mut names: Vec<*const c_char> = vec![ptr::null(); count];
            // SAFETY: `names` has room for `count` pointers.
            let filled =
                check_count(unsafe { drv.get_gain_stages(dev, ch, names.as_mut_ptr(), count) })?;
            names.truncate(filled.min(count));

            // SAFETY: the driver filled these with static NUL-terminated names.
            Ok(names.into_iter().map(|p| unsafe { c_name(p) }).collect())
        })
    }

    /// Gain modes offered by `channel`. Channels without AGC return an empty
    /// list.
    pub fn gain_modes(&self, channel: Channel) -> Result<Vec<GainModeInfo>> {
        let ch = channel.encode();
        self.device.with_raw(|drv, dev| {
            let mut base: *const RawGainMode = ptr::null();
            // SAFETY: `base` is a valid out-pointer.
            let count = check_count(unsafe { drv.get_gain_modes(dev, ch, &mut base) })?;
            // SAFETY: the driver reports `count` records at `base`.
            let raw = unsafe { decode_records(base, count, GAIN_MODE_STRIDE) }?;
            raw.iter()
                .map(|m| -> Result<GainModeInfo> {
                    let mode = GainMode::from_native(m.mode)
                        .ok_or_else(|| Error::native(ErrorKind::Unexpected))?;
                    Ok(GainModeInfo {
                        // SAFETY: names are static strings owned by the driver.
                        name: unsafe { c_name(m.name) },
                        mode,
                    })
                })
                .collect()
        })
    }

    /// Loopback modes supported by the device.
    pub fn loopback_modes(&self) -> Result<Vec<LoopbackInfo>> {
        self.device.with_raw(|drv, dev| {
            let mut base: *const RawLoopbackMode = ptr::null();
            // SAFETY: `base` is a valid out-pointer.
            let count = check_count(unsafe { drv.get_loopback_modes(dev, &mut base) })?;
            // SAFETY: the driver reports `count` records at `base`.
            let raw = unsafe { decode_records(base, count, LOOPBACK_MODE_STRIDE) }?;
            raw.iter()
                .map(|m| -> Result<LoopbackInfo> {
                    let mode = Loopback::from_native(m.mode)
                        .ok_or_else(|| Error::native(ErrorKind::Unexpected))?;
                    Ok(LoopbackInfo {
                        // SAFETY: names are static strings owned by the driver.
                        name: unsafe { c_name(m.name) },
                        mode,
                    })
                })
                .collect()
        })
    }

    pub fn gain_range(&self, channel: Channel) -> Result<Range> {
        self.range(|drv, dev, out| unsafe { drv.get_gain_range(dev, channel.encode(), out) })
    }

    pub fn gain_stage_range(&self, channel: Channel, stage: &str) -> Result<Range> {
        let stage = stage_name(stage)?;
        self.range(|drv, dev, out| unsafe {
            drv.get_gain_stage_range(dev, channel.encode(), stage.as_ptr(), out)
        })
    }

    pub fn sample_rate_range(&self, channel: Channel) -> Result<Range> {
        self.range(|drv, dev, out| unsafe { drv.get_sample_rate_range(dev, channel.encode(), out) })
    }

    pub fn frequency_range(&self, channel: Channel) -> Result<Range> {
        self.range(|drv, dev, out| unsafe { drv.get_frequency_range(dev, channel.encode(), out) })
    }

    pub fn bandwidth_range(&self, channel: Channel) -> Result<Range> {
        self.range(|drv, dev, out| unsafe { drv.get_bandwidth_range(dev, channel.encode(), out) })
    }

    /// Run a range query. Callers pass an `unsafe` closure around the driver
    /// call; its only pointer argument is the out-pointer provided here.
    fn range(
        &self,
        query: impl FnOnce(&dyn NativeDriver, *mut std::ffi::c_void, *mut *const RawRange) -> i32,
    ) -> Result<Range> {
        self.device.with_raw(|drv, dev| {
            let mut raw: *const RawRange = ptr::null();
            translate(query(drv, dev, &mut raw))?;
            if raw.is_null() {
                return Err(Error::native(ErrorKind::Unexpected));
            }
            // SAFETY: the driver returned a pointer to a static range.
            Ok(to_range(unsafe { &*raw }))
        })
    }
}

/// Devices attached to the host. No devices is an empty list, not an error.
pub fn device_list(driver: &dyn NativeDriver) -> Result<Vec<DevInfo>> {
    // SAFETY: the list function and its matching free come from one driver.
    unsafe { list_with(driver, |drv, out| drv.get_device_list(out)) }
}

/// Devices currently in bootloader mode.
pub fn bootloader_list(driver: &dyn NativeDriver) -> Result<Vec<DevInfo>> {
    // SAFETY: as for device_list.
    unsafe { list_with(driver, |drv, out| drv.get_bootloader_list(out)) }
}

/// # Safety
///
/// `query` must return a list that is released by `free_device_list`.
unsafe fn list_with(
    driver: &dyn NativeDriver,
    query: impl FnOnce(&dyn NativeDriver, *mut *mut RawDevInfo) -> i32,
) -> Result<Vec<DevInfo>> {
    let mut base: *mut RawDevInfo = ptr::null_mut();
    let status = query(driver, &mut base);
    let count = match check_count(status) {
        Ok(count) => count,
        Err(err) if err.kind() == ErrorKind::NoDevice => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let decoded = decode_records(base as *const RawDevInfo, count, DEVINFO_STRIDE);
    // The list is released before any decode error is returned.
    if !base.is_null() {
        driver.free_device_list(base);
    }
    let devices: Vec<DevInfo> = decoded?.iter().map(devinfo_from_raw).collect();
    tracing::debug!(count = devices.len(), "Device list read");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use bladerf_core::types::Backend;
    use std::sync::Arc;

    fn open_sim() -> (Arc<SimDriver>, DeviceHandle) {
        let sim = Arc::new(SimDriver::new());
        let dev = DeviceHandle::open(sim.clone(), "").unwrap();
        (sim, dev)
    }

    #[test]
    fn test_gain_stages_two_calls() {
        let (sim, dev) = open_sim();
        let stages = dev.capabilities().gain_stages(Channel::RX0).unwrap();
        assert_eq!(stages, vec!["lna", "rxvga1", "rxvga2"]);
        assert_eq!(sim.calls("get_gain_stages"), 2);

        let tx = dev.capabilities().gain_stages(Channel::TX0).unwrap();
        assert_eq!(tx, vec!["txvga1", "txvga2"]);
    }

    #[test]
    fn test_empty_gain_modes() {
        let (_sim, dev) = open_sim();
        let modes = dev.capabilities().gain_modes(Channel::TX0).unwrap();
        assert!(modes.is_empty());

        let rx = dev.capabilities().gain_modes(Channel::RX0).unwrap();
        assert_eq!(rx.len(), 5);
        assert_eq!(rx[1].name, "manual");
        assert_eq!(rx[1].mode, GainMode::Mgc);
    }

    #[test]
    fn test_loopback_modes() {
        let (_sim, dev) = open_sim();
        let modes = dev.capabilities().loopback_modes().unwrap();
        assert_eq!(modes.len(), 9);
        assert_eq!(modes[0].mode, Loopback::None);
        assert_eq!(modes[8].name, "rf_lna3");
    }

    #[test]
    fn test_ranges() {
        let (_sim, dev) = open_sim();
        let caps = dev.capabilities();
        let freq = caps.frequency_range(Channel::RX0).unwrap();
        assert_eq!(freq.min, 70_000_000);
        assert!(freq.contains(2.4e9));
        assert!(!freq.contains(10e6));

        let stage = caps.gain_stage_range(Channel::TX0, "txvga1").unwrap();
        assert_eq!((stage.min, stage.max), (-35, -4));
        assert_eq!(stage.clamp(0.0), -4.0);

        let err = caps.gain_stage_range(Channel::RX0, "bogus").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_closed_device() {
        let (_sim, dev) = open_sim();
        dev.close().unwrap();
        let err = dev.capabilities().gain_stages(Channel::RX0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_device_list_is_freed() {
        let mut second = SimDriver::default_devinfo();
        second.serial = "b2".to_string();
        second.backend = Backend::Libusb;
        let sim = SimDriver::with_devices(vec![SimDriver::default_devinfo(), second]);

        let devices = device_list(&sim).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].serial, "b2");
        assert_eq!(devices[1].backend, Backend::Libusb);
        assert_eq!(devices[0].manufacturer, "Nuand");
        assert_eq!(sim.live_device_lists(), 0);
        assert_eq!(sim.invalid_releases(), 0);
    }

    #[test]
    fn test_no_devices_is_empty() {
        let sim = SimDriver::with_devices(Vec::new());
        assert!(device_list(&sim).unwrap().is_empty());
        assert!(bootloader_list(&sim).unwrap().is_empty());
    }

    #[test]
    fn test_list_error_propagates() {
        let sim = SimDriver::new();
        sim.fail_next("get_device_list", ErrorKind::PermissionDenied, 1);
        let err = device_list(&sim).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_stride_guard() {
        #[derive(Clone, Copy, Debug)]
        struct Wrong(#[allow(dead_code)] u8);
        let records = [Wrong(1)];
        let err = unsafe { decode_records(records.as_ptr(), 1, GAIN_MODE_STRIDE) };
        if cfg!(target_pointer_width = "64") {
            assert_eq!(err.unwrap_err().kind(), ErrorKind::Unexpected);
        }
    }
}
