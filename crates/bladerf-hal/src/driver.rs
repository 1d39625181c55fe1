//! # Native Driver Interface
//!
//! [`NativeDriver`] is the C surface of libbladeRF that this crate consumes,
//! one method per function, with the same argument and return conventions:
//! integer status codes (negative on failure, or a count on success for the
//! enumeration calls) and raw out-pointers.
//!
//! Two implementations exist:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  DeviceHandle · CapabilityEnumerator · Sync · Stream      │
//! ├───────────────────────────────────────────────────────────┤
//! │                 NativeDriver (this trait)                 │
//! ├─────────────────────────────┬─────────────────────────────┤
//! │  LibBladeRf (libloading)    │  SimDriver (pure software)  │
//! └─────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! The `#[repr(C)]` records below mirror libbladeRF's public structs. Their
//! sizes are checked at compile time: the enumeration code walks arrays of
//! them by stride, so a layout drift would misread every entry after the
//! first.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::mem::size_of;

/// `struct bladerf_devinfo`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDevInfo {
    pub backend: c_int,
    pub serial: [c_char; SERIAL_LENGTH],
    pub usb_bus: u8,
    pub usb_addr: u8,
    pub instance: c_uint,
    pub manufacturer: [c_char; DESCRIPTION_LENGTH],
    pub product: [c_char; DESCRIPTION_LENGTH],
}

/// Serial number field width, including the terminating NUL.
pub const SERIAL_LENGTH: usize = 33;
/// Manufacturer/product field width, including the terminating NUL.
pub const DESCRIPTION_LENGTH: usize = 33;

impl Default for RawDevInfo {
    fn default() -> Self {
        Self {
            backend: 0,
            serial: [0; SERIAL_LENGTH],
            usb_bus: 0,
            usb_addr: 0,
            instance: 0,
            manufacturer: [0; DESCRIPTION_LENGTH],
            product: [0; DESCRIPTION_LENGTH],
        }
    }
}

/// `struct bladerf_metadata`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMetadata {
    pub timestamp: u64,
    pub flags: u32,
    pub status: u32,
    pub actual_count: c_uint,
    pub reserved: [u8; 32],
}

/// `struct bladerf_range`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRange {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub scale: f32,
}

/// `struct bladerf_gain_modes`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawGainMode {
    pub name: *const c_char,
    pub mode: c_int,
}

/// `struct bladerf_loopback_modes`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawLoopbackMode {
    pub name: *const c_char,
    pub mode: c_int,
}

/// `struct bladerf_version`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub describe: *const c_char,
}

impl Default for RawVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: 0,
            describe: std::ptr::null(),
        }
    }
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<RawDevInfo>() == 112);
    assert!(size_of::<RawMetadata>() == 56);
    assert!(size_of::<RawRange>() == 32);
    assert!(size_of::<RawGainMode>() == 16);
    assert!(size_of::<RawLoopbackMode>() == 16);
    assert!(size_of::<RawVersion>() == 16);
};

/// Stream callback return: stop streaming.
pub const STREAM_SHUTDOWN: *mut c_void = std::ptr::null_mut();

/// Stream callback return: no buffer this cycle.
pub const STREAM_NO_DATA: *mut c_void = usize::MAX as *mut c_void;

/// `bladerf_stream_cb`
pub type StreamCallback = unsafe extern "C" fn(
    dev: *mut c_void,
    stream: *mut c_void,
    meta: *mut RawMetadata,
    samples: *mut c_void,
    num_samples: usize,
    user_data: *mut c_void,
) -> *mut c_void;

/// Opaque `struct bladerf *`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePtr(pub *mut c_void);

// SAFETY: the pointer is only handed back to the driver, which owns the
// pointee. Calls on one device are issued one at a time by DeviceHandle users.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

/// Opaque `struct bladerf_stream *`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPtr(pub *mut c_void);

// SAFETY: as for DevicePtr; a stream is driven by exactly one StreamEngine.
unsafe impl Send for StreamPtr {}

/// The libbladeRF functions used by this crate.
///
/// # Safety
///
/// Methods taking raw pointers have the same requirements as the C function
/// of the same name: device and stream pointers must come from a successful
/// `open`/`init_stream` on the same driver and not have been released, and
/// every out-pointer must be valid for writes.
pub trait NativeDriver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    unsafe fn version(&self, version: *mut RawVersion);
    fn log_set_verbosity(&self, level: c_int);

    unsafe fn open(&self, device: *mut *mut c_void, identifier: *const c_char) -> c_int;
    unsafe fn open_with_devinfo(&self, device: *mut *mut c_void, info: *mut RawDevInfo) -> c_int;
    unsafe fn close(&self, dev: *mut c_void);
    unsafe fn get_devinfo(&self, dev: *mut c_void, info: *mut RawDevInfo) -> c_int;

    /// Returns the number of devices, writing a driver-allocated array to
    /// `devices` that must be released with `free_device_list`.
    unsafe fn get_device_list(&self, devices: *mut *mut RawDevInfo) -> c_int;
    unsafe fn get_bootloader_list(&self, devices: *mut *mut RawDevInfo) -> c_int;
    unsafe fn free_device_list(&self, devices: *mut RawDevInfo);

    unsafe fn set_frequency(&self, dev: *mut c_void, ch: c_int, frequency: u64) -> c_int;
    unsafe fn get_frequency(&self, dev: *mut c_void, ch: c_int, frequency: *mut u64) -> c_int;
    unsafe fn set_sample_rate(
        &self,
        dev: *mut c_void,
        ch: c_int,
        rate: c_uint,
        actual: *mut c_uint,
    ) -> c_int;
    unsafe fn set_bandwidth(
        &self,
        dev: *mut c_void,
        ch: c_int,
        bandwidth: c_uint,
        actual: *mut c_uint,
    ) -> c_int;
    unsafe fn set_gain(&self, dev: *mut c_void, ch: c_int, gain: c_int) -> c_int;
    unsafe fn get_gain(&self, dev: *mut c_void, ch: c_int, gain: *mut c_int) -> c_int;
    unsafe fn set_gain_mode(&self, dev: *mut c_void, ch: c_int, mode: c_int) -> c_int;
    unsafe fn set_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: c_int,
    ) -> c_int;
    unsafe fn get_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: *mut c_int,
    ) -> c_int;
    unsafe fn set_loopback(&self, dev: *mut c_void, mode: c_int) -> c_int;
    unsafe fn get_loopback(&self, dev: *mut c_void, mode: *mut c_int) -> c_int;

    /// Writes up to `count` stage name pointers into `stages` and returns the
    /// total number of stages. `stages` may be null when `count` is 0.
    unsafe fn get_gain_stages(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stages: *mut *const c_char,
        count: usize,
    ) -> c_int;
    /// Returns the number of modes; `modes` receives a driver-owned array.
    unsafe fn get_gain_modes(
        &self,
        dev: *mut c_void,
        ch: c_int,
        modes: *mut *const RawGainMode,
    ) -> c_int;
    unsafe fn get_loopback_modes(
        &self,
        dev: *mut c_void,
        modes: *mut *const RawLoopbackMode,
    ) -> c_int;
    unsafe fn get_gain_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int;
    unsafe fn get_gain_stage_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        range: *mut *const RawRange,
    ) -> c_int;
    unsafe fn get_sample_rate_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int;
    unsafe fn get_frequency_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int;
    unsafe fn get_bandwidth_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int;

    unsafe fn enable_module(&self, dev: *mut c_void, ch: c_int, enable: bool) -> c_int;

    #[allow(clippy::too_many_arguments)]
    unsafe fn sync_config(
        &self,
        dev: *mut c_void,
        layout: c_int,
        format: c_int,
        num_buffers: c_uint,
        buffer_size: c_uint,
        num_transfers: c_uint,
        timeout_ms: c_uint,
    ) -> c_int;
    unsafe fn sync_tx(
        &self,
        dev: *mut c_void,
        samples: *const c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        timeout_ms: c_uint,
    ) -> c_int;
    unsafe fn sync_rx(
        &self,
        dev: *mut c_void,
        samples: *mut c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        timeout_ms: c_uint,
    ) -> c_int;

    /// Allocates the stream and its buffer pool; `buffers` receives an array
    /// of `num_buffers` pointers owned by the driver until `deinit_stream`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn init_stream(
        &self,
        stream: *mut *mut c_void,
        dev: *mut c_void,
        callback: StreamCallback,
        buffers: *mut *mut *mut c_void,
        num_buffers: usize,
        format: c_int,
        samples_per_buffer: usize,
        num_transfers: usize,
        user_data: *mut c_void,
    ) -> c_int;
    /// Blocks until the callback returns `STREAM_SHUTDOWN` or an error occurs.
    unsafe fn stream(&self, stream: *mut c_void, layout: c_int) -> c_int;
    unsafe fn deinit_stream(&self, stream: *mut c_void);

    unsafe fn set_stream_timeout(&self, dev: *mut c_void, dir: c_int, timeout_ms: c_uint) -> c_int;
    unsafe fn get_stream_timeout(
        &self,
        dev: *mut c_void,
        dir: c_int,
        timeout_ms: *mut c_uint,
    ) -> c_int;
}

/// Text up to the first NUL of a fixed-width C char field.
pub(crate) fn fixed_str(field: &[c_char]) -> String {
    let bytes: Vec<u8> = field.iter().map(|&c| c as u8).collect();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Copy `value` into a fixed-width C char field, truncating and always
/// leaving a terminating NUL.
pub(crate) fn write_fixed_str(field: &mut [c_char], value: &str) {
    field.fill(0);
    let max = field.len().saturating_sub(1);
    for (dst, &src) in field.iter_mut().zip(value.as_bytes().iter().take(max)) {
        *dst = src as c_char;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_str_stops_at_nul() {
        let mut field = [0 as c_char; SERIAL_LENGTH];
        write_fixed_str(&mut field, "a662");
        assert_eq!(fixed_str(&field), "a662");

        field[1] = 0;
        assert_eq!(fixed_str(&field), "a");
    }

    #[test]
    fn test_fixed_str_truncates() {
        let long = "x".repeat(40);
        let mut field = [0 as c_char; SERIAL_LENGTH];
        write_fixed_str(&mut field, &long);
        assert_eq!(fixed_str(&field).len(), SERIAL_LENGTH - 1);
        assert_eq!(field[SERIAL_LENGTH - 1], 0);
    }

    #[test]
    fn test_sentinels_are_distinct() {
        assert!(STREAM_SHUTDOWN.is_null());
        assert!(!STREAM_NO_DATA.is_null());
        assert_ne!(STREAM_SHUTDOWN, STREAM_NO_DATA);
    }
}
