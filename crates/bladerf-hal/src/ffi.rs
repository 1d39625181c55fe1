//! # libbladeRF Bindings
//!
//! Dynamic bindings to libbladeRF, loaded at runtime with `libloading` so the
//! same binary works with or without the library installed. Tests and demos
//! fall back to [`SimDriver`](crate::sim::SimDriver) when it is missing.
//!
//! ## Library Functions
//!
//! - `bladerf_version`, `bladerf_log_set_verbosity`
//! - `bladerf_open`, `bladerf_open_with_devinfo`, `bladerf_close`, `bladerf_get_devinfo`
//! - `bladerf_get_device_list`, `bladerf_get_bootloader_list`, `bladerf_free_device_list`
//! - frequency, sample rate, bandwidth, gain, gain mode, gain stage and loopback control
//! - gain stage/mode, loopback mode and range queries
//! - `bladerf_enable_module`, `bladerf_sync_config`, `bladerf_sync_tx`, `bladerf_sync_rx`
//! - `bladerf_init_stream`, `bladerf_stream`, `bladerf_deinit_stream`
//! - `bladerf_set_stream_timeout`, `bladerf_get_stream_timeout`

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::path::Path;

use libloading::Library;

use bladerf_core::error::{Error, Result};

use crate::driver::{
    NativeDriver, RawDevInfo, RawGainMode, RawLoopbackMode, RawMetadata, RawRange, RawVersion,
    StreamCallback,
};

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["libbladeRF.so.2", "libbladeRF.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["libbladeRF.dylib", "libbladeRF.2.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["bladeRF.dll"];

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const LIB_NAMES: &[&str] = &["libbladeRF.so"];

type VersionFn = unsafe extern "C" fn(*mut RawVersion);
type LogSetVerbosityFn = unsafe extern "C" fn(c_int);
type OpenFn = unsafe extern "C" fn(*mut *mut c_void, *const c_char) -> c_int;
type OpenWithDevinfoFn = unsafe extern "C" fn(*mut *mut c_void, *mut RawDevInfo) -> c_int;
type CloseFn = unsafe extern "C" fn(*mut c_void);
type GetDevinfoFn = unsafe extern "C" fn(*mut c_void, *mut RawDevInfo) -> c_int;
type DeviceListFn = unsafe extern "C" fn(*mut *mut RawDevInfo) -> c_int;
type FreeDeviceListFn = unsafe extern "C" fn(*mut RawDevInfo);
type SetU64Fn = unsafe extern "C" fn(*mut c_void, c_int, u64) -> c_int;
type GetU64Fn = unsafe extern "C" fn(*mut c_void, c_int, *mut u64) -> c_int;
type SetActualFn = unsafe extern "C" fn(*mut c_void, c_int, c_uint, *mut c_uint) -> c_int;
type SetIntFn = unsafe extern "C" fn(*mut c_void, c_int, c_int) -> c_int;
type GetIntFn = unsafe extern "C" fn(*mut c_void, c_int, *mut c_int) -> c_int;
type SetStageFn = unsafe extern "C" fn(*mut c_void, c_int, *const c_char, c_int) -> c_int;
type GetStageFn = unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *mut c_int) -> c_int;
type SetLoopbackFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type GetLoopbackFn = unsafe extern "C" fn(*mut c_void, *mut c_int) -> c_int;
type GainStagesFn = unsafe extern "C" fn(*mut c_void, c_int, *mut *const c_char, usize) -> c_int;
type GainModesFn = unsafe extern "C" fn(*mut c_void, c_int, *mut *const RawGainMode) -> c_int;
type LoopbackModesFn = unsafe extern "C" fn(*mut c_void, *mut *const RawLoopbackMode) -> c_int;
type RangeFn = unsafe extern "C" fn(*mut c_void, c_int, *mut *const RawRange) -> c_int;
type StageRangeFn =
    unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *mut *const RawRange) -> c_int;
type EnableModuleFn = unsafe extern "C" fn(*mut c_void, c_int, bool) -> c_int;
type SyncConfigFn =
    unsafe extern "C" fn(*mut c_void, c_int, c_int, c_uint, c_uint, c_uint, c_uint) -> c_int;
type SyncTxFn =
    unsafe extern "C" fn(*mut c_void, *const c_void, c_uint, *mut RawMetadata, c_uint) -> c_int;
type SyncRxFn =
    unsafe extern "C" fn(*mut c_void, *mut c_void, c_uint, *mut RawMetadata, c_uint) -> c_int;
type InitStreamFn = unsafe extern "C" fn(
    *mut *mut c_void,
    *mut c_void,
    StreamCallback,
    *mut *mut *mut c_void,
    usize,
    c_int,
    usize,
    usize,
    *mut c_void,
) -> c_int;
type StreamFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type DeinitStreamFn = unsafe extern "C" fn(*mut c_void);
type SetStreamTimeoutFn = unsafe extern "C" fn(*mut c_void, c_int, c_uint) -> c_int;
type GetStreamTimeoutFn = unsafe extern "C" fn(*mut c_void, c_int, *mut c_uint) -> c_int;

/// Resolve a symbol and copy the function pointer out of it.
macro_rules! symbol {
    ($lib:expr, $ty:ty, $name:literal) => {{
        // SAFETY: the declared type matches the libbladeRF prototype.
        let sym = unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }
            .map_err(|e| Error::LibraryNotFound(format!("missing symbol {}: {}", $name, e)))?;
        *sym
    }};
}

/// A loaded libbladeRF.
///
/// Function pointers are copied out of the library at load time and stay
/// valid for as long as `_lib` is held.
pub struct LibBladeRf {
    path: String,
    version: VersionFn,
    log_set_verbosity: LogSetVerbosityFn,
    open: OpenFn,
    open_with_devinfo: OpenWithDevinfoFn,
    close: CloseFn,
    get_devinfo: GetDevinfoFn,
    get_device_list: DeviceListFn,
    get_bootloader_list: DeviceListFn,
    free_device_list: FreeDeviceListFn,
    set_frequency: SetU64Fn,
    get_frequency: GetU64Fn,
    set_sample_rate: SetActualFn,
    set_bandwidth: SetActualFn,
    set_gain: SetIntFn,
    get_gain: GetIntFn,
    set_gain_mode: SetIntFn,
    set_gain_stage: SetStageFn,
    get_gain_stage: GetStageFn,
    set_loopback: SetLoopbackFn,
    get_loopback: GetLoopbackFn,
    get_gain_stages: GainStagesFn,
    get_gain_modes: GainModesFn,
    get_loopback_modes: LoopbackModesFn,
    get_gain_range: RangeFn,
    get_gain_stage_range: StageRangeFn,
    get_sample_rate_range: RangeFn,
    get_frequency_range: RangeFn,
    get_bandwidth_range: RangeFn,
    enable_module: EnableModuleFn,
    sync_config: SyncConfigFn,
    sync_tx: SyncTxFn,
    sync_rx: SyncRxFn,
    init_stream: InitStreamFn,
    stream: StreamFn,
    deinit_stream: DeinitStreamFn,
    set_stream_timeout: SetStreamTimeoutFn,
    get_stream_timeout: GetStreamTimeoutFn,
    _lib: Library,
}

impl LibBladeRf {
    /// Load libbladeRF from the platform's usual names.
    pub fn load() -> Result<Self> {
        let mut last_error = String::from("no candidate library names");
        for name in LIB_NAMES {
            match Self::load_named(name) {
                Ok(lib) => return Ok(lib),
                Err(e) => {
                    tracing::debug!("libbladeRF candidate {} rejected: {}", name, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(Error::LibraryNotFound(last_error))
    }

    /// Load libbladeRF from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_named(&path.to_string_lossy())
    }

    fn load_named(name: &str) -> Result<Self> {
        // SAFETY: loading runs the library's initializers; libbladeRF has no
        // unusual load-time requirements.
        let lib = unsafe { Library::new(name) }
            .map_err(|e| Error::LibraryNotFound(format!("{}: {}", name, e)))?;

        let loaded = Self {
            path: name.to_string(),
            version: symbol!(lib, VersionFn, "bladerf_version"),
            log_set_verbosity: symbol!(lib, LogSetVerbosityFn, "bladerf_log_set_verbosity"),
            open: symbol!(lib, OpenFn, "bladerf_open"),
            open_with_devinfo: symbol!(lib, OpenWithDevinfoFn, "bladerf_open_with_devinfo"),
            close: symbol!(lib, CloseFn, "bladerf_close"),
            get_devinfo: symbol!(lib, GetDevinfoFn, "bladerf_get_devinfo"),
            get_device_list: symbol!(lib, DeviceListFn, "bladerf_get_device_list"),
            get_bootloader_list: symbol!(lib, DeviceListFn, "bladerf_get_bootloader_list"),
            free_device_list: symbol!(lib, FreeDeviceListFn, "bladerf_free_device_list"),
            set_frequency: symbol!(lib, SetU64Fn, "bladerf_set_frequency"),
            get_frequency: symbol!(lib, GetU64Fn, "bladerf_get_frequency"),
            set_sample_rate: symbol!(lib, SetActualFn, "bladerf_set_sample_rate"),
            set_bandwidth: symbol!(lib, SetActualFn, "bladerf_set_bandwidth"),
            set_gain: symbol!(lib, SetIntFn, "bladerf_set_gain"),
            get_gain: symbol!(lib, GetIntFn, "bladerf_get_gain"),
            set_gain_mode: symbol!(lib, SetIntFn, "bladerf_set_gain_mode"),
            set_gain_stage: symbol!(lib, SetStageFn, "bladerf_set_gain_stage"),
            get_gain_stage: symbol!(lib, GetStageFn, "bladerf_get_gain_stage"),
            set_loopback: symbol!(lib, SetLoopbackFn, "bladerf_set_loopback"),
            get_loopback: symbol!(lib, GetLoopbackFn, "bladerf_get_loopback"),
            get_gain_stages: symbol!(lib, GainStagesFn, "bladerf_get_gain_stages"),
            get_gain_modes: symbol!(lib, GainModesFn, "bladerf_get_gain_modes"),
            get_loopback_modes: symbol!(lib, LoopbackModesFn, "bladerf_get_loopback_modes"),
            get_gain_range: symbol!(lib, RangeFn, "bladerf_get_gain_range"),
            get_gain_stage_range: symbol!(lib, StageRangeFn, "bladerf_get_gain_stage_range"),
            get_sample_rate_range: symbol!(lib, RangeFn, "bladerf_get_sample_rate_range"),
            get_frequency_range: symbol!(lib, RangeFn, "bladerf_get_frequency_range"),
            get_bandwidth_range: symbol!(lib, RangeFn, "bladerf_get_bandwidth_range"),
            enable_module: symbol!(lib, EnableModuleFn, "bladerf_enable_module"),
            sync_config: symbol!(lib, SyncConfigFn, "bladerf_sync_config"),
            sync_tx: symbol!(lib, SyncTxFn, "bladerf_sync_tx"),
            sync_rx: symbol!(lib, SyncRxFn, "bladerf_sync_rx"),
            init_stream: symbol!(lib, InitStreamFn, "bladerf_init_stream"),
            stream: symbol!(lib, StreamFn, "bladerf_stream"),
            deinit_stream: symbol!(lib, DeinitStreamFn, "bladerf_deinit_stream"),
            set_stream_timeout: symbol!(lib, SetStreamTimeoutFn, "bladerf_set_stream_timeout"),
            get_stream_timeout: symbol!(lib, GetStreamTimeoutFn, "bladerf_get_stream_timeout"),
            _lib: lib,
        };

        tracing::info!("Loaded libbladeRF: {}", name);
        Ok(loaded)
    }

    /// Path or name the library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for LibBladeRf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibBladeRf").field("path", &self.path).finish()
    }
}

impl NativeDriver for LibBladeRf {
    fn name(&self) -> &str {
        "libbladeRF"
    }

    unsafe fn version(&self, version: *mut RawVersion) {
        (self.version)(version)
    }

    fn log_set_verbosity(&self, level: c_int) {
        // SAFETY: takes a plain integer.
        unsafe { (self.log_set_verbosity)(level) }
    }

    unsafe fn open(&self, device: *mut *mut c_void, identifier: *const c_char) -> c_int {
        (self.open)(device, identifier)
    }

    unsafe fn open_with_devinfo(&self, device: *mut *mut c_void, info: *mut RawDevInfo) -> c_int {
        (self.open_with_devinfo)(device, info)
    }

    unsafe fn close(&self, dev: *mut c_void) {
        (self.close)(dev)
    }

    unsafe fn get_devinfo(&self, dev: *mut c_void, info: *mut RawDevInfo) -> c_int {
        (self.get_devinfo)(dev, info)
    }

    unsafe fn get_device_list(&self, devices: *mut *mut RawDevInfo) -> c_int {
        (self.get_device_list)(devices)
    }

    unsafe fn get_bootloader_list(&self, devices: *mut *mut RawDevInfo) -> c_int {
        (self.get_bootloader_list)(devices)
    }

    unsafe fn free_device_list(&self, devices: *mut RawDevInfo) {
        (self.free_device_list)(devices)
    }

    unsafe fn set_frequency(&self, dev: *mut c_void, ch: c_int, frequency: u64) -> c_int {
        (self.set_frequency)(dev, ch, frequency)
    }

    unsafe fn get_frequency(&self, dev: *mut c_void, ch: c_int, frequency: *mut u64) -> c_int {
        (self.get_frequency)(dev, ch, frequency)
    }

    unsafe fn set_sample_rate(
        &self,
        dev: *mut c_void,
        ch: c_int,
        rate: c_uint,
        actual: *mut c_uint,
    ) -> c_int {
        (self.set_sample_rate)(dev, ch, rate, actual)
    }

    unsafe fn set_bandwidth(
        &self,
        dev: *mut c_void,
        ch: c_int,
        bandwidth: c_uint,
        actual: *mut c_uint,
    ) -> c_int {
        (self.set_bandwidth)(dev, ch, bandwidth, actual)
    }

    unsafe fn set_gain(&self, dev: *mut c_void, ch: c_int, gain: c_int) -> c_int {
        (self.set_gain)(dev, ch, gain)
    }

    unsafe fn get_gain(&self, dev: *mut c_void, ch: c_int, gain: *mut c_int) -> c_int {
        (self.get_gain)(dev, ch, gain)
    }

    unsafe fn set_gain_mode(&self, dev: *mut c_void, ch: c_int, mode: c_int) -> c_int {
        (self.set_gain_mode)(dev, ch, mode)
    }

    unsafe fn set_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: c_int,
    ) -> c_int {
        (self.set_gain_stage)(dev, ch, stage, gain)
    }

    unsafe fn get_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: *mut c_int,
    ) -> c_int {
        (self.get_gain_stage)(dev, ch, stage, gain)
    }

    unsafe fn set_loopback(&self, dev: *mut c_void, mode: c_int) -> c_int {
        (self.set_loopback)(dev, mode)
    }

    unsafe fn get_loopback(&self, dev: *mut c_void, mode: *mut c_int) -> c_int {
        (self.get_loopback)(dev, mode)
    }

    unsafe fn get_gain_stages(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stages: *mut *const c_char,
        count: usize,
    ) -> c_int {
        (self.get_gain_stages)(dev, ch, stages, count)
    }

    unsafe fn get_gain_modes(
        &self,
        dev: *mut c_void,
        ch: c_int,
        modes: *mut *const RawGainMode,
    ) -> c_int {
        (self.get_gain_modes)(dev, ch, modes)
    }

    unsafe fn get_loopback_modes(
        &self,
        dev: *mut c_void,
        modes: *mut *const RawLoopbackMode,
    ) -> c_int {
        (self.get_loopback_modes)(dev, modes)
    }

    unsafe fn get_gain_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        (self.get_gain_range)(dev, ch, range)
    }

    unsafe fn get_gain_stage_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        range: *mut *const RawRange,
    ) -> c_int {
        (self.get_gain_stage_range)(dev, ch, stage, range)
    }

    unsafe fn get_sample_rate_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        (self.get_sample_rate_range)(dev, ch, range)
    }

    unsafe fn get_frequency_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        (self.get_frequency_range)(dev, ch, range)
    }

    unsafe fn get_bandwidth_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        (self.get_bandwidth_range)(dev, ch, range)
    }

    unsafe fn enable_module(&self, dev: *mut c_void, ch: c_int, enable: bool) -> c_int {
        (self.enable_module)(dev, ch, enable)
    }

    unsafe fn sync_config(
        &self,
        dev: *mut c_void,
        layout: c_int,
        format: c_int,
        num_buffers: c_uint,
        buffer_size: c_uint,
        num_transfers: c_uint,
        timeout_ms: c_uint,
    ) -> c_int {
        (self.sync_config)(
            dev,
            layout,
            format,
            num_buffers,
            buffer_size,
            num_transfers,
            timeout_ms,
        )
    }

    unsafe fn sync_tx(
        &self,
        dev: *mut c_void,
        samples: *const c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        timeout_ms: c_uint,
    ) -> c_int {
        (self.sync_tx)(dev, samples, num_samples, meta, timeout_ms)
    }

    unsafe fn sync_rx(
        &self,
        dev: *mut c_void,
        samples: *mut c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        timeout_ms: c_uint,
    ) -> c_int {
        (self.sync_rx)(dev, samples, num_samples, meta, timeout_ms)
    }

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
    ) -> c_int {
        (self.init_stream)(
            stream,
            dev,
            callback,
            buffers,
            num_buffers,
            format,
            samples_per_buffer,
            num_transfers,
            user_data,
        )
    }

    unsafe fn stream(&self, stream: *mut c_void, layout: c_int) -> c_int {
        (self.stream)(stream, layout)
    }

    unsafe fn deinit_stream(&self, stream: *mut c_void) {
        (self.deinit_stream)(stream)
    }

    unsafe fn set_stream_timeout(&self, dev: *mut c_void, dir: c_int, timeout_ms: c_uint) -> c_int {
        (self.set_stream_timeout)(dev, dir, timeout_ms)
    }

    unsafe fn get_stream_timeout(
        &self,
        dev: *mut c_void,
        dir: c_int,
        timeout_ms: *mut c_uint,
    ) -> c_int {
        (self.get_stream_timeout)(dev, dir, timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_library_not_found() {
        let err = LibBladeRf::load_from(Path::new("/nonexistent/libbladeRF.so")).unwrap_err();
        assert!(matches!(err, Error::LibraryNotFound(_)));
        assert_eq!(err.kind(), bladerf_core::ErrorKind::FileNotFound);
    }

    #[test]
    fn test_library_availability() {
        match LibBladeRf::load() {
            Ok(lib) => println!("libbladeRF is available at {}", lib.path()),
            Err(e) => println!("libbladeRF not available (expected on most dev machines): {}", e),
        }
    }
}
