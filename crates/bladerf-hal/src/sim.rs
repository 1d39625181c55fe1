//! Software bladeRF
//!
//! A pure-software [`NativeDriver`] that behaves like libbladeRF on the dummy
//! backend. Every component of this crate runs against it in tests, and the
//! demos fall back to it when libbladeRF is not installed.
//!
//! ## Features
//!
//! - Device and bootloader lists, open by identifier or devinfo
//! - Per-channel frequency, sample rate, bandwidth, gain and gain stages,
//!   with libbladeRF-style range checking
//! - Gain mode, loopback mode and range tables with stable addresses
//! - Sync RX/TX with timestamps and the metadata format
//! - The async stream drive loop, calling back through the real callback ABI
//! - Fault injection and bookkeeping counters for tests
//!
//! ## Data Path
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimDriver                         │
//! │                                                          │
//! │  sync_tx / TX stream ──► wire blocks ──► loopback queue  │
//! │           │                                   │          │
//! │           ▼                                   ▼          │
//! │     transmitted()          sync_rx / RX stream ◄── tone  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! RX reads drain the loopback queue when a loopback mode is active and fall
//! back to a deterministic tone otherwise.

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bladerf_core::error::ErrorKind;
use bladerf_core::metadata::{RX_NOW, TX_NOW};
use bladerf_core::types::{Backend, Channel, ChannelLayout, DevInfo, Direction, Format, GainMode, Loopback};
use bladerf_core::wire::{self, MetaHeader};

use crate::driver::{
    write_fixed_str, NativeDriver, RawDevInfo, RawGainMode, RawLoopbackMode, RawMetadata,
    RawRange, RawVersion, StreamCallback, STREAM_NO_DATA,
};

const RX_STAGES: &[(&CStr, i64, i64)] = &[(c"lna", 0, 6), (c"rxvga1", 5, 30), (c"rxvga2", 0, 30)];
const TX_STAGES: &[(&CStr, i64, i64)] = &[(c"txvga1", -35, -4), (c"txvga2", 0, 25)];

const RX_GAIN_MODES: &[(&CStr, GainMode)] = &[
    (c"automatic", GainMode::Default),
    (c"manual", GainMode::Mgc),
    (c"fast", GainMode::FastAttackAgc),
    (c"slow", GainMode::SlowAttackAgc),
    (c"hybrid", GainMode::HybridAgc),
];

const LOOPBACK_MODES: &[(&CStr, Loopback)] = &[
    (c"none", Loopback::None),
    (c"firmware", Loopback::Firmware),
    (c"bb_txlpf_rxvga2", Loopback::BbTxlpfRxvga2),
    (c"bb_txvga1_rxvga2", Loopback::BbTxvga1Rxvga2),
    (c"bb_txlpf_rxlpf", Loopback::BbTxlpfRxlpf),
    (c"bb_txvga1_rxlpf", Loopback::BbTxvga1Rxlpf),
    (c"rf_lna1", Loopback::RfLna1),
    (c"rf_lna2", Loopback::RfLna2),
    (c"rf_lna3", Loopback::RfLna3),
];

const FREQUENCY_RANGE: RawRange = RawRange { min: 70_000_000, max: 6_000_000_000, step: 2, scale: 1.0 };
const SAMPLE_RATE_RANGE: RawRange = RawRange { min: 520_834, max: 61_440_000, step: 2, scale: 1.0 };
const BANDWIDTH_RANGE: RawRange = RawRange { min: 200_000, max: 56_000_000, step: 1, scale: 1.0 };
const RX_GAIN_RANGE: RawRange = RawRange { min: -15, max: 60, step: 1, scale: 1.0 };
const TX_GAIN_RANGE: RawRange = RawRange { min: -24, max: 66, step: 1, scale: 1.0 };

/// Channels per direction on the simulated board.
const CHANNELS_PER_DIRECTION: u8 = 2;

/// Tone period of the RX generator, in samples.
const TONE_PERIOD: u64 = 32;
const TONE_AMPLITUDE: f32 = 1024.0;

#[inline]
fn code(kind: ErrorKind) -> c_int {
    kind.code().unwrap_or(-1)
}

/// I/Q of the generator tone at absolute sample time `t`.
fn tone(t: u64) -> (i16, i16) {
    let phase = (t % TONE_PERIOD) as f32 * TAU / TONE_PERIOD as f32;
    (
        (TONE_AMPLITUDE * phase.cos()).round() as i16,
        (TONE_AMPLITUDE * phase.sin()).round() as i16,
    )
}

/// Driver-owned descriptor arrays. Addresses handed to callers stay valid for
/// the driver's lifetime.
struct Tables {
    rx_stage_ranges: Vec<RawRange>,
    tx_stage_ranges: Vec<RawRange>,
    rx_gain_modes: Vec<RawGainMode>,
    loopback_modes: Vec<RawLoopbackMode>,
    frequency: RawRange,
    sample_rate: RawRange,
    bandwidth: RawRange,
    rx_gain: RawRange,
    tx_gain: RawRange,
}

// SAFETY: the raw pointers refer to 'static C string literals and the tables
// are never mutated after construction.
unsafe impl Send for Tables {}
unsafe impl Sync for Tables {}

impl Tables {
    fn new() -> Self {
        fn stage_range(&(_, min, max): &(&CStr, i64, i64)) -> RawRange {
            RawRange {
                min,
                max,
                step: 1,
                scale: 1.0,
            }
        }

        Self {
            rx_stage_ranges: RX_STAGES.iter().map(stage_range).collect(),
            tx_stage_ranges: TX_STAGES.iter().map(stage_range).collect(),
            rx_gain_modes: RX_GAIN_MODES
                .iter()
                .map(|(name, mode)| RawGainMode {
                    name: name.as_ptr(),
                    mode: mode.native(),
                })
                .collect(),
            loopback_modes: LOOPBACK_MODES
                .iter()
                .map(|(name, mode)| RawLoopbackMode {
                    name: name.as_ptr(),
                    mode: mode.native(),
                })
                .collect(),
            frequency: FREQUENCY_RANGE,
            sample_rate: SAMPLE_RATE_RANGE,
            bandwidth: BANDWIDTH_RANGE,
            rx_gain: RX_GAIN_RANGE,
            tx_gain: TX_GAIN_RANGE,
        }
    }

    fn stages(direction: Direction) -> &'static [(&'static CStr, i64, i64)] {
        match direction {
            Direction::Rx => RX_STAGES,
            Direction::Tx => TX_STAGES,
        }
    }

    fn stage_ranges(&self, direction: Direction) -> &[RawRange] {
        match direction {
            Direction::Rx => &self.rx_stage_ranges,
            Direction::Tx => &self.tx_stage_ranges,
        }
    }

    fn gain_range(&self, direction: Direction) -> &RawRange {
        match direction {
            Direction::Rx => &self.rx_gain,
            Direction::Tx => &self.tx_gain,
        }
    }
}

#[derive(Debug, Clone)]
struct SimChannel {
    frequency: u64,
    sample_rate: u32,
    bandwidth: u32,
    gain: i32,
    gain_mode: i32,
    stage_gains: Vec<i32>,
    enabled: bool,
}

impl SimChannel {
    fn new(direction: Direction) -> Self {
        Self {
            frequency: 2_400_000_000,
            sample_rate: 30_720_000,
            bandwidth: 18_000_000,
            gain: 0,
            gain_mode: GainMode::Default.native(),
            stage_gains: Tables::stages(direction)
                .iter()
                .map(|&(_, min, _)| min as i32)
                .collect(),
            enabled: false,
        }
    }
}

struct SimDevice {
    info: DevInfo,
    channels: HashMap<c_int, SimChannel>,
    loopback: c_int,
    /// Sync format per direction, set by `sync_config`
    sync: [Option<Format>; 2],
    rx_clock: u64,
    tx_clock: u64,
    /// Encoded TX blocks waiting to be looped back to RX
    loopback_queue: VecDeque<Vec<u8>>,
    stream_timeout: [c_uint; 2],
}

impl SimDevice {
    fn new(info: DevInfo) -> Self {
        Self {
            info,
            channels: HashMap::new(),
            loopback: Loopback::None.native(),
            sync: [None, None],
            rx_clock: 0,
            tx_clock: 0,
            loopback_queue: VecDeque::new(),
            stream_timeout: [1000, 1000],
        }
    }

    fn channel(&mut self, ch: c_int) -> Option<(Direction, &mut SimChannel)> {
        let channel = Channel::decode(ch)?;
        if channel.index >= CHANNELS_PER_DIRECTION {
            return None;
        }
        let state = self
            .channels
            .entry(ch)
            .or_insert_with(|| SimChannel::new(channel.direction));
        Some((channel.direction, state))
    }

    fn enabled(&self, direction: Direction) -> bool {
        self.channels
            .get(&Channel::new(direction, 0).encode())
            .is_some_and(|c| c.enabled)
    }

    /// Queue transmitted samples for loopback when a loopback path is set.
    fn transmit(&mut self, timestamp: u64, flags: u32, samples: &[i16]) {
        if self.loopback != Loopback::None.native() {
            let header = MetaHeader { timestamp, flags };
            self.loopback_queue
                .push_back(wire::encode_meta_block(&header, samples));
        }
    }

    /// Fill `out` with received samples and return the timestamp of the
    /// first one. Looped-back data takes priority over the tone.
    fn receive(&mut self, out: &mut [i16]) -> Result<u64, c_int> {
        let count = out.len() / 2;
        let mut timestamp = self.rx_clock;

        if self.loopback != Loopback::None.native() && !self.loopback_queue.is_empty() {
            let mut filled = 0;
            while filled < count {
                let Some(block) = self.loopback_queue.pop_front() else {
                    break;
                };
                let (header, samples) =
                    wire::decode_meta_block(&block).map_err(|_| code(ErrorKind::Unexpected))?;
                if filled == 0 {
                    timestamp = header.timestamp;
                }
                let pairs = samples.len() / 2;
                let take = pairs.min(count - filled);
                out[filled * 2..(filled + take) * 2].copy_from_slice(&samples[..take * 2]);
                filled += take;
                if take < pairs {
                    let rest = MetaHeader {
                        timestamp: header.timestamp + take as u64,
                        flags: header.flags,
                    };
                    self.loopback_queue
                        .push_front(wire::encode_meta_block(&rest, &samples[take * 2..]));
                }
            }
            out[filled * 2..].fill(0);
        } else {
            for (k, pair) in out.chunks_exact_mut(2).enumerate() {
                let (i, q) = tone(self.rx_clock + k as u64);
                pair[0] = i;
                pair[1] = q;
            }
        }

        self.rx_clock = self.rx_clock.max(timestamp) + count as u64;
        Ok(timestamp)
    }
}

struct SimStream {
    device: usize,
    callback: StreamCallback,
    user_data: usize,
    samples_per_buffer: usize,
    num_transfers: usize,
    /// Backing storage for the pool; `pool_ptrs` points into it
    _pool: Vec<Vec<i16>>,
    pool_ptrs: Vec<*mut c_void>,
}

// SAFETY: the pool pointers refer to heap buffers owned by the same struct.
unsafe impl Send for SimStream {}

#[derive(Default)]
struct SimState {
    devices: HashMap<usize, SimDevice>,
    streams: HashMap<usize, SimStream>,
    device_lists: HashMap<usize, Box<[RawDevInfo]>>,
    next_id: usize,
    faults: HashMap<&'static str, (c_int, usize)>,
    calls: HashMap<&'static str, usize>,
    short_read: Option<u32>,
    overreport: bool,
    transmitted: Vec<i16>,
    invalid_releases: usize,
}

impl SimState {
    /// Count the call and return an injected failure, if one is armed.
    fn enter(&mut self, op: &'static str) -> Option<c_int> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(op) {
            Some((code, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*code)
            }
            _ => None,
        }
    }

    fn allocate_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }
}

/// Simulated libbladeRF.
pub struct SimDriver {
    devices: Vec<DevInfo>,
    bootloaders: Vec<DevInfo>,
    tables: Tables,
    state: Mutex<SimState>,
    verbosity: AtomicI32,
    callbacks: AtomicU64,
}

impl SimDriver {
    /// One device on the dummy backend.
    pub fn new() -> Self {
        Self::with_devices(vec![Self::default_devinfo()])
    }

    pub fn with_devices(devices: Vec<DevInfo>) -> Self {
        Self {
            devices,
            bootloaders: Vec::new(),
            tables: Tables::new(),
            state: Mutex::new(SimState::default()),
            verbosity: AtomicI32::new(2),
            callbacks: AtomicU64::new(0),
        }
    }

    pub fn with_bootloaders(mut self, bootloaders: Vec<DevInfo>) -> Self {
        self.bootloaders = bootloaders;
        self
    }

    pub fn default_devinfo() -> DevInfo {
        DevInfo {
            backend: Backend::Dummy,
            serial: "0000000000000000000000000000a662".to_string(),
            usb_bus: 1,
            usb_addr: 4,
            instance: 0,
            manufacturer: "Nuand".to_string(),
            product: "bladeRF 2.0 (simulated)".to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` calls of `op` return `kind`'s code.
    ///
    /// `op` is the `NativeDriver` method name, e.g. `"sync_rx"` or `"stream"`.
    pub fn fail_next(&self, op: &'static str, kind: ErrorKind, times: usize) {
        self.fail_next_code(op, code(kind), times);
    }

    /// Like [`fail_next`](Self::fail_next) with a raw status code.
    pub fn fail_next_code(&self, op: &'static str, status: c_int, times: usize) {
        self.state().faults.insert(op, (status, times));
    }

    /// Metadata-format RX reports at most this many samples.
    pub fn set_short_read(&self, limit: Option<u32>) {
        self.state().short_read = limit;
    }

    /// Metadata-format RX reports one sample more than requested.
    pub fn set_overreport(&self, enabled: bool) {
        self.state().overreport = enabled;
    }

    /// Number of times `op` was called.
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn open_devices(&self) -> usize {
        self.state().devices.len()
    }

    /// Streams initialized and not yet deinitialized.
    pub fn live_streams(&self) -> usize {
        self.state().streams.len()
    }

    pub fn live_device_lists(&self) -> usize {
        self.state().device_lists.len()
    }

    /// Releases of unknown or already released handles, streams and lists.
    pub fn invalid_releases(&self) -> usize {
        self.state().invalid_releases
    }

    /// Stream callback invocations across all streams.
    pub fn callback_invocations(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    /// Every sample transmitted so far, interleaved.
    pub fn transmitted(&self) -> Vec<i16> {
        self.state().transmitted.clone()
    }

    /// Last level passed to `log_set_verbosity`.
    pub fn native_verbosity(&self) -> c_int {
        self.verbosity.load(Ordering::Relaxed)
    }

    fn to_raw(info: &DevInfo) -> RawDevInfo {
        let mut raw = RawDevInfo {
            backend: info.backend.native(),
            usb_bus: info.usb_bus,
            usb_addr: info.usb_addr,
            instance: info.instance,
            ..Default::default()
        };
        write_fixed_str(&mut raw.serial, &info.serial);
        write_fixed_str(&mut raw.manufacturer, &info.manufacturer);
        write_fixed_str(&mut raw.product, &info.product);
        raw
    }

    /// Pick a device the way `bladerf_open` does: empty identifier means the
    /// first device, otherwise match on the `serial=` prefix.
    fn find_device(&self, identifier: &str) -> Option<DevInfo> {
        let serial = identifier
            .split([':', ' '])
            .find_map(|part| part.strip_prefix("serial="));
        match serial {
            Some(prefix) => self
                .devices
                .iter()
                .find(|d| d.serial.starts_with(prefix))
                .cloned(),
            None => self.devices.first().cloned(),
        }
    }

    fn open_info(&self, device: *mut *mut c_void, info: Option<DevInfo>) -> c_int {
        let Some(info) = info else {
            return code(ErrorKind::NoDevice);
        };
        if device.is_null() {
            return code(ErrorKind::InvalidParameter);
        }
        let mut st = self.state();
        let id = st.allocate_id();
        tracing::debug!(id, serial = %info.serial, "sim: device opened");
        st.devices.insert(id, SimDevice::new(info));
        // SAFETY: checked non-null; caller guarantees it is writable.
        unsafe { *device = id as *mut c_void };
        0
    }

    fn list(&self, op: &'static str, infos: &[DevInfo], devices: *mut *mut RawDevInfo) -> c_int {
        let mut st = self.state();
        if let Some(status) = st.enter(op) {
            return status;
        }
        if infos.is_empty() {
            return code(ErrorKind::NoDevice);
        }
        if devices.is_null() {
            return code(ErrorKind::InvalidParameter);
        }
        let mut list: Box<[RawDevInfo]> = infos.iter().map(Self::to_raw).collect();
        let ptr = list.as_mut_ptr();
        st.device_lists.insert(ptr as usize, list);
        // SAFETY: checked non-null.
        unsafe { *devices = ptr };
        infos.len() as c_int
    }

    /// Run `f` on a channel of an open device.
    fn with_channel(
        &self,
        op: &'static str,
        dev: *mut c_void,
        ch: c_int,
        f: impl FnOnce(&Tables, Direction, &mut SimChannel) -> c_int,
    ) -> c_int {
        let mut st = self.state();
        if let Some(status) = st.enter(op) {
            return status;
        }
        let Some(device) = st.devices.get_mut(&(dev as usize)) else {
            return code(ErrorKind::InvalidParameter);
        };
        match device.channel(ch) {
            Some((direction, channel)) => f(&self.tables, direction, channel),
            None => code(ErrorKind::InvalidParameter),
        }
    }

    /// Run `f` on an open device.
    fn with_device(
        &self,
        op: &'static str,
        dev: *mut c_void,
        f: impl FnOnce(&mut SimState, usize) -> c_int,
    ) -> c_int {
        let mut st = self.state();
        if let Some(status) = st.enter(op) {
            return status;
        }
        let id = dev as usize;
        if !st.devices.contains_key(&id) {
            return code(ErrorKind::InvalidParameter);
        }
        f(&mut st, id)
    }

    fn stage_index(direction: Direction, stage: *const c_char) -> Option<usize> {
        if stage.is_null() {
            return None;
        }
        // SAFETY: caller passes a NUL-terminated stage name.
        let name = unsafe { CStr::from_ptr(stage) };
        Tables::stages(direction).iter().position(|&(s, _, _)| s == name)
    }

    fn write_range(range: *mut *const RawRange, value: &RawRange) -> c_int {
        if range.is_null() {
            return code(ErrorKind::InvalidParameter);
        }
        // SAFETY: checked non-null.
        unsafe { *range = value as *const RawRange };
        0
    }

    /// Every call starts by submitting `pool[0..num_transfers)`, then
    /// resubmits whatever each callback returns. Completions arrive in
    /// submission order. With nothing left in flight the call times out.
    fn drive_rx(&self, stream_id: usize, stream: &SimStream) -> c_int {
        let dev_ptr = stream.device as *mut c_void;
        let len = stream.samples_per_buffer * 2;
        let mut in_flight: VecDeque<*mut c_void> =
            stream.pool_ptrs[..stream.num_transfers].iter().copied().collect();

        loop {
            let Some(current) = in_flight.pop_front() else {
                return code(ErrorKind::Timeout);
            };
            let timestamp = {
                let mut st = self.state();
                let Some(device) = st.devices.get_mut(&stream.device) else {
                    return code(ErrorKind::NotInitialized);
                };
                // SAFETY: `current` is one of this stream's pool buffers,
                // each `len` i16 long.
                let out = unsafe { std::slice::from_raw_parts_mut(current as *mut i16, len) };
                let timestamp = match device.receive(out) {
                    Ok(t) => t,
                    Err(status) => return status,
                };
                for v in out.iter_mut() {
                    *v = v.to_le();
                }
                timestamp
            };

            let mut meta = RawMetadata {
                timestamp,
                actual_count: stream.samples_per_buffer as c_uint,
                ..Default::default()
            };
            self.callbacks.fetch_add(1, Ordering::Relaxed);
            // SAFETY: the callback was registered with this stream and
            // `current` is not resubmitted until the callback returns.
            let next = unsafe {
                (stream.callback)(
                    dev_ptr,
                    stream_id as *mut c_void,
                    &mut meta,
                    current,
                    stream.samples_per_buffer,
                    stream.user_data as *mut c_void,
                )
            };

            if next.is_null() {
                return 0;
            }
            if next == STREAM_NO_DATA {
                continue;
            }
            if !stream.pool_ptrs.contains(&next) {
                return code(ErrorKind::InvalidParameter);
            }
            if in_flight.contains(&next) {
                tracing::warn!(stream_id, "sim: callback returned a buffer still in flight");
                return code(ErrorKind::InvalidParameter);
            }
            in_flight.push_back(next);
        }
    }

    fn drive_tx(&self, stream_id: usize, stream: &SimStream) -> c_int {
        let dev_ptr = stream.device as *mut c_void;
        let len = stream.samples_per_buffer * 2;
        let mut drained: *mut c_void = std::ptr::null_mut();

        loop {
            let mut meta = RawMetadata::default();
            self.callbacks.fetch_add(1, Ordering::Relaxed);
            // SAFETY: as in drive_rx; `drained` is null or a pool buffer.
            let next = unsafe {
                (stream.callback)(
                    dev_ptr,
                    stream_id as *mut c_void,
                    &mut meta,
                    drained,
                    stream.samples_per_buffer,
                    stream.user_data as *mut c_void,
                )
            };

            if next.is_null() {
                return 0;
            }
            if next == STREAM_NO_DATA {
                drained = std::ptr::null_mut();
                continue;
            }
            if !stream.pool_ptrs.contains(&next) {
                return code(ErrorKind::InvalidParameter);
            }

            // SAFETY: `next` is a pool buffer of `len` i16.
            let raw = unsafe { std::slice::from_raw_parts(next as *const i16, len) };
            let samples: Vec<i16> = raw.iter().map(|&v| i16::from_le(v)).collect();

            let mut st = self.state();
            let Some(device) = st.devices.get_mut(&stream.device) else {
                return code(ErrorKind::NotInitialized);
            };
            let timestamp = device.tx_clock;
            device.tx_clock += stream.samples_per_buffer as u64;
            device.transmit(timestamp, 0, &samples);
            st.transmitted.extend_from_slice(&samples);
            drained = next;
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDriver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    unsafe fn version(&self, version: *mut RawVersion) {
        if version.is_null() {
            return;
        }
        *version = RawVersion {
            major: 2,
            minor: 5,
            patch: 0,
            describe: c"2.5.0-sim".as_ptr(),
        };
    }

    fn log_set_verbosity(&self, level: c_int) {
        self.verbosity.store(level, Ordering::Relaxed);
    }

    unsafe fn open(&self, device: *mut *mut c_void, identifier: *const c_char) -> c_int {
        if let Some(status) = self.state().enter("open") {
            return status;
        }
        let identifier = if identifier.is_null() {
            String::new()
        } else {
            CStr::from_ptr(identifier).to_string_lossy().into_owned()
        };
        self.open_info(device, self.find_device(&identifier))
    }

    unsafe fn open_with_devinfo(&self, device: *mut *mut c_void, info: *mut RawDevInfo) -> c_int {
        if let Some(status) = self.state().enter("open_with_devinfo") {
            return status;
        }
        let found = if info.is_null() {
            self.devices.first().cloned()
        } else {
            let serial = crate::driver::fixed_str(&(*info).serial);
            self.find_device(&format!("serial={}", serial))
        };
        self.open_info(device, found)
    }

    unsafe fn close(&self, dev: *mut c_void) {
        let mut st = self.state();
        st.enter("close");
        if st.devices.remove(&(dev as usize)).is_none() {
            st.invalid_releases += 1;
        }
    }

    unsafe fn get_devinfo(&self, dev: *mut c_void, info: *mut RawDevInfo) -> c_int {
        self.with_device("get_devinfo", dev, |st, id| {
            if info.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            let raw = Self::to_raw(&st.devices[&id].info);
            // SAFETY: checked non-null.
            unsafe { *info = raw };
            0
        })
    }

    unsafe fn get_device_list(&self, devices: *mut *mut RawDevInfo) -> c_int {
        self.list("get_device_list", &self.devices, devices)
    }

    unsafe fn get_bootloader_list(&self, devices: *mut *mut RawDevInfo) -> c_int {
        self.list("get_bootloader_list", &self.bootloaders, devices)
    }

    unsafe fn free_device_list(&self, devices: *mut RawDevInfo) {
        let mut st = self.state();
        st.enter("free_device_list");
        if st.device_lists.remove(&(devices as usize)).is_none() {
            st.invalid_releases += 1;
        }
    }

    unsafe fn set_frequency(&self, dev: *mut c_void, ch: c_int, frequency: u64) -> c_int {
        self.with_channel("set_frequency", dev, ch, |tables, _, channel| {
            let f = frequency as i64;
            if f < tables.frequency.min || f > tables.frequency.max {
                return code(ErrorKind::OutOfRange);
            }
            channel.frequency = frequency;
            0
        })
    }

    unsafe fn get_frequency(&self, dev: *mut c_void, ch: c_int, frequency: *mut u64) -> c_int {
        self.with_channel("get_frequency", dev, ch, |_, _, channel| {
            if frequency.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: checked non-null.
            unsafe { *frequency = channel.frequency };
            0
        })
    }

    unsafe fn set_sample_rate(
        &self,
        dev: *mut c_void,
        ch: c_int,
        rate: c_uint,
        actual: *mut c_uint,
    ) -> c_int {
        self.with_channel("set_sample_rate", dev, ch, |tables, _, channel| {
            let r = rate as i64;
            if r < tables.sample_rate.min || r > tables.sample_rate.max {
                return code(ErrorKind::OutOfRange);
            }
            channel.sample_rate = rate;
            if !actual.is_null() {
                // SAFETY: checked non-null.
                unsafe { *actual = rate };
            }
            0
        })
    }

    unsafe fn set_bandwidth(
        &self,
        dev: *mut c_void,
        ch: c_int,
        bandwidth: c_uint,
        actual: *mut c_uint,
    ) -> c_int {
        self.with_channel("set_bandwidth", dev, ch, |tables, _, channel| {
            let bw = (bandwidth as i64).clamp(tables.bandwidth.min, tables.bandwidth.max) as c_uint;
            channel.bandwidth = bw;
            if !actual.is_null() {
                // SAFETY: checked non-null.
                unsafe { *actual = bw };
            }
            0
        })
    }

    unsafe fn set_gain(&self, dev: *mut c_void, ch: c_int, gain: c_int) -> c_int {
        self.with_channel("set_gain", dev, ch, |tables, direction, channel| {
            let range = tables.gain_range(direction);
            channel.gain = (gain as i64).clamp(range.min, range.max) as c_int;
            0
        })
    }

    unsafe fn get_gain(&self, dev: *mut c_void, ch: c_int, gain: *mut c_int) -> c_int {
        self.with_channel("get_gain", dev, ch, |_, _, channel| {
            if gain.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: checked non-null.
            unsafe { *gain = channel.gain };
            0
        })
    }

    unsafe fn set_gain_mode(&self, dev: *mut c_void, ch: c_int, mode: c_int) -> c_int {
        self.with_channel("set_gain_mode", dev, ch, |_, direction, channel| {
            if direction == Direction::Tx {
                return code(ErrorKind::Unsupported);
            }
            if GainMode::from_native(mode).is_none() {
                return code(ErrorKind::InvalidParameter);
            }
            channel.gain_mode = mode;
            0
        })
    }

    unsafe fn set_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: c_int,
    ) -> c_int {
        self.with_channel("set_gain_stage", dev, ch, |tables, direction, channel| {
            let Some(index) = Self::stage_index(direction, stage) else {
                return code(ErrorKind::InvalidParameter);
            };
            let range = tables.stage_ranges(direction)[index];
            channel.stage_gains[index] = (gain as i64).clamp(range.min, range.max) as c_int;
            0
        })
    }

    unsafe fn get_gain_stage(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        gain: *mut c_int,
    ) -> c_int {
        self.with_channel("get_gain_stage", dev, ch, |_, direction, channel| {
            let Some(index) = Self::stage_index(direction, stage) else {
                return code(ErrorKind::InvalidParameter);
            };
            if gain.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: checked non-null.
            unsafe { *gain = channel.stage_gains[index] };
            0
        })
    }

    unsafe fn set_loopback(&self, dev: *mut c_void, mode: c_int) -> c_int {
        self.with_device("set_loopback", dev, |st, id| {
            if !LOOPBACK_MODES.iter().any(|(_, m)| m.native() == mode) {
                return code(ErrorKind::Unsupported);
            }
            let device = st.devices.get_mut(&id);
            if let Some(device) = device {
                device.loopback = mode;
                if mode == Loopback::None.native() {
                    device.loopback_queue.clear();
                }
            }
            0
        })
    }

    unsafe fn get_loopback(&self, dev: *mut c_void, mode: *mut c_int) -> c_int {
        self.with_device("get_loopback", dev, |st, id| {
            if mode.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: checked non-null.
            unsafe { *mode = st.devices[&id].loopback };
            0
        })
    }

    unsafe fn get_gain_stages(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stages: *mut *const c_char,
        count: usize,
    ) -> c_int {
        self.with_channel("get_gain_stages", dev, ch, |_, direction, _| {
            let names = Tables::stages(direction);
            if !stages.is_null() {
                for (i, (name, _, _)) in names.iter().take(count).enumerate() {
                    // SAFETY: caller provides room for `count` pointers.
                    unsafe { *stages.add(i) = name.as_ptr() };
                }
            }
            names.len() as c_int
        })
    }

    unsafe fn get_gain_modes(
        &self,
        dev: *mut c_void,
        ch: c_int,
        modes: *mut *const RawGainMode,
    ) -> c_int {
        self.with_channel("get_gain_modes", dev, ch, |tables, direction, _| {
            if modes.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            let (ptr, len) = match direction {
                Direction::Rx => (tables.rx_gain_modes.as_ptr(), tables.rx_gain_modes.len()),
                Direction::Tx => (std::ptr::null(), 0),
            };
            // SAFETY: checked non-null.
            unsafe { *modes = ptr };
            len as c_int
        })
    }

    unsafe fn get_loopback_modes(
        &self,
        dev: *mut c_void,
        modes: *mut *const RawLoopbackMode,
    ) -> c_int {
        self.with_device("get_loopback_modes", dev, |_, _| {
            if !modes.is_null() {
                // SAFETY: checked non-null.
                unsafe { *modes = self.tables.loopback_modes.as_ptr() };
            }
            self.tables.loopback_modes.len() as c_int
        })
    }

    unsafe fn get_gain_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        self.with_channel("get_gain_range", dev, ch, |tables, direction, _| {
            Self::write_range(range, tables.gain_range(direction))
        })
    }

    unsafe fn get_gain_stage_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        stage: *const c_char,
        range: *mut *const RawRange,
    ) -> c_int {
        self.with_channel("get_gain_stage_range", dev, ch, |tables, direction, _| {
            match Self::stage_index(direction, stage) {
                Some(index) => Self::write_range(range, &tables.stage_ranges(direction)[index]),
                None => code(ErrorKind::InvalidParameter),
            }
        })
    }

    unsafe fn get_sample_rate_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        self.with_channel("get_sample_rate_range", dev, ch, |tables, _, _| {
            Self::write_range(range, &tables.sample_rate)
        })
    }

    unsafe fn get_frequency_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        self.with_channel("get_frequency_range", dev, ch, |tables, _, _| {
            Self::write_range(range, &tables.frequency)
        })
    }

    unsafe fn get_bandwidth_range(
        &self,
        dev: *mut c_void,
        ch: c_int,
        range: *mut *const RawRange,
    ) -> c_int {
        self.with_channel("get_bandwidth_range", dev, ch, |tables, _, _| {
            Self::write_range(range, &tables.bandwidth)
        })
    }

    unsafe fn enable_module(&self, dev: *mut c_void, ch: c_int, enable: bool) -> c_int {
        self.with_channel("enable_module", dev, ch, |_, _, channel| {
            channel.enabled = enable;
            0
        })
    }

    unsafe fn sync_config(
        &self,
        dev: *mut c_void,
        layout: c_int,
        format: c_int,
        num_buffers: c_uint,
        buffer_size: c_uint,
        num_transfers: c_uint,
        _timeout_ms: c_uint,
    ) -> c_int {
        self.with_device("sync_config", dev, |st, id| {
            let (Some(layout), Some(format)) =
                (ChannelLayout::from_native(layout), Format::from_native(format))
            else {
                return code(ErrorKind::InvalidParameter);
            };
            if num_buffers < 2
                || buffer_size == 0
                || buffer_size % 1024 != 0
                || num_transfers == 0
                || num_transfers >= num_buffers
            {
                return code(ErrorKind::InvalidParameter);
            }
            if let Some(device) = st.devices.get_mut(&id) {
                device.sync[layout.direction().native() as usize] = Some(format);
            }
            0
        })
    }

    unsafe fn sync_tx(
        &self,
        dev: *mut c_void,
        samples: *const c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        _timeout_ms: c_uint,
    ) -> c_int {
        self.with_device("sync_tx", dev, |st, id| {
            let Some(device) = st.devices.get_mut(&id) else {
                return code(ErrorKind::InvalidParameter);
            };
            let Some(format) = device.sync[Direction::Tx.native() as usize] else {
                return code(ErrorKind::InvalidParameter);
            };
            if !device.enabled(Direction::Tx) {
                return code(ErrorKind::Timeout);
            }
            if samples.is_null() || num_samples == 0 {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: caller provides `num_samples` interleaved pairs.
            let raw = unsafe {
                std::slice::from_raw_parts(samples as *const i16, num_samples as usize * 2)
            };
            let data: Vec<i16> = raw.iter().map(|&v| i16::from_le(v)).collect();

            let (timestamp, flags) = if format.has_metadata() {
                if meta.is_null() {
                    return code(ErrorKind::InvalidParameter);
                }
                // SAFETY: checked non-null.
                let md = unsafe { &mut *meta };
                let timestamp = if md.flags & TX_NOW != 0 {
                    device.tx_clock
                } else if md.timestamp < device.tx_clock {
                    return code(ErrorKind::TimestampInPast);
                } else {
                    md.timestamp
                };
                md.actual_count = num_samples;
                md.status = 0;
                (timestamp, md.flags)
            } else {
                (device.tx_clock, 0)
            };

            device.tx_clock = timestamp + num_samples as u64;
            device.transmit(timestamp, flags, &data);
            st.transmitted.extend_from_slice(&data);
            0
        })
    }

    unsafe fn sync_rx(
        &self,
        dev: *mut c_void,
        samples: *mut c_void,
        num_samples: c_uint,
        meta: *mut RawMetadata,
        _timeout_ms: c_uint,
    ) -> c_int {
        self.with_device("sync_rx", dev, |st, id| {
            let short_read = st.short_read;
            let overreport = st.overreport;
            let Some(device) = st.devices.get_mut(&id) else {
                return code(ErrorKind::InvalidParameter);
            };
            let Some(format) = device.sync[Direction::Rx.native() as usize] else {
                return code(ErrorKind::InvalidParameter);
            };
            if !device.enabled(Direction::Rx) {
                return code(ErrorKind::Timeout);
            }
            if samples.is_null() || num_samples == 0 {
                return code(ErrorKind::InvalidParameter);
            }

            let mut count = num_samples;
            if format.has_metadata() {
                if meta.is_null() {
                    return code(ErrorKind::InvalidParameter);
                }
                // SAFETY: checked non-null.
                let md = unsafe { &*meta };
                if md.flags & RX_NOW == 0 {
                    if md.timestamp < device.rx_clock {
                        return code(ErrorKind::TimestampInPast);
                    }
                    device.rx_clock = md.timestamp;
                }
                if let Some(limit) = short_read {
                    count = count.min(limit);
                }
            }

            // SAFETY: caller provides room for `num_samples` pairs.
            let out = unsafe {
                std::slice::from_raw_parts_mut(samples as *mut i16, count as usize * 2)
            };
            let timestamp = match device.receive(out) {
                Ok(t) => t,
                Err(status) => return status,
            };
            for v in out.iter_mut() {
                *v = v.to_le();
            }

            if format.has_metadata() {
                // SAFETY: checked non-null above.
                let md = unsafe { &mut *meta };
                md.timestamp = timestamp;
                md.flags = 0;
                md.status = 0;
                md.actual_count = if overreport { num_samples + 1 } else { count };
            }
            0
        })
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
        self.with_device("init_stream", dev, |st, id| {
            match Format::from_native(format) {
                Some(Format::Sc16Q11) => {}
                Some(Format::Sc16Q11Meta) => return code(ErrorKind::Unsupported),
                None => return code(ErrorKind::InvalidParameter),
            }
            if stream.is_null()
                || buffers.is_null()
                || num_buffers < 2
                || samples_per_buffer == 0
                || samples_per_buffer % 1024 != 0
                || num_transfers == 0
                || num_transfers >= num_buffers
            {
                return code(ErrorKind::InvalidParameter);
            }

            let mut pool: Vec<Vec<i16>> = vec![vec![0i16; samples_per_buffer * 2]; num_buffers];
            let mut pool_ptrs: Vec<*mut c_void> = pool
                .iter_mut()
                .map(|b| b.as_mut_ptr() as *mut c_void)
                .collect();
            let stream_id = st.allocate_id();

            // SAFETY: checked non-null. The pointer array lives in the
            // SimStream until deinit_stream.
            unsafe {
                *buffers = pool_ptrs.as_mut_ptr();
                *stream = stream_id as *mut c_void;
            }
            st.streams.insert(
                stream_id,
                SimStream {
                    device: id,
                    callback,
                    user_data: user_data as usize,
                    samples_per_buffer,
                    num_transfers,
                    _pool: pool,
                    pool_ptrs,
                },
            );
            tracing::debug!(stream_id, num_buffers, samples_per_buffer, "sim: stream initialized");
            0
        })
    }

    unsafe fn stream(&self, stream: *mut c_void, layout: c_int) -> c_int {
        let stream_id = stream as usize;
        let snapshot = {
            let mut st = self.state();
            if let Some(status) = st.enter("stream") {
                return status;
            }
            match st.streams.get(&stream_id) {
                Some(s) => SimStream {
                    device: s.device,
                    callback: s.callback,
                    user_data: s.user_data,
                    samples_per_buffer: s.samples_per_buffer,
                    num_transfers: s.num_transfers,
                    _pool: Vec::new(),
                    pool_ptrs: s.pool_ptrs.clone(),
                },
                None => return code(ErrorKind::InvalidParameter),
            }
        };

        // The lock is released here: callbacks run without it.
        match ChannelLayout::from_native(layout).map(ChannelLayout::direction) {
            Some(Direction::Rx) => self.drive_rx(stream_id, &snapshot),
            Some(Direction::Tx) => self.drive_tx(stream_id, &snapshot),
            None => code(ErrorKind::InvalidParameter),
        }
    }

    unsafe fn deinit_stream(&self, stream: *mut c_void) {
        let mut st = self.state();
        st.enter("deinit_stream");
        if st.streams.remove(&(stream as usize)).is_none() {
            st.invalid_releases += 1;
        }
    }

    unsafe fn set_stream_timeout(&self, dev: *mut c_void, dir: c_int, timeout_ms: c_uint) -> c_int {
        self.with_device("set_stream_timeout", dev, |st, id| {
            let Some(direction) = Direction::from_native(dir) else {
                return code(ErrorKind::InvalidParameter);
            };
            if let Some(device) = st.devices.get_mut(&id) {
                device.stream_timeout[direction.native() as usize] = timeout_ms;
            }
            0
        })
    }

    unsafe fn get_stream_timeout(
        &self,
        dev: *mut c_void,
        dir: c_int,
        timeout_ms: *mut c_uint,
    ) -> c_int {
        self.with_device("get_stream_timeout", dev, |st, id| {
            let Some(direction) = Direction::from_native(dir) else {
                return code(ErrorKind::InvalidParameter);
            };
            if timeout_ms.is_null() {
                return code(ErrorKind::InvalidParameter);
            }
            // SAFETY: checked non-null.
            unsafe { *timeout_ms = st.devices[&id].stream_timeout[direction.native() as usize] };
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn open(sim: &SimDriver) -> *mut c_void {
        let mut dev = ptr::null_mut();
        let status = unsafe { sim.open(&mut dev, ptr::null()) };
        assert_eq!(status, 0);
        assert!(!dev.is_null());
        dev
    }

    #[test]
    fn test_open_by_serial() {
        let sim = SimDriver::new();
        let mut dev = ptr::null_mut();
        let status = unsafe { sim.open(&mut dev, c"*:serial=0000".as_ptr()) };
        assert_eq!(status, 0);

        let status = unsafe { sim.open(&mut dev, c"*:serial=ffff".as_ptr()) };
        assert_eq!(status, -7);
        assert_eq!(sim.open_devices(), 1);
    }

    #[test]
    fn test_close_twice_is_counted() {
        let sim = SimDriver::new();
        let dev = open(&sim);
        unsafe {
            sim.close(dev);
            sim.close(dev);
        }
        assert_eq!(sim.open_devices(), 0);
        assert_eq!(sim.invalid_releases(), 1);
    }

    #[test]
    fn test_empty_device_list_is_no_device() {
        let sim = SimDriver::with_devices(Vec::new());
        let mut list = ptr::null_mut();
        assert_eq!(unsafe { sim.get_device_list(&mut list) }, -7);
        assert_eq!(sim.live_device_lists(), 0);
    }

    #[test]
    fn test_frequency_range_check() {
        let sim = SimDriver::new();
        let dev = open(&sim);
        let ch = Channel::RX0.encode();
        unsafe {
            assert_eq!(sim.set_frequency(dev, ch, 10_000_000), -2);
            assert_eq!(sim.set_frequency(dev, ch, 96_600_000), 0);
            let mut f = 0u64;
            assert_eq!(sim.get_frequency(dev, ch, &mut f), 0);
            assert_eq!(f, 96_600_000);
            assert_eq!(sim.set_frequency(dev, Channel::rx(2).encode(), 96_600_000), -3);
        }
    }

    #[test]
    fn test_fault_injection() {
        let sim = SimDriver::new();
        let dev = open(&sim);
        sim.fail_next("set_gain", ErrorKind::IoError, 1);
        unsafe {
            assert_eq!(sim.set_gain(dev, 0, 10), -5);
            assert_eq!(sim.set_gain(dev, 0, 10), 0);
        }
        assert_eq!(sim.calls("set_gain"), 2);
    }

    /// Returns the buffer whose address is stored in `user_data`.
    unsafe extern "C" fn return_stored(
        _dev: *mut c_void,
        _stream: *mut c_void,
        _meta: *mut RawMetadata,
        _samples: *mut c_void,
        _num_samples: usize,
        user_data: *mut c_void,
    ) -> *mut c_void {
        let stored = unsafe { &*(user_data as *const std::sync::atomic::AtomicUsize) };
        stored.load(Ordering::SeqCst) as *mut c_void
    }

    fn rx_stream_returning(sim: &SimDriver, index: usize) -> c_int {
        let dev = open(sim);
        let stored = std::sync::atomic::AtomicUsize::new(0);
        let mut stream = ptr::null_mut();
        let mut buffers: *mut *mut c_void = ptr::null_mut();
        let status = unsafe {
            sim.init_stream(
                &mut stream,
                dev,
                return_stored,
                &mut buffers,
                4,
                Format::Sc16Q11.native(),
                1024,
                2,
                &stored as *const std::sync::atomic::AtomicUsize as *mut c_void,
            )
        };
        assert_eq!(status, 0);
        let pool = unsafe { std::slice::from_raw_parts(buffers, 4) };
        stored.store(pool[index] as usize, Ordering::SeqCst);

        let status = unsafe { sim.stream(stream, ChannelLayout::RxX1.native()) };
        unsafe { sim.deinit_stream(stream) };
        status
    }

    #[test]
    fn test_rx_stream_rejects_in_flight_buffer() {
        // pool[0] completes first while pool[1] is still submitted
        let sim = SimDriver::new();
        assert_eq!(rx_stream_returning(&sim, 1), code(ErrorKind::InvalidParameter));
        assert_eq!(sim.callback_invocations(), 1);
    }

    #[test]
    fn test_rx_stream_rejects_resubmitting_same_buffer() {
        // pool[2] is free on the first cycle and in flight on the second
        let sim = SimDriver::new();
        assert_eq!(rx_stream_returning(&sim, 2), code(ErrorKind::InvalidParameter));
        assert_eq!(sim.callback_invocations(), 2);
    }

    #[test]
    fn test_tone_is_deterministic() {
        assert_eq!(tone(0), (1024, 0));
        assert_eq!(tone(8), (0, 1024));
        assert_eq!(tone(TONE_PERIOD), tone(0));
    }
}
