//! # Callback Streaming
//!
//! [`StreamEngine`] runs continuous RX or TX through `bladerf_stream`, with a
//! driver-allocated buffer pool and a Rust callback reached through the
//! [bridge](crate::bridge).
//!
//! ## Lifecycle
//!
//! ```text
//!  Uninitialized ──init──► Initialized ──start──► Running
//!                              │                     │ callback returns Shutdown
//!                              │ deinit              │ or fatal error
//!                              ▼                     ▼
//!                           TornDown ◄───────────────┘
//! ```
//!
//! `start` blocks for the life of the stream. Run it on its own thread and
//! tell the callback to return [`StreamSignal::Shutdown`] to stop; there is
//! no other cancellation path. `deinit` on a torn-down engine is a no-op.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut engine = StreamEngine::new(&dev);
//! engine.init(&StreamConfig::default(), move |samples| {
//!     tx.send(samples.to_vec()).ok();
//!     StreamSignal::Continue
//! })?;
//! std::thread::spawn(move || engine.start(ChannelLayout::RxX1));
//! ```

use std::ffi::c_void;
use std::ptr;

use bladerf_core::config::StreamConfig;
use bladerf_core::error::{translate, Error, ErrorKind, Result};
use bladerf_core::types::{ChannelLayout, Sc16};

use crate::bridge::{self, CallbackContext, StreamSignal};
use crate::device::DeviceHandle;
use crate::driver::StreamPtr;

/// Where a [`StreamEngine`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized,
    Initialized,
    Running,
    TornDown,
}

/// Callback-driven streaming on one device.
#[derive(Debug)]
pub struct StreamEngine {
    device: DeviceHandle,
    state: StreamState,
    config: Option<StreamConfig>,
    stream: Option<StreamPtr>,
    token: Option<u64>,
    invocations: u64,
}

impl StreamEngine {
    pub fn new(device: &DeviceHandle) -> Self {
        Self {
            device: device.clone(),
            state: StreamState::Uninitialized,
            config: None,
            stream: None,
            token: None,
            invocations: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    /// Callback invocations of the last run, available after `start` returns.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Allocate the buffer pool and register `callback`.
    ///
    /// The callback receives a scratch slice of `samples_per_buffer` samples.
    /// It is overwritten on the next invocation and must not be retained.
    pub fn init<F>(&mut self, config: &StreamConfig, callback: F) -> Result<()>
    where
        F: FnMut(&mut [Sc16]) -> StreamSignal + Send + 'static,
    {
        if self.state != StreamState::Uninitialized {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        config.validate()?;
        if config.format.has_metadata() {
            return Err(Error::native(ErrorKind::Unsupported));
        }

        let token = bridge::register(CallbackContext::new(
            Box::new(callback),
            config.samples_per_buffer,
            config.direction,
        ));

        let init = self.device.with_raw(|drv, dev| {
            let mut stream: *mut c_void = ptr::null_mut();
            let mut buffers: *mut *mut c_void = ptr::null_mut();
            // SAFETY: all out-pointers are valid; the token stays registered
            // until deinit, after the driver has released the stream.
            translate(unsafe {
                drv.init_stream(
                    &mut stream,
                    dev,
                    bridge::trampoline,
                    &mut buffers,
                    config.buffer_count,
                    config.format.native(),
                    config.samples_per_buffer,
                    config.transfer_count,
                    token as *mut c_void,
                )
            })?;
            if stream.is_null() || buffers.is_null() {
                // SAFETY: a non-null stream came from init_stream above.
                if !stream.is_null() {
                    unsafe { drv.deinit_stream(stream) };
                }
                return Err(Error::native(ErrorKind::Unexpected));
            }
            // SAFETY: the driver returned `buffer_count` buffer pointers.
            let pool = unsafe { std::slice::from_raw_parts(buffers, config.buffer_count) };
            bridge::set_pool(token, pool, config.transfer_count);
            // Counted while the device is still read-locked so a concurrent
            // close cannot slip in between.
            self.device.stream_started();
            Ok(StreamPtr(stream))
        });

        let stream = match init {
            Ok(stream) => stream,
            Err(err) => {
                bridge::unregister(token);
                return Err(err);
            }
        };

        self.stream = Some(stream);
        self.token = Some(token);
        self.config = Some(*config);
        self.state = StreamState::Initialized;
        tracing::info!(
            direction = %config.direction,
            buffers = config.buffer_count,
            samples_per_buffer = config.samples_per_buffer,
            transfers = config.transfer_count,
            "Stream initialized"
        );
        Ok(())
    }

    /// Run the stream until the callback returns `Shutdown` or a fatal error
    /// occurs, then tear it down.
    ///
    /// `Timeout` and `WouldBlock` from the driver are retried. A callback
    /// that panics or gets a wrongly sized buffer ends the stream with the
    /// corresponding error.
    pub fn start(&mut self, layout: ChannelLayout) -> Result<()> {
        let (Some(stream), Some(token), Some(config)) = (self.stream, self.token, self.config)
        else {
            return Err(Error::native(ErrorKind::NotInitialized));
        };
        if self.state != StreamState::Initialized {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }
        if layout.direction() != config.direction {
            return Err(Error::native(ErrorKind::InvalidParameter));
        }

        self.state = StreamState::Running;
        tracing::info!(?layout, "Stream started");

        let driver = self.device.driver().clone();
        let result = loop {
            // SAFETY: `stream` is live until teardown below.
            match translate(unsafe { driver.stream(stream.0, layout.native()) }) {
                Ok(()) => break Ok(()),
                Err(err) if err.is_recoverable() && !bridge::is_shutdown(token) => {
                    // bladerf_stream drains its transfers before returning and
                    // resubmits the pool from the start when entered again, as
                    // libbladeRF's own sync worker does. SimDriver does the same.
                    tracing::warn!(error = %err, "Recoverable stream error, continuing");
                    bridge::rewind(token);
                }
                Err(err) => break Err(err),
            }
        };

        let result = match bridge::take_failure(token) {
            Some(failure) => Err(failure),
            None => result,
        };
        self.invocations = bridge::invocations(token);
        self.teardown();

        match &result {
            Ok(()) => tracing::info!(invocations = self.invocations, "Stream finished"),
            Err(err) => tracing::error!(error = %err, "Stream terminated"),
        }
        result
    }

    /// Release the buffer pool and callback context. Calling it again, or on
    /// an engine that never initialized, does nothing.
    pub fn deinit(&mut self) -> Result<()> {
        match self.state {
            StreamState::Uninitialized | StreamState::TornDown => {
                tracing::debug!(state = ?self.state, "Stream deinit: nothing to release");
                Ok(())
            }
            StreamState::Initialized | StreamState::Running => {
                self.teardown();
                Ok(())
            }
        }
    }

    /// Best effort: never fails, logs what it released.
    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            // SAFETY: the stream came from init_stream and is released once.
            unsafe { self.device.driver().deinit_stream(stream.0) };
            self.device.stream_released();
        }
        if let Some(token) = self.token.take() {
            if !bridge::unregister(token) {
                tracing::warn!(token, "Stream callback context already released");
            }
        }
        self.state = StreamState::TornDown;
        tracing::debug!(identifier = self.device.identifier(), "Stream torn down");
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if matches!(self.state, StreamState::Initialized | StreamState::Running) {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use bladerf_core::types::{Direction, Format};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn open_sim() -> (Arc<SimDriver>, DeviceHandle) {
        let sim = Arc::new(SimDriver::new());
        let dev = DeviceHandle::open(sim.clone(), "").unwrap();
        (sim, dev)
    }

    fn rx_config(layout: ChannelLayout) -> StreamConfig {
        StreamConfig {
            format: Format::Sc16Q11,
            buffer_count: 16,
            samples_per_buffer: 8192,
            transfer_count: 8,
            direction: Direction::Rx,
            layout,
        }
    }

    #[test]
    fn test_rx_x2_until_shutdown() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let calls = Arc::new(AtomicUsize::new(0));
        let lengths_ok = Arc::new(AtomicUsize::new(0));

        let calls_cb = calls.clone();
        let lengths_cb = lengths_ok.clone();
        engine
            .init(&rx_config(ChannelLayout::RxX2), move |samples| {
                if samples.len() == 8192 {
                    lengths_cb.fetch_add(1, Ordering::SeqCst);
                }
                if calls_cb.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    StreamSignal::Shutdown
                } else {
                    StreamSignal::Continue
                }
            })
            .unwrap();
        assert_eq!(engine.state(), StreamState::Initialized);
        assert_eq!(sim.live_streams(), 1);

        engine.start(ChannelLayout::RxX2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(lengths_ok.load(Ordering::SeqCst), 5);
        assert_eq!(engine.invocations(), 5);
        assert_eq!(engine.state(), StreamState::TornDown);
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn test_rx_pool_wraps_without_reusing_in_flight_buffers() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let mut n = 0;
        engine
            .init(
                &StreamConfig {
                    samples_per_buffer: 1024,
                    ..rx_config(ChannelLayout::RxX1)
                },
                move |_| {
                    n += 1;
                    if n == 50 {
                        StreamSignal::Shutdown
                    } else {
                        StreamSignal::Continue
                    }
                },
            )
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        assert_eq!(engine.invocations(), 50);
        assert_eq!(sim.calls("stream"), 1);
    }

    #[test]
    fn test_stream_resumes_after_timeout() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let mut n = 0;
        // After two resubmissions the rotation sits at pool[1]. Three NoData
        // cycles then leave nothing in flight and the driver times out; the
        // second bladerf_stream call resubmits pool[0..3) and the rotation
        // must restart at pool[3].
        engine
            .init(
                &StreamConfig {
                    buffer_count: 4,
                    samples_per_buffer: 1024,
                    transfer_count: 3,
                    ..rx_config(ChannelLayout::RxX1)
                },
                move |_| {
                    n += 1;
                    match n {
                        3..=5 => StreamSignal::NoData,
                        7 => StreamSignal::Shutdown,
                        _ => StreamSignal::Continue,
                    }
                },
            )
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        assert_eq!(sim.calls("stream"), 2);
        assert_eq!(engine.invocations(), 7);
    }

    #[test]
    fn test_rx_sees_driver_samples() {
        let (_sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let first = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first_cb = first.clone();
        engine
            .init(
                &StreamConfig {
                    samples_per_buffer: 1024,
                    ..rx_config(ChannelLayout::RxX1)
                },
                move |samples| {
                    first_cb.lock().unwrap().extend_from_slice(&samples[..4]);
                    StreamSignal::Shutdown
                },
            )
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        assert_eq!(first.lock().unwrap()[0], Sc16::new(1024, 0));
    }

    #[test]
    fn test_double_deinit() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();

        engine.deinit().unwrap();
        engine.deinit().unwrap();
        assert_eq!(engine.state(), StreamState::TornDown);
        assert_eq!(sim.calls("deinit_stream"), 1);
        assert_eq!(sim.invalid_releases(), 0);

        let err = engine.start(ChannelLayout::RxX1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_deinit_after_start() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        engine.deinit().unwrap();
        assert_eq!(sim.calls("deinit_stream"), 1);
    }

    #[test]
    fn test_tx_stream() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let mut cycle = 0i16;
        engine
            .init(
                &StreamConfig {
                    samples_per_buffer: 1024,
                    direction: Direction::Tx,
                    layout: ChannelLayout::TxX1,
                    ..Default::default()
                },
                move |samples| {
                    cycle += 1;
                    if cycle > 2 {
                        return StreamSignal::Shutdown;
                    }
                    samples.fill(Sc16::new(cycle, -cycle));
                    StreamSignal::Continue
                },
            )
            .unwrap();
        engine.start(ChannelLayout::TxX1).unwrap();

        let sent = sim.transmitted();
        assert_eq!(sent.len(), 2 * 1024 * 2);
        assert_eq!(&sent[..2], &[1, -1]);
        assert_eq!(&sent[2048..2050], &[2, -2]);
    }

    #[test]
    fn test_no_data_cycle() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let mut n = 0;
        engine
            .init(&rx_config(ChannelLayout::RxX1), move |_| {
                n += 1;
                match n {
                    1 | 2 => StreamSignal::NoData,
                    _ => StreamSignal::Shutdown,
                }
            })
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        assert_eq!(sim.callback_invocations(), 3);
    }

    #[test]
    fn test_metadata_format_unsupported() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let config = StreamConfig {
            format: Format::Sc16Q11Meta,
            ..Default::default()
        };
        let err = engine.init(&config, |_| StreamSignal::Shutdown).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(sim.calls("init_stream"), 0);
        assert_eq!(engine.state(), StreamState::Uninitialized);
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let (_sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        let config = StreamConfig {
            buffer_count: 1,
            ..Default::default()
        };
        let err = engine.init(&config, |_| StreamSignal::Shutdown).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_native_init_failure_releases_context() {
        let (sim, dev) = open_sim();
        sim.fail_next("init_stream", ErrorKind::AllocationFailure, 1);
        let mut engine = StreamEngine::new(&dev);
        let err = engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);
        assert_eq!(engine.state(), StreamState::Uninitialized);
        // Device is not pinned by a failed stream
        dev.close().unwrap();
    }

    #[test]
    fn test_layout_direction_mismatch() {
        let (_sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();
        let err = engine.start(ChannelLayout::TxX1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(engine.state(), StreamState::Initialized);
    }

    #[test]
    fn test_recoverable_errors_retry() {
        let (sim, dev) = open_sim();
        sim.fail_next("stream", ErrorKind::Timeout, 2);
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();
        engine.start(ChannelLayout::RxX1).unwrap();
        assert_eq!(sim.calls("stream"), 3);
    }

    #[test]
    fn test_fatal_error_tears_down() {
        let (sim, dev) = open_sim();
        sim.fail_next("stream", ErrorKind::IoError, 1);
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();
        let err = engine.start(ChannelLayout::RxX1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(engine.state(), StreamState::TornDown);
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn test_callback_panic_is_contract_violation() {
        let (sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| -> StreamSignal {
                panic!("callback bug")
            })
            .unwrap();
        let err = engine.start(ChannelLayout::RxX1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn test_close_refused_while_stream_initialized() {
        let (_sim, dev) = open_sim();
        let mut engine = StreamEngine::new(&dev);
        engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap();
        assert_eq!(dev.close().unwrap_err().kind(), ErrorKind::InvalidParameter);

        engine.deinit().unwrap();
        dev.close().unwrap();
    }

    #[test]
    fn test_closed_device_cannot_init() {
        let (_sim, dev) = open_sim();
        dev.close().unwrap();
        let mut engine = StreamEngine::new(&dev);
        let err = engine
            .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_drop_releases_stream() {
        let (sim, dev) = open_sim();
        {
            let mut engine = StreamEngine::new(&dev);
            engine
                .init(&rx_config(ChannelLayout::RxX1), |_| StreamSignal::Shutdown)
                .unwrap();
        }
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn test_start_on_thread() {
        let (_sim, dev) = open_sim();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut engine = StreamEngine::new(&dev);
        let mut sent = 0;
        engine
            .init(&rx_config(ChannelLayout::RxX1), move |samples| {
                tx.send(samples.len()).ok();
                sent += 1;
                if sent == 3 {
                    StreamSignal::Shutdown
                } else {
                    StreamSignal::Continue
                }
            })
            .unwrap();
        let handle = std::thread::spawn(move || engine.start(ChannelLayout::RxX1));
        let lengths: Vec<usize> = rx.iter().collect();
        handle.join().unwrap().unwrap();
        assert_eq!(lengths, vec![8192; 3]);
    }
}
