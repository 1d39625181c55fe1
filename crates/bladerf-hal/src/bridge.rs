//! # Callback Bridge
//!
//! Carries a Rust stream callback across the C boundary.
//!
//! The driver only ever sees an integer token as `user_data`. The token keys
//! a process-wide registry holding the [`CallbackContext`]: the boxed
//! closure, a reusable scratch buffer, and the pool of driver buffers. No
//! Rust object address is handed to C.
//!
//! ```text
//!  driver ──trampoline(samples, user_data = token)──► registry[token]
//!                                                        │
//!        copy samples ──► scratch ──► callback(&mut scratch)
//!                                                        │
//!  driver ◄── next pool buffer | NO_DATA | SHUTDOWN ◄── StreamSignal
//! ```
//!
//! Driver buffers are only valid for one invocation, so the callback always
//! works on the scratch copy and never on driver memory. For TX the scratch
//! contents are written into the next pool buffer before it is returned.
//!
//! Pool buffers are handed back in round-robin order. The driver submits
//! `pool[0..transfers)` when an RX stream starts, so the RX rotation begins
//! at `pool[transfers]` and never returns a buffer that is still in flight.

use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bladerf_core::error::Error;
use bladerf_core::types::{Direction, Sc16};

use crate::driver::{RawMetadata, STREAM_NO_DATA, STREAM_SHUTDOWN};

/// What the stream should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Keep streaming. For TX, the scratch buffer holds the next samples.
    Continue,
    /// Nothing to hand back this cycle.
    NoData,
    /// Stop after this cycle.
    Shutdown,
}

/// A stream callback. The slice is only valid until the callback returns.
pub type StreamFn = Box<dyn FnMut(&mut [Sc16]) -> StreamSignal + Send>;

/// A driver-owned pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferPtr(*mut c_void);

// SAFETY: pool buffers are only touched from the thread running the stream.
unsafe impl Send for BufferPtr {}

pub(crate) struct CallbackContext {
    callback: StreamFn,
    scratch: Vec<Sc16>,
    buffer_size: usize,
    pool: Vec<BufferPtr>,
    /// Buffers the driver submits itself when the stream starts
    in_flight: usize,
    next: usize,
    direction: Direction,
    failure: Option<Error>,
    shutdown: bool,
    invocations: u64,
}

impl CallbackContext {
    pub(crate) fn new(callback: StreamFn, buffer_size: usize, direction: Direction) -> Self {
        Self {
            callback,
            scratch: vec![Sc16::new(0, 0); buffer_size],
            buffer_size,
            pool: Vec::new(),
            in_flight: 0,
            next: 0,
            direction,
            failure: None,
            shutdown: false,
            invocations: 0,
        }
    }

    fn fail(&mut self, err: Error) -> *mut c_void {
        tracing::error!(error = %err, "Stream callback failed, shutting down");
        self.failure = Some(err);
        STREAM_SHUTDOWN
    }

    /// Point the rotation at the first buffer the driver did not submit.
    fn rewind(&mut self) {
        self.next = match self.direction {
            Direction::Rx if !self.pool.is_empty() => self.in_flight % self.pool.len(),
            _ => 0,
        };
    }

    fn next_buffer(&mut self) -> Option<BufferPtr> {
        let buffer = *self.pool.get(self.next)?;
        self.next = (self.next + 1) % self.pool.len();
        Some(buffer)
    }

    /// One callback cycle.
    ///
    /// # Safety
    ///
    /// `samples` must be null or point to `num_samples` interleaved pairs,
    /// and the pool pointers must be live.
    unsafe fn invoke(&mut self, samples: *mut c_void, num_samples: usize) -> *mut c_void {
        if self.failure.is_some() || self.shutdown {
            return STREAM_SHUTDOWN;
        }
        self.invocations += 1;
        tracing::trace!(invocation = self.invocations, num_samples, "stream callback");

        if samples.is_null() {
            self.scratch.fill(Sc16::new(0, 0));
        } else {
            if num_samples != self.buffer_size {
                return self.fail(Error::BufferSizeMismatch {
                    requested: self.buffer_size,
                    actual: num_samples,
                });
            }
            let raw = std::slice::from_raw_parts(samples as *const i16, num_samples * 2);
            for (dst, pair) in self.scratch.iter_mut().zip(raw.chunks_exact(2)) {
                *dst = Sc16::new(i16::from_le(pair[0]), i16::from_le(pair[1]));
            }
        }

        let callback = &mut self.callback;
        let scratch = self.scratch.as_mut_slice();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(scratch)));
        let signal = match outcome {
            Ok(signal) => signal,
            Err(_) => {
                return self.fail(Error::ContractViolation("stream callback panicked".into()));
            }
        };

        match signal {
            StreamSignal::Continue => {
                let Some(next) = self.next_buffer() else {
                    return self.fail(Error::ContractViolation("stream has no buffer pool".into()));
                };
                if self.direction == Direction::Tx {
                    let out =
                        std::slice::from_raw_parts_mut(next.0 as *mut i16, self.buffer_size * 2);
                    for (pair, s) in out.chunks_exact_mut(2).zip(self.scratch.iter()) {
                        pair[0] = s.re.to_le();
                        pair[1] = s.im.to_le();
                    }
                }
                next.0
            }
            StreamSignal::NoData => STREAM_NO_DATA,
            StreamSignal::Shutdown => {
                tracing::debug!(invocations = self.invocations, "Stream callback requested shutdown");
                self.shutdown = true;
                STREAM_SHUTDOWN
            }
        }
    }
}

type Registry = Mutex<HashMap<u64, Arc<Mutex<CallbackContext>>>>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, HashMap<u64, Arc<Mutex<CallbackContext>>>> {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn lookup(token: u64) -> Option<Arc<Mutex<CallbackContext>>> {
    registry().get(&token).cloned()
}

fn with_context<T>(token: u64, f: impl FnOnce(&mut CallbackContext) -> T) -> Option<T> {
    let ctx = lookup(token)?;
    let mut guard = ctx.lock().unwrap_or_else(PoisonError::into_inner);
    Some(f(&mut guard))
}

/// Store `ctx` and return its token.
pub(crate) fn register(ctx: CallbackContext) -> u64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    registry().insert(token, Arc::new(Mutex::new(ctx)));
    token
}

/// Drop the context for `token`. Returns false if it was already gone.
pub(crate) fn unregister(token: u64) -> bool {
    registry().remove(&token).is_some()
}

/// Hand the driver's buffer pool to the context. `in_flight` is the number
/// of transfers the driver keeps submitted.
pub(crate) fn set_pool(token: u64, buffers: &[*mut c_void], in_flight: usize) {
    with_context(token, |ctx| {
        ctx.pool = buffers.iter().map(|&p| BufferPtr(p)).collect();
        ctx.in_flight = in_flight;
        ctx.rewind();
    });
}

/// Restart the buffer rotation for a fresh `bladerf_stream` call.
pub(crate) fn rewind(token: u64) {
    with_context(token, CallbackContext::rewind);
}

pub(crate) fn take_failure(token: u64) -> Option<Error> {
    with_context(token, |ctx| ctx.failure.take()).flatten()
}

pub(crate) fn is_shutdown(token: u64) -> bool {
    with_context(token, |ctx| ctx.shutdown).unwrap_or(true)
}

pub(crate) fn invocations(token: u64) -> u64 {
    with_context(token, |ctx| ctx.invocations).unwrap_or(0)
}

/// The `bladerf_stream_cb` handed to the driver.
///
/// # Safety
///
/// Called by the driver with `user_data` set to a token from [`register`].
pub(crate) unsafe extern "C" fn trampoline(
    _dev: *mut c_void,
    _stream: *mut c_void,
    _meta: *mut RawMetadata,
    samples: *mut c_void,
    num_samples: usize,
    user_data: *mut c_void,
) -> *mut c_void {
    let token = user_data as u64;
    let Some(ctx) = lookup(token) else {
        tracing::warn!(token, "Stream callback after teardown, shutting down");
        return STREAM_SHUTDOWN;
    };
    let mut guard = ctx.lock().unwrap_or_else(PoisonError::into_inner);
    guard.invoke(samples, num_samples)
}
