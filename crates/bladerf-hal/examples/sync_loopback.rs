//! Send a tone burst through firmware loopback with the sync interface
//!
//! Configures both directions for the metadata format, transmits one
//! timestamped burst and reads it back.
//!
//! Run with: cargo run --example sync_loopback -p bladerf-hal [-- --native]

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use bladerf_core::config::SyncConfig;
use bladerf_core::iq::{complex_to_int16, sc16_to_complex};
use bladerf_core::logging::{init_logging, LogConfig};
use bladerf_core::metadata::Metadata;
use bladerf_core::{Channel, ChannelLayout, Format, Loopback};
use bladerf_hal::{load_driver, DeviceHandle, NativeDriver, SimDriver, SyncTransferEngine};
use num_complex::Complex32;

const BURST_SAMPLES: usize = 4096;
const TIMEOUT: Duration = Duration::from_millis(3500);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LogConfig::development());

    let driver: Arc<dyn NativeDriver> = if std::env::args().any(|a| a == "--native") {
        load_driver(None)?
    } else {
        Arc::new(SimDriver::new())
    };
    let dev = DeviceHandle::open(driver, "")?;

    println!("Loopback modes:");
    for mode in dev.capabilities().loopback_modes()? {
        println!("  {:<20} {:?}", mode.name, mode.mode);
    }
    dev.set_loopback(Loopback::Firmware)?;

    let mut sync = SyncTransferEngine::new(&dev);
    for layout in [ChannelLayout::RxX1, ChannelLayout::TxX1] {
        sync.configure(&SyncConfig {
            layout,
            format: Format::Sc16Q11Meta,
            ..Default::default()
        })?;
    }
    dev.enable_module(Channel::RX0, true)?;
    dev.enable_module(Channel::TX0, true)?;

    let tone: Vec<Complex32> = (0..BURST_SAMPLES)
        .map(|n| Complex32::from_polar(0.5, TAU * n as f32 / 64.0))
        .collect();
    let burst = complex_to_int16(&tone);

    let sent = sync.tx(&burst, Metadata::tx_burst_now(), TIMEOUT)?;
    println!("TX: {} samples at t={}", sent.actual_count, sent.timestamp);

    let (samples, meta) = sync.rx(BURST_SAMPLES, Metadata::rx_now(), TIMEOUT)?;
    println!("RX: {} samples at t={}", samples.len(), meta.timestamp);
    if meta.overrun() {
        println!("RX overrun reported");
    }

    let max_err = samples
        .iter()
        .zip(tone.iter())
        .map(|(&s, &t)| (sc16_to_complex(s) - t).norm())
        .fold(0.0f32, f32::max);
    println!("Max deviation from sent tone: {:.5}", max_err);

    dev.set_loopback(Loopback::None)?;
    dev.enable_module(Channel::RX0, false)?;
    dev.enable_module(Channel::TX0, false)?;
    dev.close()?;
    Ok(())
}
