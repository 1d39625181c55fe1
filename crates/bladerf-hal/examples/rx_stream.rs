//! Stream RX samples and report per-buffer power
//!
//! The stream runs on its own thread and hands copies of each buffer to the
//! main thread over a channel; the callback stops the stream after a fixed
//! number of buffers.
//!
//! Run with: cargo run --example rx_stream -p bladerf-hal [-- --native]
//!
//! Without `--native` the software device is used.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use bladerf_core::config::{BladeRfConfig, StreamConfig};
use bladerf_core::iq::sc16_to_complex;
use bladerf_core::logging::init_logging;
use bladerf_core::{ChannelLayout, Direction};
use bladerf_hal::{
    library_version, load_driver, set_native_verbosity, DeviceHandle, NativeDriver, SimDriver,
    StreamEngine, StreamSignal,
};
use num_complex::Complex32;

const BUFFERS_TO_READ: usize = 32;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BladeRfConfig::load()?;
    config.validate()?;
    init_logging(&config.logging);

    let native = std::env::args().any(|a| a == "--native");
    let driver: Arc<dyn NativeDriver> = if native {
        load_driver(config.device.library.as_deref())?
    } else {
        Arc::new(SimDriver::new())
    };
    set_native_verbosity(driver.as_ref(), config.device.verbosity);
    println!("libbladeRF {} ({})", library_version(driver.as_ref()), driver.name());

    let dev = DeviceHandle::open(driver, &config.device.identifier)?;
    let info = dev.devinfo()?;
    println!("Opened {} {} serial {}", info.manufacturer, info.product, info.serial);

    let applied = dev.apply_channel_config(&config.channel)?;
    println!(
        "{}: {:.3} MHz, {:.3} MS/s, bandwidth {:.3} MHz",
        config.channel.channel(),
        applied.frequency_hz as f64 / 1e6,
        applied.sample_rate_hz as f64 / 1e6,
        applied.bandwidth_hz as f64 / 1e6
    );
    dev.enable_module(config.channel.channel(), true)?;

    let stream_config = StreamConfig {
        direction: Direction::Rx,
        layout: ChannelLayout::RxX2,
        ..config.stream
    };

    let (tx, rx) = mpsc::channel::<Vec<Complex32>>();
    let mut remaining = BUFFERS_TO_READ;
    let mut engine = StreamEngine::new(&dev);
    engine.init(&stream_config, move |samples| {
        let converted: Vec<Complex32> = samples.iter().map(|&s| sc16_to_complex(s)).collect();
        if tx.send(converted).is_err() {
            return StreamSignal::Shutdown;
        }
        remaining -= 1;
        if remaining == 0 {
            StreamSignal::Shutdown
        } else {
            StreamSignal::Continue
        }
    })?;

    let layout = stream_config.layout;
    let streamer = thread::spawn(move || engine.start(layout));

    for (n, buffer) in rx.iter().enumerate() {
        let power = buffer
            .iter()
            .map(|s| s.norm_sqr())
            .sum::<f32>()
            / buffer.len().max(1) as f32;
        let dbfs = 10.0 * power.max(f32::MIN_POSITIVE).log10();
        println!("buffer {:3}: {} samples, {:6.1} dBFS", n, buffer.len(), dbfs);
    }

    match streamer.join() {
        Ok(result) => result?,
        Err(_) => return Err("stream thread panicked".into()),
    }

    dev.enable_module(config.channel.channel(), false)?;
    dev.close()?;
    Ok(())
}
