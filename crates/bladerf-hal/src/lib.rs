//! # bladerf-hal
//!
//! Device access, capability enumeration, and IQ transfer for bladeRF
//! transceivers on top of libbladeRF.
//!
//! ## Components
//!
//! - [`DeviceHandle`]: an open device session and the per-channel controls
//! - [`CapabilityEnumerator`]: gain stages/modes, loopback modes, ranges,
//!   and the free functions [`device_list`] / [`bootloader_list`]
//! - [`SyncTransferEngine`]: blocking RX/TX of caller-sized buffers
//! - [`StreamEngine`]: continuous callback-driven RX/TX
//! - [`NativeDriver`]: the libbladeRF surface, implemented by [`LibBladeRf`]
//!   (the real library, loaded at runtime) and [`SimDriver`] (software)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bladerf_hal::{DeviceHandle, LibBladeRf, NativeDriver, SimDriver};
//!
//! let driver: Arc<dyn NativeDriver> = match LibBladeRf::load() {
//!     Ok(lib) => Arc::new(lib),
//!     Err(_) => Arc::new(SimDriver::new()),
//! };
//! let dev = DeviceHandle::open(driver, "")?;
//! for stage in dev.capabilities().gain_stages(Channel::RX0)? {
//!     println!("{}", stage);
//! }
//! ```

pub mod bridge;
pub mod device;
pub mod driver;
pub mod enumerate;
pub mod ffi;
pub mod sim;
pub mod stream;
pub mod sync;

pub use bridge::{StreamFn, StreamSignal};
pub use device::{library_version, set_native_verbosity, DeviceHandle};
pub use driver::NativeDriver;
pub use enumerate::{bootloader_list, device_list, CapabilityEnumerator};
pub use ffi::LibBladeRf;
pub use sim::SimDriver;
pub use stream::{StreamEngine, StreamState};
pub use sync::SyncTransferEngine;

use std::path::Path;
use std::sync::Arc;

use bladerf_core::error::Result;

/// Load libbladeRF from `path`, or from the platform search path when
/// `None`.
pub fn load_driver(path: Option<&Path>) -> Result<Arc<dyn NativeDriver>> {
    let lib = match path {
        Some(path) => LibBladeRf::load_from(path)?,
        None => LibBladeRf::load()?,
    };
    Ok(Arc::new(lib))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bladerf_core::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_load_driver_rejects_non_library() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a shared object").unwrap();

        let err = load_driver(Some(file.path())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }
}
