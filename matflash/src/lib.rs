//! # matflash
//!
//! A library for programming the User MAT (user flash area) of Hitachi/Renesas
//! microcontrollers through the boot-mode ROM over USB.
//!
//! This crate provides:
//!
//! - The boot-mode frame codec and its two's-complement checksum
//! - Response decoding for the device, clock mode and programming unit inquiries
//! - A phase-by-phase [`Flasher`] that programs 1024-byte blocks and verifies
//!   the device-reported User MAT sum
//! - A USB bulk transport on top of libusb
//!
//! ## Features
//!
//! - `native` (default): USB transport through the `rusb` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use matflash::{FirmwareImage, Flasher, PaddingPolicy};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.bin", PaddingPolicy::default())?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut port = matflash::UsbPort::open(&matflash::UsbConfig::default())?;
//!         let report = Flasher::new(&mut port).run(&image, &mut ())?;
//!         println!("Device {} programmed, sum 0x{:08X}", report.device, report.checksum);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used between protocol phases and
/// between programmed blocks.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{UsbPort, list_devices};
pub use {
    error::{Error, ErrorKind, Result},
    flasher::{FlashReport, Flasher, Reporter},
    image::{FirmwareImage, PaddingPolicy, ProgrammingChunk},
    port::{Transport, UsbConfig, UsbDeviceInfo},
    protocol::{
        BitRateParams, DeviceIdentity, InquiryList,
        checksum::{checksum, verify},
    },
    session::{FlashSession, Phase},
};
