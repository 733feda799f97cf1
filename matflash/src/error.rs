//! Error types for matflash.

use crate::session::Phase;
use std::io;
use thiserror::Error;

/// Result type for matflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for matflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading a firmware image.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// USB transport error.
    #[cfg(feature = "native")]
    #[error("USB error while trying to {step}: {source}")]
    Usb {
        /// Transport step that failed (open, claim interface, bulk write, ...).
        step: &'static str,
        /// Underlying libusb error.
        #[source]
        source: rusb::Error,
    },

    /// No device with the requested vendor/product ID is attached.
    #[error("Device {vid:04x}:{pid:04x} not found (is it in boot mode?)")]
    DeviceNotFound {
        /// USB vendor ID.
        vid: u16,
        /// USB product ID.
        pid: u16,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered with a different byte than the phase expects.
    #[error("Unexpected response: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedResponse {
        /// Expected response byte.
        expected: u8,
        /// Received response byte.
        actual: u8,
    },

    /// The device answered with a NAK.
    #[error("Device rejected the request: expected {expected:#04x}, got NAK {code:#04x}")]
    Nak {
        /// Expected response byte.
        expected: u8,
        /// NAK byte as received.
        code: u8,
    },

    /// A response frame was shorter than its layout requires.
    #[error("Short frame: expected at least {expected} bytes, got {actual}")]
    ShortFrame {
        /// Required length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// A size field disagrees with the frame layout.
    #[error("Frame size mismatch: expected {expected}, declared {actual}")]
    SizeMismatch {
        /// Size the layout requires.
        expected: usize,
        /// Size declared in the frame header.
        actual: usize,
    },

    /// Frame checksum mismatch.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte carried by the frame.
        actual: u8,
    },

    /// Device-reported User MAT sum differs from the locally accumulated sum.
    #[error(
        "User MAT sum mismatch: device reported {device:#010x}, expected {local:#010x}; firmware may be written incorrectly"
    )]
    SumMismatch {
        /// Sum reported by the device.
        device: u32,
        /// Sum accumulated while programming.
        local: u32,
    },

    /// Firmware image cannot be programmed.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Operation interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// A protocol phase failed; the run was aborted.
    #[error("{phase} failed: {source}")]
    PhaseFailed {
        /// Phase in which the failure occurred.
        phase: Phase,
        /// Cause of the failure.
        #[source]
        source: Box<Error>,
    },

    /// Programming stopped part way; the User MAT is in an undefined state.
    #[error(
        "Programming aborted after {written} of {total} blocks, User MAT contents are undefined: {source}"
    )]
    ProgrammingIncomplete {
        /// Blocks acknowledged by the device.
        written: usize,
        /// Blocks in the image.
        total: usize,
        /// Cause of the abort.
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`], used to pick an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device missing, USB failure or timeout.
    Transport,
    /// Malformed or unexpected response.
    Protocol,
    /// Device-reported sum does not match what was sent.
    Integrity,
    /// Firmware image unreadable or rejected.
    Image,
    /// Interrupted before the device was modified.
    Cancelled,
    /// Programming started but did not finish.
    Incomplete,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } | Self::Timeout(_) => ErrorKind::Transport,
            #[cfg(feature = "native")]
            Self::Usb { .. } => ErrorKind::Transport,
            Self::UnexpectedResponse { .. }
            | Self::Nak { .. }
            | Self::ShortFrame { .. }
            | Self::SizeMismatch { .. }
            | Self::ChecksumMismatch { .. } => ErrorKind::Protocol,
            Self::SumMismatch { .. } => ErrorKind::Integrity,
            Self::Io(_) | Self::InvalidImage(_) => ErrorKind::Image,
            Self::Interrupted => ErrorKind::Cancelled,
            Self::ProgrammingIncomplete { .. } => ErrorKind::Incomplete,
            Self::PhaseFailed { source, .. } => source.kind(),
        }
    }

    /// Phase in which this error occurred, if it was raised by the flasher.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::PhaseFailed { phase, .. } => Some(*phase),
            Self::ProgrammingIncomplete { .. } => Some(Phase::Programming),
            _ => None,
        }
    }

    /// Innermost error, with phase and programming wrappers removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::PhaseFailed { source, .. } | Self::ProgrammingIncomplete { source, .. } => {
                source.root()
            },
            other => other,
        }
    }

    /// Map a libusb failure, turning timeouts into [`Error::Timeout`].
    #[cfg(feature = "native")]
    pub(crate) fn usb(step: &'static str, source: rusb::Error) -> Self {
        match source {
            rusb::Error::Timeout => Self::Timeout(format!("no response during {step}")),
            source => Self::Usb { step, source },
        }
    }
}
