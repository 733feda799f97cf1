//! Transport abstraction for talking to the boot ROM.
//!
//! The flasher never touches USB directly. It sends and receives whole
//! transfers through the [`Transport`] trait, which keeps the protocol layer
//! independent of the transport and lets tests drive it with scripted bytes.
//!
//! ```text
//! +------------------+
//! |   Flasher        |
//! | (phase machine)  |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Transport trait |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  UsbPort (rusb)  |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use matflash::port::Transport;
//! use std::time::Duration;
//!
//! fn ping<T: Transport>(port: &mut T) -> matflash::Result<bool> {
//!     port.send(&[0x55], Duration::from_secs(1))?;
//!     let response = port.receive(1, Duration::from_secs(1))?;
//!     Ok(response.first() == Some(&0xE6))
//! }
//! ```

#[cfg(feature = "native")]
pub mod usb;

use crate::error::Result;
use std::time::Duration;

/// Default vendor ID of the boot-mode USB function.
pub const DEFAULT_VID: u16 = 0x045B;

/// Default product ID of the boot-mode USB function.
pub const DEFAULT_PID: u16 = 0x0025;

/// Default bulk OUT endpoint.
pub const DEFAULT_ENDPOINT_OUT: u8 = 0x01;

/// Default bulk IN endpoint.
pub const DEFAULT_ENDPOINT_IN: u8 = 0x82;

/// Default per-transfer timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest single bulk read.
pub const MAX_TRANSFER: usize = 64 * 1024;

/// USB transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConfig {
    /// Vendor ID to open.
    pub vid: u16,
    /// Product ID to open.
    pub pid: u16,
    /// Interface to claim.
    pub interface: u8,
    /// Configuration to activate.
    pub configuration: u8,
    /// Bulk OUT endpoint address.
    pub endpoint_out: u8,
    /// Bulk IN endpoint address.
    pub endpoint_in: u8,
    /// Per-transfer timeout.
    pub timeout: Duration,
    /// Reset the device before claiming it.
    pub reset: bool,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: DEFAULT_VID,
            pid: DEFAULT_PID,
            interface: 0,
            configuration: 1,
            endpoint_out: DEFAULT_ENDPOINT_OUT,
            endpoint_in: DEFAULT_ENDPOINT_IN,
            timeout: DEFAULT_TIMEOUT,
            reset: true,
        }
    }
}

impl UsbConfig {
    /// Create a new configuration for the given vendor/product ID.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Information about an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbDeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
}

/// Half-duplex, transfer-oriented transport.
///
/// Implementations perform no retries. A timeout is reported as
/// [`Error::Timeout`](crate::Error::Timeout).
pub trait Transport {
    /// Send `data` as one transfer. Returns the number of bytes written.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Receive one transfer of at most `max_len` bytes.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Notify the transport that the link bit rate changed.
    ///
    /// Transports without a notion of bit rate ignore this.
    fn set_bit_rate(&mut self, _bps: u32) -> Result<()> {
        Ok(())
    }

    /// Human-readable name of the transport endpoint.
    fn name(&self) -> &str;

    /// Release the underlying device.
    ///
    /// After calling this method, the transport cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Send all of `data`, treating a short write as an error.
    fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let written = self.send(data, timeout)?;
        if written != data.len() {
            return Err(crate::Error::ShortFrame {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        (**self).send(data, timeout)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive(max_len, timeout)
    }

    fn set_bit_rate(&mut self, bps: u32) -> Result<()> {
        (**self).set_bit_rate(bps)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use usb::{UsbPort, list_devices};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_config_default() {
        let config = UsbConfig::default();
        assert_eq!(config.vid, 0x045B);
        assert_eq!(config.pid, 0x0025);
        assert_eq!(config.interface, 0);
        assert_eq!(config.configuration, 1);
        assert_eq!(config.endpoint_out, 0x01);
        assert_eq!(config.endpoint_in, 0x82);
        assert!(config.reset);
    }

    #[test]
    fn test_usb_config_builder() {
        let config = UsbConfig::new(0x1234, 0x5678).with_timeout(Duration::from_millis(250));
        assert_eq!(config.vid, 0x1234);
        assert_eq!(config.pid, 0x5678);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    /// Accepts at most `limit` bytes per send.
    struct ShortWriter {
        limit: usize,
    }

    impl Transport for ShortWriter {
        fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            Ok(data.len().min(self.limit))
        }

        fn receive(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "short"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_all_rejects_short_write() {
        let mut port = ShortWriter { limit: 4 };
        assert!(port.send_all(&[0x55], DEFAULT_TIMEOUT).is_ok());
        assert!(matches!(
            port.send_all(&[0u8; 6], DEFAULT_TIMEOUT),
            Err(crate::Error::ShortFrame {
                expected: 6,
                actual: 4
            })
        ));

        // Through the &mut blanket impl
        let mut borrowed = &mut port;
        assert_eq!(<&mut ShortWriter as Transport>::name(&borrowed), "short");
        assert!(
            <&mut ShortWriter as Transport>::send_all(&mut borrowed, &[0x55], DEFAULT_TIMEOUT)
                .is_ok()
        );
    }
}
