//! Native USB bulk transport using the `rusb` (libusb) crate.

use {
    crate::{
        error::{Error, Result},
        port::{MAX_TRANSFER, Transport, UsbConfig, UsbDeviceInfo},
    },
    log::{debug, trace, warn},
    rusb::{Context, DeviceHandle, UsbContext},
    std::time::Duration,
};

/// Boot-mode device opened over libusb.
pub struct UsbPort {
    handle: Option<DeviceHandle<Context>>,
    name: String,
    interface: u8,
    endpoint_out: u8,
    endpoint_in: u8,
}

impl UsbPort {
    /// Open and claim the first device matching the configured vendor/product ID.
    pub fn open(config: &UsbConfig) -> Result<Self> {
        let context = Context::new().map_err(|e| Error::usb("initialize libusb", e))?;
        let mut handle = context
            .open_device_with_vid_pid(config.vid, config.pid)
            .ok_or(Error::DeviceNotFound {
                vid: config.vid,
                pid: config.pid,
            })?;

        let device = handle.device();
        let descriptor = device
            .device_descriptor()
            .map_err(|e| Error::usb("read device descriptor", e))?;
        let name = format!(
            "usb:{:04x}:{:04x} (bus {} address {})",
            descriptor.vendor_id(),
            descriptor.product_id(),
            device.bus_number(),
            device.address()
        );
        debug!("Opened {name}");

        if config.reset {
            handle
                .reset()
                .map_err(|e| Error::usb("reset device", e))?;
        }

        // The interface is released explicitly, libusb must not reattach on its own.
        if let Err(e) = handle.set_auto_detach_kernel_driver(false) {
            trace!("Auto-detach not supported: {e}");
        }

        match handle.kernel_driver_active(config.interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", config.interface);
                handle
                    .detach_kernel_driver(config.interface)
                    .map_err(|e| Error::usb("detach kernel driver", e))?;
            },
            Ok(false) => {},
            Err(e) => trace!("Kernel driver query not supported: {e}"),
        }

        handle
            .set_active_configuration(config.configuration)
            .map_err(|e| Error::usb("set configuration", e))?;
        handle
            .claim_interface(config.interface)
            .map_err(|e| Error::usb("claim interface", e))?;

        Ok(Self {
            handle: Some(handle),
            name,
            interface: config.interface,
            endpoint_out: config.endpoint_out,
            endpoint_in: config.endpoint_in,
        })
    }

    fn handle(&mut self) -> Result<&mut DeviceHandle<Context>> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::usb("use closed device", rusb::Error::NoDevice))
    }
}

impl Transport for UsbPort {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let endpoint = self.endpoint_out;
        trace!("TX {} bytes: {:02X?}", data.len(), &data[..data.len().min(16)]);
        self.handle()?
            .write_bulk(endpoint, data, timeout)
            .map_err(|e| Error::usb("bulk write", e))
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let endpoint = self.endpoint_in;
        let mut buf = vec![0u8; max_len.clamp(1, MAX_TRANSFER)];
        let n = self
            .handle()?
            .read_bulk(endpoint, &mut buf, timeout)
            .map_err(|e| Error::usb("bulk read", e))?;
        buf.truncate(n);
        trace!("RX {n} bytes: {:02X?}", &buf[..n.min(16)]);
        Ok(buf)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle
                .release_interface(self.interface)
                .map_err(|e| Error::usb("release interface", e))?;
            debug!("Released {}", self.name);
        }
        Ok(())
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release {}: {e}", self.name);
        }
    }
}

/// List attached USB devices, optionally filtered by vendor/product ID.
pub fn list_devices(filter: Option<(u16, u16)>) -> Result<Vec<UsbDeviceInfo>> {
    let context = Context::new().map_err(|e| Error::usb("initialize libusb", e))?;
    let devices = context
        .devices()
        .map_err(|e| Error::usb("enumerate devices", e))?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                trace!(
                    "Skipping device on bus {} address {}: {e}",
                    device.bus_number(),
                    device.address()
                );
                continue;
            },
        };

        let info = UsbDeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            vid: descriptor.vendor_id(),
            pid: descriptor.product_id(),
        };

        if filter.is_none_or(|(vid, pid)| info.vid == vid && info.pid == pid) {
            found.push(info);
        }
    }

    Ok(found)
}
