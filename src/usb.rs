use std::time::Duration;

use rusb::{
    request_type, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType,
    UsbContext,
};

use crate::cmd::{DfuRequest, FlashError};
use crate::target::TargetDescriptor;
use crate::USB_TIMEOUT;

type Result<T> = ::std::result::Result<T, FlashError>;

/// DFU interface class and subclass codes.
const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x01;
const DEFAULT_CONFIGURATION: u8 = 1;
const DEFAULT_INTERFACE: u8 = 0;

/// Class requests addressed to the DFU interface of an open device.
///
/// Implementations own the claimed interface and release it on drop.
pub trait DfuTransport {
    /// Host-to-device class request.
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()>;

    /// Device-to-host class request reading up to `length` bytes.
    fn control_in(&mut self, request: DfuRequest, value: u16, length: usize) -> Result<Vec<u8>>;

    /// Bus reset of the device.
    fn reset(&mut self) -> Result<()>;
}

/// Opens transports for a target.
pub trait DfuConnector {
    type Transport: DfuTransport;

    /// Opens and claims the bootloader interface of the first matching device.
    fn open(&mut self, target: &TargetDescriptor) -> Result<Self::Transport>;

    /// Product name of the first matching device, if one is attached.
    fn find(&mut self, vendor_id: u16, product_id: u16) -> Result<Option<String>>;
}

/// rusb backed [`DfuConnector`].
#[derive(Debug)]
pub struct UsbConnector<T: UsbContext> {
    context: T,
}

impl<T: UsbContext> UsbConnector<T> {
    pub fn new(context: T) -> Self {
        UsbConnector { context }
    }

    fn open_device(
        &self,
        vid: u16,
        pid: u16,
    ) -> Result<(Device<T>, DeviceDescriptor, DeviceHandle<T>)> {
        let devices = self.context.devices()?;

        for device in devices.iter() {
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };

            if device_desc.vendor_id() == vid && device_desc.product_id() == pid {
                let handle = device.open()?;
                return Ok((device, device_desc, handle));
            }
        }

        Err(FlashError::DeviceNotFound)
    }
}

impl<T: UsbContext> DfuConnector for UsbConnector<T> {
    type Transport = UsbConnection<T>;

    fn open(&mut self, target: &TargetDescriptor) -> Result<UsbConnection<T>> {
        let (device, desc, handle) = self.open_device(target.vendor_id, target.chip_id)?;
        UsbConnection::new(device, desc, handle, target.honor_interface_class)
    }

    fn find(&mut self, vendor_id: u16, product_id: u16) -> Result<Option<String>> {
        match self.open_device(vendor_id, product_id) {
            Ok((_, desc, handle)) => Ok(Some(
                handle
                    .read_product_string_ascii(&desc)
                    .unwrap_or_else(|_| format!("{:04x}:{:04x}", vendor_id, product_id)),
            )),
            Err(FlashError::DeviceNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Claimed DFU interface of an open USB device.
#[derive(Debug)]
pub struct UsbConnection<T: UsbContext> {
    _device: Device<T>,
    _desc: DeviceDescriptor,
    handle: DeviceHandle<T>,

    iface: u8,
    has_kernel_driver: bool,
}

impl<T: UsbContext> Drop for UsbConnection<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            log::warn!("could not release interface {}: {}", self.iface, e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.iface) {
                log::warn!("could not reattach kernel driver: {}", e);
            }
        }
    }
}

impl<T: UsbContext> UsbConnection<T> {
    fn new(
        device: Device<T>,
        desc: DeviceDescriptor,
        handle: DeviceHandle<T>,
        honor_interface_class: bool,
    ) -> Result<Self> {
        let (cfg, iface, setting) = if honor_interface_class {
            Self::find_dfu_interface(&device, &desc).ok_or(FlashError::UsbInterfaceNotFound)?
        } else {
            (DEFAULT_CONFIGURATION, DEFAULT_INTERFACE, 0)
        };

        let has_kernel_driver = match handle.kernel_driver_active(iface) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(iface)
                    .map_err(FlashError::UsbDetachKernelDriverFailure)?;
                true
            }
            _ => false,
        };

        if let Err(e) = handle.set_active_configuration(cfg) {
            log::debug!("could not set usb configuration {}: {}", cfg, e);
        }

        handle.claim_interface(iface).map_err(|e| match e {
            rusb::Error::Access => FlashError::PermissionDenied,
            e => FlashError::UsbClaimInterfaceFailure(e),
        })?;
        if setting != 0 {
            handle
                .set_alternate_setting(iface, setting)
                .map_err(FlashError::UsbClaimInterfaceFailure)?;
        }

        log::debug!(
            "claimed interface {} of {:04x}:{:04x}",
            iface,
            desc.vendor_id(),
            desc.product_id()
        );

        Ok(UsbConnection {
            _device: device,
            _desc: desc,
            handle,

            iface,
            has_kernel_driver,
        })
    }

    fn find_dfu_interface(device: &Device<T>, desc: &DeviceDescriptor) -> Option<(u8, u8, u8)> {
        for n in 0..desc.num_configurations() {
            let config_desc = match device.config_descriptor(n) {
                Ok(c) => c,
                Err(_) => continue,
            };

            for iface in config_desc.interfaces() {
                for iface_desc in iface.descriptors() {
                    if iface_desc.class_code() == DFU_CLASS
                        && iface_desc.sub_class_code() == DFU_SUBCLASS
                    {
                        return Some((
                            config_desc.number(),
                            iface_desc.interface_number(),
                            iface_desc.setting_number(),
                        ));
                    }
                }
            }
        }

        None
    }
}

impl<T: UsbContext> DfuTransport for UsbConnection<T> {
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()> {
        let timeout = Duration::from_millis(USB_TIMEOUT);
        let len = self.handle.write_control(
            request_type(Direction::Out, RequestType::Class, Recipient::Interface),
            request as u8,
            value,
            self.iface.into(),
            data,
            timeout,
        )?;

        if len != data.len() {
            return Err(FlashError::UnexpectedResponse {
                expected: data.len(),
                actual: len,
            });
        }

        Ok(())
    }

    fn control_in(&mut self, request: DfuRequest, value: u16, length: usize) -> Result<Vec<u8>> {
        let timeout = Duration::from_millis(USB_TIMEOUT);
        let mut buf = vec![0u8; length];
        let len = self.handle.read_control(
            request_type(Direction::In, RequestType::Class, Recipient::Interface),
            request as u8,
            value,
            self.iface.into(),
            &mut buf,
            timeout,
        )?;
        buf.truncate(len);

        Ok(buf)
    }

    fn reset(&mut self) -> Result<()> {
        Ok(self.handle.reset()?)
    }
}
