use crate::buffer::MemoryBuffer;
use crate::cmd::FlashError;
use crate::device::Progress;
use crate::target::Segment;
use crate::SEGMENT_SIZE;

type Result<T> = ::std::result::Result<T, FlashError>;

/// Report carrying the segment tag and page address (v1).
const REPORT_COMMAND: u8 = 1;
/// Report carrying page data (v1).
const REPORT_DATA: u8 = 2;
/// Output report id of devices without numbered reports (v0).
const REPORT_NONE: u8 = 0;
const CMD_LAUNCH: u8 = 0x03;

/// Global "Report ID" item with one data byte.
const ITEM_REPORT_ID: u8 = 0x85;
/// Prefix of a long item.
const ITEM_LONG: u8 = 0xFE;

/// Report layout spoken by the HID bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidProtocol {
    /// Unnumbered output reports of `page_size + 2` bytes; no readback.
    V0,
    /// Numbered feature reports with readback of every page.
    V1,
}

impl HidProtocol {
    /// Picks the layout from a report descriptor: devices declaring report
    /// ids speak v1, all others v0.
    pub fn from_report_descriptor(descriptor: &[u8]) -> Self {
        if has_report_ids(descriptor) {
            HidProtocol::V1
        } else {
            HidProtocol::V0
        }
    }
}

/// Walks the descriptor item by item looking for a Report ID item.
fn has_report_ids(descriptor: &[u8]) -> bool {
    let mut i = 0;
    while let Some(&prefix) = descriptor.get(i) {
        if prefix == ITEM_LONG {
            let size = descriptor.get(i + 1).copied().unwrap_or(0) as usize;
            i += 3 + size;
            continue;
        }
        if prefix == ITEM_REPORT_ID {
            return true;
        }
        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        i += 1 + size;
    }
    false
}

/// Report exchange with an open HID bootloader.
///
/// Report ids are passed separately; payloads never include them.
pub trait HidTransport {
    fn send_feature_report(&mut self, report_id: u8, data: &[u8]) -> Result<()>;

    fn receive_feature_report(&mut self, report_id: u8, length: usize) -> Result<Vec<u8>>;

    /// Output report.
    fn send(&mut self, report_id: u8, data: &[u8]) -> Result<()>;
}

/// Opens HID transports.
pub trait HidConnector {
    type Transport: HidTransport;

    /// Opens the device and reports the layout its report descriptor implies.
    fn connect(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<(Self::Transport, HidProtocol)>;

    /// Product name of the first matching device, if one is attached.
    fn find(&mut self, vendor_id: u16, product_id: u16) -> Result<Option<String>>;
}

/// hidapi backed [`HidConnector`].
pub struct HidApiConnector {
    api: hidapi::HidApi,
}

impl HidApiConnector {
    pub fn new() -> Result<Self> {
        Ok(HidApiConnector {
            api: hidapi::HidApi::new()?,
        })
    }

    fn product_string(&mut self, vendor_id: u16, product_id: u16) -> Result<Option<String>> {
        self.api.refresh_devices()?;
        Ok(self
            .api
            .device_list()
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .map(|d| d.product_string().unwrap_or_default().to_string()))
    }
}

impl HidConnector for HidApiConnector {
    type Transport = HidApiTransport;

    fn connect(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<(HidApiTransport, HidProtocol)> {
        if self.product_string(vendor_id, product_id)?.is_none() {
            return Err(FlashError::DeviceNotFound);
        }
        let device = self.api.open(vendor_id, product_id)?;

        let mut descriptor = vec![0u8; hidapi::MAX_REPORT_DESCRIPTOR_SIZE];
        let len = device.get_report_descriptor(&mut descriptor)?;
        descriptor.truncate(len);
        let protocol = HidProtocol::from_report_descriptor(&descriptor);
        log::debug!(
            "connected to {:04x}:{:04x}, protocol {:?}",
            vendor_id,
            product_id,
            protocol
        );
        Ok((HidApiTransport { device }, protocol))
    }

    fn find(&mut self, vendor_id: u16, product_id: u16) -> Result<Option<String>> {
        self.product_string(vendor_id, product_id)
    }
}

/// Open hidapi device; closed on drop.
pub struct HidApiTransport {
    device: hidapi::HidDevice,
}

impl HidTransport for HidApiTransport {
    fn send_feature_report(&mut self, report_id: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(report_id);
        buf.extend_from_slice(data);
        Ok(self.device.send_feature_report(&buf)?)
    }

    fn receive_feature_report(&mut self, report_id: u8, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length + 1];
        buf[0] = report_id;
        let len = self.device.get_feature_report(&mut buf)?;
        Ok(buf.get(1..len).map(<[u8]>::to_vec).unwrap_or_default())
    }

    fn send(&mut self, report_id: u8, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(report_id);
        buf.extend_from_slice(data);
        self.device.write(&buf)?;
        Ok(())
    }
}

/// Session with a HID bootloader writing one page per exchange.
pub struct HidBootloader<T: HidTransport> {
    transport: T,
    protocol: HidProtocol,
    page_size: usize,
}

impl<T: HidTransport> HidBootloader<T> {
    pub fn new(transport: T, protocol: HidProtocol, page_size: usize) -> Self {
        HidBootloader {
            transport,
            protocol,
            page_size,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Bootloader version byte (v1 only).
    pub fn version(&mut self) -> Result<Option<u8>> {
        if self.protocol == HidProtocol::V0 {
            return Ok(None);
        }
        self.transport
            .send_feature_report(REPORT_COMMAND, &vec![0u8; self.page_size])?;
        let data = self
            .transport
            .receive_feature_report(REPORT_DATA, self.page_size)?;
        Ok(data.first().copied())
    }

    /// Writes every used page of `buffer` into `segment`.
    pub fn flash(
        &mut self,
        buffer: &mut MemoryBuffer,
        segment: Segment,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        buffer.prepare_buffer();
        if !buffer.is_data_inside_valid() {
            return Err(FlashError::DataOutsideValidRange);
        }
        if !buffer.has_data() {
            return Err(FlashError::NoData);
        }

        let mut progress = Progress::start(progress);
        buffer.rewind_block();
        while buffer.has_remaining_block() {
            let done = buffer.block_offset() + buffer.block_size();
            if let Err(e) = self.write_block(buffer, segment) {
                log::warn!("Error flashing page: {}", e);
                return Err(e);
            }
            progress.update(done, buffer.data_size());
        }

        Ok(())
    }

    /// Writes the block under the buffer cursor and advances it.
    fn write_block(&mut self, buffer: &mut MemoryBuffer, segment: Segment) -> Result<()> {
        let address = buffer
            .block_range
            .with_page_size(SEGMENT_SIZE)
            .start_in_page(None) as u16;
        let [lo, hi] = address.to_le_bytes();
        let block = buffer.get_block();
        if block.len() > self.page_size {
            return Err(FlashError::BlockTooLarge {
                size: block.len(),
                max: self.page_size,
            });
        }
        log::trace!("hid page write at {:#06x}, {} bytes", address, block.len());

        match self.protocol {
            HidProtocol::V1 => {
                let mut command = vec![0u8; self.page_size];
                command[0] = segment.tag();
                command[1] = lo;
                command[2] = hi;
                self.transport.send_feature_report(REPORT_COMMAND, &command)?;

                let mut data = vec![0xFFu8; self.page_size];
                data[..block.len()].copy_from_slice(&block);
                self.transport.send_feature_report(REPORT_DATA, &data)?;

                let received = self
                    .transport
                    .receive_feature_report(REPORT_DATA, self.page_size)?;
                if let Some(offset) = mismatch(&data, &received) {
                    log::warn!("Validation error at {:#06x} + {}", address, offset);
                    return Err(FlashError::Validation { offset });
                }
            }
            HidProtocol::V0 => {
                let mut data = vec![0xFFu8; self.page_size + 2];
                data[0] = lo;
                data[1] = hi;
                data[2..2 + block.len()].copy_from_slice(&block);
                self.transport.send(REPORT_NONE, &data)?;
            }
        }

        Ok(())
    }

    /// Leaves the bootloader.
    pub fn launch(&mut self) -> Result<()> {
        match self.protocol {
            HidProtocol::V1 => {
                let mut data = vec![0u8; self.page_size];
                data[0] = CMD_LAUNCH;
                self.transport.send_feature_report(REPORT_COMMAND, &data)
            }
            HidProtocol::V0 => {
                let mut data = vec![0u8; self.page_size + 2];
                data[0] = 0xFF;
                data[1] = 0xFF;
                self.transport.send(REPORT_NONE, &data)
            }
        }
    }
}

/// Index of the first differing byte, or the shorter length when only the
/// lengths differ.
fn mismatch(sent: &[u8], received: &[u8]) -> Option<usize> {
    sent.iter()
        .zip(received)
        .position(|(a, b)| a != b)
        .or_else(|| (sent.len() != received.len()).then(|| sent.len().min(received.len())))
}
