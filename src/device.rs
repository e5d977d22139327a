use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::MemoryBuffer;
use crate::cmd::{
    AtmelCmd, ConfigField, DfuRequest, DfuState, DfuStatus, DfuStatusReply, EraseMode, FlashError,
};
use crate::range::AddressRange;
use crate::usb::DfuTransport;
use crate::{
    DFU_DETACH_TIMEOUT, ERASE_POLL_INTERVAL, ERASE_POLL_RETRIES, ERASE_TIMEOUT, IDLE_RETRIES,
    SEGMENT_SIZE,
};

type Result<T> = ::std::result::Result<T, FlashError>;

/// Vendor, product and firmware fields of the block footer. The bootloader
/// does not check them.
const FOOTER_ID_UNKNOWN: u16 = 0xFFFF;

/// Bounds on polling the device while it erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseTiming {
    /// Number of GETSTATUS polls before giving up.
    pub retries: u32,
    /// Pause between polls.
    pub interval: Duration,
    /// Wall-clock budget for the whole erase.
    pub timeout: Duration,
}

impl Default for EraseTiming {
    fn default() -> Self {
        EraseTiming {
            retries: ERASE_POLL_RETRIES,
            interval: ERASE_POLL_INTERVAL,
            timeout: ERASE_TIMEOUT,
        }
    }
}

/// Outcome of a blank check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankCheck {
    Blank,
    /// `page` is the 64kB page that failed. `address` is the first non-blank
    /// address in it, when the device reported one.
    NotBlank { page: u32, address: Option<u16> },
}

/// Reports whole percentages to a callback, skipping repeats.
pub(crate) struct Progress<'a> {
    percent: u8,
    callback: &'a mut dyn FnMut(u8),
}

impl<'a> Progress<'a> {
    /// Starts at zero and reports it.
    pub(crate) fn start(callback: &'a mut dyn FnMut(u8)) -> Self {
        callback(0);
        Progress {
            percent: 0,
            callback,
        }
    }

    pub(crate) fn update(&mut self, done: i64, total: i64) {
        if total <= 0 {
            return;
        }
        let percent = (done.clamp(0, total) * 100 / total) as u8;
        if percent != self.percent {
            self.percent = percent;
            (self.callback)(percent);
        }
    }
}

/// DFU session with an Atmel bootloader.
///
/// Owns the transport for the length of one operation; dropping the session
/// releases the device.
#[derive(Debug)]
pub struct DfuDevice<T: DfuTransport> {
    transport: T,
    transaction: u16,
    last_status: Option<DfuStatusReply>,
    erase_timing: EraseTiming,
}

impl<T: DfuTransport> DfuDevice<T> {
    pub fn new(transport: T) -> Self {
        DfuDevice {
            transport,
            transaction: 0,
            last_status: None,
            erase_timing: EraseTiming::default(),
        }
    }

    pub fn with_erase_timing(mut self, erase_timing: EraseTiming) -> Self {
        self.erase_timing = erase_timing;
        self
    }

    /// Transaction number carried by the next DNLOAD/UPLOAD.
    pub fn transaction(&self) -> u16 {
        self.transaction
    }

    /// Last GETSTATUS reply seen.
    pub fn last_status(&self) -> Option<DfuStatusReply> {
        self.last_status
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn next_transaction(&mut self) {
        self.transaction = self.transaction.wrapping_add(1);
    }

    pub fn detach(&mut self) -> Result<()> {
        log::trace!("dfu_detach");
        self.transport
            .control_out(DfuRequest::Detach, DFU_DETACH_TIMEOUT, &[])
    }

    pub fn download(&mut self, data: &[u8]) -> Result<()> {
        log::trace!(
            "dfu_download: transaction {}, {} bytes",
            self.transaction,
            data.len()
        );
        self.transport
            .control_out(DfuRequest::Dnload, self.transaction, data)?;
        self.next_transaction();
        Ok(())
    }

    pub fn upload(&mut self, size: usize) -> Result<Vec<u8>> {
        log::trace!("dfu_upload: transaction {}, {} bytes", self.transaction, size);
        let data = self
            .transport
            .control_in(DfuRequest::Upload, self.transaction, size)?;
        self.next_transaction();
        if data.len() != size {
            return Err(FlashError::UnexpectedResponse {
                expected: size,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    pub fn get_status(&mut self) -> Result<DfuStatusReply> {
        let buf = self
            .transport
            .control_in(DfuRequest::GetStatus, 0, DfuStatusReply::SIZE)?;
        let status = DfuStatusReply::des(&buf)?;
        log::trace!("dfu_get_status: {:?} / {:?}", status.status, status.state);
        self.last_status = Some(status);
        Ok(status)
    }

    /// GETSTATUS, failing with [`FlashError::ProtocolStatus`] unless OK.
    pub fn check_status(&mut self) -> Result<DfuStatusReply> {
        let status = self.get_status()?;
        if status.is_ok() {
            Ok(status)
        } else {
            Err(FlashError::ProtocolStatus {
                status: status.status,
                state: status.state,
            })
        }
    }

    pub fn clear_status(&mut self) -> Result<()> {
        log::trace!("dfu_clear_status");
        self.transport.control_out(DfuRequest::ClrStatus, 0, &[])
    }

    pub fn get_state(&mut self) -> Result<DfuState> {
        let buf = self.transport.control_in(DfuRequest::GetState, 0, 1)?;
        let state = *buf.first().ok_or(FlashError::UnexpectedResponse {
            expected: 1,
            actual: 0,
        })?;
        DfuState::try_from(state).map_err(|_| FlashError::UnknownState(state))
    }

    pub fn abort(&mut self) -> Result<()> {
        log::trace!("dfu_abort");
        self.transport.control_out(DfuRequest::Abort, 0, &[])
    }

    /// Drives the device into `dfuIDLE`.
    ///
    /// Optionally sends ABORT first, then makes up to [`IDLE_RETRIES`]
    /// attempts, each reading the status and issuing the request that moves
    /// the device one step closer to idle.
    pub fn make_idle(&mut self, initial_abort: bool) -> Result<()> {
        if initial_abort {
            self.abort()?;
        }

        for attempt in 1..=IDLE_RETRIES {
            match self.make_idle_step() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => log::debug!("idle attempt {} failed: {}", attempt, e),
            }
        }

        log::warn!("Not able to transition the device into the dfuIDLE state.");
        Err(FlashError::DeviceNotIdle)
    }

    fn make_idle_step(&mut self) -> Result<bool> {
        let status = match self.get_status() {
            Ok(status) => status,
            Err(e) => {
                self.clear_status()?;
                return Err(e);
            }
        };
        log::debug!("State: {:?}, status: {:?}", status.state, status.status);

        match status.state {
            DfuState::DfuIdle if status.is_ok() => return Ok(true),
            DfuState::DfuIdle | DfuState::DfuError => self.clear_status()?,
            DfuState::DfuDownloadSync
            | DfuState::DfuDownloadIdle
            | DfuState::DfuUploadIdle
            | DfuState::DfuManifestSync
            | DfuState::DfuDownloadBusy
            | DfuState::DfuManifest => self.abort()?,
            DfuState::AppIdle => self.detach()?,
            DfuState::AppDetach | DfuState::DfuManifestWaitReset => {
                log::info!("Resetting the device");
                self.transport.reset()?;
            }
        }

        Ok(false)
    }

    /// Reads one configuration byte.
    pub fn read_config(&mut self, field: ConfigField) -> Result<u8> {
        log::trace!("atmel_read_config: {:?}", field);
        self.download(&AtmelCmd::read_config(field))?;
        self.check_status()?;
        let data = self.upload(1)?;
        Ok(data[0])
    }

    /// Erases flash and waits for the device to finish.
    pub fn erase_flash(&mut self, mode: EraseMode) -> Result<()> {
        log::debug!("atmel_erase_flash: {:?}", mode);
        let timing = self.erase_timing;
        let start = Instant::now();
        self.download(&AtmelCmd::erase(mode))?;

        let mut polls = 0;
        loop {
            if start.elapsed() > timing.timeout {
                return Err(FlashError::CmdEraseTimeout(timing.timeout));
            }

            let status = self.get_status()?;
            polls += 1;
            match (status.status, status.state) {
                (DfuStatus::Ok, _) => return Ok(()),
                (DfuStatus::ErrorNotDone, DfuState::DfuDownloadBusy) if polls < timing.retries => {
                    log::debug!("erase status check {} returned busy", polls);
                    thread::sleep(timing.interval);
                }
                (status, state) => {
                    return Err(FlashError::CmdEraseStatus {
                        polls,
                        status,
                        state,
                    })
                }
            }
        }
    }

    /// Selects the 64kB page addressed by subsequent commands.
    pub fn select_page(&mut self, page: u8) -> Result<()> {
        log::debug!(
            "Selecting page {}, address {:#x}.",
            page,
            page as i64 * SEGMENT_SIZE
        );
        self.download(&AtmelCmd::select_page(page))?;
        self.check_status()?;
        Ok(())
    }

    /// Blank checks `range` one 64kB page at a time, stopping at the first
    /// page holding data.
    pub fn check_blank(&mut self, range: &AddressRange) -> Result<BlankCheck> {
        let range = range.with_page_size(SEGMENT_SIZE);
        log::info!("Checking memory from {}...", range);

        for page in range.start_page()..=range.end_page() {
            let start = range.start_in_page(Some(page)) as u16;
            let end = range.end_in_page(Some(page)) as u16;
            self.select_page(page as u8)?;
            match self.check_blank_in_page(start, end)? {
                None => log::debug!("Flash blank from {:#x} to {:#x}", start, end),
                Some(address) => {
                    log::info!("Flash NOT blank beginning at {:#x}.", start);
                    return Ok(BlankCheck::NotBlank {
                        page: page as u32,
                        address,
                    });
                }
            }
        }

        Ok(BlankCheck::Blank)
    }

    /// `None` when blank, otherwise the first non-blank address if the
    /// device reports it.
    fn check_blank_in_page(&mut self, start: u16, end: u16) -> Result<Option<Option<u16>>> {
        if start > end {
            return Err(FlashError::InvalidBlock {
                start: start as i64,
                end: end as i64,
            });
        }

        self.download(&AtmelCmd::blank_check(start, end)?)?;
        let status = self.get_status()?;
        if status.is_ok() {
            return Ok(None);
        }

        if status.state == DfuState::DfuError {
            self.clear_status()?;
        }
        if status.status != DfuStatus::ErrorCheckErased {
            return Ok(Some(None));
        }

        let data = self.upload(2)?;
        let address = u16::from_be_bytes([data[0], data[1]]);
        log::info!("First non-blank address in region is {:#x}.", address);
        Ok(Some(Some(address)))
    }

    /// Programs every used byte of `buffer`.
    ///
    /// The buffer is page filled first. Data outside the valid range or an
    /// empty buffer fail before anything is sent. Unless `force` is set the
    /// target region must be blank.
    pub fn flash(
        &mut self,
        buffer: &mut MemoryBuffer,
        eeprom: bool,
        force: bool,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        buffer.prepare_buffer();

        let valid = buffer.valid_range.with_page_size(SEGMENT_SIZE);
        let data = buffer.data_range;
        log::info!(
            "Flash available from {} (64kB p. {}), {:#x} bytes.",
            valid,
            valid.page_range(),
            buffer.valid_size()
        );
        log::info!(
            "Data {}: {}B p {:#x}..={:#x}, {:#x} bytes, {} pages.",
            data,
            buffer.page_size(),
            buffer.first_page(),
            buffer.last_page(),
            buffer.data_size(),
            buffer.number_of_pages()
        );

        if !buffer.is_data_inside_valid() {
            return Err(FlashError::DataOutsideValidRange);
        }
        if !buffer.has_data() {
            return Err(FlashError::NoData);
        }

        let mut progress = Progress::start(progress);

        if !force {
            if let BlankCheck::NotBlank { page, address } = self.check_blank(&data)? {
                return Err(FlashError::TargetNotBlank { page, address });
            }
        }

        log::info!("Programming {:#x} bytes...", buffer.data_size());
        let mut memory_page = None;
        buffer.rewind_block();
        while buffer.has_remaining_block() {
            let page = buffer.block_page(SEGMENT_SIZE);
            if memory_page != Some(page) {
                self.select_page(page as u8)?;
                memory_page = Some(page);
            }

            let done = buffer.block_offset() + buffer.block_size();
            self.flash_block(buffer, eeprom)?;
            progress.update(done, buffer.data_size());
        }

        log::info!("Success");
        Ok(())
    }

    /// Writes the block under the buffer cursor and advances it.
    fn flash_block(&mut self, buffer: &mut MemoryBuffer, eeprom: bool) -> Result<()> {
        let block = buffer.block_range;
        if !block.is_valid() {
            return Err(FlashError::InvalidBlock {
                start: block.start,
                end: block.end,
            });
        }
        let size = block.size() as usize;
        if size > buffer.max_transfer_size() {
            return Err(FlashError::BlockTooLarge {
                size,
                max: buffer.max_transfer_size(),
            });
        }

        let block = block.with_page_size(SEGMENT_SIZE);
        let header = AtmelCmd::block_header(
            block.start_in_page(None) as u16,
            block.end_in_page(None) as u16,
            eeprom,
        )?;
        let footer =
            AtmelCmd::block_footer(FOOTER_ID_UNKNOWN, FOOTER_ID_UNKNOWN, FOOTER_ID_UNKNOWN)?;
        let payload = buffer.get_block();

        let mut data = Vec::with_capacity(header.len() + payload.len() + footer.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(&payload);
        data.extend_from_slice(&footer);

        self.download(&data)?;
        let status = self.get_status()?;
        if !status.is_ok() {
            if let Err(e) = self.clear_status() {
                log::warn!("could not clear status after failed write: {}", e);
            }
            return Err(FlashError::BlockWrite {
                status: status.status,
                state: status.state,
            });
        }

        log::trace!("Page write success.");
        Ok(())
    }

    /// Leaves the bootloader and runs the application.
    pub fn start_app(&mut self, reset: bool) -> Result<()> {
        log::debug!("atmel_start_app: reset={}", reset);
        self.download(&AtmelCmd::start_app(reset))?;
        self.download(&[])
            .map_err(|e| FlashError::LaunchFinalize(Box::new(e)))
    }
}
