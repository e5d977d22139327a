use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::MemoryBuffer;
use crate::cmd::{ConfigField, EraseMode, FlashError};
use crate::device::{BlankCheck, DfuDevice, EraseTiming};
use crate::hex::{load_hex, HexDecoder};
use crate::hid::{HidBootloader, HidConnector, HidProtocol};
use crate::target::{Segment, Target, TargetDescriptor};
use crate::usb::DfuConnector;
use crate::{HID_DEFAULT_PID, HID_DEFAULT_VID};

type Result<T> = ::std::result::Result<T, FlashError>;

/// Marks a programmer as running an operation.
///
/// Clones share the flag, so a discovery poller can hold one while the
/// programmer holds another.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the flag, failing with [`FlashError::Busy`] if already held.
    pub fn try_acquire(&self) -> Result<BusyGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FlashError::Busy)?;
        Ok(BusyGuard(Arc::clone(&self.0)))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Held flag; released on drop.
#[derive(Debug)]
pub struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How a HEX image is flashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlashOptions {
    pub segment: Segment,
    /// Skip the blank check before writing.
    pub force: bool,
    /// Drop bytes inside the bootloader region instead of failing.
    pub suppress_bootloader: bool,
    /// Reject HEX records with bad checksums.
    pub strict_hex: bool,
}

impl FlashOptions {
    pub fn eeprom() -> Self {
        FlashOptions {
            segment: Segment::Eeprom,
            ..Default::default()
        }
    }
}

/// Device operations offered to callers.
///
/// Each operation opens the device, runs to completion and releases the
/// device again on every exit path. The `*_inner` methods do the work
/// without touching the busy flag; callers use the guarded ones.
pub trait Programmer {
    fn busy_flag(&self) -> &BusyFlag;

    /// Product name of an attached device in bootloader mode.
    fn find_device_inner(&mut self) -> Result<Option<String>>;

    fn get_inner(&mut self, name: &str) -> Result<Vec<u8>>;

    fn erase_inner(&mut self, force: bool) -> Result<()>;

    fn flash_inner(
        &mut self,
        hex: &str,
        options: &FlashOptions,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()>;

    fn launch_inner(&mut self, reset: bool) -> Result<()>;

    /// Looks for the device. Returns `None` without touching USB while an
    /// operation is running.
    fn find_device(&mut self) -> Result<Option<String>> {
        if self.busy_flag().is_busy() {
            log::trace!("device poll skipped while busy");
            return Ok(None);
        }
        self.find_device_inner()
    }

    /// Reads a named configuration value.
    fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        let _guard = self.busy_flag().try_acquire()?;
        self.get_inner(name)
    }

    /// Erases application memory. Unless `force` is set, the flash region is
    /// blank checked afterwards.
    fn erase(&mut self, force: bool) -> Result<()> {
        let _guard = self.busy_flag().try_acquire()?;
        self.erase_inner(force)
    }

    /// Writes a HEX image, reporting whole percentages to `progress`.
    fn flash(
        &mut self,
        hex: &str,
        options: &FlashOptions,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let _guard = self.busy_flag().try_acquire()?;
        self.flash_inner(hex, options, progress)
    }

    /// Leaves the bootloader and runs the application.
    fn launch(&mut self, reset: bool) -> Result<()> {
        let _guard = self.busy_flag().try_acquire()?;
        self.launch_inner(reset)
    }

    /// Erase, flash, optionally write EEPROM, then launch without reset.
    fn reflash(
        &mut self,
        flash_hex: Option<&str>,
        eeprom_hex: Option<&str>,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let _guard = self.busy_flag().try_acquire()?;
        self.erase_inner(false)?;
        if let Some(hex) = flash_hex {
            self.flash_inner(hex, &FlashOptions::default(), progress)?;
        }
        if let Some(hex) = eeprom_hex {
            let options = FlashOptions {
                force: true,
                ..FlashOptions::eeprom()
            };
            self.flash_inner(hex, &options, progress)?;
        }
        self.launch_inner(false)
    }
}

/// Decodes `hex` into a buffer sized for `segment` of `target` and checks it
/// can be flashed.
///
/// With `exclude_bootloader` the flash window is narrowed to the application
/// region and bytes inside the bootloader are dropped or rejected.
fn load_image(
    target: &TargetDescriptor,
    hex: &str,
    options: &FlashOptions,
    exclude_bootloader: bool,
) -> Result<MemoryBuffer> {
    let (size, page_size) = match options.segment {
        Segment::Flash => (target.memory_size, target.flash_page_size),
        Segment::Eeprom => (target.eeprom_memory_size, target.eeprom_page_size),
    };
    let mut buffer = MemoryBuffer::new(size, page_size, 0);
    load_hex(&mut buffer, HexDecoder::new(hex).strict(options.strict_hex))?;

    if options.segment == Segment::Flash && exclude_bootloader {
        let flash = target.flash_range();
        buffer.set_valid_range(flash.start, flash.end);

        let bootloader = target.bootloader_range();
        let mut suppressed = 0;
        for address in bootloader.start..=bootloader.end {
            if !buffer.is_data_used(address) {
                continue;
            }
            if !options.suppress_bootloader {
                log::warn!("Bootloader and code overlap at {:#x}.", address);
                return Err(FlashError::BootloaderOverlap(address));
            }
            buffer.mark_data_unused(address);
            suppressed += 1;
        }
        if suppressed > 0 {
            log::info!("Ignored {} bytes inside the bootloader region.", suppressed);
            buffer.trim_data_range();
        }
    }

    buffer.prepare_buffer();
    if !buffer.is_data_inside_valid() {
        log::warn!(
            "Data {} exists outside of the valid region {}.",
            buffer.data_range,
            buffer.valid_range
        );
        return Err(FlashError::DataOutsideValidRange);
    }
    if !buffer.has_data() {
        return Err(FlashError::NoData);
    }

    Ok(buffer)
}

/// Programmer for Atmel DFU bootloaders.
pub struct DfuProgrammer<C: DfuConnector> {
    connector: C,
    target: TargetDescriptor,
    busy: BusyFlag,
    erase_mode: EraseMode,
    erase_timing: EraseTiming,
}

impl<C: DfuConnector> DfuProgrammer<C> {
    pub fn new(connector: C, target: Target) -> Self {
        Self::with_descriptor(connector, target.descriptor())
    }

    pub fn with_descriptor(connector: C, target: TargetDescriptor) -> Self {
        DfuProgrammer {
            connector,
            target,
            busy: BusyFlag::new(),
            erase_mode: EraseMode::default(),
            erase_timing: EraseTiming::default(),
        }
    }

    /// Shares `busy` with other programmers polling the same bus.
    pub fn with_busy_flag(mut self, busy: BusyFlag) -> Self {
        self.busy = busy;
        self
    }

    pub fn with_erase_mode(mut self, erase_mode: EraseMode) -> Self {
        self.erase_mode = erase_mode;
        self
    }

    pub fn with_erase_timing(mut self, erase_timing: EraseTiming) -> Self {
        self.erase_timing = erase_timing;
        self
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Opens the device and brings it to dfuIDLE.
    fn open(&mut self) -> Result<DfuDevice<C::Transport>> {
        let transport = self.connector.open(&self.target)?;
        let mut device = DfuDevice::new(transport).with_erase_timing(self.erase_timing);
        device.make_idle(self.target.initial_abort)?;
        Ok(device)
    }
}

impl<C: DfuConnector> Programmer for DfuProgrammer<C> {
    fn busy_flag(&self) -> &BusyFlag {
        &self.busy
    }

    fn find_device_inner(&mut self) -> Result<Option<String>> {
        self.connector
            .find(self.target.vendor_id, self.target.chip_id)
    }

    fn get_inner(&mut self, name: &str) -> Result<Vec<u8>> {
        let field: ConfigField = name.parse()?;
        let mut device = self.open()?;
        let value = device.read_config(field)?;
        log::debug!("{} = {:#04x}", name, value);
        Ok(vec![value])
    }

    fn erase_inner(&mut self, force: bool) -> Result<()> {
        let flash = self.target.flash_range();
        let mut device = self.open()?;
        device.erase_flash(self.erase_mode)?;
        if !force {
            if let BlankCheck::NotBlank { page, address } = device.check_blank(&flash)? {
                return Err(FlashError::TargetNotBlank { page, address });
            }
        }
        Ok(())
    }

    fn flash_inner(
        &mut self,
        hex: &str,
        options: &FlashOptions,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let mut buffer = load_image(&self.target, hex, options, true)?;
        let mut device = self.open()?;
        device.flash(
            &mut buffer,
            options.segment == Segment::Eeprom,
            options.force,
            progress,
        )
    }

    fn launch_inner(&mut self, reset: bool) -> Result<()> {
        let mut device = self.open()?;
        device.start_app(reset)
    }
}

/// USB identity of a HID bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidTarget {
    pub target: Target,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Report layout forced on the device. `None` uses the one its report
    /// descriptor implies.
    pub protocol: Option<HidProtocol>,
}

impl HidTarget {
    /// Default HID bootloader identity for `target`.
    pub fn new(target: Target) -> Self {
        HidTarget {
            target,
            vendor_id: HID_DEFAULT_VID,
            product_id: HID_DEFAULT_PID,
            protocol: None,
        }
    }

    pub fn with_protocol(self, protocol: HidProtocol) -> Self {
        HidTarget {
            protocol: Some(protocol),
            ..self
        }
    }
}

/// Programmer for HID bootloaders.
///
/// The bootloader erases each page as it is written; `erase` and `get` do not
/// touch the device and blank checks are never made.
pub struct HidProgrammer<C: HidConnector> {
    connector: C,
    target: HidTarget,
    busy: BusyFlag,
}

impl<C: HidConnector> HidProgrammer<C> {
    pub fn new(connector: C, target: HidTarget) -> Self {
        HidProgrammer {
            connector,
            target,
            busy: BusyFlag::new(),
        }
    }

    pub fn with_busy_flag(mut self, busy: BusyFlag) -> Self {
        self.busy = busy;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn open(&mut self) -> Result<HidBootloader<C::Transport>> {
        let (transport, detected) = self
            .connector
            .connect(self.target.vendor_id, self.target.product_id)?;
        let protocol = self.target.protocol.unwrap_or(detected);
        let page_size = self.target.target.descriptor().flash_page_size as usize;
        Ok(HidBootloader::new(transport, protocol, page_size))
    }
}

impl<C: HidConnector> Programmer for HidProgrammer<C> {
    fn busy_flag(&self) -> &BusyFlag {
        &self.busy
    }

    fn find_device_inner(&mut self) -> Result<Option<String>> {
        let Some(name) = self
            .connector
            .find(self.target.vendor_id, self.target.product_id)?
        else {
            return Ok(None);
        };
        match self.open()?.version()? {
            Some(version) => Ok(Some(format!("{} v{}", name, version))),
            None => Ok(Some(name)),
        }
    }

    fn get_inner(&mut self, _name: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn erase_inner(&mut self, _force: bool) -> Result<()> {
        Ok(())
    }

    fn flash_inner(
        &mut self,
        hex: &str,
        options: &FlashOptions,
        progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let target = self.target.target.descriptor();
        let mut buffer = load_image(&target, hex, options, false)?;
        let mut bootloader = self.open()?;
        bootloader.flash(&mut buffer, options.segment, progress)
    }

    fn launch_inner(&mut self, _reset: bool) -> Result<()> {
        self.open()?.launch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_flag_is_exclusive_until_dropped() {
        let flag = BusyFlag::new();
        let poller = flag.clone();
        {
            let _guard = flag.try_acquire().unwrap();
            assert!(poller.is_busy());
            assert!(matches!(poller.try_acquire(), Err(FlashError::Busy)));
        }
        assert!(!poller.is_busy());
        assert!(poller.try_acquire().is_ok());
    }

    #[test]
    fn bootloader_bytes_are_rejected_or_suppressed() {
        let target = Target::Atmega32u4.descriptor();
        let hex = ":0100000001FE\n:020000040000FA\n:0170000002FF\n:00000001FF\n";

        assert!(matches!(
            load_image(&target, hex, &FlashOptions::default(), true),
            Err(FlashError::BootloaderOverlap(0x7000))
        ));

        let options = FlashOptions {
            suppress_bootloader: true,
            ..Default::default()
        };
        let buffer = load_image(&target, hex, &options, true).unwrap();
        assert_eq!(buffer.data_range.start, 0);
        assert_eq!(buffer.data_range.end, 127);
        assert!(!buffer.is_data_used(0x7000));
    }

    #[test]
    fn eeprom_image_uses_eeprom_geometry() {
        let target = Target::Atmega16u2.descriptor();
        let hex = ":0101FF0055AA\n:00000001FF\n";
        let buffer = load_image(&target, hex, &FlashOptions::eeprom(), true).unwrap();
        assert_eq!(buffer.total_size(), 0x200);
        assert_eq!(buffer.data_range.start, 0x180);
        assert_eq!(buffer.data_range.end, 0x1FF);
    }

    #[test]
    fn empty_image_has_no_data() {
        let target = Target::Atmega32u2.descriptor();
        assert!(matches!(
            load_image(&target, ":00000001FF\n", &FlashOptions::default(), true),
            Err(FlashError::NoData)
        ));
    }
}
