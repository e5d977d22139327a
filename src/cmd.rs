use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CONTROL_BLOCK_SIZE, FOOTER_SIZE};

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum FlashError {
    /// A line of the HEX image is malformed.
    #[error("invalid hex record at line {line}: {reason}")]
    Format { line: usize, reason: String },
    /// A HEX record checksum did not match (strict decoding only).
    #[error("checksum mismatch at line {line}: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },
    /// A HEX record addresses memory beyond 32 bits.
    #[error("address overflow at line {line}")]
    AddressOverflow { line: usize },

    /// Data exists outside of the valid target memory region.
    #[error("data exists outside of the valid target memory region")]
    DataOutsideValidRange,
    /// The buffer holds nothing to program.
    #[error("no valid data to flash")]
    NoData,
    /// Application data overlaps the bootloader region.
    #[error("bootloader and code overlap at {0:#06x}")]
    BootloaderOverlap(i64),
    /// Address is outside of the buffer storage.
    #[error("address {0:#x} is outside of the buffer")]
    AddressOutOfRange(i64),

    /// USB device not found.
    #[error("device could not be found")]
    DeviceNotFound,
    /// Not allowed to open the USB device.
    #[error("permission denied")]
    PermissionDenied,
    /// Device refused to enter the DFU idle state.
    #[error("not able to transition the device into the dfuIDLE state")]
    DeviceNotIdle,
    /// Device reported a non-OK status after a command.
    #[error("device status {status:?} (state {state:?}) was not ok")]
    ProtocolStatus { status: DfuStatus, state: DfuState },
    /// Erase took longer than the wall-clock budget.
    #[error("erase time limit of {0:?} exceeded")]
    CmdEraseTimeout(std::time::Duration),
    /// Erase did not finish within the poll budget, or finished with an error.
    #[error("erase status check {polls} returned {status:?} (state {state:?})")]
    CmdEraseStatus {
        polls: u32,
        status: DfuStatus,
        state: DfuState,
    },
    /// Device rejected a block write.
    #[error("block write unsuccessful (status {status:?}, state {state:?})")]
    BlockWrite { status: DfuStatus, state: DfuState },
    /// Target memory holds data where a blank region was required.
    #[error("target memory is not blank in 64kB page {page}{}", first_non_blank(.address))]
    TargetNotBlank { page: u32, address: Option<u16> },
    /// Data read back from the HID bootloader differs from what was sent.
    #[error("validation error at report byte {offset}")]
    Validation { offset: usize },
    /// Block handed to the protocol is empty or inverted.
    #[error("invalid block {start:#x}..={end:#x}")]
    InvalidBlock { start: i64, end: i64 },
    /// The empty download closing a launch failed after the start command
    /// was accepted.
    #[error("start app accepted but finalizing download failed: {0}")]
    LaunchFinalize(#[source] Box<FlashError>),
    /// Block exceeds the protocol transfer limit.
    #[error("{size:#x} byte message > max transfer size ({max:#x})")]
    BlockTooLarge { size: usize, max: usize },

    /// Target name is not in the descriptor table.
    #[error("target not supported: {0}")]
    TargetNotSupported(String),
    /// Config field name is unknown for this device type.
    #[error("unknown config: {0}")]
    UnknownConfig(String),
    /// Another operation holds the programmer.
    #[error("programmer is busy")]
    Busy,

    /// USB control transfer failed.
    #[error("usb transfer failed: {0}")]
    UsbTransferFailure(rusb::Error),
    /// Failed to detach USB kernel driver.
    #[error("failed to detach usb kernel driver: {0}")]
    UsbDetachKernelDriverFailure(rusb::Error),
    /// Failed to claim USB interface.
    #[error("failed to claim usb interface: {0}")]
    UsbClaimInterfaceFailure(rusb::Error),
    /// USB device did not expose a usable DFU interface.
    #[error("dfu interface not found")]
    UsbInterfaceNotFound,
    /// HID report exchange failed.
    #[error("hid failure: {0}")]
    HidFailure(hidapi::HidError),

    /// Failed to serialize command for device.
    #[error("cmd failed to binary serialize: {0}")]
    CmdSerializeFailure(bincode::Error),
    /// Failed to deserialize reply from device.
    #[error("cmd failed to binary deserialize: {0}")]
    CmdDeserializeFailure(bincode::Error),
    /// Reply length does not match the request.
    #[error("expected {expected} bytes from device, got {actual}")]
    UnexpectedResponse { expected: usize, actual: usize },
    /// Device reported a status code outside the DFU table.
    #[error("unknown dfu status {0:#04x}")]
    UnknownStatus(u8),
    /// Device reported a state code outside the DFU table.
    #[error("unknown dfu state {0:#04x}")]
    UnknownState(u8),
}

fn first_non_blank(address: &Option<u16>) -> String {
    match address {
        Some(a) => format!(", first non-blank address {a:#06x}"),
        None => String::new(),
    }
}

impl From<rusb::Error> for FlashError {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::NoDevice | rusb::Error::NotFound => FlashError::DeviceNotFound,
            rusb::Error::Access => FlashError::PermissionDenied,
            other => FlashError::UsbTransferFailure(other),
        }
    }
}

impl From<hidapi::HidError> for FlashError {
    fn from(error: hidapi::HidError) -> Self {
        FlashError::HidFailure(error)
    }
}

// see USB Device Firmware Upgrade Specification, Revision 1.1, section 3
// and Atmel application note AVR4023 (FLIP protocol)

/// Class-specific requests of the DFU interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// Device state as reported by GETSTATUS / GETSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0x00,
    AppDetach = 0x01,
    DfuIdle = 0x02,
    DfuDownloadSync = 0x03,
    DfuDownloadBusy = 0x04,
    DfuDownloadIdle = 0x05,
    DfuManifestSync = 0x06,
    DfuManifest = 0x07,
    DfuManifestWaitReset = 0x08,
    DfuUploadIdle = 0x09,
    DfuError = 0x0A,
}
impl TryFrom<u8> for DfuState {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            x if x == Self::AppIdle as u8 => Ok(Self::AppIdle),
            x if x == Self::AppDetach as u8 => Ok(Self::AppDetach),
            x if x == Self::DfuIdle as u8 => Ok(Self::DfuIdle),
            x if x == Self::DfuDownloadSync as u8 => Ok(Self::DfuDownloadSync),
            x if x == Self::DfuDownloadBusy as u8 => Ok(Self::DfuDownloadBusy),
            x if x == Self::DfuDownloadIdle as u8 => Ok(Self::DfuDownloadIdle),
            x if x == Self::DfuManifestSync as u8 => Ok(Self::DfuManifestSync),
            x if x == Self::DfuManifest as u8 => Ok(Self::DfuManifest),
            x if x == Self::DfuManifestWaitReset as u8 => Ok(Self::DfuManifestWaitReset),
            x if x == Self::DfuUploadIdle as u8 => Ok(Self::DfuUploadIdle),
            x if x == Self::DfuError as u8 => Ok(Self::DfuError),
            _ => Err(()),
        }
    }
}

/// Status code as reported by GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuStatus {
    Ok = 0x00,
    ErrorTarget = 0x01,
    ErrorFile = 0x02,
    ErrorWrite = 0x03,
    ErrorErase = 0x04,
    ErrorCheckErased = 0x05,
    ErrorProg = 0x06,
    ErrorVerify = 0x07,
    ErrorAddress = 0x08,
    ErrorNotDone = 0x09,
    ErrorFirmware = 0x0A,
    ErrorVendor = 0x0B,
    ErrorUsbr = 0x0C,
    ErrorPor = 0x0D,
    ErrorUnknown = 0x0E,
    ErrorStalledPkt = 0x0F,
}
impl TryFrom<u8> for DfuStatus {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            x if x == Self::Ok as u8 => Ok(Self::Ok),
            x if x == Self::ErrorTarget as u8 => Ok(Self::ErrorTarget),
            x if x == Self::ErrorFile as u8 => Ok(Self::ErrorFile),
            x if x == Self::ErrorWrite as u8 => Ok(Self::ErrorWrite),
            x if x == Self::ErrorErase as u8 => Ok(Self::ErrorErase),
            x if x == Self::ErrorCheckErased as u8 => Ok(Self::ErrorCheckErased),
            x if x == Self::ErrorProg as u8 => Ok(Self::ErrorProg),
            x if x == Self::ErrorVerify as u8 => Ok(Self::ErrorVerify),
            x if x == Self::ErrorAddress as u8 => Ok(Self::ErrorAddress),
            x if x == Self::ErrorNotDone as u8 => Ok(Self::ErrorNotDone),
            x if x == Self::ErrorFirmware as u8 => Ok(Self::ErrorFirmware),
            x if x == Self::ErrorVendor as u8 => Ok(Self::ErrorVendor),
            x if x == Self::ErrorUsbr as u8 => Ok(Self::ErrorUsbr),
            x if x == Self::ErrorPor as u8 => Ok(Self::ErrorPor),
            x if x == Self::ErrorUnknown as u8 => Ok(Self::ErrorUnknown),
            x if x == Self::ErrorStalledPkt as u8 => Ok(Self::ErrorStalledPkt),
            _ => Err(()),
        }
    }
}

/// Big-endian, fixed-width encoding used by every Atmel command block.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Raw 6-byte GETSTATUS reply.
#[derive(Deserialize, Debug, Clone, Copy)]
#[repr(C, packed)]
struct DfuStatusBytes {
    status: u8,
    poll_timeout: [u8; 3],
    state: u8,
    string_index: u8,
}

/// Decoded GETSTATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatusReply {
    pub status: DfuStatus,
    /// Minimum time in milliseconds the host should wait before the next GETSTATUS.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}
impl DfuStatusReply {
    /// Length of the GETSTATUS reply.
    pub const SIZE: usize = 6;

    pub fn des(buf: &[u8]) -> Result<Self, FlashError> {
        if buf.len() != Self::SIZE {
            return Err(FlashError::UnexpectedResponse {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let raw: DfuStatusBytes = codec()
            .deserialize(buf)
            .map_err(FlashError::CmdDeserializeFailure)?;
        let status = DfuStatus::try_from(raw.status)
            .map_err(|_| FlashError::UnknownStatus(raw.status))?;
        let state =
            DfuState::try_from(raw.state).map_err(|_| FlashError::UnknownState(raw.state))?;
        let timeout = raw.poll_timeout;

        Ok(DfuStatusReply {
            status,
            poll_timeout: u32::from_le_bytes([timeout[0], timeout[1], timeout[2], 0]),
            state,
            string_index: raw.string_index,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatus::Ok
    }
}

/// Erase selection for the Atmel erase command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EraseMode {
    Block0 = 0x00,
    Block1 = 0x20,
    Block2 = 0x40,
    Block3 = 0x80,
    #[default]
    All = 0xFF,
}

/// Named configuration bytes readable from an AVR DFU bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Bootloader,
    Id1,
    Id2,
    Manufacturer,
    Family,
    ProductName,
    ProductRev,
}
impl ConfigField {
    /// Group and index bytes of the read-config command.
    fn selector(self) -> [u8; 2] {
        match self {
            ConfigField::Bootloader => [0x00, 0x00],
            ConfigField::Id1 => [0x00, 0x01],
            ConfigField::Id2 => [0x00, 0x02],
            ConfigField::Manufacturer => [0x01, 0x30],
            ConfigField::Family => [0x01, 0x31],
            ConfigField::ProductName => [0x01, 0x60],
            ConfigField::ProductRev => [0x01, 0x61],
        }
    }
}
impl std::str::FromStr for ConfigField {
    type Err = FlashError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "bootloader" => Ok(ConfigField::Bootloader),
            "ID1" => Ok(ConfigField::Id1),
            "ID2" => Ok(ConfigField::Id2),
            "manufacturer" => Ok(ConfigField::Manufacturer),
            "family" => Ok(ConfigField::Family),
            "product_name" => Ok(ConfigField::ProductName),
            "product_rev" => Ok(ConfigField::ProductRev),
            _ => Err(FlashError::UnknownConfig(name.to_string())),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy)]
#[repr(C, packed)]
struct AtmelRangeCmd {
    command: u8,
    sub_command: u8,
    start: u16,
    end: u16,
}

/// Header preceding the payload of a program download.
#[derive(Serialize, Debug, Clone, Copy)]
#[repr(C, packed)]
struct AtmelBlockHeader {
    command: u8,
    memory: u8,
    start: u16,
    end: u16,
    _unused: [u8; CONTROL_BLOCK_SIZE - 6],
}

/// DFU suffix appended to a program download.
#[derive(Serialize, Debug, Clone, Copy)]
#[repr(C, packed)]
struct AtmelBlockFooter {
    crc: u32,
    length: u8,
    signature: [u8; 3],
    bcd_dfu: u16,
    vendor_id: u16,
    product_id: u16,
    bcd_firmware: u16,
}

/// Atmel FLIP command blocks carried in DNLOAD requests.
///
/// These are shorthands for building the payloads and do not check that the
/// device is in a state where the command is accepted.
pub struct AtmelCmd;
impl AtmelCmd {
    /// Creates a chip erase command
    pub fn erase(mode: EraseMode) -> Vec<u8> {
        vec![0x04, 0x00, mode as u8]
    }

    /// Creates a command selecting the 64kB page used by later commands
    pub fn select_page(page: u8) -> Vec<u8> {
        vec![0x06, 0x03, 0x00, page]
    }

    /// Creates a blank check command over `start..=end` of the selected page
    pub fn blank_check(start: u16, end: u16) -> Result<Vec<u8>, FlashError> {
        let c = AtmelRangeCmd {
            command: 0x03,
            sub_command: 0x01,
            start,
            end,
        };
        codec()
            .serialize(&c)
            .map_err(FlashError::CmdSerializeFailure)
    }

    /// Creates a read configuration command
    pub fn read_config(field: ConfigField) -> Vec<u8> {
        let [group, index] = field.selector();
        vec![0x05, group, index]
    }

    /// Creates a start application command, with or without a watchdog reset
    pub fn start_app(reset: bool) -> Vec<u8> {
        if reset {
            vec![0x04, 0x03, 0x00]
        } else {
            vec![0x04, 0x03, 0x01, 0x00, 0x00]
        }
    }

    /// Creates the program command header for `start..=end` of the selected page
    pub fn block_header(start: u16, end: u16, eeprom: bool) -> Result<Vec<u8>, FlashError> {
        let c = AtmelBlockHeader {
            command: 0x01,
            memory: eeprom as u8,
            start,
            end,
            _unused: [0; CONTROL_BLOCK_SIZE - 6],
        };
        codec()
            .serialize(&c)
            .map_err(FlashError::CmdSerializeFailure)
    }

    /// Creates the DFU suffix closing a program download
    pub fn block_footer(
        vendor_id: u16,
        product_id: u16,
        bcd_firmware: u16,
    ) -> Result<Vec<u8>, FlashError> {
        let c = AtmelBlockFooter {
            crc: 0,
            length: FOOTER_SIZE as u8,
            signature: *b"DFU",
            bcd_dfu: 0x0110,
            vendor_id,
            product_id,
            bcd_firmware,
        };
        codec()
            .serialize(&c)
            .map_err(FlashError::CmdSerializeFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reply_decodes_poll_timeout_little_endian() {
        let reply = DfuStatusReply::des(&[0x09, 0x10, 0x27, 0x00, 0x04, 0x00]).unwrap();
        assert_eq!(reply.status, DfuStatus::ErrorNotDone);
        assert_eq!(reply.state, DfuState::DfuDownloadBusy);
        assert_eq!(reply.poll_timeout, 10_000);
        assert!(!reply.is_ok());
    }

    #[test]
    fn status_reply_rejects_wrong_length_and_unknown_codes() {
        assert!(matches!(
            DfuStatusReply::des(&[0, 0, 0, 0, 2]),
            Err(FlashError::UnexpectedResponse {
                expected: 6,
                actual: 5
            })
        ));
        assert!(matches!(
            DfuStatusReply::des(&[0x42, 0, 0, 0, 2, 0]),
            Err(FlashError::UnknownStatus(0x42))
        ));
        assert!(matches!(
            DfuStatusReply::des(&[0, 0, 0, 0, 0x0B, 0]),
            Err(FlashError::UnknownState(0x0B))
        ));
    }

    #[test]
    fn block_header_is_big_endian_and_padded() {
        let header = AtmelCmd::block_header(0x0102, 0x03FF, true).unwrap();
        assert_eq!(header.len(), CONTROL_BLOCK_SIZE);
        assert_eq!(&header[..6], &[0x01, 0x01, 0x01, 0x02, 0x03, 0xFF]);
        assert!(header[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn block_footer_carries_dfu_suffix() {
        let footer = AtmelCmd::block_footer(0xFFFF, 0xFFFF, 0xFFFF).unwrap();
        assert_eq!(
            footer,
            vec![
                0x00, 0x00, 0x00, 0x00, 0x10, b'D', b'F', b'U', 0x01, 0x10, 0xFF, 0xFF, 0xFF, 0xFF,
                0xFF, 0xFF
            ]
        );
    }

    #[test]
    fn command_blocks() {
        assert_eq!(AtmelCmd::erase(EraseMode::default()), vec![0x04, 0x00, 0xFF]);
        assert_eq!(AtmelCmd::select_page(1), vec![0x06, 0x03, 0x00, 0x01]);
        assert_eq!(
            AtmelCmd::blank_check(0x0000, 0x6FFF).unwrap(),
            vec![0x03, 0x01, 0x00, 0x00, 0x6F, 0xFF]
        );
        assert_eq!(AtmelCmd::start_app(true), vec![0x04, 0x03, 0x00]);
        assert_eq!(AtmelCmd::start_app(false), vec![0x04, 0x03, 0x01, 0x00, 0x00]);
        let field: ConfigField = "product_rev".parse().unwrap();
        assert_eq!(AtmelCmd::read_config(field), vec![0x05, 0x01, 0x61]);
        assert!(matches!(
            "serial".parse::<ConfigField>(),
            Err(FlashError::UnknownConfig(_))
        ));
    }
}
