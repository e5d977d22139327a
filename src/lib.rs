//! Flashing Intel HEX firmware onto AVR microcontrollers through their USB
//! bootloaders.
//!
//! <br>
//!
//! Two bootloader families are supported. Atmel DFU bootloaders (the ones
//! shipped on ATmega32U4 and ATmega16U2/32U2 parts) are driven with USB DFU
//! class requests carrying Atmel command blocks. HID bootloaders take one
//! flash page per HID report. Both write from a sparse [`MemoryBuffer`]
//! loaded from Intel HEX text, page filled so the device only ever sees whole
//! pages.
//!
//! # Example
//!
//! Erase, flash and start an ATmega32U4 in DFU mode!
//!
//! ```no_run
//! use avrboot_rs::{DfuProgrammer, Programmer, Target, UsbConnector};
//!
//! use rusb::Context;
//!
//! fn main() {
//!     let ctx = Context::new().expect("could not initialize libusb");
//!     let mut programmer = DfuProgrammer::new(UsbConnector::new(ctx), Target::Atmega32u4);
//!
//!     let hex = std::fs::read_to_string("blink.hex").expect("failed to read firmware");
//!     programmer
//!         .reflash(Some(hex.as_str()), None, &mut |p| println!("{}%", p))
//!         .expect("failed to flash device");
//! }
//! ```

use std::time::Duration;

/// Bytes addressable by one Atmel page select
pub const SEGMENT_SIZE: i64 = 0x10000;
/// Largest payload of a single DFU download
pub const MAX_TRANSFER_SIZE: usize = 0x400;
/// Size of the command block prefixing a download
pub const CONTROL_BLOCK_SIZE: usize = 32;
/// Size of the suffix trailing a download
pub const FOOTER_SIZE: usize = 16;

/// Timeout value sent with DFU_DETACH, in milliseconds
pub const DFU_DETACH_TIMEOUT: u16 = 1000;
/// Timeout of one USB control transfer, in milliseconds
pub const USB_TIMEOUT: u64 = 5000;
/// Attempts to bring a device into dfuIDLE
pub const IDLE_RETRIES: u32 = 5;
/// GETSTATUS polls while erasing
pub const ERASE_POLL_RETRIES: u32 = 10;
/// Pause between erase polls
pub const ERASE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Wall-clock limit of an erase
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(20);

/// Atmel USB Vendor ID
pub const ATMEL_VID: u16 = 0x03EB;
/// Default USB Vendor ID of HID bootloaders
pub const HID_DEFAULT_VID: u16 = 0x16C0;
/// Default USB Product ID of HID bootloaders
pub const HID_DEFAULT_PID: u16 = 0x0478;

/// Address Range Module
pub mod range;
pub use range::AddressRange;

/// Intel HEX Module
pub mod hex;
pub use hex::{load_hex, read_hex, HexDecoder, HexRecord};

/// Memory Buffer Module
pub mod buffer;
pub use buffer::MemoryBuffer;

/// Command Module
pub mod cmd;
pub use cmd::{AtmelCmd, ConfigField, DfuState, DfuStatus, DfuStatusReply, EraseMode, FlashError};

/// Target Module
pub mod target;
pub use target::{Segment, Target, TargetDescriptor};

/// USB Connection Module
pub mod usb;
pub use usb::{DfuConnector, DfuTransport, UsbConnection, UsbConnector};

/// DFU Device Module
pub mod device;
pub use device::{BlankCheck, DfuDevice, EraseTiming};

/// HID Bootloader Module
pub mod hid;
pub use hid::{HidApiConnector, HidBootloader, HidConnector, HidProtocol, HidTransport};

/// Programmer Module
pub mod programmer;
pub use programmer::{BusyFlag, DfuProgrammer, FlashOptions, HidProgrammer, HidTarget, Programmer};
