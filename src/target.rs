use std::fmt;
use std::str::FromStr;

use crate::cmd::FlashError;
use crate::range::AddressRange;
use crate::ATMEL_VID;

/// Family of the bootloader command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Avr,
}

/// Memory written by a flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Segment {
    #[default]
    Flash,
    Eeprom,
}

impl Segment {
    /// Segment byte of a HID page command.
    pub fn tag(self) -> u8 {
        match self {
            Segment::Flash => 0x01,
            Segment::Eeprom => 0x02,
        }
    }
}

/// Supported microcontrollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Atmega32u4,
    Atmega16u2,
    Atmega32u2,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Atmega32u4, Target::Atmega16u2, Target::Atmega32u2];

    pub fn name(self) -> &'static str {
        match self {
            Target::Atmega32u4 => "atmega32u4",
            Target::Atmega16u2 => "atmega16u2",
            Target::Atmega32u2 => "atmega32u2",
        }
    }

    /// Looks up a target by name, failing with [`FlashError::TargetNotSupported`].
    pub fn by_name(name: &str) -> Result<Target, FlashError> {
        name.parse()
    }

    pub fn descriptor(self) -> TargetDescriptor {
        match self {
            Target::Atmega32u4 => TargetDescriptor {
                device_type: DeviceType::Avr,
                vendor_id: ATMEL_VID,
                chip_id: 0x2FF4,
                memory_size: 0x8000,
                bootloader_size: 0x1000,
                bootloader_at_high_mem: true,
                flash_page_size: 128,
                initial_abort: true,
                honor_interface_class: false,
                eeprom_page_size: 128,
                eeprom_memory_size: 0x0400,
            },
            Target::Atmega16u2 => TargetDescriptor {
                device_type: DeviceType::Avr,
                vendor_id: ATMEL_VID,
                chip_id: 0x2FEF,
                memory_size: 0x4000,
                bootloader_size: 0x1000,
                bootloader_at_high_mem: true,
                flash_page_size: 128,
                initial_abort: true,
                honor_interface_class: false,
                eeprom_page_size: 128,
                eeprom_memory_size: 0x0200,
            },
            Target::Atmega32u2 => TargetDescriptor {
                device_type: DeviceType::Avr,
                vendor_id: ATMEL_VID,
                chip_id: 0x2FF0,
                memory_size: 0x8000,
                bootloader_size: 0x1000,
                bootloader_at_high_mem: true,
                flash_page_size: 128,
                initial_abort: true,
                honor_interface_class: false,
                eeprom_page_size: 128,
                eeprom_memory_size: 0x0400,
            },
        }
    }
}

impl FromStr for Target {
    type Err = FlashError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Target::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| FlashError::TargetNotSupported(name.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory geometry and USB identity of a target in bootloader mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub device_type: DeviceType,
    pub vendor_id: u16,
    /// USB product ID of the bootloader.
    pub chip_id: u16,
    pub memory_size: u32,
    pub bootloader_size: u32,
    pub bootloader_at_high_mem: bool,
    pub flash_page_size: u32,
    /// Send ABORT before forcing the device idle.
    pub initial_abort: bool,
    /// Look for the DFU class interface instead of using interface 0.
    pub honor_interface_class: bool,
    pub eeprom_page_size: u32,
    pub eeprom_memory_size: u32,
}

impl TargetDescriptor {
    fn memory_top(&self) -> i64 {
        self.memory_size as i64 - 1
    }

    /// Addresses application code may occupy.
    pub fn flash_range(&self) -> AddressRange {
        let page_size = self.flash_page_size as i64;
        let bootloader = self.bootloader_size as i64;
        if self.bootloader_at_high_mem {
            AddressRange::new(page_size, 0, self.memory_top() - bootloader)
        } else {
            AddressRange::new(page_size, bootloader, self.memory_top())
        }
    }

    /// Addresses held by the bootloader.
    pub fn bootloader_range(&self) -> AddressRange {
        let page_size = self.flash_page_size as i64;
        let bootloader = self.bootloader_size as i64;
        if self.bootloader_at_high_mem {
            AddressRange::new(
                page_size,
                self.memory_size as i64 - bootloader,
                self.memory_top(),
            )
        } else {
            AddressRange::new(page_size, 0, bootloader - 1)
        }
    }

    pub fn eeprom_range(&self) -> AddressRange {
        AddressRange::new(
            self.eeprom_page_size as i64,
            0,
            self.eeprom_memory_size as i64 - 1,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        assert_eq!(Target::by_name("atmega32u4").unwrap(), Target::Atmega32u4);
        assert!(matches!(
            Target::by_name("attiny85"),
            Err(FlashError::TargetNotSupported(name)) if name == "attiny85"
        ));
    }

    #[test]
    fn high_bootloader_ranges() {
        let d = Target::Atmega32u4.descriptor();
        assert_eq!(d.vendor_id, 0x03EB);
        assert_eq!(d.flash_range(), AddressRange::new(128, 0, 0x6FFF));
        assert_eq!(d.bootloader_range(), AddressRange::new(128, 0x7000, 0x7FFF));
        assert_eq!(d.eeprom_range().size(), 0x400);
    }

    #[test]
    fn low_bootloader_ranges() {
        let d = TargetDescriptor {
            bootloader_at_high_mem: false,
            ..Target::Atmega16u2.descriptor()
        };
        assert_eq!(d.flash_range(), AddressRange::new(128, 0x1000, 0x3FFF));
        assert_eq!(d.bootloader_range(), AddressRange::new(128, 0, 0xFFF));
    }
}
