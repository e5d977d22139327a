//! Intel HEX decoding.
//!
//! [`HexDecoder`] walks the image lazily and yields one `(address, byte)` pair
//! per data byte, resolving extended segment/linear address records as it
//! goes. Decoding stops at the first end-of-file record; anything after it is
//! never looked at. Checksums are ignored unless [`HexDecoder::strict`] is set.

use std::str::Lines;

use crate::buffer::MemoryBuffer;
use crate::cmd::FlashError;

type Result<T> = ::std::result::Result<T, FlashError>;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// One parsed HEX line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexRecord {
    Data { offset: u16, value: Vec<u8> },
    EndOfFile,
    ExtendedSegmentAddress(u16),
    StartSegmentAddress { cs: u16, ip: u16 },
    ExtendedLinearAddress(u16),
    StartLinearAddress(u32),
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl HexRecord {
    /// Parses a single line (without line terminator). `line` is the 1-based
    /// line number used in errors.
    pub fn parse(text: &str, line: usize, strict: bool) -> Result<Self> {
        let format = |reason: &str| FlashError::Format {
            line,
            reason: reason.to_string(),
        };

        let body = text
            .strip_prefix(':')
            .ok_or_else(|| format("line does not start with ':'"))?
            .as_bytes();

        let mut bytes = Vec::with_capacity(body.len() / 2);
        for pair in body.chunks(2) {
            match pair {
                [hi, lo] => match (hex_digit(*hi), hex_digit(*lo)) {
                    (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                    _ => return Err(format("invalid hex digit")),
                },
                _ => return Err(format("odd number of hex digits")),
            }
        }

        if bytes.len() < 4 {
            return Err(format("record too short"));
        }
        let byte_count = bytes[0] as usize;
        if bytes.len() < 4 + byte_count {
            return Err(format(&format!(
                "byte count {} exceeds record length",
                byte_count
            )));
        }
        let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        let data = &bytes[4..4 + byte_count];

        if strict {
            let expected = bytes
                .get(4 + byte_count)
                .copied()
                .ok_or_else(|| format("missing checksum"))?;
            let sum = bytes[..4 + byte_count]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b));
            let actual = 0u8.wrapping_sub(sum);
            if expected != actual {
                return Err(FlashError::ChecksumMismatch {
                    line,
                    expected,
                    actual,
                });
            }
        }

        let word = |data: &[u8]| -> Result<u16> {
            match data {
                [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
                _ => Err(format("address record must have 2 data bytes")),
            }
        };

        match record_type {
            RECORD_DATA => Ok(HexRecord::Data {
                offset,
                value: data.to_vec(),
            }),
            RECORD_EOF => Ok(HexRecord::EndOfFile),
            RECORD_EXTENDED_SEGMENT => Ok(HexRecord::ExtendedSegmentAddress(word(data)?)),
            RECORD_EXTENDED_LINEAR => Ok(HexRecord::ExtendedLinearAddress(word(data)?)),
            RECORD_START_SEGMENT => match data {
                [a, b, c, d] => Ok(HexRecord::StartSegmentAddress {
                    cs: u16::from_be_bytes([*a, *b]),
                    ip: u16::from_be_bytes([*c, *d]),
                }),
                _ => Err(format("start segment address must have 4 data bytes")),
            },
            RECORD_START_LINEAR => match data {
                [a, b, c, d] => Ok(HexRecord::StartLinearAddress(u32::from_be_bytes([
                    *a, *b, *c, *d,
                ]))),
                _ => Err(format("start linear address must have 4 data bytes")),
            },
            other => Err(format(&format!("unsupported record type {:#04x}", other))),
        }
    }
}

/// Lazy `(absolute address, byte)` iterator over an Intel HEX image.
///
/// The iterator is fused after the end-of-file record or the first error.
pub struct HexDecoder<'a> {
    lines: std::iter::Enumerate<Lines<'a>>,
    strict: bool,
    high_address: u32,
    pending: Option<(usize, Option<u32>, std::vec::IntoIter<u8>)>,
    start_address: Option<u32>,
    done: bool,
}

impl<'a> HexDecoder<'a> {
    pub fn new(text: &'a str) -> Self {
        HexDecoder {
            lines: text.lines().enumerate(),
            strict: false,
            high_address: 0,
            pending: None,
            start_address: None,
            done: false,
        }
    }

    /// Enables checksum validation.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Entry point from a start segment/linear address record seen so far.
    /// Informational only.
    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    /// Reads records until the next one carrying data.
    fn next_data(&mut self) -> Option<Result<()>> {
        for (n, text) in self.lines.by_ref() {
            let line = n + 1;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let record = match HexRecord::parse(text, line, self.strict) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            match record {
                HexRecord::Data { offset, value } => {
                    let base = match self.high_address.checked_add(offset as u32) {
                        Some(base) => base,
                        None => return Some(Err(FlashError::AddressOverflow { line })),
                    };
                    self.pending = Some((line, Some(base), value.into_iter()));
                    return Some(Ok(()));
                }
                HexRecord::EndOfFile => return None,
                HexRecord::ExtendedSegmentAddress(segment) => {
                    self.high_address = (segment as u32) << 4;
                }
                HexRecord::ExtendedLinearAddress(upper) => {
                    self.high_address = (upper as u32) << 16;
                }
                HexRecord::StartSegmentAddress { cs, ip } => {
                    self.start_address = Some(((cs as u32) << 4) + ip as u32);
                }
                HexRecord::StartLinearAddress(address) => {
                    self.start_address = Some(address);
                }
            }
        }
        None
    }
}

impl Iterator for HexDecoder<'_> {
    type Item = Result<(u32, u8)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some((line, address, bytes)) = &mut self.pending {
                if let Some(byte) = bytes.next() {
                    let Some(current) = *address else {
                        self.done = true;
                        return Some(Err(FlashError::AddressOverflow { line: *line }));
                    };
                    *address = current.checked_add(1);
                    return Some(Ok((current, byte)));
                }
                self.pending = None;
            }

            match self.next_data() {
                Some(Ok(())) => continue,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Decodes `hex` into `buffer` without checksum validation.
pub fn read_hex(buffer: &mut MemoryBuffer, hex: &str) -> Result<usize> {
    load_hex(buffer, HexDecoder::new(hex))
}

/// Stores everything `decoder` yields into `buffer`.
///
/// Absolute addresses are translated by the buffer offset; bytes falling
/// outside the buffer window are dropped with a warning. Returns the number
/// of bytes stored.
pub fn load_hex(buffer: &mut MemoryBuffer, decoder: HexDecoder<'_>) -> Result<usize> {
    let mut stored = 0;
    let mut dropped = 0;
    for item in decoder {
        let (address, byte) = item?;
        let address = address as i64;
        if buffer.is_valid_address(address) {
            buffer.put_data(buffer.relative_address(address), byte)?;
            stored += 1;
        } else {
            if dropped == 0 {
                log::warn!(
                    "Address {:#x} is outside valid range {}.",
                    address,
                    buffer.offset_valid_range()
                );
            }
            dropped += 1;
        }
    }
    if dropped > 0 {
        log::warn!("{} bytes outside of the valid range were ignored", dropped);
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Vec<(u32, u8)> {
        HexDecoder::new(text).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn extended_linear_address_offsets_data() {
        let text = ":020000040001F9\n:02001000AABB89\n:00000001FF\n";
        assert_eq!(decode(text), vec![(0x10010, 0xAA), (0x10011, 0xBB)]);
    }

    #[test]
    fn extended_segment_address_shifts_by_four() {
        let text = ":020000021000EC\n:0100000042BD\n:00000001FF";
        assert_eq!(decode(text), vec![(0x10000, 0x42)]);
    }

    #[test]
    fn stops_at_end_of_file() {
        let text = ":0100000001FE\n:00000001FF\n:0100010002FC\ngarbage after eof\n";
        assert_eq!(decode(text), vec![(0x0000, 0x01)]);
    }

    #[test]
    fn records_start_address() {
        let mut decoder = HexDecoder::new(":0400000500000100F6\n:00000001FF\n");
        assert!(decoder.next().is_none());
        assert_eq!(decoder.start_address(), Some(0x100));
    }

    #[test]
    fn rejects_line_without_marker() {
        let mut decoder = HexDecoder::new(":0100000001FE\n0100010002FC\n");
        assert_eq!(decoder.next().unwrap().unwrap(), (0, 1));
        assert!(matches!(
            decoder.next(),
            Some(Err(FlashError::Format { line: 2, .. }))
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn checksum_only_checked_when_strict() {
        let text = ":0100000001FF\n:00000001FF\n";
        assert_eq!(decode(text), vec![(0, 1)]);

        let mut strict = HexDecoder::new(text).strict(true);
        assert!(matches!(
            strict.next(),
            Some(Err(FlashError::ChecksumMismatch {
                line: 1,
                expected: 0xFF,
                actual: 0xFE
            }))
        ));
    }

    #[test]
    fn short_payload_is_format_error() {
        assert!(matches!(
            HexRecord::parse(":04000000AABB", 7, false),
            Err(FlashError::Format { line: 7, .. })
        ));
    }

    #[test]
    fn read_hex_drops_bytes_outside_buffer() {
        let mut buffer = MemoryBuffer::new(0x100, 16, 0x100);
        let text = ":0100FF0001FF\n:020100001122CC\n:00000001FF\n";
        assert_eq!(read_hex(&mut buffer, text).unwrap(), 2);
        assert_eq!(buffer.get_data(0), Some(0x11));
        assert_eq!(buffer.get_data(1), Some(0x22));
        assert_eq!(buffer.data_range.size(), 2);
    }
}
