use crate::cmd::FlashError;
use crate::range::AddressRange;
use crate::MAX_TRANSFER_SIZE;

type Result<T> = ::std::result::Result<T, FlashError>;

/// Value of an erased flash byte.
pub const BYTE_MAX: u8 = 0xFF;
const ADDRESS_MASK: i64 = 0x7FFF_FFFF;

/// Sparse image of target memory.
///
/// Storage covers `0..total_size` relative to `offset`. Every byte carries a
/// used mark; only used bytes are ever sent to the device. `data_range` is the
/// bounding box of everything written so far, `valid_range` the window the
/// target accepts, and `block_range` the cursor over the next device write.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    total_size: i64,
    page_size: i64,
    offset: i64,
    max_transfer_size: i64,

    pub data_range: AddressRange,
    pub valid_range: AddressRange,
    pub block_range: AddressRange,

    data: Vec<u8>,
    marks: Vec<bool>,
}

impl MemoryBuffer {
    /// Creates an empty buffer filled with [`BYTE_MAX`] with nothing marked used.
    pub fn new(total_size: u32, page_size: u32, offset: u32) -> Self {
        let total_size = total_size as i64;
        let page_size = (page_size as i64).max(1);
        let valid_range = AddressRange::new(page_size, 0, total_size - 1);
        let len = valid_range.size() as usize;

        MemoryBuffer {
            total_size,
            page_size,
            offset: offset as i64,
            max_transfer_size: MAX_TRANSFER_SIZE as i64,

            data_range: AddressRange::empty(page_size),
            valid_range,
            block_range: AddressRange::empty(page_size),

            data: vec![BYTE_MAX; len],
            marks: vec![false; len],
        }
    }

    /// Caps the length of a single block.
    pub fn with_max_transfer_size(mut self, max_transfer_size: usize) -> Self {
        self.max_transfer_size = (max_transfer_size as i64).max(1);
        self
    }

    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size as usize
    }

    /// Narrows (or widens) the window of addresses the target accepts.
    pub fn set_valid_range(&mut self, start: i64, end: i64) {
        self.valid_range.set(start, end);
    }

    /// Valid range in absolute device addresses.
    pub fn offset_valid_range(&self) -> AddressRange {
        self.valid_range.offset(self.offset)
    }

    pub fn data_size(&self) -> i64 {
        self.data_range.size()
    }

    pub fn valid_size(&self) -> i64 {
        self.valid_range.size()
    }

    /// Share of the valid window spanned by data.
    pub fn usage(&self) -> f64 {
        match self.valid_size() {
            0 => 0.0,
            valid => self.data_size() as f64 / valid as f64,
        }
    }

    pub fn first_page(&self) -> i64 {
        self.data_range.start_page()
    }

    pub fn last_page(&self) -> i64 {
        self.data_range.end_page()
    }

    pub fn number_of_pages(&self) -> i64 {
        self.data_range.number_of_pages()
    }

    pub fn offset_in_page(&self, address: i64) -> i64 {
        address.rem_euclid(self.page_size)
    }

    pub fn has_data(&self) -> bool {
        self.data_range.is_valid()
    }

    pub fn has_data_in_page(&self, page: i64) -> bool {
        (page * self.page_size..(page + 1) * self.page_size).any(|a| self.is_data_used(a))
    }

    /// True when every written address lies inside the valid window.
    pub fn is_data_inside_valid(&self) -> bool {
        self.valid_range.contains_range(&self.data_range)
    }

    /// True when absolute `address` maps into the valid window.
    pub fn is_valid_address(&self, address: i64) -> bool {
        self.valid_range
            .offset(self.offset & ADDRESS_MASK)
            .contains(address & ADDRESS_MASK)
    }

    /// Translates an absolute device address into a buffer address.
    pub fn relative_address(&self, address: i64) -> i64 {
        (address & ADDRESS_MASK) - (self.offset & ADDRESS_MASK)
    }

    fn index(&self, address: i64) -> Option<usize> {
        usize::try_from(address)
            .ok()
            .filter(|&i| i < self.data.len())
    }

    /// Writes `byte` at `address`, marks it used and grows the data range.
    pub fn put_data(&mut self, address: i64, byte: u8) -> Result<()> {
        let i = self
            .index(address)
            .ok_or(FlashError::AddressOutOfRange(address))?;
        self.data[i] = byte;
        self.marks[i] = true;
        self.data_range.inflate(address);
        Ok(())
    }

    pub fn put_blank(&mut self, address: i64) -> Result<()> {
        self.put_data(address, BYTE_MAX)
    }

    pub fn get_data(&self, address: i64) -> Option<u8> {
        self.index(address).map(|i| self.data[i])
    }

    pub fn is_data_used(&self, address: i64) -> bool {
        self.index(address).map_or(false, |i| self.marks[i])
    }

    pub fn mark_data_used(&mut self, address: i64) {
        if let Some(i) = self.index(address) {
            self.marks[i] = true;
        }
    }

    /// Excludes `address` from any later transfer. The data range is left as is.
    pub fn mark_data_unused(&mut self, address: i64) {
        if let Some(i) = self.index(address) {
            self.marks[i] = false;
        }
    }

    /// Shrinks the data range to the used bytes, after some were marked unused.
    pub fn trim_data_range(&mut self) {
        let first = self.marks.iter().position(|&used| used);
        let last = self.marks.iter().rposition(|&used| used);
        match (first, last) {
            (Some(first), Some(last)) => self.data_range.set(first as i64, last as i64),
            _ => self.data_range.invalidate(),
        }
    }

    /// Marks every address of `page` used, filling unwritten ones with [`BYTE_MAX`].
    ///
    /// Addresses past the end of storage are left alone.
    pub fn fill_page(&mut self, page: i64) {
        let end = ((page + 1) * self.page_size).min(self.data.len() as i64);
        for address in (page * self.page_size).max(0)..end {
            if !self.is_data_used(address) {
                // in bounds by construction of the loop
                let _ = self.put_blank(address);
            }
        }
    }

    /// Fills every page of the data range holding at least one used byte, so
    /// blocks come out as whole pages.
    pub fn prepare_buffer(&mut self) {
        if !self.has_data() {
            return;
        }
        for page in self.first_page()..=self.last_page() {
            if self.has_data_in_page(page) {
                self.fill_page(page);
            }
        }
    }

    /// Page number of the current block for a page size of `page_size`.
    pub fn block_page(&self, page_size: i64) -> i64 {
        self.block_range.with_page_size(page_size).start_page()
    }

    pub fn block_size(&self) -> i64 {
        self.block_range.size()
    }

    /// Offset of the current block from the start of the data range.
    pub fn block_offset(&self) -> i64 {
        self.block_range.start - self.data_range.start
    }

    /// Bytes of the current block; advances the cursor.
    pub fn get_block(&mut self) -> Vec<u8> {
        let block = match (
            self.index(self.block_range.start),
            self.index(self.block_range.end),
        ) {
            (Some(start), Some(end)) if end >= start => self.data[start..=end].to_vec(),
            _ => Vec::new(),
        };
        self.next_block();
        block
    }

    /// Stores `block` at the current block start; advances the cursor.
    pub fn put_block(&mut self, block: &[u8]) -> Result<()> {
        let start = self.block_range.start;
        for (i, byte) in block.iter().enumerate() {
            self.put_data(start + i as i64, *byte)?;
        }
        self.next_block();
        Ok(())
    }

    pub fn has_remaining_block(&self) -> bool {
        self.block_range.is_valid() && self.data_range.contains_range(&self.block_range)
    }

    /// Places the cursor on the first block of the data range.
    pub fn rewind_block(&mut self) {
        let start = self.data_range.start;
        self.block_range.set(start, self.find_block_end(start));
    }

    pub fn next_block(&mut self) {
        let start = self.find_block_start(self.block_range.end);
        self.block_range.set(start, self.find_block_end(start));
    }

    fn find_block_start(&self, end: i64) -> i64 {
        let mut start = end.saturating_add(1);
        while start <= self.data_range.end {
            if self.is_data_used(start) {
                break;
            }
            start += 1;
        }
        start
    }

    fn find_block_end(&self, start: i64) -> i64 {
        let mut end = start;
        while end <= self.data_range.end {
            if !self.is_data_used(end)
                || end - start + 1 > self.max_transfer_size
                || end.div_euclid(self.page_size) > start.div_euclid(self.page_size)
            {
                break;
            }
            end += 1;
        }
        end.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(buffer: &mut MemoryBuffer) -> Vec<AddressRange> {
        let mut out = Vec::new();
        buffer.rewind_block();
        while buffer.has_remaining_block() {
            out.push(buffer.block_range);
            buffer.next_block();
        }
        out
    }

    #[test]
    fn new_buffer_is_blank_and_unused() {
        let buffer = MemoryBuffer::new(0x400, 128, 0);
        assert_eq!(buffer.valid_size(), 0x400);
        assert!(!buffer.has_data());
        assert_eq!(buffer.get_data(0x3FF), Some(BYTE_MAX));
        assert!(!buffer.is_data_used(0));
        assert_eq!(buffer.get_data(0x400), None);
    }

    #[test]
    fn put_data_marks_and_inflates() {
        let mut buffer = MemoryBuffer::new(0x400, 128, 0);
        buffer.put_data(0x90, 0x12).unwrap();
        buffer.put_data(0x10, 0x34).unwrap();
        assert!(buffer.is_data_used(0x90));
        assert_eq!(buffer.data_range, AddressRange::new(128, 0x10, 0x90));
        assert!(matches!(
            buffer.put_data(0x400, 0),
            Err(FlashError::AddressOutOfRange(0x400))
        ));
    }

    #[test]
    fn prepare_buffer_fills_touched_pages_only() {
        let mut buffer = MemoryBuffer::new(0x400, 128, 0);
        buffer.put_data(0x05, 0xAA).unwrap();
        buffer.put_data(0x185, 0xBB).unwrap();
        buffer.prepare_buffer();

        assert!((0..0x80).all(|a| buffer.is_data_used(a)));
        assert!((0x80..0x180).all(|a| !buffer.is_data_used(a)));
        assert!((0x180..0x200).all(|a| buffer.is_data_used(a)));
        assert_eq!(buffer.get_data(0x05), Some(0xAA));
        assert_eq!(buffer.get_data(0x06), Some(BYTE_MAX));
        assert_eq!(buffer.data_range, AddressRange::new(128, 0, 0x1FF));
    }

    #[test]
    fn prepare_buffer_is_idempotent() {
        let mut once = MemoryBuffer::new(0x800, 128, 0);
        for a in (0x30..0x150).chain(0x3F0..0x410) {
            once.put_data(a, a as u8).unwrap();
        }
        once.prepare_buffer();
        let mut twice = once.clone();
        twice.prepare_buffer();

        assert_eq!(once.data, twice.data);
        assert_eq!(once.marks, twice.marks);
        assert_eq!(once.data_range, twice.data_range);
    }

    #[test]
    fn fill_page_stops_at_storage_end() {
        let mut buffer = MemoryBuffer::new(0x1F0, 128, 0);
        buffer.put_data(0x1E0, 1).unwrap();
        buffer.prepare_buffer();
        assert_eq!(buffer.data_range, AddressRange::new(128, 0x180, 0x1EF));
    }

    #[test]
    fn blocks_never_cross_pages_or_exceed_transfer_size() {
        let mut buffer = MemoryBuffer::new(0x1000, 128, 0);
        // 300 used bytes, a 128 byte gap, then 50 more
        for a in 0..300 {
            buffer.put_data(a, 0x11).unwrap();
        }
        for a in 428..478 {
            buffer.put_data(a, 0x22).unwrap();
        }
        buffer.prepare_buffer();
        // the gap shares pages with both runs and disappears
        assert!((0..512).all(|a| buffer.is_data_used(a)));

        let blocks = blocks(&mut buffer);
        assert_eq!(blocks.len(), 4);
        for block in &blocks {
            assert!(block.size() <= buffer.max_transfer_size() as i64);
            assert_eq!(block.start_page(), block.end_page());
        }
        assert_eq!(blocks[0], AddressRange::new(128, 0, 127));
        assert_eq!(blocks[3], AddressRange::new(128, 384, 511));
    }

    #[test]
    fn max_transfer_size_splits_pages() {
        let mut buffer = MemoryBuffer::new(0x20000, 0x10000, 0).with_max_transfer_size(0x400);
        for a in 0..0x900 {
            buffer.put_data(a, 0).unwrap();
        }
        let blocks = blocks(&mut buffer);
        let sizes: Vec<i64> = blocks.iter().map(|b| b.size()).collect();
        assert_eq!(sizes, vec![0x400, 0x400, 0x100]);
    }

    #[test]
    fn unused_marks_split_blocks() {
        let mut buffer = MemoryBuffer::new(0x100, 128, 0);
        for a in 0..16 {
            buffer.put_data(a, 0).unwrap();
        }
        buffer.mark_data_unused(8);

        let blocks = blocks(&mut buffer);
        assert_eq!(
            blocks,
            vec![AddressRange::new(128, 0, 7), AddressRange::new(128, 9, 15)]
        );
    }

    #[test]
    fn trim_follows_used_marks() {
        let mut buffer = MemoryBuffer::new(0x100, 16, 0);
        for a in 0x10..0x40 {
            buffer.put_data(a, 0).unwrap();
        }
        for a in 0x30..0x40 {
            buffer.mark_data_unused(a);
        }
        buffer.trim_data_range();
        assert_eq!(buffer.data_range, AddressRange::new(16, 0x10, 0x2F));

        for a in 0x10..0x30 {
            buffer.mark_data_unused(a);
        }
        buffer.trim_data_range();
        assert!(!buffer.has_data());
    }

    #[test]
    fn get_block_advances_cursor() {
        let mut buffer = MemoryBuffer::new(0x100, 4, 0);
        for a in 0..6 {
            buffer.put_data(a, a as u8).unwrap();
        }
        buffer.rewind_block();
        assert_eq!(buffer.get_block(), vec![0, 1, 2, 3]);
        assert_eq!(buffer.block_offset(), 4);
        assert_eq!(buffer.get_block(), vec![4, 5]);
        assert!(!buffer.has_remaining_block());
    }

    #[test]
    fn put_block_stores_at_cursor() {
        let mut buffer = MemoryBuffer::new(0x100, 4, 0);
        for a in 0..8 {
            buffer.put_blank(a).unwrap();
        }
        buffer.rewind_block();
        buffer.put_block(&[1, 2, 3, 4]).unwrap();
        buffer.put_block(&[5, 6]).unwrap();
        assert_eq!(buffer.get_data(3), Some(4));
        assert_eq!(buffer.get_data(5), Some(6));
        assert_eq!(buffer.get_data(6), Some(BYTE_MAX));
    }

    #[test]
    fn empty_buffer_has_no_blocks() {
        let mut buffer = MemoryBuffer::new(0x100, 128, 0);
        buffer.prepare_buffer();
        assert!(blocks(&mut buffer).is_empty());
    }

    #[test]
    fn valid_address_respects_offset() {
        let mut buffer = MemoryBuffer::new(0x1000, 128, 0x800);
        assert!(buffer.is_valid_address(0x800));
        assert!(buffer.is_valid_address(0x17FF));
        assert!(!buffer.is_valid_address(0x7FF));
        assert_eq!(buffer.relative_address(0x810), 0x10);

        buffer.set_valid_range(0, 0xEFF);
        buffer.put_data(0xF00, 0).unwrap();
        assert!(!buffer.is_data_inside_valid());
    }
}
