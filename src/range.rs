use std::fmt;

/// Closed address interval `start..=end` with a default page size for page queries.
///
/// A range with `end < start` is empty. The canonical empty range has
/// `start = i64::MAX` and `end = i64::MIN`, so that [`AddressRange::inflate`]
/// on it yields the single address inflated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: i64,
    pub end: i64,
    pub page_size: i64,
}

impl AddressRange {
    /// Creates the range `start..=end`.
    pub fn new(page_size: i64, start: i64, end: i64) -> Self {
        AddressRange {
            start,
            end,
            page_size,
        }
    }

    /// Creates an empty range.
    pub fn empty(page_size: i64) -> Self {
        AddressRange {
            start: i64::MAX,
            end: i64::MIN,
            page_size,
        }
    }

    /// Same bounds, viewed with another page size.
    pub fn with_page_size(&self, page_size: i64) -> Self {
        AddressRange { page_size, ..*self }
    }

    pub fn set(&mut self, start: i64, end: i64) {
        self.start = start;
        self.end = end;
    }

    pub fn invalidate(&mut self) {
        self.start = i64::MAX;
        self.end = i64::MIN;
    }

    pub fn is_valid(&self) -> bool {
        self.end >= self.start
    }

    /// Number of addresses in the range, zero when empty.
    pub fn size(&self) -> i64 {
        if self.is_valid() {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn contains(&self, address: i64) -> bool {
        address >= self.start && address <= self.end
    }

    /// True when `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// True when either endpoint of `other` falls inside this range.
    ///
    /// This is not interval overlap: a range strictly enclosing `self` does
    /// not intersect it.
    pub fn intersect(&self, other: &AddressRange) -> bool {
        self.contains(other.start) || self.contains(other.end)
    }

    /// Grows the range to include `address`.
    pub fn inflate(&mut self, address: i64) {
        self.start = self.start.min(address);
        self.end = self.end.max(address);
    }

    /// Copy of the range moved by `delta`.
    pub fn offset(&self, delta: i64) -> Self {
        AddressRange::new(
            self.page_size,
            self.start.saturating_add(delta),
            self.end.saturating_add(delta),
        )
    }

    pub fn start_page(&self) -> i64 {
        self.start.div_euclid(self.page_size)
    }

    pub fn end_page(&self) -> i64 {
        self.end.div_euclid(self.page_size)
    }

    pub fn number_of_pages(&self) -> i64 {
        self.end_page() - self.start_page() + 1
    }

    /// Offset of the range start within its page, or within `page` when the
    /// range begins before that page.
    pub fn start_in_page(&self, page: Option<i64>) -> i64 {
        let start = match page {
            Some(page) => self.start.max(page * self.page_size),
            None => self.start,
        };
        start.rem_euclid(self.page_size)
    }

    /// Offset of the range end within its page, or within `page` when the
    /// range ends after that page.
    pub fn end_in_page(&self, page: Option<i64>) -> i64 {
        let end = match page {
            Some(page) => self.end.min((page + 1) * self.page_size - 1),
            None => self.end,
        };
        end.rem_euclid(self.page_size)
    }

    /// Range of page numbers covered by this range.
    pub fn page_range(&self) -> Self {
        AddressRange::new(self.page_size, self.start_page(), self.end_page())
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:#x} to {:#x}", self.start, self.end)
        } else {
            write!(f, "(empty)")
        }
    }
}
