//! One-shot page arena for the relocated image.

use crate::platform::{PAGE_SIZE, PageRange};

/// A bump arena over a fixed window of pages.
///
/// Only the most recent allocation can be given back, which is all the
/// sequencer ever does.
pub struct ImageArena {
    start: usize,
    end: usize,
    next: usize,
}

impl ImageArena {
    /// `start` is rounded up to a page; `end` is exclusive.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        let start = align_up(start, PAGE_SIZE);
        Self { start, end, next: start }
    }

    pub fn allocate(&mut self, pages: usize) -> Option<PageRange> {
        if pages == 0 {
            return None;
        }

        let base = self.next;
        let end = pages.checked_mul(PAGE_SIZE).and_then(|len| base.checked_add(len))?;
        if end > self.end {
            return None;
        }

        self.next = end;
        Some(PageRange::new(base, pages))
    }

    /// Give back `range`. Returns `false` if it isn't the latest allocation.
    pub fn release(&mut self, range: PageRange) -> bool {
        if range.pages == 0 || range.end() != self.next {
            return false;
        }

        self.next = range.base;
        true
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.next - self.start
    }
}

/// Align `x` up to the next multiple of `align`. `align` must be a power of two.
const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}
