//! Code-cache eviction before jumping into the relocated image.
//!
//! With cache-as-RAM in no-evict mode nothing keeps L1i coherent with the
//! cache lines backing the new copy, and stale decoded instructions raise #UD
//! on perfectly valid code. Reading a span larger than L1 pushes the old lines
//! out so the first fetch from the copy misses.
//!
//! Platforms without that hazard can make
//! [`ImageServices::evict_code_cache`](crate::platform::ImageServices::evict_code_cache) a no-op.

use core::ptr;

/// Passes over the window.
pub const SWEEP_PASSES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeWindow {
    pub base: usize,
    pub len: usize,
}

impl CodeWindow {
    /// 640 KiB of the memory-mapped BIOS from 0xFFF0_0000.
    pub const BIOS: Self = Self::new(0xfff0_0000, 640 * 1024);

    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub const fn end(&self) -> usize {
        self.base + self.len
    }
}

/// Read every dword of `window`, [`SWEEP_PASSES`] times.
///
/// The OR of all values is returned so the reads can't be elided.
///
/// # Safety
/// `window` must be mapped, readable and 4-byte aligned.
pub unsafe fn saturate_code_cache(window: CodeWindow) -> u32 {
    let mut acc = 0;

    for _ in 0..SWEEP_PASSES {
        for i in 0..window.len / 4 {
            acc |= unsafe { ptr::read_volatile((window.base + i * 4) as *const u32) };
        }
    }

    acc
}
