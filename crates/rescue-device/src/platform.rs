//! Services the rescue feature borrows from the firmware environment.

use derive_ctor::ctor;
use derive_more::IsVariant;
use r_efi::efi;
use rescue_port::{SimplePoll, SimpleRead, SimpleWrite};

use crate::{
    Outcome, Result,
    config::RescueConfig,
    flash::FlashAccess,
    warmup::{CodeWindow, saturate_code_cache},
};

pub const PAGE_SIZE: usize = 4096;

/// Serial link to the host tool.
pub trait Transport: SimpleRead + SimpleWrite + SimplePoll {}

impl<T: SimpleRead + SimpleWrite + SimplePoll> Transport for T {}

/// Monotonic time source and busy-wait delay.
pub trait Timer {
    fn now_ns(&self) -> u64;
    fn delay_us(&mut self, us: u64);
}

pub trait ColdReset {
    /// Cold reset of the whole platform. Doesn't come back on real hardware.
    fn cold_reset(&mut self);
}

/// Platform constants of the rescue feature.
pub trait PlatformConfig {
    fn rescue_config(&self) -> RescueConfig;
}

/// Registry of installed zero-payload capabilities.
pub trait ServiceRegistry {
    fn is_installed(&self, guid: &efi::Guid) -> bool;
    fn install(&mut self, guid: &'static efi::Guid) -> core::result::Result<(), efi::Status>;
}

/// Size and entry of this module's image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ctor)]
pub struct ImageInfo {
    pub size: usize,
    pub entry_offset: usize,
}

/// Page-aligned memory owned by whoever allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ctor)]
pub struct PageRange {
    pub base: usize,
    pub pages: usize,
}

impl PageRange {
    pub const fn pages_for(size: usize) -> usize {
        size.div_ceil(PAGE_SIZE)
    }

    pub const fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub const fn end(&self) -> usize {
        self.base + self.len()
    }
}

/// Address of a relocated entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(pub usize);

/// Loading of this module's own image into fresh memory.
pub trait ImageServices {
    fn locate_self(&mut self) -> core::result::Result<ImageInfo, efi::Status>;
    fn allocate_pages(&mut self, pages: usize) -> core::result::Result<PageRange, efi::Status>;
    fn free_pages(&mut self, range: PageRange) -> core::result::Result<(), efi::Status>;
    /// Copy the image into `dest` and apply its relocations.
    fn load_and_relocate(
        &mut self,
        image: &ImageInfo,
        dest: &PageRange,
    ) -> core::result::Result<EntryPoint, efi::Status>;
    /// Drop code-cache lines that may still map the image in flash.
    ///
    /// Defaults to the cache-as-RAM sweep over [`CodeWindow::BIOS`]. Platforms
    /// where that window isn't mapped must override it.
    fn evict_code_cache(&mut self) {
        // SAFETY: the BIOS window is memory-mapped and dword aligned on cache-as-RAM boards
        unsafe { saturate_code_cache(CodeWindow::BIOS) };
    }
    /// Call the relocated entry point and return its result.
    fn transfer(&mut self, entry: EntryPoint) -> Result<Outcome>;
}

/// Everything the sequencer needs from the platform.
pub trait Firmware:
    Transport + FlashAccess + Timer + ColdReset + PlatformConfig + ServiceRegistry + ImageServices
{
}

impl<T> Firmware for T where
    T: Transport + FlashAccess + Timer + ColdReset + PlatformConfig + ServiceRegistry + ImageServices
{
}

/// Published once the module runs from its relocated copy.
pub struct RelocationMarker;

impl RelocationMarker {
    pub const GUID: efi::Guid =
        efi::Guid::from_fields(0xe5147285, 0x4d34, 0x415e, 0x8e, 0xa8, &[0x85, 0xbd, 0xd8, 0xc6, 0x5b, 0xde]);
}

/// Which copy of the module is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum EntryState {
    /// First entry, executing in place from flash.
    ColdEntry,
    /// Relocated copy, runs the command loop.
    RescueActive,
}

impl EntryState {
    pub fn detect<R: ServiceRegistry + ?Sized>(registry: &R) -> Self {
        if registry.is_installed(&RelocationMarker::GUID) {
            Self::RescueActive
        } else {
            Self::ColdEntry
        }
    }
}
