use rescue_protocol::BLOCK_SIZE;
use thiserror::Error as TError;

#[cfg(test)]
use mockall::automock;

/// Regions of the boot flash descriptor.
///
/// The rescue loop only touches [`FlashRegion::Bios`]; the rest are there for
/// platform [`FlashAccess`] implementations that map every region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashRegion {
    Descriptor,
    Bios,
    Me,
    GbE,
    PlatformData,
}

#[derive(Debug, TError, PartialEq, Eq)]
pub enum FlashError {
    /// Service is missing or wasn't initialised
    #[error("flash service not ready")]
    NotReady,
    /// Access crosses the end of the region
    #[error("offset {0:#x} outside the region")]
    OutOfRange(usize),
    /// Controller reported a failure
    #[error("flash controller error")]
    Device,
}

/// Block access to the boot flash.
///
/// Offsets are relative to the start of `region`.
#[cfg_attr(test, automock)]
pub trait FlashAccess {
    /// (Re)initialise the flash service.
    fn init(&mut self) -> Result<(), FlashError>;
    fn read_block(&mut self, region: FlashRegion, offset: usize, buf: &mut [u8]) -> Result<(), FlashError>;
    fn erase_block(&mut self, region: FlashRegion, offset: usize, len: usize) -> Result<(), FlashError>;
    fn write_block(&mut self, region: FlashRegion, offset: usize, data: &[u8]) -> Result<(), FlashError>;
}

/// Byte offset of `block_number` inside its region.
pub const fn block_offset(block_number: u16) -> usize {
    block_number as usize * BLOCK_SIZE
}
