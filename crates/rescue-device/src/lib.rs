#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Device side of the early SPI flash rescue protocol.
//!
//! [`sequencer::module_entry`] is called once per boot attempt, before memory
//! is fully up. With no host listening it returns [`Outcome::NormalBoot`];
//! otherwise it moves itself out of flash and lets the host checksum and
//! rewrite blocks of the BIOS region through [`engine::RescueEngine`].

use derive_more::IsVariant;
use r_efi::efi;

use crate::err::Error;

pub mod arena;
pub mod config;
pub mod engine;
pub mod err;
pub mod flash;
pub mod platform;
pub mod sequencer;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod warmup;

pub type Result<T> = core::result::Result<T, Error>;

pub use config::RescueConfig;
pub use engine::RescueEngine;
pub use sequencer::module_entry;

/// How a boot attempt left the rescue feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum Outcome {
    /// No host answered HELLO.
    NormalBoot,
    /// Host sent EXIT, boot continues.
    Exited,
    /// Host sent RESET. Only seen when the platform reset returns.
    Reset,
}

/// Status for the firmware module completion path.
pub fn entry_status(result: &Result<Outcome>) -> efi::Status {
    match result {
        Ok(_) => efi::Status::SUCCESS,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(entry_status(&Ok(Outcome::NormalBoot)), efi::Status::SUCCESS);
        assert_eq!(entry_status(&Err(Error::LivenessTimeout)), efi::Status::TIMEOUT);
        assert_eq!(entry_status(&Err(Error::OutOfResources)), efi::Status::OUT_OF_RESOURCES);
        assert_eq!(entry_status(&Err(Error::Device)), efi::Status::DEVICE_ERROR);
        assert_eq!(entry_status(&Err(Error::Registry(efi::Status::ABORTED))), efi::Status::ABORTED);
        assert_eq!(entry_status(&Err(Error::InvalidConfig("x"))), efi::Status::INVALID_PARAMETER);
    }
}
