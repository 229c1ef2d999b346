//! Host side of the early SPI flash rescue protocol.
//!
//! [`client::RescueClient`] drives a board that answered HELLO: it checksums
//! and rewrites BIOS blocks one at a time over any [`rescue_port`] transport.

use crate::err::Error;

pub mod client;
pub mod err;
mod logging;

pub type Result<T> = core::result::Result<T, Error>;
