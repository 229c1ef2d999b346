#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt::Display;

use bincode::{Decode, Encode};
use derive_ctor::ctor;
use derive_more::IsVariant;
use rescue_port::{SimpleRead, SimpleWrite};
use strum::FromRepr;

use crate::err::Error;

pub mod err;
pub mod timing;

pub type Result<T> = core::result::Result<T, Error>;

/// Protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: &str = "0.50";

/// Size of an addressable flash block, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IsVariant, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    /// Device announces itself to the host during bootstrap.
    Hello = 0x10,
    /// Checksum of one block, followed by a raw 4-byte CRC.
    Checksum = 0x11,
    /// Reserved, never dispatched by the device.
    Read = 0x12,
    /// Rewrite one block, content streamed in chunks.
    Write = 0x13,
    /// Cold reset of the platform.
    Reset = 0x14,
    /// Leave rescue mode and continue booting.
    Exit = 0x15,
    /// Extension: report handler failures with an explicit NACK.
    NackMode = 0x16,
}

/// Value of [`Response::acknowledge`].
pub mod acknowledge {
    /// Not yet acknowledged.
    pub const NONE: u8 = 0x00;
    pub const ACK: u8 = 0x01;
    /// Only sent after the host enabled [`super::Opcode::NackMode`].
    pub const NACK: u8 = 0x02;
}

/// Wire encoding: fixed-width integers, little-endian, no padding.
///
/// Little-endian is the native order of the x86 boards this runs on and the
/// host tool must match it bit for bit.
fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Command packet: `[opcode:u8][block_number:u16]`.
///
/// The opcode is kept raw so that unknown values survive decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, ctor)]
pub struct Command {
    pub opcode: u8,
    /// Block inside the BIOS region.
    pub block_number: u16,
}

impl Command {
    pub const SIZE: usize = 3;

    pub fn hello() -> Self {
        Self::new(Opcode::Hello as u8, 0)
    }

    pub fn checksum(block_number: u16) -> Self {
        Self::new(Opcode::Checksum as u8, block_number)
    }

    pub fn write(block_number: u16) -> Self {
        Self::new(Opcode::Write as u8, block_number)
    }

    pub fn reset() -> Self {
        Self::new(Opcode::Reset as u8, 0)
    }

    pub fn exit() -> Self {
        Self::new(Opcode::Exit as u8, 0)
    }

    pub fn nack_mode() -> Self {
        Self::new(Opcode::NackMode as u8, 0)
    }

    /// `None` for opcodes this revision doesn't know.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_repr(self.opcode)
    }

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE]> {
        encode_fixed(self)
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        decode_fixed(bytes)
    }
}

/// Response packet: `[acknowledge:u8][size:u16]`. `size` is advisory and always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, ctor)]
pub struct Response {
    pub acknowledge: u8,
    pub size: u16,
}

impl Response {
    pub const SIZE: usize = 3;

    pub fn ack() -> Self {
        Self::new(acknowledge::ACK, 0)
    }

    pub fn nack() -> Self {
        Self::new(acknowledge::NACK, 0)
    }

    pub fn is_ack(&self) -> bool {
        self.acknowledge == acknowledge::ACK
    }

    pub fn is_nack(&self) -> bool {
        self.acknowledge == acknowledge::NACK
    }

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE]> {
        encode_fixed(self)
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        decode_fixed(bytes)
    }
}

fn encode_fixed<T: Encode, const N: usize>(value: &T) -> Result<[u8; N]> {
    let mut bytes = [0; N];
    bincode::encode_into_slice(value, &mut bytes, config())?;
    Ok(bytes)
}

fn decode_fixed<T: Decode<()>, const N: usize>(bytes: &[u8; N]) -> Result<T> {
    bincode::decode_from_slice(bytes, config())
        .map(|r| r.0)
        .map_err(|e| e.into())
}

/// Block checksum, bit-identical to the firmware `CalculateCrc32` routine.
pub fn block_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Packet framing over a serial link.
///
/// Packets are fixed-size records; trailing payloads (checksum, write chunks)
/// are raw bytes with no framing of their own.
#[derive(ctor)]
pub struct Protocol<T: SimpleRead + SimpleWrite> {
    io: T,
}

impl<T: SimpleRead + SimpleWrite> Protocol<T> {
    pub fn io(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    pub fn read_command(&mut self) -> Result<Command> {
        let mut bytes = [0; Command::SIZE];
        self.io.read(&mut bytes)?;
        Command::from_bytes(&bytes)
    }

    pub fn send_command(&mut self, command: Command) -> Result<()> {
        self.io.write(&command.to_bytes()?).map_err(|e| e.into())
    }

    pub fn read_response(&mut self) -> Result<Response> {
        let mut bytes = [0; Response::SIZE];
        self.io.read(&mut bytes)?;
        Response::from_bytes(&bytes)
    }

    pub fn send_response(&mut self, response: Response) -> Result<()> {
        self.io.write(&response.to_bytes()?).map_err(|e| e.into())
    }

    /// Raw CRC trailing a CHECKSUM acknowledge.
    pub fn read_checksum(&mut self) -> Result<u32> {
        self.io.read_u32_le().map_err(|e| e.into())
    }

    pub fn send_checksum(&mut self, crc: u32) -> Result<()> {
        self.io.write_u32_le(crc).map_err(|e| e.into())
    }

    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.io.read(buf).map_err(|e| e.into())
    }

    pub fn send_raw(&mut self, buf: &[u8]) -> Result<()> {
        self.io.write(buf).map_err(|e| e.into())
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.opcode() {
            Some(op @ (Opcode::Checksum | Opcode::Read | Opcode::Write)) => {
                write!(f, "{op} block {}", self.block_number)
            }
            Some(op) => write!(f, "{op}"),
            None => write!(f, "unknown opcode {:#04x}", self.opcode),
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.acknowledge {
            acknowledge::ACK => write!(f, "ACK"),
            acknowledge::NACK => write!(f, "NACK"),
            other => write!(f, "no ACK ({other:#04x})"),
        }
    }
}
