use rescue_protocol::Opcode;
use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// Nothing that looked like HELLO arrived in time
    #[error("No HELLO from the device within {0} ms, is the board powered on?")]
    NoHello(u64),
    /// The device answered with something other than ACK
    #[error("Device didn't acknowledge {0}")]
    NoAck(Opcode),
    /// The device reported a failed flash operation
    #[error("Device rejected {opcode} of block {block:#x}")]
    Nack { opcode: Opcode, block: u16 },
    /// Read-back after WRITE doesn't match the data sent
    #[error("Checksum mismatch at block {block:#x}! Expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { block: u16, expected: u32, actual: u32 },
    /// The image can't be split into whole blocks
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// rescue-protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] rescue_protocol::err::Error),
    /// rescue-port error
    #[error("Port error: {0}")]
    Port(#[from] rescue_port::err::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// serialport crate error
    #[error("serialport error: {0}")]
    SerialPort(#[from] serialport::Error),
    /// Any other error
    #[error("{0}")]
    Custom(#[from] Box<dyn std::error::Error>),
}

impl Error {
    /// `true` if the device simply didn't answer in time.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Port(e) | Self::Protocol(rescue_protocol::err::Error::Port(e)) => e.is_timeout(),
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
