use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// Transport error
    #[error("port error: {0}")]
    Port(#[from] rescue_port::err::Error),

    /// bincode crate error
    #[error("packet encode error: {0}")]
    Encode(bincode::error::EncodeError),
    /// bincode crate error
    #[error("packet decode error: {0}")]
    Decode(bincode::error::DecodeError),
}

impl From<bincode::error::EncodeError> for Error {
    fn from(value: bincode::error::EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(value: bincode::error::DecodeError) -> Self {
        Self::Decode(value)
    }
}
