use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    #[cfg(feature = "serialport")]
    /// `serialport` crate error
    #[error("serialport error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[cfg(feature = "std")]
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The other end of the link is gone
    #[error("link closed")]
    Closed,
}

impl Error {
    /// `true` if a read gave up waiting for data.
    pub fn is_timeout(&self) -> bool {
        match self {
            #[cfg(feature = "std")]
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
