use r_efi::efi;
use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// Flash service couldn't be (re)initialised
    #[error("flash service initialisation failed")]
    Device,
    /// Host went silent while rescue mode was active
    #[error("host timed out, flash content may be inconsistent")]
    LivenessTimeout,
    /// No pages for the relocated image
    #[error("out of memory for the relocated image")]
    OutOfResources,
    /// Own image couldn't be located, loaded or relocated
    #[error("image load failed: {0:?}")]
    Load(efi::Status),
    /// Relocation marker couldn't be published
    #[error("service registry error: {0:?}")]
    Registry(efi::Status),
    /// Platform supplied an unusable configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// rescue-protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] rescue_protocol::err::Error),
}

impl Error {
    /// Status handed back to the firmware module completion path.
    pub fn status(&self) -> efi::Status {
        match self {
            Self::Device | Self::Protocol(_) => efi::Status::DEVICE_ERROR,
            Self::LivenessTimeout => efi::Status::TIMEOUT,
            Self::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            Self::Load(status) | Self::Registry(status) => *status,
            Self::InvalidConfig(_) => efi::Status::INVALID_PARAMETER,
        }
    }
}

impl From<rescue_port::err::Error> for Error {
    fn from(value: rescue_port::err::Error) -> Self {
        Self::Protocol(value.into())
    }
}
