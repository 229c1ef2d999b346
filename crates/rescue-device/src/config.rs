use rescue_protocol::{BLOCK_SIZE, timing};

use crate::{Result, err::Error};

/// Platform constants of the rescue feature.
///
/// Timing values are shared with the host tool; see [`rescue_protocol::timing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueConfig {
    pub settle_ms: u64,
    pub hello_retry_ms: u64,
    pub hello_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub chunk_pacing_ms: u64,
    pub poll_settle_ms: u64,
    /// WRITE transfer chunk, must divide the block size.
    pub chunk_size: usize,
    /// Send NACK on handler failures without waiting for the host to ask.
    pub nack_on_failure: bool,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            settle_ms: timing::SETTLE_MS,
            hello_retry_ms: timing::HELLO_RETRY_MS,
            hello_timeout_ms: timing::HELLO_TIMEOUT_MS,
            liveness_timeout_ms: timing::LIVENESS_TIMEOUT_MS,
            chunk_pacing_ms: timing::CHUNK_PACING_MS,
            poll_settle_ms: timing::POLL_SETTLE_MS,
            chunk_size: timing::CHUNK_SIZE,
            nack_on_failure: false,
        }
    }
}

impl RescueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || BLOCK_SIZE % self.chunk_size != 0 {
            return Err(Error::InvalidConfig("chunk size must divide the block size"));
        }
        if self.hello_retry_ms == 0 {
            return Err(Error::InvalidConfig("hello retry interval is zero"));
        }
        if self.liveness_timeout_ms == 0 {
            return Err(Error::InvalidConfig("liveness timeout is zero"));
        }

        Ok(())
    }
}
