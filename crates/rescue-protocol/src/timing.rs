//! Pacing shared by the device and the host tool.
//!
//! Changing any of these requires the other side to be rebuilt with the same values.

/// Delay before the first HELLO, time for the operator to attach the host tool.
pub const SETTLE_MS: u64 = 3000;
/// Interval between HELLO retries.
pub const HELLO_RETRY_MS: u64 = 250;
/// Default overall HELLO budget.
pub const HELLO_TIMEOUT_MS: u64 = 10_000;
/// Maximum host silence once rescue mode is active.
pub const LIVENESS_TIMEOUT_MS: u64 = 10_000;
/// Delay before reading each WRITE chunk. Tuned for 115200 baud.
pub const CHUNK_PACING_MS: u64 = 33;
/// Delay after data shows up, lets the rest of a command packet arrive.
pub const POLL_SETTLE_MS: u64 = 10;
/// Default WRITE transfer chunk.
pub const CHUNK_SIZE: usize = 64;

pub const US_PER_MS: u64 = 1000;
pub const NS_PER_MS: u64 = 1000 * 1000;
