use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use derive_ctor::ctor;
use derive_more::IsVariant;
use rescue_port::{SimplePoll, SimpleRead, SimpleWrite};
use rescue_protocol::{
    BLOCK_SIZE, Command, Opcode, Protocol, Response, block_checksum,
    timing::{CHUNK_SIZE, HELLO_RETRY_MS},
};

use crate::{Result, err::Error};

/// Extra wait after ACKing HELLO, so the duplicates still in flight get discarded too.
const HELLO_DRAIN_MARGIN_MS: u64 = 100;

#[derive(Debug, Clone, ctor)]
pub struct ClientOptions {
    /// Resends of an idempotent command whose response timed out.
    pub retries: u32,
    /// WRITE chunk size, must match the device.
    pub chunk_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { retries: 3, chunk_size: CHUNK_SIZE }
    }
}

/// What [`RescueClient::sync_block`] did to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum BlockSync {
    Unchanged,
    Rewritten,
}

pub struct RescueClient<T: SimpleRead + SimpleWrite> {
    protocol: Protocol<T>,
    options: ClientOptions,
    nack_enabled: bool,
}

impl<T: SimpleRead + SimpleWrite + SimplePoll> RescueClient<T> {
    pub fn new(io: T, options: ClientOptions) -> Self {
        Self { protocol: Protocol::new(io), options, nack_enabled: false }
    }

    pub fn into_inner(self) -> T {
        self.protocol.into_inner()
    }

    /// Block until the device announces itself, then take it over.
    ///
    /// The stream is scanned byte by byte since the host may attach in the
    /// middle of a packet.
    pub fn wait_for_hello(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut window = [0; Command::SIZE];

        loop {
            match self.protocol.io().read_u8() {
                Ok(byte) => {
                    window.rotate_left(1);
                    window[Command::SIZE - 1] = byte;
                    if Command::from_bytes(&window).is_ok_and(|c| c == Command::hello()) {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(Error::NoHello(wait.as_millis() as u64));
            }
        }

        self.protocol.send_response(Response::ack())?;

        // The device keeps sending HELLO until it polls our ACK
        sleep(Duration::from_millis(HELLO_RETRY_MS + HELLO_DRAIN_MARGIN_MS));
        self.drain()
    }

    /// Ask the device to report handler failures instead of staying silent.
    pub fn enable_nack(&mut self) -> Result<()> {
        self.with_retries(|client| {
            client.protocol.send_command(Command::nack_mode())?;
            client.expect_ack(Opcode::NackMode, 0)
        })?;

        self.nack_enabled = true;
        Ok(())
    }

    pub fn checksum(&mut self, block: u16) -> Result<u32> {
        self.with_retries(|client| client.request_checksum(block))
    }

    /// Stream one block to the device. Never retried, a resent command would
    /// be taken for chunk data.
    pub fn write_block(&mut self, block: u16, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(Error::InvalidImage(format!("block is {} bytes, expected {BLOCK_SIZE}", data.len())));
        }

        self.drain()?;
        self.protocol.send_command(Command::write(block))?;
        self.expect_ack(Opcode::Write, block)?;

        for chunk in data.chunks(self.options.chunk_size) {
            self.protocol.send_raw(chunk)?;
            self.expect_ack(Opcode::Write, block)?;
        }

        Ok(())
    }

    /// [`Self::write_block`], then read the block's checksum back.
    pub fn write_verified(&mut self, block: u16, data: &[u8]) -> Result<()> {
        self.write_block(block, data)?;

        let expected = block_checksum(data);
        // No drain here: the NACK of a failed erase or program comes ahead of the reply
        let actual = match self.request_checksum(block) {
            Err(Error::Nack { .. }) if self.nack_enabled => {
                return Err(Error::Nack { opcode: Opcode::Write, block });
            }
            Err(e) if e.is_timeout() => self.checksum(block)?,
            result => result?,
        };

        if actual != expected {
            return Err(Error::ChecksumMismatch { block, expected, actual });
        }

        Ok(())
    }

    /// Rewrite `block` only if the device content differs from `data`.
    pub fn sync_block(&mut self, block: u16, data: &[u8]) -> Result<BlockSync> {
        if self.checksum(block)? == block_checksum(data) {
            return Ok(BlockSync::Unchanged);
        }

        self.write_verified(block, data)?;
        Ok(BlockSync::Rewritten)
    }

    /// Cold reset the board. Nothing comes back.
    pub fn reset(&mut self) -> Result<()> {
        self.protocol.send_command(Command::reset()).map_err(|e| e.into())
    }

    /// Let the board continue booting. Nothing comes back.
    pub fn exit(&mut self) -> Result<()> {
        self.protocol.send_command(Command::exit()).map_err(|e| e.into())
    }

    fn request_checksum(&mut self, block: u16) -> Result<u32> {
        self.protocol.send_command(Command::checksum(block))?;
        self.expect_ack(Opcode::Checksum, block)?;
        self.protocol.read_checksum().map_err(|e| e.into())
    }

    fn expect_ack(&mut self, opcode: Opcode, block: u16) -> Result<()> {
        let response = self.protocol.read_response()?;

        if response.is_ack() {
            Ok(())
        } else if response.is_nack() {
            Err(Error::Nack { opcode, block })
        } else {
            Err(Error::NoAck(opcode))
        }
    }

    fn with_retries<R>(&mut self, mut request: impl FnMut(&mut Self) -> Result<R>) -> Result<R> {
        let mut attempt = 0;

        loop {
            self.drain()?;

            match request(self) {
                Err(e) if e.is_timeout() && attempt < self.options.retries => attempt += 1,
                result => return result,
            }
        }
    }

    /// Drop whatever is queued, late replies included.
    fn drain(&mut self) -> Result<()> {
        let io = self.protocol.io();
        while io.poll() {
            io.read_u8()?;
        }

        Ok(())
    }
}

/// Split a BIOS region image into numbered blocks.
pub fn image_blocks(image: &[u8]) -> Result<impl Iterator<Item = (u16, &[u8])>> {
    if image.is_empty() || image.len() % BLOCK_SIZE != 0 {
        return Err(Error::InvalidImage(format!(
            "size {:#x} isn't a non-zero multiple of {BLOCK_SIZE:#x}",
            image.len()
        )));
    }

    let blocks = image.len() / BLOCK_SIZE;
    if blocks > usize::from(u16::MAX) + 1 {
        return Err(Error::InvalidImage(format!("{blocks} blocks don't fit a 16-bit block number")));
    }

    Ok(image.chunks(BLOCK_SIZE).enumerate().map(|(i, block)| (i as u16, block)))
}
