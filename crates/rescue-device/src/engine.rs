//! Command loop of the rescue session.
//!
//! The host drives the whole procedure; the device only answers one command
//! at a time until it's told to leave or the host goes silent.

use rescue_protocol::{
    BLOCK_SIZE, Command, Opcode, Protocol, Response, block_checksum,
    timing::{NS_PER_MS, US_PER_MS},
};

use crate::{
    Outcome, Result,
    config::RescueConfig,
    err::Error,
    flash::{FlashAccess, FlashRegion, block_offset},
    platform::{ColdReset, Timer, Transport},
};

/// State of one rescue session.
#[derive(Debug, Default)]
struct Session {
    last_serviced_ns: u64,
    finished: Option<Outcome>,
    nack_enabled: bool,
}

pub struct RescueEngine<'a, P> {
    platform: &'a mut P,
    config: &'a RescueConfig,
    session: Session,
}

impl<'a, P: Transport + FlashAccess + Timer + ColdReset> RescueEngine<'a, P> {
    pub fn new(platform: &'a mut P, config: &'a RescueConfig) -> Self {
        let session = Session { nack_enabled: config.nack_on_failure, ..Default::default() };
        Self { platform, config, session }
    }

    /// Service commands until EXIT, RESET, or the liveness timeout.
    pub fn run(mut self) -> Result<Outcome> {
        self.platform.init().map_err(|_| Error::Device)?;

        let liveness_ns = self.config.liveness_timeout_ms.saturating_mul(NS_PER_MS);
        self.session.last_serviced_ns = self.platform.now_ns();

        loop {
            if self.platform.poll() {
                self.delay_ms(self.config.poll_settle_ms);

                let command = self.link().read_command()?;
                self.dispatch(command)?;
                self.session.last_serviced_ns = self.platform.now_ns();

                if let Some(outcome) = self.session.finished {
                    return Ok(outcome);
                }
            }

            let silent_ns = self.platform.now_ns().saturating_sub(self.session.last_serviced_ns);
            if silent_ns >= liveness_ns {
                // Nothing to roll back to, cache-as-RAM can't hold a backup
                return Err(Error::LivenessTimeout);
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<()> {
        match command.opcode() {
            Some(Opcode::Checksum) => self.send_block_checksum(command.block_number),
            Some(Opcode::Write) => self.write_block(command.block_number),
            Some(Opcode::Reset) => {
                self.platform.cold_reset();
                self.session.finished = Some(Outcome::Reset);
                Ok(())
            }
            Some(Opcode::Exit) => {
                self.session.finished = Some(Outcome::Exited);
                Ok(())
            }
            Some(Opcode::NackMode) => {
                self.session.nack_enabled = true;
                self.link().send_response(Response::ack()).map_err(|e| e.into())
            }
            Some(Opcode::Hello | Opcode::Read) | None => Ok(()),
        }
    }

    fn send_block_checksum(&mut self, block_number: u16) -> Result<()> {
        let mut data = [0; BLOCK_SIZE];
        if self
            .platform
            .read_block(FlashRegion::Bios, block_offset(block_number), &mut data)
            .is_err()
        {
            return self.handler_failed();
        }

        let crc = block_checksum(&data);

        let mut link = self.link();
        link.send_response(Response::ack())?;
        link.send_checksum(crc).map_err(|e| e.into())
    }

    fn write_block(&mut self, block_number: u16) -> Result<()> {
        let mut data = [0; BLOCK_SIZE];

        self.link().send_response(Response::ack())?;

        for chunk in data.chunks_mut(self.config.chunk_size) {
            // The link has no flow control, give the host time to push the chunk
            self.delay_ms(self.config.chunk_pacing_ms);

            let mut link = Protocol::new(&mut *self.platform);
            link.read_raw(chunk)?;
            link.send_response(Response::ack())?;
        }

        let offset = block_offset(block_number);
        if self.platform.erase_block(FlashRegion::Bios, offset, BLOCK_SIZE).is_err()
            || self.platform.write_block(FlashRegion::Bios, offset, &data).is_err()
        {
            return self.handler_failed();
        }

        Ok(())
    }

    /// Without NACK mode the response is simply dropped and the host times out.
    fn handler_failed(&mut self) -> Result<()> {
        if self.session.nack_enabled {
            self.link().send_response(Response::nack())?;
        }

        Ok(())
    }

    fn link(&mut self) -> Protocol<&mut P> {
        Protocol::new(&mut *self.platform)
    }

    fn delay_ms(&mut self, ms: u64) {
        self.platform.delay_us(ms.saturating_mul(US_PER_MS));
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use mockall::predicate::{always, eq};
    use rescue_port::{SimplePoll, SimpleRead, SimpleWrite};
    use rescue_protocol::acknowledge;

    use super::*;
    use crate::{
        flash::{FlashError, MockFlashAccess},
        sim::{ScriptedLink, SimClock, SimPlatform},
    };

    const SECOND_NS: u64 = 1000 * NS_PER_MS;

    fn platform(blocks: usize) -> SimPlatform<ScriptedLink> {
        SimPlatform::scripted(blocks, RescueConfig::default())
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..BLOCK_SIZE).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn run(platform: &mut SimPlatform<ScriptedLink>) -> Result<Outcome> {
        let config = platform.config.clone();
        RescueEngine::new(platform, &config).run()
    }

    fn checksum_reply(crc: u32) -> Vec<u8> {
        let mut reply = vec![acknowledge::ACK, 0, 0];
        reply.extend_from_slice(&crc.to_le_bytes());
        reply
    }

    #[test]
    fn checksum_acknowledges_then_sends_crc() {
        let mut platform = platform(8);
        platform.flash.block_mut(5).copy_from_slice(&pattern(5));
        platform.link.push(0, &[0x11, 0x05, 0x00]);
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
        assert_eq!(platform.link.output, checksum_reply(block_checksum(&pattern(5))));
        assert_eq!(platform.flash.erases, 0);
        assert_eq!(platform.flash.writes, 0);
    }

    #[test]
    fn write_then_checksum_round_trip() {
        let mut platform = platform(4);
        platform.flash.block_mut(2).copy_from_slice(&pattern(9));
        let content = pattern(9);

        platform.link.push(0, &Command::checksum(2).to_bytes().unwrap());
        platform.link.push(0, &Command::write(2).to_bytes().unwrap());
        platform.link.push(0, &content);
        platform.link.push(0, &Command::checksum(2).to_bytes().unwrap());
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);

        let out = &platform.link.output;
        let first = &out[..7];
        let last = &out[out.len() - 7..];
        assert_eq!(first, last);
        assert_eq!(first, checksum_reply(block_checksum(&content)).as_slice());
    }

    #[test]
    fn write_erases_and_programs_once_for_any_chunking() {
        for chunk_size in [64, 512, 1024, 4096] {
            let config = RescueConfig { chunk_size, ..Default::default() };
            let mut platform = SimPlatform::scripted(4, config.clone());
            let content = pattern(chunk_size as u8);

            platform.link.push(0, &Command::write(3).to_bytes().unwrap());
            platform.link.push(0, &content);
            platform.link.push(0, &Command::exit().to_bytes().unwrap());

            assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
            assert_eq!(platform.flash.erases, 1);
            assert_eq!(platform.flash.writes, 1);
            assert_eq!(platform.flash.block_mut(3), content.as_slice());

            // One ACK for the command, one per chunk
            let acks = 1 + BLOCK_SIZE / chunk_size;
            assert_eq!(platform.link.output, [acknowledge::ACK, 0, 0].repeat(acks));
        }
    }

    #[test]
    fn write_paces_every_chunk() {
        let config = RescueConfig { chunk_size: 1024, ..Default::default() };
        let mut platform = SimPlatform::scripted(1, config);
        platform.link.push(0, &Command::write(0).to_bytes().unwrap());
        platform.link.push(0, &[0xa5; BLOCK_SIZE]);
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        run(&mut platform).unwrap();
        // 4 chunks, 2 settles
        assert!(platform.clock.delayed_us() >= (4 * 33 + 2 * 10) * US_PER_MS);
    }

    #[test]
    fn exit_terminates_without_reset_or_output() {
        let mut platform = platform(1);
        platform.link.push(0, &[0x15, 0x00, 0x00]);

        assert!(run(&mut platform).unwrap().is_exited());
        assert_eq!(platform.resets, 0);
        assert!(platform.link.output.is_empty());
    }

    #[test]
    fn reset_invokes_platform_reset() {
        let mut platform = platform(1);
        platform.link.push(0, &Command::reset().to_bytes().unwrap());
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert!(run(&mut platform).unwrap().is_reset());
        assert_eq!(platform.resets, 1);
        assert!(platform.link.output.is_empty());
    }

    #[test]
    fn liveness_timeout_without_host() {
        let mut platform = platform(1);

        assert!(matches!(run(&mut platform), Err(Error::LivenessTimeout)));
        assert!(platform.clock.now_ns() >= 10 * SECOND_NS);
        assert!(platform.link.output.is_empty());
    }

    #[test]
    fn unknown_and_reserved_opcodes_keep_the_session_alive() {
        let mut platform = platform(1);
        platform.link.push(9 * SECOND_NS, &[0x7f, 0x00, 0x00]);
        platform.link.push(18 * SECOND_NS, &[0x12, 0x01, 0x00]);
        platform.link.push(27 * SECOND_NS, &[0x10, 0x00, 0x00]);
        platform.link.push(36 * SECOND_NS, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
        assert!(platform.link.output.is_empty());
        assert_eq!(platform.flash.reads, 0);
    }

    #[test]
    fn liveness_timeout_after_long_gap() {
        let mut platform = platform(1);
        platform.link.push(5 * SECOND_NS, &Command::checksum(0).to_bytes().unwrap());
        platform.link.push(16 * SECOND_NS, &Command::exit().to_bytes().unwrap());

        assert!(matches!(run(&mut platform), Err(Error::LivenessTimeout)));
        // The checksum was serviced before the gap
        assert_eq!(platform.link.output.len(), 7);
    }

    #[test]
    fn flash_failure_drops_the_response() {
        let mut platform = platform(1);
        platform.flash.fail_reads = true;
        platform.link.push(0, &Command::checksum(0).to_bytes().unwrap());
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
        assert!(platform.link.output.is_empty());
    }

    #[test]
    fn out_of_range_block_is_a_flash_failure() {
        let mut platform = platform(2);
        platform.link.push(0, &Command::checksum(2).to_bytes().unwrap());
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
        assert!(platform.link.output.is_empty());
    }

    #[test]
    fn nack_mode_reports_failures() {
        let mut platform = platform(1);
        platform.flash.fail_reads = true;
        platform.flash.fail_erases = true;
        platform.link.push(0, &Command::nack_mode().to_bytes().unwrap());
        platform.link.push(0, &Command::checksum(0).to_bytes().unwrap());
        platform.link.push(0, &Command::write(0).to_bytes().unwrap());
        platform.link.push(0, &[0; BLOCK_SIZE]);
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);

        let mut expected = vec![acknowledge::ACK, 0, 0];
        expected.extend([acknowledge::NACK, 0, 0]);
        expected.extend([acknowledge::ACK, 0, 0].repeat(1 + 64));
        expected.extend([acknowledge::NACK, 0, 0]);
        assert_eq!(platform.link.output, expected);
        assert_eq!(platform.flash.writes, 0);
    }

    #[test]
    fn program_failure_leaves_the_block_erased() {
        let mut platform = platform(2);
        platform.flash.block_mut(1).copy_from_slice(&pattern(1));
        platform.flash.fail_writes = true;
        platform.link.push(0, &Command::write(1).to_bytes().unwrap());
        platform.link.push(0, &pattern(2));
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);

        // Command and chunk ACKs only, the failure itself is silent
        assert_eq!(platform.link.output, [acknowledge::ACK, 0, 0].repeat(1 + 64));
        assert_eq!(platform.flash.erases, 1);
        assert_eq!(platform.flash.writes, 1);
        assert!(platform.flash.block_mut(1).iter().all(|b| *b == 0xff));
    }

    #[test]
    fn program_failure_is_nacked_in_nack_mode() {
        let config = RescueConfig { nack_on_failure: true, ..Default::default() };
        let mut platform = SimPlatform::scripted(2, config);
        platform.flash.fail_writes = true;
        platform.link.push(0, &Command::write(1).to_bytes().unwrap());
        platform.link.push(0, &pattern(2));
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);

        let mut expected = [acknowledge::ACK, 0, 0].repeat(1 + 64);
        expected.extend([acknowledge::NACK, 0, 0]);
        assert_eq!(platform.link.output, expected);
        assert!(platform.flash.block_mut(1).iter().all(|b| *b == 0xff));
    }

    #[test]
    fn huge_liveness_timeout_saturates() {
        let config = RescueConfig { liveness_timeout_ms: u64::MAX, ..Default::default() };
        let mut platform = SimPlatform::scripted(1, config);
        platform.link.push(60 * SECOND_NS, &Command::exit().to_bytes().unwrap());

        assert_eq!(run(&mut platform).unwrap(), Outcome::Exited);
    }

    #[test]
    fn nack_on_failure_from_config() {
        let config = RescueConfig { nack_on_failure: true, ..Default::default() };
        let mut platform = SimPlatform::scripted(1, config);
        platform.flash.fail_reads = true;
        platform.link.push(0, &Command::checksum(0).to_bytes().unwrap());
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        run(&mut platform).unwrap();
        assert_eq!(platform.link.output, [acknowledge::NACK, 0, 0]);
    }

    #[test]
    fn flash_init_failure() {
        let mut platform = platform(1);
        platform.flash.fail_init = true;
        platform.link.push(0, &Command::exit().to_bytes().unwrap());

        assert!(matches!(run(&mut platform), Err(Error::Device)));
    }

    #[test]
    fn truncated_command_is_a_protocol_error() {
        let mut platform = platform(1);
        platform.link.push(0, &[0x11]);

        assert!(matches!(run(&mut platform), Err(Error::Protocol(_))));
    }

    struct MockedPlatform {
        link: ScriptedLink,
        clock: SimClock,
        flash: MockFlashAccess,
    }

    impl SimpleRead for MockedPlatform {
        fn read(&mut self, buf: &mut [u8]) -> rescue_port::Result<()> {
            self.link.read(buf)
        }
    }

    impl SimpleWrite for MockedPlatform {
        fn write(&mut self, buf: &[u8]) -> rescue_port::Result<()> {
            self.link.write(buf)
        }
    }

    impl SimplePoll for MockedPlatform {
        fn poll(&mut self) -> bool {
            self.link.poll()
        }
    }

    impl FlashAccess for MockedPlatform {
        fn init(&mut self) -> core::result::Result<(), FlashError> {
            self.flash.init()
        }

        fn read_block(&mut self, region: FlashRegion, offset: usize, buf: &mut [u8]) -> core::result::Result<(), FlashError> {
            self.flash.read_block(region, offset, buf)
        }

        fn erase_block(&mut self, region: FlashRegion, offset: usize, len: usize) -> core::result::Result<(), FlashError> {
            self.flash.erase_block(region, offset, len)
        }

        fn write_block(&mut self, region: FlashRegion, offset: usize, data: &[u8]) -> core::result::Result<(), FlashError> {
            self.flash.write_block(region, offset, data)
        }
    }

    impl Timer for MockedPlatform {
        fn now_ns(&self) -> u64 {
            self.clock.now_ns()
        }

        fn delay_us(&mut self, us: u64) {
            self.clock.delay_us(us)
        }
    }

    impl ColdReset for MockedPlatform {
        fn cold_reset(&mut self) {
            panic!("no reset expected");
        }
    }

    #[test]
    fn write_hits_the_bios_region_at_block_offset() {
        let clock = SimClock::virtual_time(1000);
        let mut flash = MockFlashAccess::new();
        flash.expect_init().times(1).returning(|| Ok(()));
        flash
            .expect_erase_block()
            .with(eq(FlashRegion::Bios), eq(7 * BLOCK_SIZE), eq(BLOCK_SIZE))
            .times(1)
            .returning(|_, _, _| Ok(()));
        flash
            .expect_write_block()
            .with(eq(FlashRegion::Bios), eq(7 * BLOCK_SIZE), always())
            .times(1)
            .returning(|_, _, data| if data.iter().all(|b| *b == 0x5a) { Ok(()) } else { Err(FlashError::Device) });
        flash.expect_read_block().never();

        let mut link = ScriptedLink::new(clock.clone());
        link.push(0, &Command::write(7).to_bytes().unwrap());
        link.push(0, &[0x5a; BLOCK_SIZE]);
        link.push(0, &Command::exit().to_bytes().unwrap());

        let mut platform = MockedPlatform { link, clock, flash };
        let config = RescueConfig { chunk_size: 256, ..Default::default() };
        assert_eq!(RescueEngine::new(&mut platform, &config).run().unwrap(), Outcome::Exited);
    }

    #[test]
    fn erase_failure_skips_programming() {
        let clock = SimClock::virtual_time(1000);
        let mut flash = MockFlashAccess::new();
        flash.expect_init().returning(|| Ok(()));
        flash.expect_erase_block().times(1).returning(|_, _, _| Err(FlashError::Device));
        flash.expect_write_block().never();

        let mut link = ScriptedLink::new(clock.clone());
        link.push(0, &Command::write(0).to_bytes().unwrap());
        link.push(0, &[0; BLOCK_SIZE]);
        link.push(0, &Command::exit().to_bytes().unwrap());

        let mut platform = MockedPlatform { link, clock, flash };
        let config = RescueConfig::default();
        assert_eq!(RescueEngine::new(&mut platform, &config).run().unwrap(), Outcome::Exited);
        // Chunks were acknowledged, the failure itself is silent
        assert_eq!(platform.link.output.len(), 3 * 65);
    }
}
