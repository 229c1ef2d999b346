//! In-memory platform: flash, serial link, clock, registry and image loader.
//!
//! Drives the device code in tests and in host-side integration runs without
//! firmware or hardware underneath.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use r_efi::efi;
use rescue_port::{SimplePoll, SimpleRead, SimpleWrite, err::Error as PortError};
use rescue_protocol::BLOCK_SIZE;

use crate::{
    Outcome, Result,
    arena::ImageArena,
    config::RescueConfig,
    err::Error,
    flash::{FlashAccess, FlashError, FlashRegion},
    platform::{
        ColdReset, EntryPoint, ImageInfo, ImageServices, PageRange, PlatformConfig, ServiceRegistry, Timer, Transport,
    },
    sequencer::module_entry,
    warmup::{CodeWindow, saturate_code_cache},
};

const ARENA_BASE: usize = 0x8000_0000;
const ARENA_SIZE: usize = 1024 * 1024;
const IMAGE_SIZE: usize = 96 * 1024;
const IMAGE_ENTRY: usize = 0x240;

/// Virtual or wall-clock time.
///
/// Virtual time moves forward by `tick_ns` on every reading and by the full
/// amount of every delay, so timeouts elapse instantly.
#[derive(Debug, Clone)]
pub struct SimClock {
    now: Arc<AtomicU64>,
    delayed_us: Arc<AtomicU64>,
    tick_ns: u64,
    wall: Option<Instant>,
}

impl SimClock {
    pub fn virtual_time(tick_ns: u64) -> Self {
        Self { now: Arc::default(), delayed_us: Arc::default(), tick_ns, wall: None }
    }

    pub fn wall() -> Self {
        Self { now: Arc::default(), delayed_us: Arc::default(), tick_ns: 0, wall: Some(Instant::now()) }
    }

    /// Current time without ticking.
    pub fn peek_ns(&self) -> u64 {
        match self.wall {
            Some(start) => start.elapsed().as_nanos() as u64,
            None => self.now.load(Ordering::SeqCst),
        }
    }

    /// Sum of all delays so far.
    pub fn delayed_us(&self) -> u64 {
        self.delayed_us.load(Ordering::SeqCst)
    }

    fn advance_to(&self, ns: u64) {
        if self.wall.is_none() {
            self.now.fetch_max(ns, Ordering::SeqCst);
        }
    }
}

impl Timer for SimClock {
    fn now_ns(&self) -> u64 {
        match self.wall {
            Some(start) => start.elapsed().as_nanos() as u64,
            None => self.now.fetch_add(self.tick_ns, Ordering::SeqCst),
        }
    }

    fn delay_us(&mut self, us: u64) {
        self.delayed_us.fetch_add(us, Ordering::SeqCst);
        match self.wall {
            Some(_) => thread::sleep(Duration::from_micros(us)),
            None => {
                self.now.fetch_add(us.saturating_mul(1000), Ordering::SeqCst);
            }
        }
    }
}

/// Host bytes released at fixed points in virtual time.
///
/// A read that needs bytes not yet released jumps the clock forward, the way
/// a blocking read would wait. Running out of scripted bytes closes the link.
pub struct ScriptedLink {
    clock: SimClock,
    input: VecDeque<(u64, u8)>,
    pub output: Vec<u8>,
}

impl ScriptedLink {
    pub fn new(clock: SimClock) -> Self {
        Self { clock, input: VecDeque::new(), output: Vec::new() }
    }

    /// Queue `bytes`, visible from `at_ns` on.
    pub fn push(&mut self, at_ns: u64, bytes: &[u8]) {
        self.input.extend(bytes.iter().map(|b| (at_ns, *b)));
    }
}

impl SimpleRead for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> rescue_port::Result<()> {
        if self.input.len() < buf.len() {
            return Err(PortError::Closed);
        }

        for dst in buf.iter_mut() {
            let (at_ns, byte) = self.input.pop_front().ok_or(PortError::Closed)?;
            self.clock.advance_to(at_ns);
            *dst = byte;
        }
        Ok(())
    }
}

impl SimpleWrite for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> rescue_port::Result<()> {
        self.output.extend_from_slice(buf);
        Ok(())
    }
}

impl SimplePoll for ScriptedLink {
    fn poll(&mut self) -> bool {
        let now = self.clock.peek_ns();
        self.input.front().is_some_and(|(at_ns, _)| *at_ns <= now)
    }
}

/// BIOS region backed by memory, with NOR semantics: erase sets bits, program clears them.
#[derive(Debug, Default)]
pub struct SimFlash {
    data: Vec<u8>,
    ready: bool,
    pub inits: usize,
    pub reads: usize,
    pub erases: usize,
    pub writes: usize,
    pub fail_init: bool,
    pub fail_reads: bool,
    pub fail_erases: bool,
    pub fail_writes: bool,
}

impl SimFlash {
    pub fn new(blocks: usize) -> Self {
        Self { data: vec![0xff; blocks * BLOCK_SIZE], ..Default::default() }
    }

    pub fn block_mut(&mut self, block_number: usize) -> &mut [u8] {
        let offset = block_number * BLOCK_SIZE;
        &mut self.data[offset..offset + BLOCK_SIZE]
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn span(&mut self, region: FlashRegion, offset: usize, len: usize) -> core::result::Result<&mut [u8], FlashError> {
        if !self.ready || region != FlashRegion::Bios {
            return Err(FlashError::NotReady);
        }

        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(&mut self.data[offset..end]),
            _ => Err(FlashError::OutOfRange(offset)),
        }
    }
}

impl FlashAccess for SimFlash {
    fn init(&mut self) -> core::result::Result<(), FlashError> {
        self.inits += 1;
        if self.fail_init {
            return Err(FlashError::Device);
        }
        self.ready = true;
        Ok(())
    }

    fn read_block(&mut self, region: FlashRegion, offset: usize, buf: &mut [u8]) -> core::result::Result<(), FlashError> {
        self.reads += 1;
        if self.fail_reads {
            return Err(FlashError::Device);
        }
        buf.copy_from_slice(self.span(region, offset, buf.len())?);
        Ok(())
    }

    fn erase_block(&mut self, region: FlashRegion, offset: usize, len: usize) -> core::result::Result<(), FlashError> {
        self.erases += 1;
        if self.fail_erases {
            return Err(FlashError::Device);
        }
        self.span(region, offset, len)?.fill(0xff);
        Ok(())
    }

    fn write_block(&mut self, region: FlashRegion, offset: usize, data: &[u8]) -> core::result::Result<(), FlashError> {
        self.writes += 1;
        if self.fail_writes {
            return Err(FlashError::Device);
        }
        for (dst, src) in self.span(region, offset, data.len())?.iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }
}

/// This module's "image" and the memory its copy is loaded into.
pub struct SimImage {
    pub bytes: Vec<u8>,
    pub entry_offset: usize,
    pub arena: ImageArena,
    /// Pages of the last load and their content.
    pub loaded: Option<(PageRange, Vec<u8>)>,
    pub jumps: Vec<EntryPoint>,
    pub evictions: usize,
    /// Result of the last sweep over the loaded copy.
    pub last_sweep: Option<u32>,
    pub fail_locate: bool,
    pub fail_load: bool,
}

impl Default for SimImage {
    fn default() -> Self {
        Self {
            bytes: (0..IMAGE_SIZE).map(|i| (i % 251) as u8).collect(),
            entry_offset: IMAGE_ENTRY,
            arena: ImageArena::new(ARENA_BASE, ARENA_BASE + ARENA_SIZE),
            loaded: None,
            jumps: Vec::new(),
            evictions: 0,
            last_sweep: None,
            fail_locate: false,
            fail_load: false,
        }
    }
}

pub struct SimPlatform<L> {
    pub link: L,
    pub clock: SimClock,
    pub flash: SimFlash,
    pub image: SimImage,
    pub registry: Vec<efi::Guid>,
    pub resets: usize,
    pub config: RescueConfig,
}

impl SimPlatform<ScriptedLink> {
    /// Scripted host on a virtual clock ticking 100 µs per reading.
    pub fn scripted(blocks: usize, config: RescueConfig) -> Self {
        let clock = SimClock::virtual_time(100_000);
        Self::new(ScriptedLink::new(clock.clone()), clock, blocks, config)
    }
}

impl<L> SimPlatform<L> {
    pub fn new(link: L, clock: SimClock, blocks: usize, config: RescueConfig) -> Self {
        Self {
            link,
            clock,
            flash: SimFlash::new(blocks),
            image: SimImage::default(),
            registry: Vec::new(),
            resets: 0,
            config,
        }
    }
}

impl<L: SimpleRead> SimpleRead for SimPlatform<L> {
    fn read(&mut self, buf: &mut [u8]) -> rescue_port::Result<()> {
        self.link.read(buf)
    }
}

impl<L: SimpleWrite> SimpleWrite for SimPlatform<L> {
    fn write(&mut self, buf: &[u8]) -> rescue_port::Result<()> {
        self.link.write(buf)
    }
}

impl<L: SimplePoll> SimplePoll for SimPlatform<L> {
    fn poll(&mut self) -> bool {
        self.link.poll()
    }
}

impl<L> FlashAccess for SimPlatform<L> {
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

impl<L> Timer for SimPlatform<L> {
    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn delay_us(&mut self, us: u64) {
        self.clock.delay_us(us)
    }
}

impl<L> ColdReset for SimPlatform<L> {
    fn cold_reset(&mut self) {
        self.resets += 1;
    }
}

impl<L> PlatformConfig for SimPlatform<L> {
    fn rescue_config(&self) -> RescueConfig {
        self.config.clone()
    }
}

impl<L> ServiceRegistry for SimPlatform<L> {
    fn is_installed(&self, guid: &efi::Guid) -> bool {
        self.registry.contains(guid)
    }

    fn install(&mut self, guid: &'static efi::Guid) -> core::result::Result<(), efi::Status> {
        if self.registry.contains(guid) {
            return Err(efi::Status::ALREADY_STARTED);
        }
        self.registry.push(*guid);
        Ok(())
    }
}

impl<L: Transport> ImageServices for SimPlatform<L> {
    fn locate_self(&mut self) -> core::result::Result<ImageInfo, efi::Status> {
        if self.image.fail_locate {
            return Err(efi::Status::NOT_FOUND);
        }
        Ok(ImageInfo::new(self.image.bytes.len(), self.image.entry_offset))
    }

    fn allocate_pages(&mut self, pages: usize) -> core::result::Result<PageRange, efi::Status> {
        self.image.arena.allocate(pages).ok_or(efi::Status::OUT_OF_RESOURCES)
    }

    fn free_pages(&mut self, range: PageRange) -> core::result::Result<(), efi::Status> {
        if self.image.arena.release(range) { Ok(()) } else { Err(efi::Status::INVALID_PARAMETER) }
    }

    fn load_and_relocate(
        &mut self,
        image: &ImageInfo,
        dest: &PageRange,
    ) -> core::result::Result<EntryPoint, efi::Status> {
        if self.image.fail_load {
            return Err(efi::Status::LOAD_ERROR);
        }
        if image.size > dest.len() || image.entry_offset >= image.size {
            return Err(efi::Status::BUFFER_TOO_SMALL);
        }

        let mut copy = vec![0; dest.len()];
        copy[..image.size].copy_from_slice(&self.image.bytes[..image.size]);
        self.image.loaded = Some((*dest, copy));

        Ok(EntryPoint(dest.base + image.entry_offset))
    }

    fn evict_code_cache(&mut self) {
        self.image.evictions += 1;

        if let Some((_, copy)) = &self.image.loaded {
            let skip = copy.as_ptr().align_offset(4).min(copy.len());
            let window = CodeWindow::new(copy.as_ptr() as usize + skip, copy.len() - skip);
            // SAFETY: the window lies inside `copy` and starts dword aligned
            self.image.last_sweep = Some(unsafe { saturate_code_cache(window) });
        }
    }

    /// Re-enters the module, which now finds the relocation marker.
    fn transfer(&mut self, entry: EntryPoint) -> Result<Outcome> {
        let inside = self
            .image
            .loaded
            .as_ref()
            .is_some_and(|(range, _)| (range.base..range.end()).contains(&entry.0));
        if !inside {
            return Err(Error::Load(efi::Status::INVALID_PARAMETER));
        }

        self.image.jumps.push(entry);
        module_entry(self)
    }
}
