//! Bootstrap of the rescue feature.
//!
//! The module runs twice per boot. The first entry executes in place from the
//! flash it may be about to rewrite, so once a host answers HELLO it loads a
//! private copy of itself into fresh pages, publishes [`RelocationMarker`] and
//! calls that copy. The second entry finds the marker and runs the command loop.

use log::LevelFilter;
use rescue_protocol::{Command, Protocol, timing::US_PER_MS};

use crate::{
    Outcome, Result,
    config::RescueConfig,
    engine::RescueEngine,
    err::Error,
    platform::{EntryState, Firmware, ImageInfo, PageRange, RelocationMarker, Timer, Transport},
};

/// Module entry point, called on every boot attempt.
pub fn module_entry<P: Firmware>(platform: &mut P) -> Result<Outcome> {
    let config = platform.rescue_config();
    config.validate()?;

    match EntryState::detect(&*platform) {
        EntryState::RescueActive => RescueEngine::new(platform, &config).run(),
        EntryState::ColdEntry => cold_entry(platform, &config),
    }
}

fn cold_entry<P: Firmware>(platform: &mut P, config: &RescueConfig) -> Result<Outcome> {
    log::info!("HELLO begins. Re-connect with the host tool now");
    platform.delay_us(config.settle_ms.saturating_mul(US_PER_MS));

    if !send_hello(platform, config)? {
        log::info!("No rescue host, continuing boot");
        return Ok(Outcome::NormalBoot);
    }

    log::info!("Rescue host attached, relocating");
    // Debug output shares the serial line with the protocol
    let _quiet = QuietLog::engage();

    let image = platform.locate_self().map_err(Error::Load)?;
    let pages = platform
        .allocate_pages(PageRange::pages_for(image.size))
        .map_err(|_| Error::OutOfResources)?;

    let result = enter_relocated(platform, &image, &pages);

    // Services must not point into the pages freed below
    let reinit = platform.init();
    let freed = platform.free_pages(pages);

    let outcome = result?;
    reinit.map_err(|_| Error::Device)?;
    freed.map_err(Error::Load)?;

    Ok(outcome)
}

fn enter_relocated<P: Firmware>(platform: &mut P, image: &ImageInfo, pages: &PageRange) -> Result<Outcome> {
    let entry = platform.load_and_relocate(image, pages).map_err(Error::Load)?;

    platform.evict_code_cache();
    platform.install(&RelocationMarker::GUID).map_err(Error::Registry)?;

    platform.transfer(entry)
}

/// Announce the device until the host acknowledges or the budget runs out.
///
/// Returns `false` when nobody answered.
pub fn send_hello<P: Transport + Timer>(platform: &mut P, config: &RescueConfig) -> Result<bool> {
    let mut elapsed_ms = 0;

    while elapsed_ms < config.hello_timeout_ms {
        // Resent every round, the host may attach late
        Protocol::new(&mut *platform).send_command(Command::hello())?;

        if platform.poll() && Protocol::new(&mut *platform).read_response()?.is_ack() {
            return Ok(true);
        }

        platform.delay_us(config.hello_retry_ms.saturating_mul(US_PER_MS));
        elapsed_ms = elapsed_ms.saturating_add(config.hello_retry_ms);
    }

    Ok(false)
}

/// Turns the `log` facade off, restores the previous level on drop.
struct QuietLog(LevelFilter);

impl QuietLog {
    fn engage() -> Self {
        let previous = log::max_level();
        log::set_max_level(LevelFilter::Off);
        Self(previous)
    }
}

impl Drop for QuietLog {
    fn drop(&mut self) {
        log::set_max_level(self.0);
    }
}
