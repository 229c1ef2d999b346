use std::{fs, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use colored::Colorize;
use rescue_host::{
    Result,
    client::{BlockSync, ClientOptions, RescueClient, image_blocks},
    err::Error,
    log, status,
};
use rescue_port::Port;
use rescue_protocol::{BLOCK_SIZE, PROTOCOL_VERSION, block_checksum, timing::CHUNK_SIZE};

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Serial port the board is attached to
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = 115200)]
    baud: u32,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value_t = 2000)]
    timeout: u64,

    /// How long to wait for HELLO, in milliseconds
    #[arg(short, long, default_value_t = 60_000)]
    wait: u64,

    /// Resends of a command whose response timed out
    #[arg(short, long, default_value_t = 3)]
    retries: u32,

    /// WRITE chunk size, must match the board's
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Ask the board to report failed flash operations
    #[arg(long)]
    nack: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Take over the board and leave it waiting for commands
    Wait,
    /// Print block checksums
    Checksum {
        #[arg(value_parser=maybe_hex::<u16>)]
        block: u16,

        #[arg(short, long, default_value_t = 1)]
        count: u16,
    },
    /// Write blocks from a BIOS region image and verify them
    Write {
        image: PathBuf,

        /// First block to write, counted from the start of the image
        #[arg(short, long, default_value_t = 0, value_parser=maybe_hex::<u16>)]
        start: u16,

        /// Number of blocks, up to the end of the image if not set
        #[arg(short, long)]
        count: Option<u16>,
    },
    /// Rewrite every block that differs from the image, then continue booting
    Flash { image: PathBuf },
    /// Cold reset the board
    Reset,
    /// Leave rescue mode and continue booting
    Exit,
}

type Client = RescueClient<Port>;

fn open_port(cli: &Cli) -> Result<Port> {
    log!("Opening {} at {} baud... ", cli.port, cli.baud);
    let port = status!(
        serialport::new(&cli.port, cli.baud)
            .timeout(Duration::from_millis(cli.timeout))
            .open()
    )?;

    Ok(port)
}

fn print_checksums(client: &mut Client, block: u16, count: u16) -> Result<()> {
    for block in (block..).take(count as usize) {
        let crc = client.checksum(block)?;
        println!("{block:#06x}: {crc:#010x}");
    }

    Ok(())
}

fn write_blocks(client: &mut Client, image: &[u8], start: u16, count: Option<u16>) -> Result<()> {
    let blocks = image_blocks(image)?.skip(start as usize);
    let blocks: Vec<_> = match count {
        Some(count) => blocks.take(count as usize).collect(),
        None => blocks.collect(),
    };

    if blocks.is_empty() {
        return Err(Error::InvalidImage(format!("no blocks from {start:#x}")));
    }

    for (block, data) in blocks {
        log!("Writing block {block:#06x}... ");
        status!(client.write_verified(block, data))?;
    }

    Ok(())
}

fn flash_image(client: &mut Client, image: &[u8]) -> Result<()> {
    let mut rewritten = 0;

    for (block, data) in image_blocks(image)? {
        log!("Block {block:#06x} ({:#010x})... ", block_checksum(data));
        match client.sync_block(block, data) {
            Ok(BlockSync::Unchanged) => println!("{}", "unchanged".dimmed()),
            Ok(BlockSync::Rewritten) => {
                rewritten += 1;
                println!("{}", "rewritten".green());
            }
            Err(e) => {
                println!("{}", "failed".red());
                return Err(e);
            }
        }
    }

    println!("{rewritten} of {} blocks rewritten", image.len() / BLOCK_SIZE);

    log!("Continuing boot... ");
    status!(client.exit())
}

fn run(cli: Cli) -> Result<()> {
    if cli.chunk_size == 0 || BLOCK_SIZE % cli.chunk_size != 0 {
        return Err(Error::Custom(format!("Chunk size must divide {BLOCK_SIZE}").into()));
    }

    let port = open_port(&cli)?;
    let mut client = RescueClient::new(port, ClientOptions::new(cli.retries, cli.chunk_size));

    println!("Power on the board now");
    log!("Waiting for HELLO... ");
    status!(client.wait_for_hello(Duration::from_millis(cli.wait)))?;

    if cli.nack {
        log!("Enabling NACK mode... ");
        status!(client.enable_nack())?;
    }

    match cli.action {
        Action::Wait => Ok(()),
        Action::Checksum { block, count } => print_checksums(&mut client, block, count),
        Action::Write { image, start, count } => write_blocks(&mut client, &fs::read(image)?, start, count),
        Action::Flash { image } => flash_image(&mut client, &fs::read(image)?),
        Action::Reset => {
            log!("Resetting... ");
            status!(client.reset())
        }
        Action::Exit => {
            log!("Continuing boot... ");
            status!(client.exit())
        }
    }
}

fn main() -> core::result::Result<(), String> {
    let cli = Cli::parse();

    println!("Flash rescue protocol {PROTOCOL_VERSION}");
    run(cli).map_err(|e| e.to_string())
}
