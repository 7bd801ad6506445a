use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

use x86mon::{
    demo,
    emu::{
        debugger::Debugger,
        emulator::{EmuState, Emulator},
        pio::PortBus,
        ram::{Ram, DEFAULT_RAM_SIZE},
        registers::{Cpu, Machine},
        watchpoint::{WatchPool, DEFAULT_WATCH_CAPACITY},
    },
};

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse()
        .map_err(|_| format!("unknown log level `{}`", s))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "x86 emulator and monitor")]
struct Args {
    /// Raw binary image to load. Runs the built-in demo when omitted.
    image: Option<PathBuf>,
    /// Guest address to load the image at; execution starts there.
    #[arg(long, default_value = "0x100000", value_parser = parse_u32)]
    load_addr: u32,
    /// Guest memory size in bytes.
    #[arg(long, default_value_t = DEFAULT_RAM_SIZE)]
    mem_size: usize,
    /// Maximum number of concurrent watchpoints.
    #[arg(long, default_value_t = DEFAULT_WATCH_CAPACITY)]
    max_watches: usize,
    /// Run the guest to completion without the monitor prompt.
    #[arg(short, long)]
    batch: bool,
    /// Also write the log to this file, at trace level.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Terminal log level.
    #[arg(long, value_parser = parse_level)]
    log_level: Option<LevelFilter>,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level.unwrap_or(if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Warn
    });
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(LevelFilter::Trace, Config::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let image = match &args.image {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("cannot read image {}", path.display()))?,
        None => demo::image(args.load_addr),
    };
    let mut ram = Ram::new(args.mem_size);
    ram.load_image(args.load_addr, &image)?;
    let machine = Machine::new(Cpu::new(args.load_addr), ram);
    let emu = Emulator::new(machine, PortBus::with_serial());
    let mut dbg = Debugger::new(emu, WatchPool::new(args.max_watches));

    if args.batch {
        match dbg.run_batch()? {
            EmuState::Halted(code) => log::info!("guest exited with code {}", code),
            state => log::warn!("guest ended in state {:?}", state),
        }
        return Ok(());
    }
    dbg.repl()
}
