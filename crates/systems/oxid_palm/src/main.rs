// crates/systems/oxid_palm/src/main.rs
use std::env;
use std::str::FromStr;

use oxide_core::{MemoryBus, Rom};
use oxid_palm::lowmem::LowMem;
use oxid_palm::pc::PcValidator;
use oxid_palm::syscall::big_rom::{find_card_header, locate_big_rom_entry};
use oxid_palm::{CoreConfig, PalmCore, PalmError, PalmMemory};

// ============================================================================
//  CONSTANTS
// ============================================================================

// Típico de los modelos 3.x: 8 MB de RAM, los primeros 256 KB dinámicos
const RAM_SIZE: u32 = 8 * 1024 * 1024;
const DYNAMIC_SIZE: u32 = 256 * 1024;

struct Args {
    rom_path: String,
    config_path: Option<String>,
}

fn parse_args() -> Option<Args> {
    let mut args = env::args().skip(1);
    let rom_path = args.next()?;
    Some(Args {
        rom_path,
        config_path: args.next(),
    })
}

fn init_logging(level: &str) {
    let level = tracing::Level::from_str(level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(true).init();
}

fn main() -> Result<(), PalmError> {
    let Some(args) = parse_args() else {
        eprintln!("Usage: oxid_palm <rom> [config.json]");
        std::process::exit(2);
    };

    let config = match &args.config_path {
        Some(path) => CoreConfig::from_file(path)?,
        None => CoreConfig::default(),
    };
    init_logging(&config.log_level);

    println!("--- Oxide-Palm (DragonBall) ---");
    println!("ROM: {}", args.rom_path);
    println!("Palm OS: {}", config.os_version);

    let rom = Rom::from_file(&args.rom_path)?;

    // La cabecera de tarjeta dice dónde arranca la ROM grande
    match find_card_header(rom.data.as_slice()) {
        Some((offset, header)) => {
            println!(
                "Card header @ +0x{:05X}: \"{}\" ({}) v{}",
                offset, header.name, header.manuf, header.hdr_version
            );
        }
        None => println!("Card header: not found"),
    }
    let big_rom = locate_big_rom_entry(rom.data.as_slice());
    if let Some(entry) = big_rom {
        println!("Big ROM entry: 0x{:08X}", entry);
    }

    let mut mem = PalmMemory::new(RAM_SIZE, DYNAMIC_SIZE, rom).with_rom_base(config.rom_base);
    let rom_range = mem.rom_range();
    println!(
        "Memory Map: RAM @ 0x00000000-0x{:08X} (dynamic < 0x{:08X}), ROM @ 0x{:08X}-0x{:08X}",
        RAM_SIZE, mem.dynamic_end(), rom_range.start, rom_range.end
    );

    let mut core = PalmCore::new(config);
    core.refresh_meta(&mut mem);
    {
        let low = LowMem::new(&mem, &core.config().low_mem);
        let globals = low.system_globals();
        println!("System globals: 0x{:08X}-0x{:08X}", globals.start, globals.end);
    }

    // Al bootear, el 68k lee el SP inicial de +0 y el PC de +4
    let init_sp = mem.read_u32(rom_range.start);
    let reset_pc = mem.read_u32(rom_range.start + 4);
    println!("Reset: SP=0x{:08X} PC=0x{:08X}", init_sp, reset_pc);

    let validator = PcValidator::new(core.config().low_mem);
    match validator.check(&mem, reset_pc) {
        Ok(()) => println!("Status: reset vector OK, core ready."),
        Err(reason) => {
            tracing::error!(pc = format_args!("{reset_pc:#010X}"), ?reason, "reset vector rejected");
            return Err(PalmError::InvalidPc {
                address: reset_pc,
                reason,
            });
        }
    }
    Ok(())
}
