//! CLI utilities for the espcoredump binary
//!
//! No stability guaranties apply

use std::{
    fs,
    io::Write,
    num::ParseIntError,
    path::{Path, PathBuf},
};

use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use log::info;
use miette::{IntoDiagnostic, Result, WrapErr};
use object::{Object, ObjectSection, ObjectSegment, SectionFlags};
use tempfile::NamedTempFile;

use crate::{
    cli::gdb::{GdbMi, ResultClass},
    coredump::CoreDump,
    flash::{Chip, EsptoolReader},
};

pub mod gdb;

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Target chip type
    #[arg(short = 'c', long, default_value_t = Chip::default(), env = "ESPTOOL_CHIP")]
    pub chip: Chip,
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "ESPTOOL_PORT")]
    pub port: Option<String>,
    /// Baud rate used when reading flash
    #[arg(short = 'b', long, env = "ESPTOOL_BAUD")]
    pub baud: Option<u32>,
}

#[derive(Debug, Args)]
pub struct CoreArgs {
    /// Path to GDB
    #[arg(short = 'g', long, default_value = "xtensa-esp32-elf-gdb")]
    pub gdb: String,
    /// Path to core dump file (if skipped, the core dump is read from flash)
    #[arg(long)]
    pub core: Option<PathBuf>,
    /// Offset of the core dump partition in flash
    #[arg(short = 'o', long, default_value = "0x110000", value_parser = parse_u32)]
    pub off: u32,
    /// Index of the task that crashed; its thread is reported with SIGSEGV
    #[arg(long, value_name = "INDEX")]
    pub failed_task: Option<u32>,
    /// Path to the program's ELF binary
    pub prog: PathBuf,
}

fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    match input.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

/// Where the core file handed to GDB lives: a caller-supplied path, or a
/// temporary file generated from flash that is cleaned up when dropped.
enum CoreSource {
    Provided(PathBuf),
    Generated(NamedTempFile),
}

impl CoreSource {
    fn path(&self) -> &Path {
        match self {
            CoreSource::Provided(path) => path,
            CoreSource::Generated(tmp) => tmp.path(),
        }
    }
}

/// Returns the core file to debug, extracting it from the device unless a
/// pre-existing file was supplied with `--core`.
fn prepare_corefile(connect_args: &ConnectArgs, args: &CoreArgs) -> Result<CoreSource> {
    if let Some(core) = &args.core {
        return Ok(CoreSource::Provided(core.clone()));
    }

    let mut reader = EsptoolReader::fetch(
        connect_args.chip,
        connect_args.port.as_deref(),
        connect_args.baud,
        args.off,
    )?;
    let dump = CoreDump::parse(&mut reader, args.failed_task)?;

    let mut tmp = NamedTempFile::new().into_diagnostic()?;
    dump.write(&mut tmp)?;
    tmp.flush().into_diagnostic()?;
    info!(
        "Created core file with {} tasks at '{}'",
        dump.task_count(),
        tmp.path().display()
    );

    Ok(CoreSource::Generated(tmp))
}

/// Starts an interactive GDB session on the core dump.
pub fn dbg_corefile(connect_args: &ConnectArgs, args: &CoreArgs) -> Result<()> {
    let core = prepare_corefile(connect_args, args)?;
    gdb::run_interactive(&args.gdb, core.path(), &args.prog)?;

    Ok(())
}

/// Drives GDB in machine-interface mode and prints a structured crash
/// report: registers and backtrace of the current thread, the thread list,
/// and the memory regions present in the dump.
pub fn info_corefile(connect_args: &ConnectArgs, args: &CoreArgs, print_mem: bool) -> Result<()> {
    let core = prepare_corefile(connect_args, args)?;
    let regions = memory_regions(&args.prog, core.path())?;

    let mut gdb = GdbMi::spawn(&args.gdb, core.path(), &args.prog)?;
    let mut to_stdout = |text: &str| print!("{text}");

    println!("===============================================================");
    println!("==================== ESP32 CORE DUMP START ====================");

    banner("CURRENT THREAD REGISTERS");
    report_command(&mut gdb, "info registers", &mut to_stdout)?;
    banner("CURRENT THREAD STACK");
    report_command(&mut gdb, "bt", &mut to_stdout)?;
    banner("THREADS INFO");
    report_command(&mut gdb, "info threads", &mut to_stdout)?;
    banner("MEMORY REGIONS");
    print_region_table(&regions);

    if print_mem {
        banner("MEMORY CONTENTS");
        for region in regions.iter().filter(|region| region.in_dump) {
            println!("{} {:#x} {:#x} {}", region.name, region.addr, region.size, region.attrs);
            let command = format!("x/{}x {:#x}", region.size / 4, region.addr);
            report_command(&mut gdb, &command, &mut to_stdout)?;
        }
    }

    println!();
    println!("===================== ESP32 CORE DUMP END =====================");
    println!("===============================================================");

    Ok(())
}

fn banner(title: &str) {
    let pad = 63_usize.saturating_sub(title.len() + 2);
    println!();
    println!("{0} {title} {1}", "=".repeat(pad / 2), "=".repeat(pad - pad / 2));
}

fn report_command(
    gdb: &mut GdbMi,
    command: &str,
    console: &mut dyn FnMut(&str),
) -> Result<()> {
    let result = gdb.console_command(command, console)?;
    if result != ResultClass::Done {
        println!("GDB/MI command '{command}' failed ({result:?})");
    }

    Ok(())
}

struct Region {
    name: String,
    addr: u64,
    size: u64,
    attrs: String,
    /// The core dump carries memory contents for this region.
    in_dump: bool,
}

/// Matches the program ELF's allocatable sections against the LOAD segments
/// of the core file, marking the ones whose contents the dump captured.
fn memory_regions(prog: &Path, core: &Path) -> Result<Vec<Region>> {
    let prog_data = fs::read(prog)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read program ELF '{}'", prog.display()))?;
    let core_data = fs::read(core).into_diagnostic()?;

    let prog_elf = object::File::parse(&*prog_data).into_diagnostic()?;
    let core_elf = object::File::parse(&*core_data).into_diagnostic()?;

    let dumped: Vec<(u64, u64)> = core_elf
        .segments()
        .map(|segment| (segment.address(), segment.size()))
        .collect();

    let mut regions = Vec::new();
    for section in prog_elf.sections() {
        let SectionFlags::Elf { sh_flags } = section.flags() else {
            continue;
        };
        if sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 || section.address() == 0 {
            continue;
        }

        let addr = section.address();
        let size = section.size();
        let mut attrs = String::from("R");
        if sh_flags & u64::from(object::elf::SHF_WRITE) != 0 {
            attrs.push('W');
        }
        if sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
            attrs.push('X');
        }

        let in_dump = dumped
            .iter()
            .any(|(seg_addr, seg_size)| *seg_addr < addr + size && addr < seg_addr + seg_size);

        regions.push(Region {
            name: section.name().unwrap_or("<unnamed>").to_string(),
            addr,
            size,
            attrs,
            in_dump,
        });
    }

    Ok(regions)
}

fn print_region_table(regions: &[Region]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(["Name", "Address", "Size", "Attrs", "In dump"]);

    for region in regions {
        table.add_row([
            region.name.clone(),
            format!("{:#010x}", region.addr),
            format!("{:#x}", region.size),
            region.attrs.clone(),
            if region.in_dump { "yes" } else { "" }.to_string(),
        ]);
    }

    println!("{table}");
}
