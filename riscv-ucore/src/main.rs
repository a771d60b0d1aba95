use clap::Parser;
use riscv_ucore::bus::Memory;
use riscv_ucore::csr::{CSR_MCAUSE, CSR_MEPC, CSR_MTVEC};
use riscv_ucore::ucode::{FieldTable, UcodeRom};
use riscv_ucore::{Core, CoreError};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a flat little-endian program image
    #[arg(short, long)]
    image: PathBuf,

    /// Byte address to load the image at (also the reset PC region)
    #[arg(long, default_value_t = 0)]
    load_addr: u32,

    /// Memory size in 32-bit words
    #[arg(long, default_value_t = 1 << 16)]
    mem_words: usize,

    /// Acknowledge latency of the memory, in wait states
    #[arg(long, default_value_t = 0)]
    wait_states: u32,

    /// Cycle budget; the run stops when it is spent
    #[arg(long, default_value_t = 1_000_000)]
    cycles: u64,

    /// Optional packed microcode image (overrides the built-in program)
    #[arg(long, requires = "ucode_fields")]
    ucode: Option<PathBuf>,

    /// Field-layout table accompanying --ucode
    #[arg(long)]
    ucode_fields: Option<PathBuf>,

    /// Drive the external interrupt line high for the whole run
    #[arg(long)]
    irq: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let rom = match (&args.ucode, &args.ucode_fields) {
        (Some(image), Some(fields)) => {
            let table = FieldTable::from_bytes(&fs::read(fields)?)?;
            UcodeRom::from_image(&fs::read(image)?, &table)?
        }
        _ => riscv_ucore::program::default_rom(),
    };

    let mut core = Core::new(rom);
    let mut mem = Memory::with_wait_states(args.mem_words, args.wait_states);
    mem.load_bytes(args.load_addr, &fs::read(&args.image)?);

    log::info!(
        "running {} for up to {} cycles",
        args.image.display(),
        args.cycles
    );

    match core.run(&mut mem, args.irq, args.cycles) {
        Ok(()) => {}
        Err(e @ CoreError::Unimplemented { .. }) => {
            eprintln!("halted: {e}");
        }
    }

    println!("cycles: {}", core.cycles());
    println!("pc:     {:#010x}", core.pc());
    for i in 0..32 {
        print!("x{i:<2} {:08x}", core.reg(i));
        if i % 4 == 3 {
            println!();
        } else {
            print!("  ");
        }
    }
    for (name, addr) in [
        ("mtvec", CSR_MTVEC),
        ("mepc", CSR_MEPC),
        ("mcause", CSR_MCAUSE),
    ] {
        println!("{name:<7} {:08x}", core.csr(addr).unwrap_or(0));
    }

    let (reads, writes) = mem.transactions();
    println!("bus:    {reads} reads, {writes} writes");
    Ok(())
}
