use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use log::*;

use scsibus_core::config::BusConfig;
use scsibus_core::scsi::STATUS_CHECK_CONDITION;
use scsibus_core::scsi::bus::ScsiBus;
use scsibus_core::scsi::initiator::{Initiator, Transaction};

/// Issues a single SCSI command to a unit of a configured bus
#[derive(Parser)]
struct Args {
    /// Bus configuration (JSON)
    config: PathBuf,

    /// Target SCSI ID
    target: usize,

    /// Logical unit, sent with IDENTIFY
    #[arg(long)]
    lun: Option<u8>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// INQUIRY
    Inquiry,
    /// TEST UNIT READY
    Tur,
    /// READ CAPACITY
    Capacity,
    /// REQUEST SENSE
    Sense,
    /// READ(10)
    Read { lba: u32, count: u16 },
    /// MODE SENSE(6) for a page code, 0x3F for all pages
    ModeSense {
        #[arg(value_parser = parse_byte)]
        page: u8,
    },
    /// READ BLOCK LIMITS (tape)
    BlockLimits,
    /// REWIND (tape)
    Rewind,
}

fn parse_byte(s: &str) -> Result<u8> {
    Ok(match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

impl Command {
    fn cdb(&self) -> Vec<u8> {
        match *self {
            Self::Inquiry => vec![0x12, 0, 0, 0, 0xFF, 0],
            Self::Tur => vec![0x00, 0, 0, 0, 0, 0],
            Self::Capacity => vec![0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            Self::Sense => vec![0x03, 0, 0, 0, 18, 0],
            Self::Read { lba, count } => {
                let mut cdb = vec![0x28, 0];
                cdb.extend_from_slice(&lba.to_be_bytes());
                cdb.push(0);
                cdb.extend_from_slice(&count.to_be_bytes());
                cdb.push(0);
                cdb
            }
            Self::ModeSense { page } => vec![0x1A, 0, page & 0x3F, 0, 0xFF, 0],
            Self::BlockLimits => vec![0x05, 0, 0, 0, 0, 0],
            Self::Rewind => vec![0x01, 0, 0, 0, 0, 0],
        }
    }
}

fn hexdump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:08X}  {:<47}  {}", i * 16, hex.join(" "), ascii);
    }
}

fn report(bus: &mut ScsiBus, host: &Initiator, target: usize, t: &Transaction) -> Result<()> {
    if !t.data.is_empty() {
        hexdump(&t.data);
    }
    println!("Status: {:02X}, message: {:02X}", t.status, t.message);
    if t.status == STATUS_CHECK_CONDITION {
        let sense = host.request_sense(bus, target)?;
        println!(
            "Sense key {:X}, ASC {:02X}, ASCQ {:02X}{}{}{}{}",
            sense.key.key(),
            sense.asc,
            sense.ascq,
            if sense.key.filemark() { ", filemark" } else { "" },
            if sense.key.eom() { ", EOM" } else { "" },
            if sense.key.ili() { ", ILI" } else { "" },
            sense
                .info
                .map_or_else(String::new, |i| format!(", information {}", i))
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    let (config, basedir) = BusConfig::load(&args.config)?;
    let mut bus = config.build(&basedir)?;
    if bus.target(args.target).is_none() {
        bail!("No unit at SCSI ID {}", args.target);
    }

    let mut host = Initiator::new(config.host_id);
    if let Some(lun) = args.lun {
        host = host.with_lun(lun);
    }

    let cdb = args.command.cdb();
    debug!("CDB: {:02X?}", cdb);
    let t = host.command(&mut bus, args.target, &cdb, &[])?;
    report(&mut bus, &host, args.target, &t)
}
