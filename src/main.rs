// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{fs::File, time::{Duration, Instant}};
use anyhow::Context;
use clap::{Command, Arg, ArgAction, crate_description, crate_version};
use clap_num::maybe_hex;
use indicatif::{ProgressBar, ProgressStyle};

use mpsseflash::{Clock, Erase, Flash, FtdiConfig, FtdiInfo, FtdiTransport, Mode, NoProgress,
                 Phase, Pins, Progress, run};
use mpsseflash::ftdi::{DeviceSpec, Interface};

/// Default length of reads when no size is given.
const DEFAULT_READ_SIZE: usize = 256 * 1024;

const PROGRESS_TPL: &str = " {msg:<12} [{bar:40}] {pos:>3}% ({elapsed})";
const PROGRESS_CHARS: &str = "=> ";

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("mpsseflash")
        .version(crate_version!())
        .about(crate_description!())
        .arg(Arg::new("file")
             .help("Image to program or verify, or destination file in read mode")
             .required_unless_present_any(["test", "bulk-erase", "list"]))
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet"))
        .arg(Arg::new("list")
             .help("List connected FTDI adapters")
             .long("list")
             .short('l')
             .action(ArgAction::SetTrue))
        .arg(Arg::new("device")
             .help("Adapter to use: d:BUS/ADDR, i:VID:PID[:INDEX] or s:VID:PID:SERIAL")
             .long("device")
             .short('d')
             .action(ArgAction::Set)
             .default_value("i:0x0403:0x6010")
             .value_parser(|s: &str| s.parse::<DeviceSpec>()))
        .arg(Arg::new("interface")
             .help("Adapter interface to use")
             .long("interface")
             .short('I')
             .action(ArgAction::Set)
             .default_value("A")
             .value_parser(|s: &str| s.parse::<Interface>()))
        .arg(Arg::new("divisor")
             .help("Divisor of the 60MHz MPSSE clock, an even number from 2 to 131072")
             .long("divisor")
             .action(ArgAction::Set)
             .default_value("18")
             .value_parser(divisor))
        .arg(Arg::new("offset")
             .help("Start address in flash (decimal, or hex with 0x prefix; k and M suffixes allowed)")
             .long("offset")
             .short('o')
             .action(ArgAction::Set)
             .default_value("0")
             .value_parser(size::<u32>))
        .arg(Arg::new("read")
             .help("Read 256kB of flash contents into the file")
             .long("read")
             .short('r')
             .action(ArgAction::SetTrue)
             .conflicts_with_all(["check", "test"]))
        .arg(Arg::new("read-size")
             .help("Read the given number of bytes of flash contents into the file")
             .long("read-size")
             .short('R')
             .action(ArgAction::Set)
             .value_parser(size::<usize>)
             .conflicts_with_all(["check", "test"]))
        .arg(Arg::new("check")
             .help("Do not write the flash, only verify it against the file")
             .long("check")
             .short('c')
             .action(ArgAction::SetTrue)
             .conflicts_with("test"))
        .arg(Arg::new("test")
             .help("Only read and print the flash ID")
             .long("test")
             .short('t')
             .action(ArgAction::SetTrue))
        .arg(Arg::new("bulk-erase")
             .help("Erase the entire flash before writing, or only erase if no file is given")
             .long("bulk-erase")
             .short('b')
             .action(ArgAction::SetTrue)
             .conflicts_with_all(["no-erase", "read", "read-size", "check", "test"]))
        .arg(Arg::new("no-erase")
             .help("Do not erase the flash before writing")
             .long("no-erase")
             .short('n')
             .action(ArgAction::SetTrue)
             .conflicts_with_all(["read", "read-size", "check", "test"]))
        .arg(Arg::new("verify")
             .help("Disable readback verification after writing")
             .long("no-verify")
             .action(ArgAction::SetFalse))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing adapters does not require opening one,
    // so we just list them and quit early.
    if matches.get_flag("list") {
        print_adapter_list();
        return Ok(());
    }

    let offset = matches.get_one::<u32>("offset").copied().unwrap_or(0);
    let path = matches.get_one::<String>("file");
    let read_size = matches.get_one::<usize>("read-size").copied()
        .or_else(|| if matches.get_flag("read") { Some(DEFAULT_READ_SIZE) } else { None });

    // Load the image before touching the adapter, except in read mode
    // where the file is the destination.
    let image = match path {
        Some(path) if read_size.is_none() && !matches.get_flag("test") => {
            let data = std::fs::read(path)
                .with_context(|| format!("Could not read image file {}", path))?;
            log::info!("Loaded {} bytes from {}", data.len(), path);
            Some(data)
        },
        _ => None,
    };

    let config = FtdiConfig {
        device: matches.get_one::<DeviceSpec>("device").cloned().unwrap_or_default(),
        interface: matches.get_one::<Interface>("interface").copied().unwrap_or_default(),
        clock: Clock::new(matches.get_one::<u32>("divisor").copied().unwrap_or(18)),
        pins: Pins::default(),
    };
    let clock = config.clock;
    if !quiet {
        println!("MPSSE clock: {:.1}MHz / {} = {:.3}MHz SPI clock",
                 clock.base_mhz(), clock.divisor(), clock.spi_hz() / 1e6);
    }

    let transport = FtdiTransport::open(&config)?;
    if !quiet { println!("Opened {} interface {}", transport.chip(), config.interface) };
    let flash = Flash::new(transport, config.clock, config.pins);

    let mut bars = Bars::default();
    let mut none = NoProgress;
    let progress: &mut dyn Progress = if quiet { &mut none } else { &mut bars };

    let part = if matches.get_flag("test") {
        run(flash, offset, Mode::Identify, progress)?
    } else if let Some(length) = read_size {
        let path = path.context("No file given to read into")?;
        let mut file = File::create(path)
            .with_context(|| format!("Could not create output file {}", path))?;
        run(flash, offset, Mode::Read { length, sink: &mut file }, progress)?
    } else if let Some(image) = &image {
        let mode = if matches.get_flag("check") {
            Mode::Verify { image }
        } else {
            let erase = if matches.get_flag("bulk-erase") {
                Erase::Bulk
            } else if matches.get_flag("no-erase") {
                Erase::Skip
            } else {
                Erase::Sectors
            };
            Mode::Program { image, erase, verify: matches.get_flag("verify") }
        };
        run(flash, offset, mode, progress)?
    } else {
        run(flash, offset, Mode::BulkErase, progress)?
    };

    if matches.get_flag("test") || !quiet {
        let id = part.signature();
        println!("Flash ID: {:02X} {:02X} {:02X}", id[0], id[1], id[2]);
        println!("Flash: {}", part);
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

/// Parse a size or address, in decimal or 0x-prefixed hex, with an optional
/// k (1024) or M (1048576) suffix.
fn size<T: std::convert::TryFrom<u64>>(s: &str) -> Result<T, String> {
    let (digits, scale) = if let Some(d) = s.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix('M') {
        (d, 1024 * 1024)
    } else {
        (s, 1)
    };
    let value = maybe_hex::<u64>(digits)?
        .checked_mul(scale)
        .ok_or_else(|| format!("{} is too large", s))?;
    T::try_from(value).map_err(|_| format!("{} is too large", s))
}

fn divisor(s: &str) -> Result<u32, String> {
    let divisor = maybe_hex::<u32>(s)?;
    if (2..=131072).contains(&divisor) && divisor % 2 == 0 {
        Ok(divisor)
    } else {
        Err("divisor must be an even number from 2 to 131072".to_owned())
    }
}

fn print_adapter_list() {
    let adapters = FtdiInfo::list();
    if adapters.is_empty() {
        println!("No FTDI adapters found.");
    } else {
        println!("Found {} FTDI adapter{}:", adapters.len(),
                 if adapters.len() == 1 { "" } else { "s" });
        for adapter in adapters {
            println!("  {}", adapter);
        }
    }
}

/// Draws one progress bar per phase on the terminal.
#[derive(Default)]
struct Bars {
    bar: Option<ProgressBar>,
}

impl Progress for Bars {
    fn begin(&mut self, phase: Phase, total: usize) {
        let pb = if total == 0 {
            let pb = ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            let style = ProgressStyle::with_template(PROGRESS_TPL)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars(PROGRESS_CHARS);
            ProgressBar::new(100).with_style(style)
        };
        pb.set_message(phase.to_string());
        self.bar = Some(pb);
    }

    fn step(&mut self, _phase: Phase, percent: u32) {
        if let Some(pb) = &self.bar {
            pb.set_position(percent as u64);
        }
    }

    fn end(&mut self, _phase: Phase) {
        if let Some(pb) = self.bar.take() {
            pb.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size() {
        assert_eq!(size::<usize>("256"), Ok(256));
        assert_eq!(size::<usize>("0x100"), Ok(256));
        assert_eq!(size::<usize>("256k"), Ok(256 * 1024));
        assert_eq!(size::<u32>("2M"), Ok(2 * 1024 * 1024));
        assert_eq!(size::<u32>("0x10k"), Ok(16 * 1024));
        assert!(size::<u32>("8192M").is_err());
        assert!(size::<usize>("12q").is_err());
    }

    #[test]
    fn test_divisor() {
        assert_eq!(divisor("18"), Ok(18));
        assert_eq!(divisor("2"), Ok(2));
        assert_eq!(divisor("131072"), Ok(131072));
        assert!(divisor("17").is_err());
        assert!(divisor("0").is_err());
        assert!(divisor("131074").is_err());
    }
}
