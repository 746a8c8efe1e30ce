// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! This is the lowest-level module. It is responsible for scanning the USB bus
//! to find a high-speed FTDI adapter, switching the selected interface into
//! MPSSE mode, and moving bytes over its bulk endpoints.

use std::str::FromStr;
use std::thread;
use std::time::Duration;
use clap_num::maybe_hex;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use thiserror::Error;

use crate::mpsse::{Clock, Pins};
use crate::transport::{self, Transport};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid device specifier, use d:BUS/ADDR, i:VID:PID[:INDEX] or s:VID:PID:SERIAL.")]
    InvalidSpecifier,
    #[error("invalid interface, use A, B, C or D.")]
    InvalidInterface,
    #[error("FTDI device not found: {0}.")]
    DeviceNotFound(String),
    #[error("FTDI chip with bcdDevice 0x{0:04X} is not a supported high-speed MPSSE chip.")]
    UnsupportedChip(u16),
    #[error("interface {interface} of {chip} does not support MPSSE.")]
    NoMpsse { chip: ChipType, interface: Interface },
    #[error("USB error")]
    Usb(#[from] rusb::Error),
    #[error("transport error")]
    Transport(#[from] transport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const FTDI_VID: u16 = 0x0403;
const FT2232H_PID: u16 = 0x6010;

const REQTYPE_OUT: u8 = 0x40;
const REQTYPE_IN: u8 = 0xC0;
const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_GET_LATENCY_TIMER: u8 = 0x0A;
const SIO_SET_BITMODE: u8 = 0x0B;
const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const BITMODE_RESET: u8 = 0x00;
const BITMODE_MPSSE: u8 = 0x02;

/// Latency timer used while the adapter is open, in milliseconds.
const LATENCY_MS: u8 = 16;
/// Size of the USB transfers used for each read and write.
const CHUNK_SIZE: usize = 8 * 1024;
/// Number of modem status bytes at the start of every bulk IN packet.
const STATUS_BYTES: usize = 2;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
const RESET_SETTLE: Duration = Duration::from_millis(100);
const INIT_SETTLE: Duration = Duration::from_millis(100);
const FLASH_SETTLE: Duration = Duration::from_millis(250);

/// Supported FTDI chip families, identified by their bcdDevice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChipType {
    FT2232H,
    FT4232H,
    FT232H,
}

impl ChipType {
    /// Identify the chip from the major part of its bcdDevice.
    fn from_release(major: u8) -> Option<Self> {
        match major {
            7 => Some(ChipType::FT2232H),
            8 => Some(ChipType::FT4232H),
            9 => Some(ChipType::FT232H),
            _ => None,
        }
    }

    /// Check whether `interface` has an MPSSE engine on this chip.
    pub fn has_mpsse(&self, interface: Interface) -> bool {
        match self {
            ChipType::FT232H => interface == Interface::A,
            ChipType::FT2232H | ChipType::FT4232H =>
                matches!(interface, Interface::A | Interface::B),
        }
    }
}

impl std::fmt::Display for ChipType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Adapter interface (channel) to use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interface {
    A,
    B,
    C,
    D,
}

impl Interface {
    /// USB interface number.
    pub fn number(&self) -> u8 {
        match self {
            Interface::A => 0,
            Interface::B => 1,
            Interface::C => 2,
            Interface::D => 3,
        }
    }

    /// wIndex used in vendor control requests for this interface.
    fn index(&self) -> u16 {
        self.number() as u16 + 1
    }

    fn in_ep(&self) -> u8 {
        0x81 + 2 * self.number()
    }

    fn out_ep(&self) -> u8 {
        0x02 + 2 * self.number()
    }
}

impl Default for Interface {
    fn default() -> Self {
        Interface::A
    }
}

impl FromStr for Interface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Interface::A),
            "B" => Ok(Interface::B),
            "C" => Ok(Interface::C),
            "D" => Ok(Interface::D),
            _ => Err(Error::InvalidInterface),
        }
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Selects which connected adapter to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Device at a USB bus number and device address.
    BusAddress { bus: u8, address: u8 },
    /// The `index`th device with this VID and PID.
    VidPid { vid: u16, pid: u16, index: usize },
    /// Device with this VID, PID and serial number.
    Serial { vid: u16, pid: u16, serial: String },
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::VidPid { vid: FTDI_VID, pid: FT2232H_PID, index: 0 }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    /// Parse `d:BUS/ADDR`, `i:VID:PID`, `i:VID:PID:INDEX` or `s:VID:PID:SERIAL`.
    ///
    /// Numbers may be decimal or 0x-prefixed hex.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.split_once(':').ok_or(Error::InvalidSpecifier)?;
        match kind {
            "d" => {
                let (bus, address) = rest.split_once('/').ok_or(Error::InvalidSpecifier)?;
                Ok(DeviceSpec::BusAddress {
                    bus: maybe_hex(bus).or(Err(Error::InvalidSpecifier))?,
                    address: maybe_hex(address).or(Err(Error::InvalidSpecifier))?,
                })
            },
            "i" => {
                let parts: Vec<&str> = rest.split(':').collect();
                let index = match parts.len() {
                    2 => 0,
                    3 => maybe_hex(parts[2]).or(Err(Error::InvalidSpecifier))?,
                    _ => return Err(Error::InvalidSpecifier),
                };
                Ok(DeviceSpec::VidPid {
                    vid: maybe_hex(parts[0]).or(Err(Error::InvalidSpecifier))?,
                    pid: maybe_hex(parts[1]).or(Err(Error::InvalidSpecifier))?,
                    index,
                })
            },
            "s" => {
                let parts: Vec<&str> = rest.splitn(3, ':').collect();
                if parts.len() != 3 || parts[2].is_empty() {
                    return Err(Error::InvalidSpecifier);
                }
                Ok(DeviceSpec::Serial {
                    vid: maybe_hex(parts[0]).or(Err(Error::InvalidSpecifier))?,
                    pid: maybe_hex(parts[1]).or(Err(Error::InvalidSpecifier))?,
                    serial: parts[2].to_owned(),
                })
            },
            _ => Err(Error::InvalidSpecifier),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceSpec::BusAddress { bus, address } => write!(f, "d:{}/{}", bus, address),
            DeviceSpec::VidPid { vid, pid, index } =>
                write!(f, "i:0x{:04x}:0x{:04x}:{}", vid, pid, index),
            DeviceSpec::Serial { vid, pid, serial } =>
                write!(f, "s:0x{:04x}:0x{:04x}:{}", vid, pid, serial),
        }
    }
}

/// Everything needed to open an adapter for SPI flash access.
#[derive(Clone, Debug, Default)]
pub struct FtdiConfig {
    pub device: DeviceSpec,
    pub interface: Interface,
    pub clock: Clock,
    pub pins: Pins,
}

/// An FTDI adapter with one interface open in MPSSE mode.
pub struct FtdiTransport {
    handle: DeviceHandle<Context>,
    interface: Interface,
    chip: ChipType,
    max_packet_size: usize,
    read_chunk: usize,
    write_chunk: usize,
    pending: Vec<u8>,
    saved_latency: Option<u8>,
    released: bool,
}

impl FtdiTransport {
    /// Find and open the adapter described by `config`, leaving it in MPSSE
    /// mode with the clock and pins configured and CS deasserted.
    pub fn open(config: &FtdiConfig) -> Result<Self> {
        log::debug!("Opening FTDI device {} interface {}", config.device, config.interface);
        let context = Context::new()?;
        let device = find_device(&context, &config.device)?;
        let desc = device.device_descriptor()?;
        let bcd = bcd_device(&desc);
        let chip = ChipType::from_release(desc.device_version().major())
            .ok_or(Error::UnsupportedChip(bcd))?;
        if !chip.has_mpsse(config.interface) {
            return Err(Error::NoMpsse { chip, interface: config.interface });
        }
        let max_packet_size = max_packet_size(&device, config.interface).unwrap_or(512);

        let mut handle = device.open()?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle.claim_interface(config.interface.number())?;
        log::info!("Opened {} at bus {} address {}", chip, device.bus_number(), device.address());

        let mut ftdi = FtdiTransport {
            handle,
            interface: config.interface,
            chip,
            max_packet_size,
            read_chunk: CHUNK_SIZE,
            write_chunk: CHUNK_SIZE,
            pending: Vec::new(),
            saved_latency: None,
            released: false,
        };
        ftdi.init(config)?;
        Ok(ftdi)
    }

    pub fn chip(&self) -> ChipType {
        self.chip
    }

    fn init(&mut self, config: &FtdiConfig) -> Result<()> {
        self.control_out(SIO_RESET, SIO_RESET_SIO)?;
        thread::sleep(RESET_SETTLE);
        self.set_bitmode(0x00, BITMODE_RESET)?;
        self.set_bitmode(0xFF, BITMODE_MPSSE)?;
        self.control_out(SIO_RESET, SIO_RESET_PURGE_RX)?;
        self.control_out(SIO_RESET, SIO_RESET_PURGE_TX)?;
        self.drain()?;

        let latency = self.latency_timer()?;
        log::debug!("Saved latency timer {}ms", latency);
        self.saved_latency = Some(latency);
        self.control_out(SIO_SET_LATENCY_TIMER, LATENCY_MS as u16)?;
        self.set_chunk_sizes(CHUNK_SIZE, CHUNK_SIZE)?;

        let clock = config.clock;
        log::debug!("MPSSE clock {:.1}MHz / {} = {:.3}MHz",
                    clock.base_mhz(), clock.divisor(), clock.spi_hz() / 1e6);
        self.write(&clock.init_sequence(config.pins))?;
        thread::sleep(INIT_SETTLE);
        thread::sleep(FLASH_SETTLE);
        Ok(())
    }

    fn set_bitmode(&self, mask: u8, mode: u8) -> Result<()> {
        self.control_out(SIO_SET_BITMODE, ((mode as u16) << 8) | mask as u16)
    }

    fn latency_timer(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.handle.read_control(REQTYPE_IN, SIO_GET_LATENCY_TIMER, 0,
                                 self.interface.index(), &mut buf, CONTROL_TIMEOUT)?;
        Ok(buf[0])
    }

    fn control_out(&self, request: u8, value: u16) -> Result<()> {
        log::trace!("Control request 0x{:02X} value 0x{:04X}", request, value);
        self.handle.write_control(REQTYPE_OUT, request, value,
                                  self.interface.index(), &[], CONTROL_TIMEOUT)?;
        Ok(())
    }

    /// Read and discard any pending data without waiting.
    fn drain(&mut self) -> Result<()> {
        log::trace!("Draining pending data from adapter");
        self.pending.clear();
        let mut buf = vec![0u8; self.read_chunk];
        let timeout = Duration::from_millis(1);
        loop {
            match self.handle.read_bulk(self.interface.in_ep(), &mut buf, timeout) {
                Ok(n) if n > STATUS_BYTES => continue,
                Ok(_) => break,
                Err(rusb::Error::Timeout) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fetch one transfer from the IN endpoint, keeping only the payload bytes.
    fn fill(&mut self) -> transport::Result<()> {
        let mut buf = vec![0u8; self.read_chunk];
        let n = match self.handle.read_bulk(self.interface.in_ep(), &mut buf, READ_TIMEOUT) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => 0,
            Err(e) => return Err(usb_error(e)),
        };
        for packet in buf[..n].chunks(self.max_packet_size) {
            if packet.len() > STATUS_BYTES {
                self.pending.extend_from_slice(&packet[STATUS_BYTES..]);
            }
        }
        Ok(())
    }

    /// Restore the latency timer and release the interface.
    fn release(&mut self) -> transport::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let mut result = Ok(());
        if let Some(latency) = self.saved_latency.take() {
            log::debug!("Restoring latency timer {}ms", latency);
            if let Err(e) = self.handle.write_control(REQTYPE_OUT, SIO_SET_LATENCY_TIMER,
                                                      latency as u16, self.interface.index(),
                                                      &[], CONTROL_TIMEOUT)
            {
                result = Err(usb_error(e));
            }
        }
        if let Err(e) = self.handle.release_interface(self.interface.number()) {
            result = result.and(Err(usb_error(e)));
        }
        result
    }
}

impl Transport for FtdiTransport {
    fn write_raw(&mut self, data: &[u8]) -> transport::Result<usize> {
        let mut written = 0;
        for chunk in data.chunks(self.write_chunk) {
            let n = self.handle.write_bulk(self.interface.out_ep(), chunk, WRITE_TIMEOUT)
                               .map_err(usb_error)?;
            written += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(written)
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> transport::Result<usize> {
        if self.pending.is_empty() {
            self.fill()?;
        }
        let n = usize::min(buf.len(), self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn set_chunk_sizes(&mut self, read: usize, write: usize) -> transport::Result<()> {
        // Reads are split into packets, so keep them a whole number of packets.
        let packets = usize::max(read / self.max_packet_size, 1);
        self.read_chunk = packets * self.max_packet_size;
        self.write_chunk = usize::max(write, 1);
        log::trace!("Chunk sizes: read {}, write {}", self.read_chunk, self.write_chunk);
        Ok(())
    }

    fn close(&mut self) -> transport::Result<()> {
        log::debug!("Closing FTDI adapter");
        self.release()
    }
}

impl Drop for FtdiTransport {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Error releasing FTDI adapter: {}", e);
        }
    }
}

/// Convert a USB error into a transport error, using libusb error codes.
fn usb_error(e: rusb::Error) -> transport::Error {
    let code = match e {
        rusb::Error::NoDevice => return transport::Error::Disconnected,
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    };
    transport::Error::Driver { code, message: e.to_string() }
}

fn bcd_device(desc: &rusb::DeviceDescriptor) -> u16 {
    let v = desc.device_version();
    ((v.major() as u16) << 8) | ((v.minor() as u16) << 4) | v.sub_minor() as u16
}

fn max_packet_size(device: &Device<Context>, interface: Interface) -> Option<usize> {
    let cdesc = device.config_descriptor(0).ok()?;
    let iface = cdesc.interfaces().find(|i| i.number() == interface.number())?;
    let idesc = iface.descriptors().next()?;
    let ep = idesc.endpoint_descriptors().find(|ep| ep.address() == interface.in_ep())?;
    Some(ep.max_packet_size() as usize)
}

fn find_device(context: &Context, spec: &DeviceSpec) -> Result<Device<Context>> {
    let mut index = 0;
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        let found = match spec {
            DeviceSpec::BusAddress { bus, address } =>
                device.bus_number() == *bus && device.address() == *address,
            DeviceSpec::VidPid { vid, pid, index: want } => {
                if desc.vendor_id() == *vid && desc.product_id() == *pid {
                    index += 1;
                    index - 1 == *want
                } else {
                    false
                }
            },
            DeviceSpec::Serial { vid, pid, serial } => {
                desc.vendor_id() == *vid && desc.product_id() == *pid
                    && read_serial(&device, &desc).as_ref() == Some(serial)
            },
        };
        if found {
            return Ok(device);
        }
    }
    Err(Error::DeviceNotFound(spec.to_string()))
}

fn read_serial(device: &Device<Context>, desc: &rusb::DeviceDescriptor) -> Option<String> {
    let handle = device.open().ok()?;
    handle.read_serial_number_string_ascii(desc).ok()
}

/// Metadata about a connected FTDI adapter.
#[derive(Clone, Debug)]
pub struct FtdiInfo {
    pub bus: u8,
    pub address: u8,
    pub vid: u16,
    pub pid: u16,
    pub chip: ChipType,
    pub serial: Option<String>,
}

impl FtdiInfo {
    /// Find all connected high-speed FTDI adapters.
    pub fn list() -> Vec<Self> {
        log::trace!("Searching for FTDI adapters");
        match Context::new().and_then(|ctx| ctx.devices()) {
            Ok(devices) => devices.iter().filter_map(|d| Self::from_device(&d)).collect(),
            Err(_) => vec![],
        }
    }

    fn from_device(device: &Device<Context>) -> Option<Self> {
        let desc = device.device_descriptor().ok()?;
        if desc.vendor_id() != FTDI_VID {
            return None;
        }
        let chip = ChipType::from_release(desc.device_version().major())?;
        Some(FtdiInfo {
            bus: device.bus_number(),
            address: device.address(),
            vid: desc.vendor_id(),
            pid: desc.product_id(),
            chip,
            serial: read_serial(device, &desc),
        })
    }

    /// A specifier which selects this adapter.
    pub fn spec(&self) -> DeviceSpec {
        DeviceSpec::BusAddress { bus: self.bus, address: self.address }
    }
}

impl std::fmt::Display for FtdiInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let serial = self.serial.clone().unwrap_or_else(|| "".to_owned());
        write!(f, "{} {:04x}:{:04x} {} {}", self.spec(), self.vid, self.pid, self.chip, serial)
    }
}
