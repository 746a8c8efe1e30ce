// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::thread;
use std::time::{Duration, Instant};
use crate::mpsse::{self, Clock, CommandBuffer, Pins, MAX_TRANSFER};
use crate::transport::{self, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Waited longer than {0:?} for flash memory to be ready.")]
    WaitTimeout(Duration),
    #[error("Transfer of {0} bytes exceeds the MPSSE transfer limit.")]
    TransferTooLong(usize),
    #[error("Address 0x{0:08X} cannot be sent as a 24-bit address.")]
    InvalidAddress(u32),
    #[error("Page program of {length} bytes at 0x{address:06X} crosses a page boundary.")]
    PageBoundary { address: u32, length: usize },

    #[error("Transport error")]
    Transport(#[from] transport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Page program size in bytes.
pub const PAGE_SIZE: usize = 256;

/// Number of bytes the adapter samples back for each byte clocked out
/// before the data phase of a read: opcode and three address bytes.
const READ_HEADER: usize = 4;

/// SPI flash driver for a flash attached to an MPSSE adapter.
///
/// Each method frames one or more SPI transactions with chip-select
/// commands. Single-shot operations are written to the transport
/// immediately, while page programs can be appended to a `CommandBuffer`
/// so many of them are sent in one USB transfer.
pub struct Flash<T: Transport> {
    transport: T,
    clock: Clock,
    pins: Pins,
}

impl<T: Transport> Flash<T> {
    /// Create a new Flash driver on an already-initialised MPSSE transport.
    pub fn new(transport: T, clock: Clock, pins: Pins) -> Self {
        Flash { transport, clock, pins }
    }

    /// Close the underlying transport.
    pub fn close(&mut self) -> Result<()> {
        Ok(self.transport.close()?)
    }

    /// Read the JEDEC identification bytes.
    ///
    /// Returns the bytes sampled after the opcode: manufacturer ID, then
    /// the memory type and capacity bytes.
    pub fn identify(&mut self) -> Result<Vec<u8>> {
        let rx = self.exchange(Command::ReadJEDECID, &[], 3)?;
        log::debug!("Flash ID: {:02X?}", rx);
        Ok(rx)
    }

    /// Release the flash from deep power-down.
    pub fn power_up(&mut self) -> Result<()> {
        log::debug!("Sending Release Powerdown command");
        self.command(Command::ReleasePowerdown)
    }

    /// Put the flash into deep power-down.
    pub fn power_down(&mut self) -> Result<()> {
        log::debug!("Sending Powerdown command");
        self.command(Command::Powerdown)
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)
    }

    /// Erase the entire chip.
    ///
    /// The caller must have sent `write_enable()` first, and should then
    /// wait for the erase to complete with `wait_ready()`.
    pub fn bulk_erase(&mut self) -> Result<()> {
        log::debug!("Sending Chip Erase command");
        self.command(Command::ChipErase)
    }

    /// Erase the 64kB block containing `address`.
    ///
    /// The caller must have sent `write_enable()` first.
    pub fn sector_erase_64k(&mut self, address: u32) -> Result<()> {
        log::debug!("Erasing 64kB block at 0x{:06X}", address);
        let addr = make_address(address)?;
        self.write(Command::BlockErase64, &addr)
    }

    /// Append a write-enable and a page program of `data` at `address` to `buf`.
    ///
    /// `data` must not cross a page boundary. If `page_program_us` is given,
    /// idle clocks covering that long are appended after the program so
    /// the next command in the buffer is not sent while the flash is busy.
    pub fn prepare_page_program(&self, buf: &mut CommandBuffer, address: u32, data: &[u8],
                                page_program_us: Option<u32>) -> Result<()>
    {
        let offset = address as usize % PAGE_SIZE;
        if data.is_empty() || offset + data.len() > PAGE_SIZE {
            return Err(Error::PageBoundary { address, length: data.len() });
        }
        let addr = make_address(address)?;

        buf.push(&mpsse::chip_select(self.pins));
        buf.push(&mpsse::data_out(1));
        buf.push(&[Command::WriteEnable.into()]);
        buf.push(&mpsse::chip_deselect(self.pins));

        buf.push(&mpsse::chip_select(self.pins));
        buf.push(&mpsse::data_out(READ_HEADER + data.len()));
        buf.push(&[Command::PageProgram.into()]);
        buf.push(&addr);
        buf.push(data);
        buf.push(&mpsse::chip_deselect(self.pins));

        if let Some(us) = page_program_us {
            let idle = self.clock.idle_bytes_for(us);
            if idle > 0 {
                buf.push(&mpsse::wait_mask(idle));
            }
        }
        Ok(())
    }

    /// Program up to one page of data at `address` immediately.
    ///
    /// The caller should wait for programming to complete with `wait_ready()`.
    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut buf = CommandBuffer::with_capacity(data.len() + 32);
        self.prepare_page_program(&mut buf, address, data, None)?;
        self.send(&buf)
    }

    /// Send a prepared command buffer in a single transfer.
    pub fn send(&mut self, buf: &CommandBuffer) -> Result<()> {
        log::trace!("Sending {} byte command buffer", buf.len());
        Ok(self.transport.write(buf.as_bytes())?)
    }

    /// Read `length` bytes of data from the flash, starting at `address`.
    ///
    /// Uses the legacy ReadData instruction, which requires no dummy byte.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let addr = make_address(address)?;
        self.exchange(Command::ReadData, &addr, length)
    }

    /// Read status register 1.
    pub fn read_status(&mut self) -> Result<StatusRegister1> {
        let rx = self.exchange(Command::ReadStatusRegister1, &[], 1)?;
        Ok(StatusRegister1(rx[0]))
    }

    /// Check if the flash is busy performing an erase or program.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status().map(|status| status.get_busy())
    }

    /// Poll the status register every `poll` until the flash is no longer busy.
    ///
    /// Fails with `WaitTimeout` once more than `budget` has elapsed with the
    /// flash still busy.
    pub fn wait_ready(&mut self, poll: Duration, budget: Duration) -> Result<()> {
        let t0 = Instant::now();
        while self.is_busy()? {
            thread::sleep(poll);
            if t0.elapsed() > budget {
                log::error!("Flash still busy after {:?}", t0.elapsed());
                return Err(Error::WaitTimeout(budget));
            }
        }
        log::trace!("Flash ready after {:?}", t0.elapsed());
        Ok(())
    }

    /// Writes `command` and `data` to the flash memory, then returns `nbytes` of response.
    ///
    /// Filler bytes of 0xFF are clocked out while the response is sampled,
    /// and the bytes sampled during the command and `data` are discarded.
    fn exchange(&mut self, command: Command, data: &[u8], nbytes: usize) -> Result<Vec<u8>> {
        let total = 1 + data.len() + nbytes;
        if total > MAX_TRANSFER {
            return Err(Error::TransferTooLong(total));
        }
        log::trace!("SPI exchange: write {:02X} {:02X?}, read {} bytes",
                    u8::from(command), data, nbytes);
        let mut buf = CommandBuffer::with_capacity(total + 9);
        buf.push(&mpsse::chip_select(self.pins));
        buf.push(&mpsse::data_out_in(total));
        buf.push(&[command.into()]);
        buf.push(data);
        buf.fill(0xFF, nbytes);
        buf.push(&mpsse::chip_deselect(self.pins));
        self.transport.write(buf.as_bytes())?;

        let mut rx = vec![0u8; total];
        self.transport.read(&mut rx)?;
        Ok(rx.split_off(1 + data.len()))
    }

    /// Writes `command` and `data` to the flash memory, without reading the response.
    fn write(&mut self, command: Command, data: &[u8]) -> Result<()> {
        log::trace!("SPI write: {:02X} {:02X?}", u8::from(command), data);
        let mut buf = CommandBuffer::with_capacity(data.len() + 10);
        buf.push(&mpsse::chip_select(self.pins));
        buf.push(&mpsse::data_out(1 + data.len()));
        buf.push(&[command.into()]);
        buf.push(data);
        buf.push(&mpsse::chip_deselect(self.pins));
        Ok(self.transport.write(buf.as_bytes())?)
    }

    /// Convenience method for issuing a single command with no address or data.
    fn command(&mut self, command: Command) -> Result<()> {
        self.write(command, &[])
    }
}

/// Generate a 3-byte big-endian address.
fn make_address(address: u32) -> Result<[u8; 3]> {
    if address > 0x00FF_FFFF {
        return Err(Error::InvalidAddress(address));
    }
    let bytes = address.to_be_bytes();
    Ok([bytes[1], bytes[2], bytes[3]])
}

/// SPI flash command opcodes used by this driver.
///
/// These are taken from the Winbond W25Q128JV datasheet and are widely
/// supported by other single I/O SPI NOR flashes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    WriteEnable = 0x06,
    ReadData = 0x03,
    PageProgram = 0x02,
    ReadStatusRegister1 = 0x05,
    ReadJEDECID = 0x9F,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,
    ChipErase = 0xC7,
    BlockErase64 = 0xD8,
}

/// Status Register 1
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    /// Get BUSY bit.
    pub fn get_busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }
}
