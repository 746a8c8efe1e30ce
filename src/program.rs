// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! End-to-end programming, verification and readback of an SPI flash.

use std::io::Write;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::flash::{self, Flash, PAGE_SIZE};
use crate::mpsse::CommandBuffer;
use crate::registry::Part;
use crate::session::{self, Session, State};
use crate::transport::Transport;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Verification failed at address 0x{address:06X}.")]
    VerifyMismatch { address: u32 },
    #[error("{length} bytes at 0x{offset:06X} do not fit in the {capacity} byte flash.")]
    AddressOutOfRange { offset: u32, length: usize, capacity: usize },
    #[error("Error writing image data")]
    ImageIo(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] session::Error),
    #[error("Flash error")]
    Flash(#[from] flash::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Size of the blocks erased by sector erase.
pub const BLOCK_SIZE: u32 = 0x10000;

/// Number of command bytes accumulated before a batch of page programs is sent.
pub const BATCH_LIMIT: usize = 64 * 1024;

/// Number of bytes fetched per read command when reading or verifying.
pub const READ_CHUNK: usize = 7 * 1024;

const BULK_ERASE_POLL: Duration = Duration::from_millis(1000);
const BULK_ERASE_BUDGET: Duration = Duration::from_secs(200);
const SECTOR_ERASE_POLL: Duration = Duration::from_millis(150);
const READY_POLL: Duration = Duration::from_millis(100);
const READY_BUDGET: Duration = Duration::from_millis(1000);
const BATCH_POLL: Duration = Duration::from_millis(50);
const BATCH_BUDGET: Duration = Duration::from_millis(100);

/// How to erase the flash before programming.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Erase {
    /// Erase every 64kB block touched by the image.
    Sectors,
    /// Erase the whole chip.
    Bulk,
    /// Do not erase.
    Skip,
}

/// What a run should do once the flash is identified.
pub enum Mode<'a> {
    /// Only identify the flash.
    Identify,
    /// Erase as requested, program `image`, and optionally verify it.
    Program { image: &'a [u8], erase: Erase, verify: bool },
    /// Erase the whole chip without programming anything.
    BulkErase,
    /// Compare the flash contents against `image`.
    Verify { image: &'a [u8] },
    /// Read `length` bytes and write them to `sink`.
    Read { length: usize, sink: &'a mut dyn Write },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Erase,
    Program,
    Read,
    Verify,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Phase::Erase => "Erasing",
            Phase::Program => "Programming",
            Phase::Read => "Reading",
            Phase::Verify => "Verifying",
        };
        f.write_str(name)
    }
}

/// Receiver for coarse progress notifications.
pub trait Progress {
    /// A phase covering `total` units of work is starting.
    ///
    /// `total` is 0 when the amount of work is not known in advance.
    fn begin(&mut self, _phase: Phase, _total: usize) {}

    /// The phase has reached `percent`, always a multiple of 10.
    fn step(&mut self, phase: Phase, percent: u32);

    fn end(&mut self, _phase: Phase) {}
}

/// Discards all progress notifications.
pub struct NoProgress;

impl Progress for NoProgress {
    fn step(&mut self, _phase: Phase, _percent: u32) {}
}

/// Turns a running byte count into notifications at each 10% boundary crossed.
struct Deciles {
    phase: Phase,
    total: usize,
    last: u32,
}

impl Deciles {
    fn begin(progress: &mut dyn Progress, phase: Phase, total: usize) -> Self {
        progress.begin(phase, total);
        Deciles { phase, total, last: 0 }
    }

    fn update(&mut self, progress: &mut dyn Progress, done: usize) {
        if self.total == 0 {
            return;
        }
        let percent = (done.min(self.total) * 100 / self.total) as u32 / 10 * 10;
        while self.last < percent {
            self.last += 10;
            progress.step(self.phase, self.last);
        }
    }

    fn end(self, progress: &mut dyn Progress) {
        progress.end(self.phase);
    }
}

/// Range of 64kB-aligned blocks which must be erased to program
/// `length` bytes at `offset`.
pub fn erase_range(offset: u32, length: usize) -> Range<u32> {
    let mask = !(BLOCK_SIZE as usize - 1);
    let begin = offset as usize & mask;
    let end = (offset as usize + length + BLOCK_SIZE as usize - 1) & mask;
    begin as u32 .. end as u32
}

/// Split `length` bytes starting at flash address `offset` into
/// page program chunks.
///
/// Yields the flash address of each chunk and its range within the image.
/// Only the first chunk may start part way through a page.
pub fn pages(offset: u32, length: usize) -> Pages {
    Pages { address: offset, position: 0, length }
}

pub struct Pages {
    address: u32,
    position: usize,
    length: usize,
}

impl Iterator for Pages {
    type Item = (u32, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.length {
            return None;
        }
        let room = PAGE_SIZE - (self.address as usize % PAGE_SIZE);
        let n = usize::min(room, self.length - self.position);
        let item = (self.address, self.position .. self.position + n);
        self.address += n as u32;
        self.position += n;
        Some(item)
    }
}

/// Identify the attached flash and carry out `mode` at `offset`.
///
/// The flash is powered down and the transport closed before returning,
/// whether or not the run succeeded. The first error encountered is
/// returned; errors during that cleanup are only logged if an earlier
/// error occurred.
pub fn run<T: Transport>(flash: Flash<T>, offset: u32, mode: Mode, progress: &mut dyn Progress)
    -> Result<&'static Part>
{
    let mut session = Session::new(flash);
    let result = execute(&mut session, offset, mode, progress);
    let closed = session.close();
    match (result, closed) {
        (Ok(part), Ok(())) => Ok(part),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            log::warn!("Error during cleanup: {}", cleanup);
            Err(e)
        },
    }
}

fn execute<T: Transport>(session: &mut Session<T>, offset: u32, mode: Mode,
                         progress: &mut dyn Progress)
    -> Result<&'static Part>
{
    let part = session.identify()?;
    let t0 = Instant::now();

    match mode {
        Mode::Identify => (),
        Mode::Program { image, erase: how, verify: check } => {
            check_range(part, offset, image.len())?;
            erase(session, part, offset, image.len(), how, progress)?;
            program(session, part, offset, image, progress)?;
            if check {
                verify(session, offset, image, progress)?;
            }
        },
        Mode::BulkErase => erase(session, part, offset, 0, Erase::Bulk, progress)?,
        Mode::Verify { image } => {
            check_range(part, offset, image.len())?;
            verify(session, offset, image, progress)?;
        },
        Mode::Read { length, sink } => {
            check_range(part, offset, length)?;
            read(session, offset, length, sink, progress)?;
        },
    }

    log::info!("Finished in {:.2}s", t0.elapsed().as_secs_f32());
    Ok(part)
}

fn check_range(part: &Part, offset: u32, length: usize) -> Result<()> {
    let end = (offset as usize).checked_add(length);
    if end.map_or(true, |end| end > part.capacity) {
        Err(Error::AddressOutOfRange { offset, length, capacity: part.capacity })
    } else {
        Ok(())
    }
}

/// Erase the flash ahead of programming `length` bytes at `offset`.
///
/// Each 64kB block erase is allowed the part's `block_erase_ms` to complete.
pub fn erase<T: Transport>(session: &mut Session<T>, part: &Part, offset: u32, length: usize,
                           how: Erase, progress: &mut dyn Progress)
    -> Result<()>
{
    match how {
        Erase::Skip => {
            log::info!("Skipping erase");
            return Ok(());
        },
        // Nothing to program, so no block needs erasing.
        Erase::Sectors if length == 0 => return Ok(()),
        _ => (),
    }

    session.set_state(State::Erasing);
    let budget = Duration::from_millis(part.block_erase_ms as u64);
    let flash = session.flash();

    if how == Erase::Bulk {
        log::info!("Erasing entire flash");
        let deciles = Deciles::begin(progress, Phase::Erase, 0);
        flash.write_enable()?;
        flash.bulk_erase()?;
        flash.wait_ready(BULK_ERASE_POLL, BULK_ERASE_BUDGET)?;
        deciles.end(progress);
        return Ok(());
    }

    let range = erase_range(offset, length);
    log::info!("Erasing 0x{:06X} to 0x{:06X}", range.start, range.end);
    let mut deciles = Deciles::begin(progress, Phase::Erase, (range.end - range.start) as usize);
    for address in range.clone().step_by(BLOCK_SIZE as usize) {
        flash.write_enable()?;
        flash.sector_erase_64k(address)?;
        flash.wait_ready(SECTOR_ERASE_POLL, budget)?;
        deciles.update(progress, (address + BLOCK_SIZE - range.start) as usize);
    }
    deciles.end(progress);
    Ok(())
}

/// Program `image` at `offset`, which must already be erased.
///
/// Page programs are accumulated into command buffers of about
/// `BATCH_LIMIT` bytes, each sent as one transfer and followed by
/// a single readiness check.
pub fn program<T: Transport>(session: &mut Session<T>, part: &Part, offset: u32, image: &[u8],
                             progress: &mut dyn Progress)
    -> Result<()>
{
    session.set_state(State::Programming);
    let flash = session.flash();
    flash.wait_ready(READY_POLL, READY_BUDGET)?;
    if image.is_empty() {
        return Ok(());
    }

    log::info!("Programming {} bytes at 0x{:06X}", image.len(), offset);
    let mut deciles = Deciles::begin(progress, Phase::Program, image.len());
    let mut buf = CommandBuffer::with_capacity(BATCH_LIMIT + 2 * PAGE_SIZE);
    for (address, range) in pages(offset, image.len()) {
        let done = range.end;
        flash.prepare_page_program(&mut buf, address, &image[range], Some(part.page_program_us))?;
        if buf.len() >= BATCH_LIMIT {
            send_batch(flash, &mut buf)?;
            deciles.update(progress, done);
        }
    }
    if !buf.is_empty() {
        send_batch(flash, &mut buf)?;
    }
    deciles.update(progress, image.len());
    deciles.end(progress);
    Ok(())
}

fn send_batch<T: Transport>(flash: &mut Flash<T>, buf: &mut CommandBuffer) -> Result<()> {
    log::debug!("Sending {} byte program batch", buf.len());
    flash.send(buf)?;
    buf.clear();
    flash.wait_ready(BATCH_POLL, BATCH_BUDGET)?;
    Ok(())
}

/// Compare the flash contents at `offset` against `image`.
///
/// Fails with the absolute flash address of the first differing byte.
pub fn verify<T: Transport>(session: &mut Session<T>, offset: u32, image: &[u8],
                            progress: &mut dyn Progress)
    -> Result<()>
{
    session.set_state(State::Verifying);
    log::info!("Verifying {} bytes at 0x{:06X}", image.len(), offset);
    let flash = session.flash();
    let mut deciles = Deciles::begin(progress, Phase::Verify, image.len());
    for (i, expected) in image.chunks(READ_CHUNK).enumerate() {
        let start = i * READ_CHUNK;
        let address = offset + start as u32;
        log::debug!("Verifying 0x{:06X} +0x{:X}", address, expected.len());
        let data = flash.read(address, expected.len())?;
        if let Some(idx) = data.iter().zip(expected).position(|(a, b)| a != b) {
            let address = address + idx as u32;
            log::error!("Expected 0x{:02X} at 0x{:06X}, read 0x{:02X}",
                        expected[idx], address, data[idx]);
            return Err(Error::VerifyMismatch { address });
        }
        deciles.update(progress, start + expected.len());
    }
    deciles.end(progress);
    Ok(())
}

/// Read `length` bytes from `offset`, writing them to `sink` in address order.
pub fn read<T: Transport>(session: &mut Session<T>, offset: u32, length: usize,
                          sink: &mut dyn Write, progress: &mut dyn Progress)
    -> Result<()>
{
    session.set_state(State::Reading);
    log::info!("Reading {} bytes from 0x{:06X}", length, offset);
    let flash = session.flash();
    let mut deciles = Deciles::begin(progress, Phase::Read, length);
    let mut start = 0;
    while start < length {
        let n = usize::min(READ_CHUNK, length - start);
        let address = offset + start as u32;
        log::debug!("Reading 0x{:06X} +0x{:X}", address, n);
        let data = flash.read(address, n)?;
        sink.write_all(&data)?;
        start += n;
        deciles.update(progress, start);
    }
    sink.flush()?;
    deciles.end(progress);
    Ok(())
}
