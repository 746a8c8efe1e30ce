// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Encoders for the FTDI MPSSE command stream.
//!
//! Everything in this module is pure: functions return byte sequences
//! which the flash driver assembles into `CommandBuffer`s and hands to a
//! transport for sending.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum number of bytes a single MPSSE clocking command can transfer.
pub const MAX_TRANSFER: usize = 65536;

/// MPSSE base clock for high-speed chips with the divide-by-5 prescaler disabled.
pub const BASE_CLOCK_HZ: u32 = 60_000_000;

/// Default clock divisor, giving a 3.33MHz SPI clock.
pub const DEFAULT_DIVISOR: u32 = 18;

/// MPSSE opcodes used to drive an SPI flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Clock bytes out on the falling edge, MSB first, no input sampling.
    ClockBytesOut = 0x11,
    /// Clock bytes out on the falling edge while sampling input on the rising edge.
    ClockBytesOutIn = 0x31,
    /// Clock for n*8 cycles with no data transfer.
    ClockBytes = 0x8F,
    SetBitsLow = 0x80,
    LoopbackEnd = 0x85,
    TckDivisor = 0x86,
    DisableClockDivide5 = 0x8A,
}

/// Values for the "set data bits low byte" command.
///
/// Bit 0 is SCK, bit 1 is DO, bit 2 is DI and bit 3 is CS. Only the CS bits
/// change between select and deselect; pin directions are fixed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pins {
    /// Output bits which make up the chip select.
    pub cs_bits: u8,
    /// Pin directions, 1 for output.
    pub pindir: u8,
}

impl Default for Pins {
    /// CS on bit 3; SCK, DO and CS as outputs, DI as input.
    fn default() -> Self {
        Pins { cs_bits: 0x08, pindir: 0x0b }
    }
}

/// MPSSE clock configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Clock {
    divisor: u32,
}

impl Clock {
    /// Create a clock configuration with the given divisor of the 60MHz base clock.
    ///
    /// Panics if `divisor` is odd or outside 2..=131072.
    pub fn new(divisor: u32) -> Self {
        assert!((2..=131072).contains(&divisor), "Clock::new: divisor out of range");
        assert!(divisor % 2 == 0, "Clock::new: divisor must be even");
        Clock { divisor }
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// MPSSE base clock in MHz.
    pub fn base_mhz(&self) -> f64 {
        BASE_CLOCK_HZ as f64 / 1e6
    }

    /// Resulting SPI clock in Hz.
    pub fn spi_hz(&self) -> f64 {
        BASE_CLOCK_HZ as f64 / self.divisor as f64
    }

    /// Time taken to clock one byte over SPI, in microseconds.
    pub fn byte_period_us(&self) -> f64 {
        8e6 / self.spi_hz()
    }

    /// Number of idle bytes to clock to cover `us` microseconds.
    ///
    /// Byte periods shorter than 1us are rounded up to 1us, and the result
    /// is clamped to a single MPSSE transfer.
    pub fn idle_bytes_for(&self, us: u32) -> usize {
        let period = self.byte_period_us().max(1.0);
        let count = (us as f64 / period) as usize;
        usize::min(count, MAX_TRANSFER)
    }

    /// Bytes to send once after entering MPSSE mode to configure the clock and pins.
    pub fn init_sequence(&self, pins: Pins) -> Vec<u8> {
        let div = (self.divisor / 2 - 1) as u16;
        let mut seq = vec![
            Opcode::DisableClockDivide5.into(),
            Opcode::TckDivisor.into(), div as u8, (div >> 8) as u8,
            Opcode::LoopbackEnd.into(),
        ];
        seq.extend(&chip_deselect(pins));
        // Single CS pulse, handy as a scope trigger.
        seq.extend(&chip_select(pins));
        seq.extend(&chip_deselect(pins));
        seq
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new(DEFAULT_DIVISOR)
    }
}

/// Drive CS low.
pub fn chip_select(pins: Pins) -> [u8; 3] {
    [Opcode::SetBitsLow.into(), 0x00, pins.pindir]
}

/// Drive CS high.
pub fn chip_deselect(pins: Pins) -> [u8; 3] {
    [Opcode::SetBitsLow.into(), pins.cs_bits, pins.pindir]
}

/// Header for clocking out `n` following payload bytes.
pub fn data_out(n: usize) -> [u8; 3] {
    header(Opcode::ClockBytesOut, n)
}

/// Header for clocking out `n` following payload bytes while sampling `n` bytes in.
pub fn data_out_in(n: usize) -> [u8; 3] {
    header(Opcode::ClockBytesOutIn, n)
}

/// Clock `n` bytes worth of cycles without transferring data, used to pace
/// the gap after a page program inside a single USB transfer.
pub fn wait_mask(n: usize) -> [u8; 3] {
    header(Opcode::ClockBytes, n)
}

/// Encode `opcode` with a length of `n`, sent as `n - 1` in little-endian.
///
/// Panics if `n` is 0 or exceeds `MAX_TRANSFER`.
fn header(opcode: Opcode, n: usize) -> [u8; 3] {
    assert!((1..=MAX_TRANSFER).contains(&n), "MPSSE transfer length {} out of range", n);
    let len = (n - 1) as u16;
    [opcode.into(), len as u8, (len >> 8) as u8]
}

/// Ordered MPSSE byte sequence sent to the adapter in one USB transfer.
///
/// Each select/deselect pair inside the buffer is one SPI transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CommandBuffer { data: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `n` copies of `byte`.
    pub fn fill(&mut self, byte: u8, n: usize) {
        self.data.resize(self.data.len() + n, byte);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
