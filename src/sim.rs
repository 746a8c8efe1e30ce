// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Simulated MPSSE adapter with a single I/O SPI NOR flash attached.
//!
//! The simulator parses the MPSSE byte stream written to it, frames SPI
//! transactions on the chip-select edges, and executes each one against
//! an in-memory flash array when CS is released. Bytes sampled by
//! clock-out-and-in commands are queued for the host to read back.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::mem;

use crate::mpsse::{Opcode, Pins};
use crate::transport::{Error, Result, Transport};

/// One completed SPI transaction, recorded when CS was released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub opcode: u8,
    /// Address for commands which carry one.
    pub address: Option<u32>,
    /// Bytes clocked after the opcode and address.
    pub payload: usize,
    /// State of the write enable latch when the transaction started.
    pub write_enabled: bool,
    /// Set if the flash ignored the command because it was busy or powered down.
    pub ignored: bool,
}

pub struct SimFlash {
    pub memory: Vec<u8>,
    pub id: [u8; 3],
    pins: Pins,
    selected: bool,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    wel: bool,
    busy: usize,
    busy_from_program: bool,

    /// Number of status polls reporting busy after an erase.
    pub erase_busy_polls: usize,
    /// Number of status polls reporting busy after a page program,
    /// unless idle clocks are sent first.
    pub program_busy_polls: usize,
    /// Report busy forever.
    pub stuck_busy: bool,
    pub powered_down: bool,

    /// Every transaction, in order.
    pub log: Vec<Transaction>,
    /// Every host write, in order.
    pub writes: Vec<Vec<u8>>,
    /// Length of each idle clock command.
    pub waits: Vec<usize>,

    /// Largest number of bytes returned by one `read_raw()`.
    pub max_read_fragment: usize,
    /// Accept at most this many bytes per write, without processing them.
    pub accept_limit: Option<usize>,
    /// Fail every transfer as if the adapter had been unplugged.
    pub disconnected: bool,
    /// Become disconnected after this many further host writes.
    pub disconnect_after_writes: Option<usize>,
    /// Become disconnected once a transaction starts with this SPI opcode,
    /// failing the write that carries it.
    pub disconnect_on: Option<u8>,
    /// Number of times the host closed the adapter.
    pub closed: usize,
}

impl SimFlash {
    /// Create a blank, erased flash of `size` bytes answering with `id`.
    pub fn new(id: [u8; 3], size: usize) -> Self {
        SimFlash {
            memory: vec![0xFF; size],
            id,
            pins: Pins::default(),
            selected: false,
            tx: Vec::new(),
            rx: VecDeque::new(),
            wel: false,
            busy: 0,
            busy_from_program: false,
            erase_busy_polls: 1,
            program_busy_polls: 1,
            stuck_busy: false,
            powered_down: false,
            log: Vec::new(),
            writes: Vec::new(),
            waits: Vec::new(),
            max_read_fragment: usize::MAX,
            accept_limit: None,
            disconnected: false,
            disconnect_after_writes: None,
            disconnect_on: None,
            closed: 0,
        }
    }

    /// Transactions with the given opcode which the flash acted on.
    pub fn executed(&self, opcode: u8) -> Vec<&Transaction> {
        self.log.iter().filter(|t| t.opcode == opcode && !t.ignored).collect()
    }

    fn is_busy(&self) -> bool {
        self.stuck_busy || self.busy > 0
    }

    fn status(&self) -> u8 {
        (self.is_busy() as u8) | ((self.wel as u8) << 1)
    }

    fn index(&self, address: usize) -> usize {
        address % self.memory.len()
    }

    fn process(&mut self, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let opcode = Opcode::try_from(data[i])
                .unwrap_or_else(|_| panic!("unexpected MPSSE opcode 0x{:02X}", data[i]));
            match opcode {
                Opcode::SetBitsLow => {
                    assert_eq!(data[i + 2], self.pins.pindir, "pin directions changed");
                    self.set_cs(data[i + 1] & self.pins.cs_bits != 0);
                    i += 3;
                },
                Opcode::ClockBytesOut | Opcode::ClockBytesOutIn => {
                    let n = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize + 1;
                    assert!(self.selected, "data clocked with CS high");
                    for &byte in &data[i + 3..i + 3 + n] {
                        let response = self.clock_byte(byte);
                        if opcode == Opcode::ClockBytesOutIn {
                            self.rx.push_back(response);
                        }
                    }
                    i += 3 + n;
                },
                Opcode::ClockBytes => {
                    let n = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize + 1;
                    self.waits.push(n);
                    if self.busy_from_program && !self.stuck_busy {
                        self.busy = 0;
                    }
                    i += 3;
                },
                Opcode::TckDivisor => i += 3,
                Opcode::LoopbackEnd | Opcode::DisableClockDivide5 => i += 1,
            }
        }
    }

    fn set_cs(&mut self, high: bool) {
        if high && self.selected {
            self.execute();
        }
        self.selected = !high;
    }

    /// Shift one byte into the flash, returning the byte it shifts out.
    fn clock_byte(&mut self, byte: u8) -> u8 {
        let pos = self.tx.len();
        self.tx.push(byte);
        if pos == 0 && self.disconnect_on == Some(byte) {
            self.disconnected = true;
        }
        if pos == 0 || self.powered_down {
            return 0xFF;
        }
        match self.tx[0] {
            0x9F if pos <= 3 => self.id[pos - 1],
            0x05 => self.status(),
            0x03 if pos >= 4 && !self.is_busy() => {
                let address = be24(&self.tx[1..4]) as usize;
                self.memory[self.index(address + pos - 4)]
            },
            _ => 0xFF,
        }
    }

    fn execute(&mut self) {
        let tx = mem::take(&mut self.tx);
        if tx.is_empty() {
            return;
        }
        let opcode = tx[0];
        let address = match opcode {
            0x02 | 0x03 | 0xD8 if tx.len() >= 4 => Some(be24(&tx[1..4])),
            _ => None,
        };
        let header = if address.is_some() { 4 } else { 1 };
        let ignored = match opcode {
            0xAB => false,
            0x05 => self.powered_down,
            _ => self.powered_down || self.is_busy(),
        };
        self.log.push(Transaction {
            opcode,
            address,
            payload: tx.len() - header,
            write_enabled: self.wel,
            ignored,
        });

        if opcode == 0x05 {
            if !ignored && self.busy > 0 {
                self.busy -= 1;
            }
            return;
        }
        if ignored {
            return;
        }

        match opcode {
            0x06 => self.wel = true,
            0xAB => self.powered_down = false,
            0xB9 => self.powered_down = true,
            0xC7 if self.wel => {
                self.memory.iter_mut().for_each(|b| *b = 0xFF);
                self.start_busy(self.erase_busy_polls, false);
            },
            0xD8 if self.wel => {
                if let Some(address) = address {
                    let base = address as usize & !0xFFFF;
                    for i in 0..0x10000 {
                        let idx = self.index(base + i);
                        self.memory[idx] = 0xFF;
                    }
                    self.start_busy(self.erase_busy_polls, false);
                }
            },
            0x02 if self.wel => {
                if let Some(address) = address {
                    let address = address as usize;
                    for (i, &byte) in tx[4..].iter().enumerate() {
                        // Addresses wrap within the page.
                        let a = (address & !0xFF) | ((address + i) & 0xFF);
                        let idx = self.index(a);
                        self.memory[idx] &= byte;
                    }
                    self.start_busy(self.program_busy_polls, true);
                }
            },
            _ => (),
        }
    }

    fn start_busy(&mut self, polls: usize, program: bool) {
        self.wel = false;
        self.busy = polls;
        self.busy_from_program = program;
    }
}

fn be24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

impl Transport for SimFlash {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(n) = self.disconnect_after_writes {
            if n == 0 {
                self.disconnected = true;
            } else {
                self.disconnect_after_writes = Some(n - 1);
            }
        }
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        self.writes.push(data.to_vec());
        if let Some(limit) = self.accept_limit {
            return Ok(usize::min(limit, data.len()));
        }
        self.process(data);
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        assert!(buf.is_empty() || !self.rx.is_empty(), "host read with no data pending");
        let n = usize::min(usize::min(buf.len(), self.rx.len()), self.max_read_fragment);
        for (dst, src) in buf[..n].iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        self.closed += 1;
        Ok(())
    }
}
