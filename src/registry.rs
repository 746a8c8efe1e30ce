// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Table of supported SPI flash memories, looked up by JEDEC ID.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Unable to identify flash memory: expected 3 ID bytes, got {0}.")]
    WrongLength(usize),
    #[error("Unknown flash memory with ID {:02X?}.", .0)]
    UnknownPart([u8; 3]),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Description of a supported flash memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub manufacturer: &'static str,
    pub manufacturer_id: u8,
    /// ID bits 15 to 8, the memory type.
    pub id15_id8: u8,
    /// ID bits 7 to 0, the capacity code.
    pub id7_id0: u8,
    pub name: &'static str,
    /// Capacity in bytes.
    pub capacity: usize,
    /// Page program time budget in microseconds.
    pub page_program_us: u32,
    /// 64kB block erase time budget in milliseconds.
    pub block_erase_ms: u32,
}

impl Part {
    /// The three-byte identification signature returned by the 0x9F command.
    pub fn signature(&self) -> [u8; 3] {
        [self.manufacturer_id, self.id15_id8, self.id7_id0]
    }
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}, {} bytes", self.manufacturer, self.name, self.capacity)
    }
}

const fn winbond(id15_id8: u8, id7_id0: u8, name: &'static str, capacity: usize) -> Part {
    Part {
        manufacturer: "Winbond",
        manufacturer_id: 0xEF,
        id15_id8,
        id7_id0,
        name,
        capacity,
        page_program_us: 800,
        block_erase_ms: 2000,
    }
}

const MB: usize = 1024 * 1024;

/// All supported flash memories.
///
/// Only 3-byte addressing is used, so parts larger than 16MB are not listed.
pub static PARTS: &[Part] = &[
    winbond(0x40, 0x15, "W25Q16JV-IQ", 2 * MB),
    winbond(0x40, 0x16, "W25Q32JV-IQ", 4 * MB),
    winbond(0x40, 0x17, "W25Q64JV-IQ", 8 * MB),
    winbond(0x40, 0x18, "W25Q128JV", 16 * MB),
    winbond(0x70, 0x16, "W25Q32JV-IM", 4 * MB),
    winbond(0x70, 0x17, "W25Q64JV-IM", 8 * MB),
    winbond(0x70, 0x18, "W25Q128JV-IM", 16 * MB),
];

/// Find the part matching the identification bytes `id`.
///
/// `id` must be exactly three bytes: manufacturer ID followed by the
/// two device ID bytes.
pub fn lookup(id: &[u8]) -> Result<&'static Part> {
    if id.len() != 3 {
        return Err(Error::WrongLength(id.len()));
    }
    let signature = [id[0], id[1], id[2]];
    PARTS.iter()
         .find(|part| part.signature() == signature)
         .ok_or(Error::UnknownPart(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_w25q128() {
        let part = lookup(&[0xEF, 0x40, 0x18]).unwrap();
        assert_eq!(part.name, "W25Q128JV");
        assert_eq!(part.capacity, 16 * 1024 * 1024);
        assert_eq!(part.page_program_us, 800);
        assert_eq!(part.block_erase_ms, 2000);
    }

    #[test]
    fn test_lookup_unknown() {
        assert_eq!(lookup(&[0xC2, 0x20, 0x18]), Err(Error::UnknownPart([0xC2, 0x20, 0x18])));
    }

    #[test]
    fn test_lookup_wrong_length() {
        assert_eq!(lookup(&[0xEF, 0x40]), Err(Error::WrongLength(2)));
        assert_eq!(lookup(&[0xEF, 0x40, 0x18, 0x00]), Err(Error::WrongLength(4)));
        assert_eq!(lookup(&[]), Err(Error::WrongLength(0)));
    }

    #[test]
    fn test_signatures_unique() {
        for (i, a) in PARTS.iter().enumerate() {
            for b in &PARTS[i + 1..] {
                assert_ne!(a.signature(), b.signature(), "{} and {}", a.name, b.name);
            }
        }
    }
}
