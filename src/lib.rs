// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! mpsseflash
//!
//! SPI flash programming utility using FTDI MPSSE adapters.

pub mod transport;
pub mod ftdi;
pub mod mpsse;
pub mod registry;
pub mod flash;
pub mod session;
pub mod program;

#[cfg(test)]
mod sim;

pub use crate::flash::Flash;
pub use crate::ftdi::{FtdiConfig, FtdiInfo, FtdiTransport};
pub use crate::mpsse::{Clock, Pins};
pub use crate::program::{run, Erase, Mode, NoProgress, Phase, Progress};
pub use crate::registry::Part;
pub use crate::transport::Transport;
