// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use crate::flash::{self, Flash};
use crate::registry::{self, Part};
use crate::transport::{self, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Flash error")]
    Flash(#[from] flash::Error),
    #[error("Identification failed")]
    Identification(#[from] registry::Error),
    #[error("Error releasing adapter")]
    Transport(#[from] transport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle of a programming session.
///
/// A session starts `Connected`, reaches `Identified` once the flash ID is
/// recognised, moves through the operation states, and always ends with
/// `PoweredDown` (when the power-down command was sent) and then `Closed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Connected,
    Identified,
    Erasing,
    Programming,
    Reading,
    Verifying,
    PoweredDown,
    Closed,
}

/// An open adapter with a flash attached, tracking what has been done to it.
pub struct Session<T: Transport> {
    flash: Flash<T>,
    part: Option<&'static Part>,
    state: State,
}

impl<T: Transport> Session<T> {
    pub fn new(flash: Flash<T>) -> Self {
        Session { flash, part: None, state: State::Connected }
    }

    pub fn flash(&mut self) -> &mut Flash<T> {
        &mut self.flash
    }

    /// The identified part, if `identify()` has succeeded.
    pub fn part(&self) -> Option<&'static Part> {
        self.part
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        if state != self.state {
            log::debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Wake the flash and identify it from its JEDEC ID.
    pub fn identify(&mut self) -> Result<&'static Part> {
        // Always bring flash out of power-down before trying to access it.
        self.flash.power_up()?;
        let id = self.flash.identify()?;
        let part = registry::lookup(&id)?;
        log::info!("Found {} (ID {:02X?})", part, id);
        self.part = Some(part);
        self.set_state(State::Identified);
        Ok(part)
    }

    /// Put the flash into deep power-down.
    pub fn power_down(&mut self) -> Result<()> {
        self.flash.power_down()?;
        self.set_state(State::PoweredDown);
        Ok(())
    }

    /// Put the flash into power-down and release the adapter.
    ///
    /// The adapter is released even if power-down fails; the first
    /// failure is returned. Closing a closed session does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        let powerdown = self.power_down();
        if let Err(e) = &powerdown {
            log::warn!("Could not power down flash: {}", e);
        }
        let release = self.flash.close();
        if let Err(e) = &release {
            log::warn!("Could not release adapter: {}", e);
        }
        self.set_state(State::Closed);
        powerdown?;
        release?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpsse::{Clock, Pins};
    use crate::sim::SimFlash;

    fn session(sim: &mut SimFlash) -> Session<&mut SimFlash> {
        Session::new(Flash::new(sim, Clock::default(), Pins::default()))
    }

    #[test]
    fn test_identify() {
        let mut sim = SimFlash::new([0xEF, 0x40, 0x18], 0x10000);
        sim.powered_down = true;
        let mut s = session(&mut sim);
        assert_eq!(s.state(), State::Connected);
        let part = s.identify().unwrap();
        assert_eq!(part.name, "W25Q128JV");
        assert_eq!(s.part(), Some(part));
        assert_eq!(s.state(), State::Identified);
        s.close().unwrap();
        assert_eq!(s.state(), State::Closed);
        s.close().unwrap();
        drop(s);
        assert!(sim.powered_down);
        assert_eq!(sim.closed, 1);
        let ops: Vec<u8> = sim.log.iter().map(|t| t.opcode).collect();
        assert_eq!(ops, vec![0xAB, 0x9F, 0xB9]);
    }

    #[test]
    fn test_identify_unknown() {
        let mut sim = SimFlash::new([0xC2, 0x20, 0x18], 0x10000);
        let mut s = session(&mut sim);
        match s.identify() {
            Err(Error::Identification(registry::Error::UnknownPart(id))) => {
                assert_eq!(id, [0xC2, 0x20, 0x18]);
            },
            r => panic!("unexpected result {:?}", r.map(|p| p.name)),
        }
        assert_eq!(s.part(), None);
        assert_eq!(s.state(), State::Connected);
    }

    #[test]
    fn test_close_after_disconnect() {
        let mut sim = SimFlash::new([0xEF, 0x40, 0x18], 0x10000);
        sim.disconnect_after_writes = Some(2);
        let mut s = session(&mut sim);
        s.identify().unwrap();
        assert!(matches!(s.close(), Err(Error::Flash(flash::Error::Transport(
            transport::Error::Disconnected)))));
        // Power down failed, but the adapter is still released.
        assert_eq!(s.state(), State::Closed);
        drop(s);
        assert_eq!(sim.closed, 1);
    }

    #[test]
    fn test_power_down_state() {
        let mut sim = SimFlash::new([0xEF, 0x40, 0x18], 0x10000);
        let mut s = session(&mut sim);
        s.identify().unwrap();
        s.power_down().unwrap();
        assert_eq!(s.state(), State::PoweredDown);
        s.close().unwrap();
        drop(s);
        let ops: Vec<u8> = sim.log.iter().map(|t| t.opcode).collect();
        assert_eq!(ops, vec![0xAB, 0x9F, 0xB9, 0xB9]);
    }
}
