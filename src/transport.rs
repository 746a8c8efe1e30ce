// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! The transport module is the lowest layer the flash driver talks to.
//! It turns the byte-oriented pipes of a USB adapter into exact-count
//! writes and reads, and reports short transfers and disconnects as
//! typed errors.

use std::{thread, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("short write: wrote {actual} bytes, expected {expected}.")]
    ShortWrite { actual: usize, expected: usize },
    #[error("USB device not connected.")]
    Disconnected,
    #[error("driver error {code}: {message}")]
    Driver { code: i32, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Delay between polls of the read pipe while waiting for more data.
pub const READ_POLL_DELAY: Duration = Duration::from_micros(100);

/// Trait for byte pipes which can carry MPSSE command streams.
///
/// Implementors provide `write_raw()` and `read_raw()`, which may transfer
/// fewer bytes than requested. The provided `write()` and `read()` build the
/// exact-count semantics the flash driver relies on.
pub trait Transport {
    /// Write as much of `data` as possible, returning the number of bytes written.
    fn write_raw(&mut self, data: &[u8]) -> Result<usize>;

    /// Read whatever data is currently available into `buf`, returning
    /// the number of bytes read, which may be zero.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Configure the transfer sizes used for the underlying read and write pipes.
    fn set_chunk_sizes(&mut self, _read: usize, _write: usize) -> Result<()> {
        Ok(())
    }

    /// Release the underlying device.
    ///
    /// Closing an already closed transport does nothing.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write all of `data`, failing if any byte is not accepted.
    fn write(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("TX: {} bytes", data.len());
        let written = self.write_raw(data)?;
        if written != data.len() {
            return Err(Error::ShortWrite { actual: written, expected: data.len() });
        }
        Ok(())
    }

    /// Fill `buf` completely, polling the read pipe until enough data arrives.
    ///
    /// There is no timeout here; callers which need one must bound the
    /// operations that lead to data being returned.
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_raw(&mut buf[filled..])?;
            if filled < buf.len() {
                thread::sleep(READ_POLL_DELAY);
            }
        }
        log::trace!("RX: {:02X?}", &buf[..usize::min(buf.len(), 16)]);
        Ok(())
    }
}

impl<T: Transport> Transport for &mut T {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_raw(data)
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_raw(buf)
    }

    fn set_chunk_sizes(&mut self, read: usize, write: usize) -> Result<()> {
        (**self).set_chunk_sizes(read, write)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Pipe which accepts a limited number of bytes and returns queued data in fragments.
    struct Pipe {
        accept: usize,
        rx: VecDeque<u8>,
        fragment: usize,
        reads: usize,
        fail_after: Option<usize>,
        closed: usize,
    }

    impl Transport for Pipe {
        fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
            Ok(usize::min(self.accept, data.len()))
        }

        fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.reads += 1;
            if let Some(n) = self.fail_after {
                if self.reads > n {
                    return Err(Error::Disconnected);
                }
            }
            // Every other poll returns nothing, as an idle FTDI pipe does.
            if self.reads % 2 == 0 {
                return Ok(0);
            }
            let n = usize::min(usize::min(self.fragment, buf.len()), self.rx.len());
            for b in buf[..n].iter_mut() {
                *b = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }
    }

    fn pipe(accept: usize, rx: &[u8], fragment: usize) -> Pipe {
        Pipe { accept, rx: rx.iter().copied().collect(), fragment, reads: 0, fail_after: None,
               closed: 0 }
    }

    #[test]
    fn test_write_exact() {
        let mut p = pipe(16, &[], 1);
        assert!(p.write(&[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_short_write() {
        let mut p = pipe(2, &[], 1);
        match p.write(&[1, 2, 3]) {
            Err(Error::ShortWrite { actual: 2, expected: 3 }) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn test_read_accumulates_fragments() {
        let mut p = pipe(0, &[1, 2, 3, 4, 5, 6, 7], 3);
        let mut buf = [0u8; 7];
        p.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7]);
        assert!(p.reads > 3);
    }

    #[test]
    fn test_read_disconnect() {
        let mut p = pipe(0, &[1, 2], 1);
        p.fail_after = Some(2);
        let mut buf = [0u8; 4];
        assert!(matches!(p.read(&mut buf), Err(Error::Disconnected)));
    }

    #[test]
    fn test_close_through_reference() {
        fn finish<T: Transport>(mut t: T) -> Result<()> {
            t.write(&[1])?;
            t.close()
        }
        let mut p = pipe(16, &[], 1);
        finish(&mut p).unwrap();
        assert_eq!(p.closed, 1);
    }
}
