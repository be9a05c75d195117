/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! POSIX FIFOs used to chain external client process threads. FIFO index
//! `i` is the ack point between positions `i - 1` and `i` of the scheduled
//! order: each external client reads one byte from FIFO `n` and writes one
//! byte to FIFO `n + 1`; the engine writes the head of each subgraph and
//! reads the tail.

use crate::config::ServerContext;
use std::{
    ffi::CString,
    io::{self, Error},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Readable,
    TimedOut,
    /// POLLERR / POLLHUP / POLLNVAL: the peer went away.
    Lost,
}

#[derive(Debug)]
pub struct Fifo {
    fd: i32,
    path: PathBuf,
}

// The fd is used from one thread at a time per direction; byte reads and
// writes on a FIFO are atomic.
unsafe impl Send for Fifo {}
unsafe impl Sync for Fifo {}

fn mkfifo_if_missing(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::other("path contains NUL"))?;
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) } < 0 {
        let err = Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

fn open_fifo(path: &Path, flags: i32) -> io::Result<i32> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::other("path contains NUL"))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o666) };
    if fd < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(fd)
    }
}

impl Fifo {
    /// Engine side: non-blocking so a missing peer can never stall the
    /// cycle; readability is established with `poll` first.
    pub fn open_nonblocking(path: &Path) -> io::Result<Self> {
        mkfifo_if_missing(path)?;
        let fd = open_fifo(path, libc::O_RDWR | libc::O_NONBLOCK)?;
        debug!("opened fifo {} (fd {fd})", path.to_string_lossy());
        Ok(Self {
            fd,
            path: path.to_owned(),
        })
    }

    /// Client side: blocking reads drive the process thread.
    pub fn open_blocking(path: &Path) -> io::Result<Self> {
        mkfifo_if_missing(path)?;
        let fd = open_fifo(path, libc::O_RDWR)?;
        Ok(Self {
            fd,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_byte(&self) -> io::Result<()> {
        let byte = 0u8;
        let written = unsafe { libc::write(self.fd, (&raw const byte).cast(), 1) };
        if written != 1 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Blocks until one byte arrives. Only valid on a blocking fd.
    pub fn read_byte(&self) -> io::Result<()> {
        let mut byte = 0u8;
        loop {
            let read = unsafe { libc::read(self.fd, (&raw mut byte).cast(), 1) };
            if read == 1 {
                return Ok(());
            }
            let err = Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Non-blocking read of one byte; Ok(false) when nothing is pending.
    pub fn try_read_byte(&self) -> io::Result<bool> {
        let mut byte = 0u8;
        let read = unsafe { libc::read(self.fd, (&raw mut byte).cast(), 1) };
        if read == 1 {
            return Ok(true);
        }
        let err = Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn poll_readable(&self, timeout_ms: i32) -> io::Result<PollOutcome> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(PollOutcome::TimedOut);
            }
            return Err(err);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Ok(PollOutcome::Lost);
        }
        if pfd.revents & libc::POLLIN != 0 {
            return Ok(PollOutcome::Readable);
        }
        Ok(PollOutcome::TimedOut)
    }

    /// Throws away bytes left over from an interrupted cycle.
    pub fn drain(&self) {
        while matches!(self.try_read_byte(), Ok(true)) {}
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// The engine's FIFO ring, grown on demand during rechain.
pub struct FifoRing {
    context: ServerContext,
    engine_pid: u32,
    fifos: Vec<Option<Fifo>>,
}

impl FifoRing {
    pub fn new(context: ServerContext) -> Self {
        Self {
            context,
            engine_pid: std::process::id(),
            fifos: Vec::new(),
        }
    }

    pub fn get_or_create(&mut self, index: u32) -> io::Result<&Fifo> {
        let idx = index as usize;
        if idx >= self.fifos.len() {
            self.fifos.resize_with(idx + 16, || None);
        }
        if self.fifos[idx].is_none() {
            let path = self.context.fifo_path(self.engine_pid, index);
            self.fifos[idx] = Some(Fifo::open_nonblocking(&path)?);
        }
        Ok(self.fifos[idx].as_ref().expect("fifo slot just filled"))
    }

    pub fn get(&self, index: u32) -> Option<&Fifo> {
        self.fifos.get(index as usize).and_then(Option::as_ref)
    }

    pub fn clear_all(&self) {
        for fifo in self.fifos.iter().flatten() {
            fifo.drain();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_context() -> ServerContext {
        ServerContext::new(
            &format!("fifo-test-{}", std::process::id()),
            Some(std::env::temp_dir()),
            false,
        )
    }

    #[test]
    fn fifo_byte_round_trip_works() {
        let ctx = test_context();
        std::fs::create_dir_all(ctx.server_dir()).expect("mkdir failed");
        let path = ctx.fifo_path(std::process::id(), 0);
        let fifo = Fifo::open_nonblocking(&path).expect("open failed");

        assert_eq!(
            fifo.poll_readable(0).expect("poll failed"),
            PollOutcome::TimedOut
        );
        fifo.write_byte().expect("write failed");
        assert_eq!(
            fifo.poll_readable(100).expect("poll failed"),
            PollOutcome::Readable
        );
        assert!(fifo.try_read_byte().expect("read failed"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn drain_discards_stale_bytes() {
        let ctx = test_context();
        std::fs::create_dir_all(ctx.server_dir()).expect("mkdir failed");
        let path = ctx.fifo_path(std::process::id(), 1);
        let fifo = Fifo::open_nonblocking(&path).expect("open failed");
        fifo.write_byte().expect("write failed");
        fifo.write_byte().expect("write failed");
        fifo.drain();
        assert!(!fifo.try_read_byte().expect("read failed"));
        let _ = std::fs::remove_file(&path);
    }
}
