// src/exec/channel.rs

//! Descriptor-based channels between a manager and its slaves.
//!
//! A slave gets two unidirectional channels, passed as inherited file
//! descriptors whose numbers travel in environment variables:
//!
//! - the *initial-state* channel (manager -> child) carries an
//!   [`InitialState`]. It is an unlinked temporary file written before the
//!   child starts, so the manager never waits on a child that does not read
//!   it,
//! - the *result* channel (child -> manager) carries a [`SlaveReport`]
//!   written once when the child is done.
//!
//! Payloads are JSON. A truncated result payload (child crashed halfway)
//! simply fails to decode.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use serde::Serialize;

use crate::errors::Result;
use crate::types::SlaveReport;

/// Env var holding the fd of a slave's initial-state channel.
pub const SLAVE_INITIAL_STATE_ENV: &str = "RESPAWN_SLAVE_INITIAL_STATE";
/// Env var holding the fd of a slave's result channel.
pub const SLAVE_RESULT_ENV: &str = "RESPAWN_SLAVE_RESULT";
/// Env var holding the fd of the snapshot handed over across a re-exec.
pub const INITIAL_STATE_ENV: &str = "RESPAWN_INITIAL_STATE";

const READ_CHUNK: usize = 4096;

/// Create a pipe. Both ends are close-on-exec; see [`clear_cloexec`].
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (reader, writer) = io::pipe()?;
    Ok((reader.into(), writer.into()))
}

/// Let `fd` survive `exec`.
///
/// Only calls `fcntl`, so it is safe to use from a `pre_exec` hook.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor has no memory effects.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Make `fd` close-on-exec again, so it is not leaked to grandchildren.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor has no memory effects.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Serialize `payload` into `out` and flush it.
pub fn write_payload<W: Write, T: Serialize>(mut out: W, payload: &T) -> Result<()> {
    serde_json::to_writer(&mut out, payload)?;
    out.flush()?;
    Ok(())
}

/// Write `payload` to an unlinked temporary file and rewind it, ready to be
/// inherited by a child. The file is close-on-exec like any other.
pub fn snapshot_file<T: Serialize>(payload: &T) -> Result<File> {
    let mut file = tempfile::tempfile()?;
    write_payload(&mut file, payload)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

pub fn decode_report(bytes: &[u8]) -> Result<SlaveReport> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Manager-side read end of a result channel.
///
/// Non-blocking: [`ResultChannel::drain`] takes whatever is queued in the
/// pipe and returns, so it can be called on a live child to keep the pipe
/// from filling up.
#[derive(Debug)]
pub struct ResultChannel {
    file: File,
    buffer: Vec<u8>,
    eof: bool,
}

impl ResultChannel {
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            file: File::from(fd),
            buffer: Vec::new(),
            eof: false,
        })
    }

    /// Read until EOF or until the pipe would block.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            match self.file.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
