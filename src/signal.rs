//!
//! Self-pipe signal plumbing: SIGHUP, SIGTERM and
//! SIGINT are caught by a minimal async-signal-safe handler that writes one
//! byte to a pipe, which `mux.rs` registers as an ordinary pollable fd.
//! Doing real work (closing logfiles, setting the drain flag) happens back
//! on the mux thread once it observes the byte, never inside the handler
//! itself.
//!
//! Grounded in the self-pipe pattern shown in
//! `other_examples/648fb5db_groblegark-coop__crates-cli-src-command-attach.rs.rs`
//! for `nix::sys::signal` usage style.
//!

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd;

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// One end of the self-pipe. Dropping this does not restore the previous
/// handlers: signal handling is process-global for the lifetime of
/// `conmand`.
pub struct SignalPipe {
    read_fd: RawFd,
}

impl SignalPipe {
    /// Creates the pipe and installs handlers for SIGHUP, SIGTERM and
    /// SIGINT. Must be called once, before the mux starts polling.
    pub fn install() -> io::Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().map_err(io::Error::from)?;
        set_nonblocking(write_fd)?;
        set_nonblocking(read_fd)?;
        WRITE_FD.store(write_fd, Ordering::Relaxed);

        let handler = SigHandler::Handler(on_signal);
        unsafe {
            signal::signal(Signal::SIGHUP, handler).map_err(io::Error::from)?;
            signal::signal(Signal::SIGTERM, handler).map_err(io::Error::from)?;
            signal::signal(Signal::SIGINT, handler).map_err(io::Error::from)?;
        }

        Ok(SignalPipe { read_fd })
    }

    /// Drains every pending wakeup byte, returning how many bytes were
    /// coalesced into this call (the self-pipe can only tell us "at least
    /// one signal happened", not which one — `conmand` checks
    /// `SignalFlags` for that).
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } {
                n if n > 0 => total += n as usize,
                _ => break,
            }
        }
        total
    }
}

impl AsRawFd for SignalPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// What the mux should do after observing bytes on the signal pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// SIGHUP: reopen logfiles.
    ReloadLogs,
    /// SIGTERM/SIGINT: begin draining and shut down.
    Shutdown,
}

/// Since the self-pipe can't tell signal types apart, `conmand` also keeps
/// a lock-free flag per signal, set from the handler's safe subset
/// (`AtomicBool::store` is async-signal-safe) and read from the mux loop.
/// The handler itself only ever touches the pipe; setting these flags is
/// `conmand`'s job via a second, thin handler registered for each signal
/// individually (see `bin/conmand.rs`).
pub struct SignalFlags {
    pub hup: AtomicBool,
    pub term: AtomicBool,
}

impl SignalFlags {
    pub fn new() -> Self {
        SignalFlags {
            hup: AtomicBool::new(false),
            term: AtomicBool::new(false),
        }
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn nonblocking_pipe_drains_without_pending_data() {
        let (r, _w) = unistd::pipe().unwrap();
        set_nonblocking(r).unwrap();
        let pipe = SignalPipe { read_fd: r };
        assert_eq!(pipe.drain(), 0);
    }

    #[test]
    fn drain_reports_written_bytes() {
        let (r, w) = unistd::pipe().unwrap();
        set_nonblocking(r).unwrap();
        set_nonblocking(w).unwrap();
        let mut wf = unsafe { std::fs::File::from_raw_fd(w) };
        wf.write_all(&[1, 1, 1]).unwrap();
        let pipe = SignalPipe { read_fd: r };
        assert_eq!(pipe.drain(), 3);
    }
}
