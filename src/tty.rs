//!
//! Server-side `CONSOLE_TTY` device setup: opens a local serial device and
//! configures its baud rate, parity and stop bits via `nix::sys::termios`
//!.
//!

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg};

use crate::error::{Error, Result};
use crate::object::Parity;

fn baud_rate(baud: u32) -> Result<BaudRate> {
    match baud {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(Error::Protocol(format!("unsupported baud rate: {}", other))),
    }
}

/// Opens `device_path` and applies the requested serial parameters,
/// returning the raw fd the mux will register with its poller.
///
/// Grounded in `other_examples/648fb5db_groblegark-coop__crates-cli-src-command-attach.rs.rs`'s
/// termios configuration style (construct a fresh `Termios`, flip the
/// handful of flags that matter, `tcsetattr` once).
pub fn open_console_tty(device_path: &str, baud: u32, parity: Parity, stop_bits: u8) -> Result<RawFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(device_path)?;
    let fd = file.as_raw_fd();

    let mut tio = termios::tcgetattr(fd)?;
    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate)?;
    termios::cfsetospeed(&mut tio, rate)?;

    use nix::sys::termios::{ControlFlags, InputFlags};
    tio.control_flags.remove(ControlFlags::PARENB | ControlFlags::PARODD);
    match parity {
        Parity::None => {}
        Parity::Even => tio.control_flags.insert(ControlFlags::PARENB),
        Parity::Odd => tio.control_flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }
    tio.input_flags.insert(InputFlags::IGNPAR);

    tio.control_flags.remove(ControlFlags::CSTOPB);
    if stop_bits == 2 {
        tio.control_flags.insert(ControlFlags::CSTOPB);
    }

    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)?;

    // Leak the File: ownership of the fd passes to the caller, which
    // registers it with the mio poller and closes it on teardown.
    std::mem::forget(file);
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_baud_rate() {
        let err = baud_rate(1_000_000).unwrap_err();
        match err {
            Error::Protocol(msg) => assert!(msg.contains("1000000")),
            _ => panic!("expected Protocol error"),
        }
    }

    #[test]
    fn accepts_standard_baud_rates() {
        assert!(baud_rate(9600).is_ok());
        assert!(baud_rate(115200).is_ok());
    }
}
