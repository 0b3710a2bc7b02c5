//!
//! `LOGFILE` object support: lazily-opened append-mode files that mirror
//! console or client traffic to disk, with optional line-prefix
//! timestamping and SIGHUP-triggered reopen.
//!

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::object::TimestampMode;

fn timestamp_prefix() -> String {
    let now = chrono::Local::now();
    format!("[{}] ", now.format("%Y-%m-%d %H:%M:%S"))
}

/// A LOGFILE object's backing file handle plus the timestamping state
/// needed to decide when to emit a fresh marker. Not itself an `Object`'s
/// `ring`-bearing data path — `mux.rs` writes to it directly whenever a
/// CONSOLE or CLIENT with a linked logfile produces bytes.
pub struct LogWriter {
    path: String,
    mode: TimestampMode,
    file: Option<File>,
    at_line_start: bool,
}

impl LogWriter {
    pub fn new(path: impl Into<String>, mode: TimestampMode) -> Self {
        LogWriter {
            path: path.into(),
            mode,
            file: None,
            at_line_start: true,
        }
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let f = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Appends `bytes` to the logfile, opening it on first use, inserting a
    /// timestamp marker at the start of each line when `LinePrefix` mode is
    /// active.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mode = self.mode;
        let mut at_line_start = self.at_line_start;
        let file = self.ensure_open()?;
        if mode == TimestampMode::None {
            file.write_all(bytes)?;
        } else {
            for chunk in bytes.split_inclusive(|&b| b == b'\n') {
                if at_line_start {
                    file.write_all(timestamp_prefix().as_bytes())?;
                }
                file.write_all(chunk)?;
                at_line_start = chunk.last() == Some(&b'\n');
            }
        }
        self.at_line_start = at_line_start;
        Ok(())
    }

    /// Closes the underlying fd so the next `write` reopens it in append
    /// mode, picking up a file that `logrotate` (or similar) has renamed
    /// out from under the daemon. Invoked by the mux on SIGHUP.
    pub fn reopen(&mut self) {
        self.file = None;
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }
}
