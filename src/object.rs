//!
//! The object model: every participant in the I/O graph (listener,
//! console, client, logfile) is represented uniformly by an `Object`
//! carrying a ring buffer and a set of reader/writer edges, keyed by a
//! stable `Handle` rather than linked by direct reference (see
//! DESIGN.md).
//!

use std::collections::HashSet;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::ring::{RingBuffer, DEFAULT_CAPACITY};

/// Opaque, stable identifier for an object in the registry. Never reused:
/// the registry hands out a monotonically increasing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

/// The escape-sequence interception state machine for a CLIENT. Mutable
/// only by the mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeState {
    Idle,
    AwaitSecondByte,
}

impl Default for EscapeState {
    fn default() -> Self {
        EscapeState::Idle
    }
}

/// Attributes specific to a CLIENT object.
#[derive(Debug, Clone)]
pub struct ClientAttrs {
    pub remote_ip: SocketAddr,
    pub remote_host: Option<String>,
    pub user: String,
    /// True once this client has been linked as a writer of some console.
    pub write_enabled: bool,
    pub broadcast: bool,
    pub escape_state: EscapeState,
    pub quiet: bool,
    /// If set, this client's CONNECT included OPTION=JOIN; used when it is
    /// later force-displaced.
    pub requested_join: bool,
    pub linked_logfile: Option<Handle>,
}

/// Parity settings for a CONSOLE_TTY device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Attributes specific to a CONSOLE_TTY object. The exclusive writer
/// is not duplicated here — it is derived from
/// `Object::writers`, which `Registry::link` enforces to hold at most one
/// CLIENT handle for a console.
#[derive(Debug, Clone)]
pub struct ConsoleTtyAttrs {
    pub device_path: String,
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub logfile: Option<Handle>,
}

/// Reconnect backoff state for a CONSOLE_SOCKET.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub current: Duration,
    pub next_attempt: Instant,
}

impl Backoff {
    pub const MIN: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Backoff {
            current: Self::MIN,
            next_attempt: Instant::now(),
        }
    }

    /// Called after a failed connect/read: doubles the delay up to MAX and
    /// schedules the next attempt.
    pub fn fail(&mut self) {
        self.current = (self.current * 2).min(Self::MAX);
        self.next_attempt = Instant::now() + self.current;
    }

    /// Called after a successful read: resets to the minimum delay.
    pub fn reset(&mut self) {
        self.current = Self::MIN;
        self.next_attempt = Instant::now();
    }

    pub fn ready(&self) -> bool {
        Instant::now() >= self.next_attempt
    }
}

/// Attributes specific to a CONSOLE_SOCKET object.
#[derive(Debug, Clone)]
pub struct ConsoleSocketAttrs {
    pub remote_addr: SocketAddr,
    pub backoff: Backoff,
    pub logfile: Option<Handle>,
}

/// Timestamping mode for a LOGFILE object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    None,
    LinePrefix,
}

/// Attributes specific to a LOGFILE object.
#[derive(Debug, Clone)]
pub struct LogfileAttrs {
    pub path: String,
    pub timestamp_mode: TimestampMode,
    /// True if the previous write ended with a newline, so the next
    /// write should be prefixed with a fresh timestamp.
    pub at_line_start: bool,
}

/// Per-variant attributes, tagged by `ObjectKind`.
#[derive(Debug, Clone)]
pub enum Attrs {
    Listen,
    Client(ClientAttrs),
    ConsoleTty(ConsoleTtyAttrs),
    ConsoleSocket(ConsoleSocketAttrs),
    Logfile(LogfileAttrs),
}

/// A coarse variant tag, independent of the attribute payload — convenient
/// for `obj.kind() == ObjectKind::ConsoleTty` checks, since "CONSOLE"
/// checks apply to both tty and socket variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Listen,
    Client,
    ConsoleTty,
    ConsoleSocket,
    Logfile,
}

impl Attrs {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Attrs::Listen => ObjectKind::Listen,
            Attrs::Client(_) => ObjectKind::Client,
            Attrs::ConsoleTty(_) => ObjectKind::ConsoleTty,
            Attrs::ConsoleSocket(_) => ObjectKind::ConsoleSocket,
            Attrs::Logfile(_) => ObjectKind::Logfile,
        }
    }

    pub fn is_console(&self) -> bool {
        matches!(self.kind(), ObjectKind::ConsoleTty | ObjectKind::ConsoleSocket)
    }
}

/// A single node in the I/O graph.
pub struct Object {
    pub id: Handle,
    pub name: String,
    pub fd: Option<RawFd>,
    pub ring: RingBuffer,
    pub readers: HashSet<Handle>,
    pub writers: HashSet<Handle>,
    pub attrs: Attrs,
}

impl Object {
    pub fn new(id: Handle, name: impl Into<String>, fd: Option<RawFd>, attrs: Attrs) -> Self {
        Object {
            id,
            name: name.into(),
            fd,
            ring: RingBuffer::new(DEFAULT_CAPACITY),
            readers: HashSet::new(),
            writers: HashSet::new(),
            attrs,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.attrs.kind()
    }

    /// Current exclusive writer of a CONSOLE object, or `None` if this is
    /// not a console or has no writer. `Registry::link` never lets more
    /// than one CLIENT into a console's `writers` set, so the first (only)
    /// entry is the exclusive writer.
    pub fn console_writer(&self) -> Option<Handle> {
        if !self.attrs.is_console() {
            return None;
        }
        self.writers.iter().next().copied()
    }

    pub fn client_attrs(&self) -> Option<&ClientAttrs> {
        match &self.attrs {
            Attrs::Client(a) => Some(a),
            _ => None,
        }
    }

    pub fn client_attrs_mut(&mut self) -> Option<&mut ClientAttrs> {
        match &mut self.attrs {
            Attrs::Client(a) => Some(a),
            _ => None,
        }
    }

    pub fn linked_logfile(&self) -> Option<Handle> {
        match &self.attrs {
            Attrs::Client(a) => a.linked_logfile,
            Attrs::ConsoleTty(a) => a.logfile,
            Attrs::ConsoleSocket(a) => a.logfile,
            _ => None,
        }
    }
}
