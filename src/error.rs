//!
//! Error types shared by the daemon and client halves of ConMan.
//!
//! A plain enum with a hand-written `Display` impl rather than a
//! derive-macro crate, since nothing here needs more than a message
//! string.
//!

use std::fmt;

/// Protocol-level error codes sent to clients in an `ERROR CODE=<n>` line.
/// Values match `enum err_type` in `original_source/common.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Local = 1,
    BadRequest = 2,
    BadRegex = 3,
    Authenticate = 4,
    NoConsoles = 5,
    TooManyConsoles = 6,
    BusyConsoles = 7,
    NoResources = 8,
    NotImplemented = 9,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that can arise while running the core engine: object-model
/// violations, I/O failures, and protocol failures that never made it to
/// the client (because the socket was already gone).
#[derive(Debug)]
pub enum Error {
    /// A handle referenced an object that has been removed from the registry.
    StaleHandle,
    /// A link would have violated the single-writer invariant.
    WriterConflict,
    /// The regex engine rejected a compiled pattern.
    BadRegex(String),
    /// An I/O operation on a socket, tty, or logfile failed.
    Io(std::io::Error),
    /// Out of descriptors, memory, or other local resource.
    NoResources,
    /// The client's request did not parse.
    Protocol(String),
}

impl Error {
    /// Returns a human readable string describing the error, matching the
    /// `to_string` convention used throughout this crate's modules.
    pub fn to_string(&self) -> String {
        match self {
            Error::StaleHandle => String::from("Referenced object no longer exists"),
            Error::WriterConflict => String::from("Console already has a writer"),
            Error::BadRegex(msg) => format!("Invalid regular expression: {}", msg),
            Error::Io(e) => format!("I/O error: {}", e),
            Error::NoResources => String::from("Insufficient resources to process request"),
            Error::Protocol(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
