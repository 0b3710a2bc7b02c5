//!
//! ConMan is a serial console concentrator: `conmand` multiplexes many
//! serial or network-relayed consoles to many clients over a line-oriented
//! TCP protocol, and `conman` attaches a terminal to one or more of them.
//!
//! ## Wire protocol sketch
//!
//! A client sends a `HELLO USER='name'` greeting followed by one request
//! line (`QUERY`/`MONITOR`/`CONNECT`/`EXECUTE`, each optionally qualified
//! by `CONSOLE=`/`OPTION=`/`PROGRAM=` clauses). The server replies with
//! either `OK ...` or `ERROR CODE=<n> MESSAGE='...'`; `CONNECT` and
//! `MONITOR` then hold the connection open as a live byte stream to and
//! from the resolved console(s).
//!
//! See `lex`/`session` for the line grammar, `resolver` for console-name
//! matching, `object`/`registry` for the in-process object graph, and
//! `mux` for the event loop that moves bytes along it.
//!

pub mod config;
pub mod error;
pub mod lex;
pub mod logfile;
pub mod mux;
pub mod net;
pub mod object;
pub mod registry;
pub mod resolver;
pub mod ring;
pub mod session;
pub mod signal;
pub mod tty;
