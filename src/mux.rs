//!
//! The I/O multiplexer: a single-threaded `mio` readiness loop
//! that owns every object's fd, reads available bytes, fans them out along
//! the registry's reader/writer graph, and drains each object's own ring
//! back out to its fd.
//!
//! Session *setup* (the HELLO/request/response exchange) runs on its own
//! thread per accepted connection; only the ongoing byte-forwarding data
//! path runs here: a single mux thread for the data path, not one thread
//! per connection.
//!
//! Readiness-loop shape grounded in
//! `other_examples/dd1d4452_codepr-teaspoon__src-server.rs.rs` and
//! `other_examples/5f3b1c48_CycleChain-ignix__src-net.rs.rs`.
//!

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;
use crate::logfile::LogWriter;
use crate::object::{EscapeState, Handle, ObjectKind};
use crate::registry::{Inner, Registry};
use crate::ring::REPLAY_LEN;
use crate::signal::{SignalFlags, SignalPipe};

/// Escape byte recognized inline in a CLIENT's outbound-to-console stream
/// (`ESC_CHAR` in `common.h`).
pub const ESC_CHAR: u8 = 0xFF;

/// Text shown to a client sending the `?` (help) escape.
const HELP_TEXT: &str = "escape sequences: B=break .=close ?=help I=info L=log Q=quiet Z=suspend";

const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_CHUNK: usize = 4096;

const TOKEN_SIGNAL: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// A freshly-linked client handed off from a session-setup thread, with
/// its socket already registered as an `Object` in the registry.
pub struct NewClient {
    pub handle: Handle,
    pub fd: RawFd,
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// The multiplexer. Holds the `mio::Poll` instance, the token<->handle
/// mapping (mio tokens are small integers, registry handles are a
/// monotonic `u64`), and the shared registry.
pub struct Mux {
    poll: Poll,
    registry: Arc<Registry>,
    next_token: usize,
    token_to_handle: HashMap<Token, Handle>,
    handle_to_token: HashMap<Handle, Token>,
    signal_pipe: SignalPipe,
    signal_flags: Arc<SignalFlags>,
    new_clients: Receiver<NewClient>,
    logwriters: HashMap<Handle, LogWriter>,
    draining: bool,
}

impl Mux {
    /// `registry` must already contain every configured `CONSOLE_TTY`/
    /// `CONSOLE_SOCKET` object (inserted by `bin/conmand.rs` at startup).
    /// Accepting new connections is not this struct's job: `conmand`'s main
    /// thread blocks in `TcpListener::accept()` and hands each connection
    /// to a session-setup thread, which sends a `NewClient` down
    /// `new_clients` once the session has been linked into the registry.
    pub fn new(registry: Arc<Registry>, signal_flags: Arc<SignalFlags>, new_clients: Receiver<NewClient>) -> Result<Self> {
        let poll = Poll::new()?;
        let signal_pipe = SignalPipe::install()?;

        poll.registry().register(
            &mut SourceFd(&signal_pipe.as_raw_fd()),
            TOKEN_SIGNAL,
            Interest::READABLE,
        )?;

        let mut mux = Mux {
            poll,
            registry,
            next_token: FIRST_DYNAMIC_TOKEN,
            token_to_handle: HashMap::new(),
            handle_to_token: HashMap::new(),
            signal_pipe,
            signal_flags,
            new_clients,
            logwriters: HashMap::new(),
            draining: false,
        };
        mux.register_existing_consoles()?;
        Ok(mux)
    }

    /// Attaches a `LOGFILE`'s writer so the fan-out pass mirrors bytes into
    /// it. Called by `bin/conmand.rs` once per configured `log=` entry and
    /// again whenever a client toggles its per-client logfile link.
    pub fn register_logfile(&mut self, handle: Handle, writer: LogWriter) {
        self.logwriters.insert(handle, writer);
    }

    fn register_existing_consoles(&mut self) -> Result<()> {
        let handles: Vec<(Handle, RawFd)> = {
            let inner = self.registry.lock();
            inner
                .iter()
                .filter_map(|(h, o)| o.fd.map(|fd| (*h, fd)))
                .collect()
        };
        for (handle, fd) in handles {
            self.register_fd(handle, fd)?;
        }
        Ok(())
    }

    fn register_fd(&mut self, handle: Handle, fd: RawFd) -> Result<()> {
        set_nonblocking(fd)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.token_to_handle.insert(token, handle);
        self.handle_to_token.insert(handle, token);
        Ok(())
    }

    fn deregister(&mut self, handle: Handle, fd: RawFd) {
        if let Some(token) = self.handle_to_token.remove(&handle) {
            self.token_to_handle.remove(&token);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Runs the event loop until a SIGTERM/SIGINT has been observed and
    /// every client object has drained.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let mut ready: Vec<Token> = Vec::new();
            for ev in events.iter() {
                if ev.token() == TOKEN_SIGNAL {
                    self.handle_signal();
                } else {
                    ready.push(ev.token());
                }
            }

            self.absorb_new_clients();

            for token in ready {
                if let Some(handle) = self.token_to_handle.get(&token).copied() {
                    self.read_from(handle);
                }
            }

            self.fanout_pass();
            self.flush_writes();
            self.harvest_closed();
            self.retry_console_sockets();

            if self.draining && self.no_clients_left() {
                info!("drain complete, shutting down");
                return Ok(());
            }
        }
    }

    fn handle_signal(&mut self) {
        self.signal_pipe.drain();
        if self.signal_flags.hup.swap(false, Ordering::Relaxed) {
            info!("SIGHUP received: reopening logfiles");
            for w in self.logwriters.values_mut() {
                w.reopen();
            }
        }
        if self.signal_flags.term.swap(false, Ordering::Relaxed) {
            info!("shutdown signal received: draining");
            self.draining = true;
        }
    }

    fn absorb_new_clients(&mut self) {
        loop {
            match self.new_clients.try_recv() {
                Ok(new_client) => {
                    if let Err(e) = self.register_fd(new_client.handle, new_client.fd) {
                        warn!("failed to register new client: {}", e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn read_from(&mut self, handle: Handle) {
        let fd = {
            let inner = self.registry.lock();
            match inner.get(handle).and_then(|o| o.fd) {
                Some(fd) => fd,
                None => return,
            }
        };
        let mut buf = [0u8; MAX_CHUNK];
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => self.mark_closed(handle),
            Ok(n) => {
                {
                    let mut inner = self.registry.lock();
                    if let Some(obj) = inner.get_mut(handle) {
                        obj.ring.append(&buf[..n]);
                    }
                }
                self.reset_backoff_if_console(handle);
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
            Err(_) => self.mark_closed(handle),
        }
    }

    fn reset_backoff_if_console(&mut self, handle: Handle) {
        let mut inner = self.registry.lock();
        if let Some(obj) = inner.get_mut(handle) {
            if let crate::object::Attrs::ConsoleSocket(a) = &mut obj.attrs {
                a.backoff.reset();
            }
        }
    }

    /// Copies each object's unread ring bytes into every one of its
    /// readers' rings, applying escape-sequence interception for CLIENT
    /// sources and mirroring into a linked LOGFILE when present. Runs
    /// under a single registry lock per pass rather than once per object.
    fn fanout_pass(&mut self) {
        let mut inner = self.registry.lock();
        let handles = inner.handles();
        for handle in handles {
            let (src_bytes, readers, src_kind, logfile) = {
                let obj = match inner.get(handle) {
                    Some(o) => o,
                    None => continue,
                };
                if obj.ring.is_empty() {
                    continue;
                }
                (
                    obj.ring.readable_span().to_vec(),
                    obj.readers.iter().copied().collect::<Vec<_>>(),
                    obj.kind(),
                    obj.linked_logfile(),
                )
            };

            let forwarded = if src_kind == ObjectKind::Client {
                process_client_escapes(&mut inner, handle, &src_bytes)
            } else {
                src_bytes.clone()
            };

            for reader in &readers {
                if let Some(robj) = inner.get_mut(*reader) {
                    robj.ring.append(&forwarded);
                    if robj.ring.overflowed() && robj.kind() == ObjectKind::Client {
                        robj.ring.clear_overflow();
                        let notice = frame_notice("output dropped (buffer overflow)");
                        robj.ring.append(&notice);
                    }
                }
            }

            if let Some(lf) = logfile {
                let quiet = src_kind == ObjectKind::Client
                    && inner.get(handle).and_then(|o| o.client_attrs()).map(|a| a.quiet).unwrap_or(false);
                if !quiet {
                    if let Some(w) = self.logwriters.get_mut(&lf) {
                        let _ = w.write(&forwarded);
                    }
                }
            }

            if let Some(obj) = inner.get_mut(handle) {
                obj.ring.consume(src_bytes.len());
            }
        }
    }

    fn flush_writes(&mut self) {
        let mut failed: Vec<Handle> = Vec::new();
        {
            let mut inner = self.registry.lock();
            let handles = inner.handles();
            for handle in handles {
                let fd = match inner.get(handle) {
                    Some(o) => match o.fd {
                        Some(fd) if !o.ring.is_empty() => fd,
                        _ => continue,
                    },
                    None => continue,
                };
                let span = inner.get(handle).unwrap().ring.readable_span().to_vec();
                match nix::unistd::write(fd, &span) {
                    Ok(n) => inner.get_mut(handle).unwrap().ring.consume(n),
                    Err(nix::errno::Errno::EAGAIN) => {}
                    Err(_) => failed.push(handle),
                }
            }
        }
        for handle in failed {
            self.mark_closed(handle);
        }
    }

    fn mark_closed(&mut self, handle: Handle) {
        let mut inner = self.registry.lock();
        let kind = inner.get(handle).map(|o| o.kind());
        match kind {
            Some(ObjectKind::ConsoleSocket) => {
                if let Some(obj) = inner.get_mut(handle) {
                    if let crate::object::Attrs::ConsoleSocket(a) = &mut obj.attrs {
                        a.backoff.fail();
                    }
                    obj.fd = None;
                }
                drop(inner);
                if let Some(token) = self.handle_to_token.remove(&handle) {
                    self.token_to_handle.remove(&token);
                }
            }
            Some(_) => {
                let fd = inner.get(handle).and_then(|o| o.fd);
                drop(inner);
                if let Some(fd) = fd {
                    self.deregister(handle, fd);
                }
                self.registry.lock().detach_and_remove(handle);
            }
            None => {}
        }
    }

    fn harvest_closed(&mut self) {
        // Placeholder for symmetry with the naming used in DESIGN.md;
        // actual harvesting happens inline in `read_from`/`mark_closed`
        // since mio reports EOF/error at read time rather than as a
        // separate sweep.
    }

    fn retry_console_sockets(&mut self) {
        let due: Vec<(Handle, SocketAddr)> = {
            let inner = self.registry.lock();
            inner
                .iter()
                .filter_map(|(h, o)| match &o.attrs {
                    crate::object::Attrs::ConsoleSocket(a) if o.fd.is_none() && a.backoff.ready() => {
                        Some((*h, a.remote_addr))
                    }
                    _ => None,
                })
                .collect()
        };
        for (handle, addr) in due {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    let fd = stream.as_raw_fd();
                    std::mem::forget(stream);
                    {
                        let mut inner = self.registry.lock();
                        if let Some(obj) = inner.get_mut(handle) {
                            obj.fd = Some(fd);
                        }
                    }
                    if let Err(e) = self.register_fd(handle, fd) {
                        warn!("failed to register reconnected console socket: {}", e);
                    }
                }
                Err(_) => {
                    let mut inner = self.registry.lock();
                    if let Some(obj) = inner.get_mut(handle) {
                        if let crate::object::Attrs::ConsoleSocket(a) = &mut obj.attrs {
                            a.backoff.fail();
                        }
                    }
                }
            }
        }
    }

    fn no_clients_left(&self) -> bool {
        let inner = self.registry.lock();
        inner.iter().all(|(_, o)| o.kind() != ObjectKind::Client)
    }
}

/// Scans a CLIENT's newly-read bytes for the escape byte (`ESC_CHAR`) plus
/// its sub-code, stripping the two-byte sequence from the forwarded stream
/// and applying its side effect. A lone trailing escape byte with no
/// second byte yet is retained in `escape_state` and resolved on the next
/// pass. A doubled `ESC_CHAR` (`0xFF 0xFF`) passes through as one literal
/// byte, matching the wire convention for an escaped literal.
fn process_client_escapes(inner: &mut Inner, client: Handle, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    loop {
        let b = match iter.next() {
            Some(b) => b,
            None => break,
        };
        let state = match inner.get(client).and_then(|o| o.client_attrs()) {
            Some(a) => a.escape_state,
            None => {
                out.push(b);
                continue;
            }
        };
        match state {
            EscapeState::Idle => {
                if b == ESC_CHAR {
                    if let Some(a) = inner.get_mut(client).and_then(|o| o.client_attrs_mut()) {
                        a.escape_state = EscapeState::AwaitSecondByte;
                    }
                } else {
                    out.push(b);
                }
            }
            EscapeState::AwaitSecondByte => {
                if let Some(a) = inner.get_mut(client).and_then(|o| o.client_attrs_mut()) {
                    a.escape_state = EscapeState::Idle;
                }
                if b == ESC_CHAR {
                    out.push(ESC_CHAR);
                } else {
                    apply_escape_subcode(inner, client, b);
                }
                if !inner.contains(client) {
                    break;
                }
            }
        }
    }
    out
}

/// Applies the side effect of one escape sub-code.
fn apply_escape_subcode(inner: &mut Inner, client: Handle, sub_code: u8) {
    match sub_code {
        b'Q' => {
            if let Some(a) = inner.get_mut(client).and_then(|o| o.client_attrs_mut()) {
                a.quiet = !a.quiet;
            }
        }
        b'.' => {
            inner.detach_and_remove(client);
        }
        b'B' => {
            if let Some(console) = console_for_client(inner, client) {
                if let Some(fd) = inner.get(console).and_then(|o| o.fd) {
                    unsafe {
                        libc::tcsendbreak(fd, 0);
                    }
                }
            }
        }
        b'?' => {
            let notice = frame_notice(HELP_TEXT);
            if let Some(obj) = inner.get_mut(client) {
                obj.ring.append(&notice);
            }
        }
        b'I' => {
            let text = session_info_text(inner, client);
            let notice = frame_notice(&text);
            if let Some(obj) = inner.get_mut(client) {
                obj.ring.append(&notice);
            }
        }
        b'L' => toggle_client_logfile(inner, client),
        b'Z' => {
            // Suspend is handled entirely client-side (see bin/conman.rs);
            // the mux just strips the sequence from the forwarded stream.
        }
        _ => {}
    }
}

/// Displaces the current writer of `console` in favor of `new_writer`,
/// honoring the `OPTION=JOIN` semantics resolved in DESIGN.md: the old
/// writer is demoted to a reader (not disconnected) and both old and new
/// writer are notified.
pub fn force_displace(registry: &Registry, console: Handle, new_writer: Handle) -> Result<Option<Handle>> {
    let old_writer = {
        let inner = registry.lock();
        inner.get(console).and_then(|o| o.console_writer())
    };
    if let Some(old) = old_writer {
        // Removes only the write edge (old -> console); the pre-existing
        // read edge (console -> old), set up alongside it at CONNECT time,
        // is untouched, so `old` keeps seeing console output as a reader.
        registry.unlink(old, console);

        let old_had_join = registry
            .lock()
            .get(old)
            .and_then(|o| o.client_attrs())
            .map(|a| a.requested_join)
            .unwrap_or(false);
        if old_had_join {
            let console_name = registry.lock().get(console).map(|o| o.name.clone()).unwrap_or_default();
            let mut inner = registry.lock();
            if let Some(o) = inner.get_mut(old) {
                o.ring
                    .append(format!("*** console {} taken over by another client ***\n", console_name).as_bytes());
            }
            if let Some(o) = inner.get_mut(new_writer) {
                o.ring
                    .append(format!("*** joined existing session on console {} ***\n", console_name).as_bytes());
            }
        }
    }
    registry.link(new_writer, console, true)?;
    Ok(old_writer)
}

/// Links `console` as a byte source for `client` (the CONSOLE's output
/// becomes readable by the client) and seeds the client's ring with up to
/// `REPLAY_LEN` trailing bytes already on the console so a freshly-attached
/// client sees recent backlog instead of a blank screen.
pub fn link_console_reader(registry: &Registry, console: Handle, client: Handle) -> Result<()> {
    registry.link(console, client, false)?;
    let tail = {
        let inner = registry.lock();
        inner.get(console).map(|o| o.ring.replay_tail(REPLAY_LEN)).unwrap_or_default()
    };
    if !tail.is_empty() {
        let mut inner = registry.lock();
        if let Some(c) = inner.get_mut(client) {
            c.ring.append(&tail);
        }
    }
    Ok(())
}

/// Frames `text` as an out-of-band server message per the
/// `\r\n<ConMan> ... .\r\n` convention used for inline notices.
fn frame_notice(text: &str) -> Vec<u8> {
    format!("\r\n<ConMan> {}.\r\n", text).into_bytes()
}

/// The CONSOLE this client currently writes to, if any (the console whose
/// `writers` set contains this client).
fn console_for_client(inner: &Inner, client: Handle) -> Option<Handle> {
    let obj = inner.get(client)?;
    obj.readers.iter().copied().find(|h| inner.get(*h).map(|o| o.attrs.is_console()).unwrap_or(false))
}

fn session_info_text(inner: &Inner, client: Handle) -> String {
    let obj = match inner.get(client) {
        Some(o) => o,
        None => return String::from("no session info available"),
    };
    let attrs = match obj.client_attrs() {
        Some(a) => a,
        None => return String::new(),
    };
    match console_for_client(inner, client).and_then(|h| inner.get(h)) {
        Some(console) => format!(
            "user={} console={} write={} quiet={}",
            attrs.user, console.name, attrs.write_enabled, attrs.quiet
        ),
        None => format!("user={} console=none quiet={}", attrs.user, attrs.quiet),
    }
}

/// Toggles this client's per-client logfile link between unset and the
/// logfile attached to the console it currently writes to (if any).
fn toggle_client_logfile(inner: &mut Inner, client: Handle) {
    let console_logfile = console_for_client(inner, client).and_then(|h| inner.get(h)).and_then(|o| o.linked_logfile());
    if let Some(attrs) = inner.get_mut(client).and_then(|o| o.client_attrs_mut()) {
        attrs.linked_logfile = if attrs.linked_logfile.is_some() { None } else { console_logfile };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Attrs, ClientAttrs, ConsoleTtyAttrs, EscapeState, Object, Parity};
    use std::net::SocketAddr;

    fn client_object(id: Handle) -> Object {
        Object::new(
            id,
            "client",
            None,
            Attrs::Client(ClientAttrs {
                remote_ip: "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
                remote_host: None,
                user: "u".into(),
                write_enabled: false,
                broadcast: false,
                escape_state: EscapeState::Idle,
                quiet: false,
                requested_join: false,
                linked_logfile: None,
            }),
        )
    }

    fn console_object(id: Handle, logfile: Option<Handle>) -> Object {
        Object::new(
            id,
            "A",
            None,
            Attrs::ConsoleTty(ConsoleTtyAttrs {
                device_path: "/dev/ttyA".into(),
                baud: 9600,
                parity: Parity::None,
                stop_bits: 1,
                logfile,
            }),
        )
    }

    #[test]
    fn escape_sequence_is_stripped_from_forwarded_bytes() {
        let reg = Registry::new();
        let handle = reg.insert(client_object);
        let mut inner = reg.lock();
        let input = [b'h', b'i', ESC_CHAR, b'Q', b'!'];
        let out = process_client_escapes(&mut inner, handle, &input);
        assert_eq!(out, b"hi!");
        assert!(inner.get(handle).unwrap().client_attrs().unwrap().quiet);
    }

    #[test]
    fn lone_escape_byte_is_buffered_across_calls() {
        let reg = Registry::new();
        let handle = reg.insert(client_object);
        let mut inner = reg.lock();
        let out1 = process_client_escapes(&mut inner, handle, &[b'a', ESC_CHAR]);
        assert_eq!(out1, b"a");
        assert_eq!(
            inner.get(handle).unwrap().client_attrs().unwrap().escape_state,
            EscapeState::AwaitSecondByte
        );
        let out2 = process_client_escapes(&mut inner, handle, &[b'Q']);
        assert!(out2.is_empty());
        assert!(inner.get(handle).unwrap().client_attrs().unwrap().quiet);
        assert_eq!(inner.get(handle).unwrap().client_attrs().unwrap().escape_state, EscapeState::Idle);
    }

    #[test]
    fn doubled_escape_byte_emits_one_literal() {
        let reg = Registry::new();
        let handle = reg.insert(client_object);
        let mut inner = reg.lock();
        let out = process_client_escapes(&mut inner, handle, &[b'a', ESC_CHAR, ESC_CHAR, b'b']);
        assert_eq!(out, [b'a', ESC_CHAR, b'b']);
    }

    #[test]
    fn close_subcode_detaches_client() {
        let reg = Registry::new();
        let handle = reg.insert(client_object);
        let mut inner = reg.lock();
        let out = process_client_escapes(&mut inner, handle, &[ESC_CHAR, b'.']);
        assert!(out.is_empty());
        assert!(!inner.contains(handle));
    }

    #[test]
    fn help_subcode_appends_framed_notice_to_own_ring() {
        let reg = Registry::new();
        let handle = reg.insert(client_object);
        let mut inner = reg.lock();
        let out = process_client_escapes(&mut inner, handle, &[ESC_CHAR, b'?']);
        assert!(out.is_empty());
        let span = inner.get(handle).unwrap().ring.readable_span();
        assert!(span.starts_with(b"\r\n<ConMan> "));
        assert!(span.ends_with(b".\r\n"));
    }

    #[test]
    fn log_subcode_toggles_to_linked_consoles_logfile() {
        let reg = Registry::new();
        let console = reg.insert(|id| console_object(id, Some(id)));
        let client = reg.insert(client_object);
        reg.link(client, console, false).unwrap();
        let mut inner = reg.lock();
        process_client_escapes(&mut inner, client, &[ESC_CHAR, b'L']);
        assert_eq!(inner.get(client).unwrap().client_attrs().unwrap().linked_logfile, Some(console));
        process_client_escapes(&mut inner, client, &[ESC_CHAR, b'L']);
        assert!(inner.get(client).unwrap().client_attrs().unwrap().linked_logfile.is_none());
    }
}
