//!
//! `conmand`: the console concentrator daemon. Loads a config file,
//! installs the configured consoles into the registry, starts the mux on
//! a background thread, and spawns one session-setup thread per accepted
//! connection.
//!

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use clap::{App, Arg};
use log::{error, info, warn};

use conman::config::{ConfigError, ConsoleConfig, ServerConfig, DEFAULT_CONFIG_PATH};
use conman::error::ErrorCode;
use conman::logfile::LogWriter;
use conman::mux::{Mux, NewClient};
use conman::net::{is_loopback, resolve_peer_host};
use conman::object::{
    Attrs, Backoff, ClientAttrs, ConsoleSocketAttrs, ConsoleTtyAttrs, EscapeState, Handle, Object, ObjectKind,
};
use conman::registry::Registry;
use conman::session::{self, Action};
use conman::signal::SignalFlags;
use conman::tty::open_console_tty;

#[derive(Debug, Clone)]
struct ProgramOptions {
    config_path: String,
}

fn process_options() -> ProgramOptions {
    let parser = App::new("conmand")
        .version("1.0")
        .about("Serial console concentrator daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("PATH")
                .help("Configuration file path")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    ProgramOptions {
        config_path: parser.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH).to_string(),
    }
}

fn main() {
    let options = process_options();
    let config = match ServerConfig::load(std::path::Path::new(&options.config_path)) {
        Ok(c) => c,
        Err(ConfigError::Read(_)) => {
            warn!("no config file at {}, using defaults", options.config_path);
            ServerConfig::default()
        }
        Err(e) => {
            eprintln!("failed to load config: {}", e);
            process::exit(1);
        }
    };

    if let Some(logfile) = &config.logfile {
        if let Err(e) = simple_logging::log_to_file(logfile, log::LevelFilter::Info) {
            eprintln!("failed to open log file {}: {}", logfile, e);
            process::exit(1);
        }
    }
    info!("conmand starting, config = {:?}", options.config_path);

    let registry = Arc::new(Registry::new());
    let mut pending_logwriters = Vec::new();
    for console in &config.console {
        match install_console(&registry, console) {
            Ok((_, Some(writer))) => pending_logwriters.push(writer),
            Ok((_, None)) => {}
            Err(e) => error!("failed to install console '{}': {}", console.name, e),
        }
    }

    let listen_addr = match config.listen_addr() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let listener = match TcpListener::bind(listen_addr) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", listen_addr, e);
            process::exit(1);
        }
    };
    info!("listening on {}", listen_addr);

    let signal_flags = Arc::new(SignalFlags::new());
    let (new_client_tx, new_client_rx) = mpsc::channel::<NewClient>();

    let mux_registry = Arc::clone(&registry);
    let mux_signal_flags = Arc::clone(&signal_flags);
    let mux_thread = thread::spawn(move || {
        let mut mux = match Mux::new(mux_registry, mux_signal_flags, new_client_rx) {
            Ok(m) => m,
            Err(e) => {
                error!("failed to initialize event loop: {}", e);
                process::exit(1);
            }
        };
        for (handle, writer) in pending_logwriters {
            mux.register_logfile(handle, writer);
        }
        if let Err(e) = mux.run() {
            error!("event loop exited with error: {}", e);
        }
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let registry = Arc::clone(&registry);
                let new_client_tx = new_client_tx.clone();
                thread::spawn(move || handle_connection(stream, registry, new_client_tx));
            }
            Err(e) => {
                error!("accept failed: {}", e);
            }
        }
    }

    let _ = mux_thread.join();
}

/// Installs one configured console (TTY or socket) into the registry,
/// returning its handle and, if `log=` was set, the `LogWriter` the mux
/// should attach once it starts.
fn install_console(registry: &Registry, cfg: &ConsoleConfig) -> conman::error::Result<(Handle, Option<(Handle, LogWriter)>)> {
    let has_log = cfg.log.is_some();
    let handle = if let Some(dev) = &cfg.dev {
        let fd = open_console_tty(dev, cfg.baud, cfg.parity.into(), cfg.stopbits)?;
        registry.insert(|id| {
            Object::new(
                id,
                cfg.name.clone(),
                Some(fd),
                Attrs::ConsoleTty(ConsoleTtyAttrs {
                    device_path: dev.clone(),
                    baud: cfg.baud,
                    parity: cfg.parity.into(),
                    stop_bits: cfg.stopbits,
                    logfile: has_log.then(|| id),
                }),
            )
        })
    } else {
        let addr = format!("{}:{}", cfg.host.as_deref().unwrap_or_default(), cfg.port.unwrap_or(0));
        let remote_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|_| conman::error::Error::Protocol(format!("bad console socket address: {}", addr)))?;
        registry.insert(|id| {
            Object::new(
                id,
                cfg.name.clone(),
                None,
                Attrs::ConsoleSocket(ConsoleSocketAttrs {
                    remote_addr,
                    backoff: Backoff::new(),
                    logfile: has_log.then(|| id),
                }),
            )
        })
    };

    // `linked_logfile()` reads back the console's own handle here, so
    // `mux.register_logfile` is keyed by the console itself rather than a
    // separate LOGFILE object.
    let logwriter = cfg
        .log
        .as_ref()
        .map(|path| (handle, LogWriter::new(path.clone(), cfg.timestamp_mode())));
    Ok((handle, logwriter))
}

/// Runs the one-shot greeting/request exchange for a newly-accepted
/// connection on its own thread; on a successful CONNECT/MONITOR, links the client
/// into the registry and hands its fd to the mux for ongoing data-path
/// forwarding.
fn handle_connection(stream: TcpStream, registry: Arc<Registry>, new_clients: mpsc::Sender<NewClient>) {
    let peer = match stream.peer_addr() {
        Ok(a) => a,
        Err(_) => return,
    };
    let mut reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(_) => return,
    };
    let mut writer = stream;

    let mut greeting_line = String::new();
    if reader.read_line(&mut greeting_line).unwrap_or(0) == 0 {
        return;
    }
    let greeting = match session::parse_greeting(&greeting_line) {
        Ok(g) => g,
        Err(e) => {
            let _ = writer.write_all(session::format_error(ErrorCode::BadRequest, &e.to_string()).as_bytes());
            return;
        }
    };

    if !is_loopback(&peer) {
        let _ = writer.write_all(
            session::format_error(ErrorCode::Authenticate, session::default_error_message(ErrorCode::Authenticate))
                .as_bytes(),
        );
        return;
    }

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let req = match session::parse_request(&request_line) {
        Ok(r) => r,
        Err(e) => {
            let _ = writer.write_all(session::format_error(ErrorCode::BadRequest, &e.to_string()).as_bytes());
            return;
        }
    };

    if req.action == Action::Execute {
        let _ =
            writer.write_all(session::format_error(ErrorCode::NotImplemented, "EXECUTE is not implemented").as_bytes());
        return;
    }

    let known_names: Vec<String> = {
        let inner = registry.lock();
        inner
            .consoles()
            .into_iter()
            .filter_map(|h| inner.get(h).map(|o| o.name.clone()))
            .collect()
    };
    let known_refs: Vec<&str> = known_names.iter().map(String::as_str).collect();

    let matched = match session::resolve_and_validate(&req, &known_refs) {
        Ok(m) => m,
        Err(code) => {
            let _ = writer.write_all(session::format_error(code, session::default_error_message(code)).as_bytes());
            return;
        }
    };

    if req.action == Action::Query {
        let _ = writer.write_all(session::format_ok("").as_bytes());
        for name in &matched {
            let _ = writer.write_all(format!("{}\n", name).as_bytes());
        }
        return;
    }

    if req.action == Action::Connect && !req.force {
        let busy: Vec<String> = {
            let inner = registry.lock();
            matched
                .iter()
                .filter(|name| {
                    let console_handle = inner
                        .find_by_name(ObjectKind::ConsoleTty, name)
                        .or_else(|| inner.find_by_name(ObjectKind::ConsoleSocket, name));
                    match console_handle.and_then(|h| inner.get(h)) {
                        Some(o) => o.console_writer().is_some(),
                        None => false,
                    }
                })
                .map(|name| name.to_string())
                .collect()
        };
        if !busy.is_empty() {
            let message = format!("Console(s) busy: {}", busy.join(", "));
            let _ = writer.write_all(session::format_error(ErrorCode::BusyConsoles, &message).as_bytes());
            return;
        }
    }

    let host = resolve_peer_host(&peer);
    let client_fd = writer.as_raw_fd();
    let client_handle = registry.insert(|id| {
        Object::new(
            id,
            format!("client-{}", id.0),
            Some(client_fd),
            Attrs::Client(ClientAttrs {
                remote_ip: peer,
                remote_host: host,
                user: greeting.user,
                write_enabled: req.action == Action::Connect,
                broadcast: req.broadcast,
                escape_state: EscapeState::Idle,
                quiet: req.quiet,
                requested_join: req.join,
                linked_logfile: None,
            }),
        )
    });

    for name in &matched {
        let console_handle = {
            let inner = registry.lock();
            inner
                .find_by_name(ObjectKind::ConsoleTty, name)
                .or_else(|| inner.find_by_name(ObjectKind::ConsoleSocket, name))
        };
        let console_handle = match console_handle {
            Some(h) => h,
            None => continue,
        };
        if req.action == Action::Connect {
            let linked = if req.force {
                conman::mux::force_displace(&registry, console_handle, client_handle).map(|_| ())
            } else {
                registry.link(client_handle, console_handle, false)
            };
            if linked.is_err() {
                let _ = writer.write_all(
                    session::format_error(ErrorCode::BusyConsoles, session::default_error_message(ErrorCode::BusyConsoles))
                        .as_bytes(),
                );
                registry.lock().detach_and_remove(client_handle);
                return;
            }
        }
        let _ = conman::mux::link_console_reader(&registry, console_handle, client_handle);
    }

    let _ = writer.write_all(session::format_ok("").as_bytes());

    // The mux now owns this fd's lifecycle; leak the std wrappers so
    // their `Drop` impls don't close it out from under the poller.
    std::mem::forget(reader);
    std::mem::forget(writer);

    let _ = new_clients.send(NewClient {
        handle: client_handle,
        fd: client_fd as RawFd,
    });
}
