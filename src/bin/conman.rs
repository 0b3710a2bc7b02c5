//!
//! `conman`: the client half of the console concentrator. Connects to
//! `conmand`, performs the greeting/request handshake, and for CONNECT/
//! MONITOR puts the controlling terminal into raw mode and pumps bytes
//! between stdin/stdout and the socket until the connection closes.
//!

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::{App, Arg};
use log::warn;
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, SetArg, Termios};

use conman::lex::encode;
use conman::mux::ESC_CHAR;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7890;
const DEFAULT_ESCAPE: char = '&';

#[derive(Debug, Clone)]
struct ProgramOptions {
    host: String,
    port: u16,
    user: Option<String>,
    consoles: Vec<String>,
    query: bool,
    monitor: bool,
    force: bool,
    broadcast: bool,
    join: bool,
    quiet: bool,
    regex: bool,
    escape: char,
    verbose: bool,
}

fn process_options() -> ProgramOptions {
    let matches = App::new("conman")
        .version("1.0")
        .about("Attaches a terminal to one or more ConMan consoles")
        .arg(Arg::with_name("host").short("h").long("host").takes_value(true).help("conmand host"))
        .arg(Arg::with_name("port").short("p").long("port").takes_value(true).help("conmand port"))
        .arg(Arg::with_name("user").short("u").long("user").takes_value(true).help("reported user name"))
        .arg(Arg::with_name("query").short("Q").long("query").help("list matching consoles and exit"))
        .arg(Arg::with_name("monitor").short("M").long("monitor").help("read-only attach"))
        .arg(Arg::with_name("force").short("F").long("force").help("displace the current writer"))
        .arg(Arg::with_name("broadcast").short("b").long("broadcast").help("write to every matched console"))
        .arg(Arg::with_name("join").short("j").long("join").help("request JOIN semantics on displacement"))
        .arg(Arg::with_name("quiet").short("q").long("quiet").help("suppress this client's logfile copy"))
        .arg(Arg::with_name("regex").short("x").long("regex").help("treat CONSOLE patterns as raw regexes"))
        .arg(
            Arg::with_name("escape")
                .short("e")
                .long("escape")
                .takes_value(true)
                .help("local escape character (default '&')"),
        )
        .arg(Arg::with_name("verbose").short("v").long("verbose").help("log to stderr"))
        .arg(Arg::with_name("console").multiple(true).required(true).help("console name(s) or pattern(s)"))
        .get_matches();

    let escape = matches
        .value_of("escape")
        .and_then(|s| s.chars().next())
        .unwrap_or(DEFAULT_ESCAPE);

    ProgramOptions {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string(),
        port: matches
            .value_of("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT),
        user: matches.value_of("user").map(String::from),
        consoles: matches
            .values_of("console")
            .map(|vs| vs.map(String::from).collect())
            .unwrap_or_default(),
        query: matches.is_present("query"),
        monitor: matches.is_present("monitor"),
        force: matches.is_present("force"),
        broadcast: matches.is_present("broadcast"),
        join: matches.is_present("join"),
        quiet: matches.is_present("quiet"),
        regex: matches.is_present("regex"),
        escape,
        verbose: matches.is_present("verbose"),
    }
}

fn build_request_line(options: &ProgramOptions) -> String {
    let action = if options.query {
        "QUERY"
    } else if options.monitor {
        "MONITOR"
    } else {
        "CONNECT"
    };
    let mut line = String::from(action);
    for console in &options.consoles {
        line.push_str(&format!(" CONSOLE='{}'", encode(console)));
    }
    if options.force {
        line.push_str(" OPTION=FORCE");
    }
    if options.broadcast {
        line.push_str(" OPTION=BROADCAST");
    }
    if options.join {
        line.push_str(" OPTION=JOIN");
    }
    if options.quiet {
        line.push_str(" OPTION=QUIET");
    }
    if options.regex {
        line.push_str(" OPTION=REGEX");
    }
    line.push('\n');
    line
}

/// Saves the controlling terminal's cooked-mode settings and restores them
/// on drop, mirroring `client.h`'s save/restore of `struct termios term`.
struct RawModeGuard {
    fd: i32,
    saved: Termios,
}

impl RawModeGuard {
    fn enter() -> io::Result<Self> {
        let fd = io::stdin().as_raw_fd();
        let saved = termios::tcgetattr(fd).map_err(io::Error::from)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd, SetArg::TCSAFLUSH, &raw).map_err(io::Error::from)?;
        Ok(RawModeGuard { fd, saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSAFLUSH, &self.saved);
    }
}

/// Translates the user's local escape character into the wire-level
/// `ESC_CHAR` + sub-code pair: a literal escape character is sent as
/// itself unless doubled, matching the server's convention of doubling a
/// literal `0xFF`.
fn translate_input(bytes: &[u8], escape: u8, pending_escape: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if *pending_escape {
            *pending_escape = false;
            if b == escape {
                out.push(escape);
            } else {
                out.push(ESC_CHAR);
                out.push(b);
            }
        } else if b == escape {
            *pending_escape = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Reads one byte from `stream` looking for a server `'Z'` sub-code
/// (suspend) after an `ESC_CHAR`, delivering `SIGTSTP` to ourselves when
/// seen; every other byte is written straight to stdout.
fn pump_downstream(mut stream: TcpStream, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    let mut stdout = io::stdout();
    let mut awaiting_subcode = false;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let mut out = Vec::with_capacity(n);
        for &b in &buf[..n] {
            if awaiting_subcode {
                awaiting_subcode = false;
                if b == b'Z' {
                    let _ = signal::raise(Signal::SIGTSTP);
                } else {
                    out.push(ESC_CHAR);
                    out.push(b);
                }
            } else if b == ESC_CHAR {
                awaiting_subcode = true;
            } else {
                out.push(b);
            }
        }
        if stdout.write_all(&out).is_err() {
            break;
        }
        let _ = stdout.flush();
    }
    stop.store(true, Ordering::Relaxed);
}

fn pump_upstream(mut stream: TcpStream, escape: u8, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    let mut pending_escape = false;
    let mut stdin = io::stdin();
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let n = match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let out = translate_input(&buf[..n], escape, &mut pending_escape);
        if !out.is_empty() && stream.write_all(&out).is_err() {
            break;
        }
    }
}

fn main() {
    let options = process_options();
    if options.verbose {
        let _ = simple_logging::log_to_stderr(log::LevelFilter::Info);
    }

    let user = options.user.clone().unwrap_or_else(|| whoami::username());

    let stream = match TcpStream::connect((options.host.as_str(), options.port)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("conman: failed to connect to {}:{}: {}", options.host, options.port, e);
            process::exit(1);
        }
    };

    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("conman: {}", e);
            process::exit(1);
        }
    };
    let mut reader = BufReader::new(stream.try_clone().expect("clone socket for reading"));

    if writer
        .write_all(format!("HELLO USER='{}'\n", encode(&user)).as_bytes())
        .is_err()
    {
        eprintln!("conman: failed to send greeting");
        process::exit(1);
    }
    if writer.write_all(build_request_line(&options).as_bytes()).is_err() {
        eprintln!("conman: failed to send request");
        process::exit(1);
    }

    let mut response = String::new();
    if reader.read_line(&mut response).unwrap_or(0) == 0 {
        eprintln!("conman: connection closed before a response was received");
        process::exit(1);
    }
    if response.starts_with("ERROR") {
        eprintln!("conman: {}", response.trim_end());
        process::exit(1);
    }

    if options.query {
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap_or(0) > 0 {
            print!("{}", line);
            line.clear();
        }
        return;
    }

    let _raw_guard = match RawModeGuard::enter() {
        Ok(g) => Some(g),
        Err(e) => {
            warn!("failed to set raw terminal mode: {}", e);
            None
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let escape_byte = options.escape as u8;
    let down_stream = stream.try_clone().expect("clone socket for downstream pump");
    let down_stop = Arc::clone(&stop);
    let downstream = thread::spawn(move || pump_downstream(down_stream, down_stop));

    pump_upstream(writer.try_clone().expect("clone socket for upstream pump"), escape_byte, Arc::clone(&stop));
    let _ = writer.shutdown(std::net::Shutdown::Write);
    let _ = downstream.join();
}
