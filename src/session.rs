//!
//! Session & protocol: parses a client's greeting and request
//! lines, resolves and validates the requested consoles, and formats the
//! server's response lines. Named after, and closely modeled on,
//! `original_source/server-sock.c`'s `recv_greeting`/`parse_greeting`/
//! `recv_req`/`parse_cmd_opts`/`query_consoles`/`validate_req`/`send_rsp`
//! pipeline — those C functions' control flow becomes `Result`-returning
//! methods here instead of `goto err`.
//!
//! This module only parses, resolves and validates; it never touches a
//! socket or the registry's mutex directly. `mux.rs` calls into it once a
//! complete line has accumulated in a CLIENT's ring buffer, and carries out
//! whatever `Request`/link-handle it returns.
//!

use crate::error::{Error, ErrorCode, Result};
use crate::lex::{decode, encode, Lexer, Token};
use crate::resolver::resolve_request;

/// A parsed `HELLO` greeting line.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub user: String,
}

/// Parses `HELLO USER='name'`. Mirrors `recv_greeting`/`parse_greeting`:
/// the leading `HELLO` keyword is mandatory, `USER=` is optional (an absent
/// user falls back to the caller's OS-reported login).
pub fn parse_greeting(line: &str) -> Result<Greeting> {
    let mut lex = Lexer::new(line);
    if lex.next() != Token::Hello {
        return Err(Error::Protocol(String::from("expected HELLO")));
    }
    let mut user = None;
    loop {
        match lex.next() {
            Token::User => {
                if lex.next() != Token::Equals {
                    return Err(Error::Protocol(String::from("expected = after USER")));
                }
                match lex.next() {
                    Token::Str(s) => user = Some(s),
                    Token::Ident(s) => user = Some(s),
                    _ => return Err(Error::Protocol(String::from("expected USER value"))),
                }
            }
            Token::Eol | Token::Eof => break,
            Token::LexError(msg) => return Err(Error::Protocol(msg)),
            _ => {
                // Unknown token: skip forward compatibly.
            }
        }
    }
    Ok(Greeting {
        user: user.unwrap_or_else(|| String::from("unknown")),
    })
}

/// The action a request line names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Query,
    Monitor,
    Connect,
    Execute,
}

/// A parsed request line, before console-name resolution.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: Action,
    /// Raw `CONSOLE=` patterns in the order they appeared; empty means
    /// "match everything".
    pub console_patterns: Vec<String>,
    pub use_regex: bool,
    pub force: bool,
    pub broadcast: bool,
    pub join: bool,
    pub quiet: bool,
    /// `PROGRAM=` value for an EXECUTE request.
    pub program: Option<String>,
}

/// Parses a request line (`QUERY`/`MONITOR`/`CONNECT`/`EXECUTE` plus zero or
/// more `CONSOLE=`/`OPTION=`/`PROGRAM=` clauses). Mirrors `recv_req` +
/// `parse_cmd_opts`.
pub fn parse_request(line: &str) -> Result<Request> {
    let mut lex = Lexer::new(line);
    let action = match lex.next() {
        Token::Query => Action::Query,
        Token::Monitor => Action::Monitor,
        Token::Connect => Action::Connect,
        Token::Execute => Action::Execute,
        Token::LexError(msg) => return Err(Error::Protocol(msg)),
        other => return Err(Error::Protocol(format!("unexpected request keyword: {}", other))),
    };

    let mut req = Request {
        action,
        console_patterns: Vec::new(),
        use_regex: false,
        force: false,
        broadcast: false,
        join: false,
        quiet: false,
        program: None,
    };

    loop {
        match lex.next() {
            Token::Eol | Token::Eof => break,
            Token::LexError(msg) => return Err(Error::Protocol(msg)),
            Token::Console => {
                expect_equals(&mut lex)?;
                req.console_patterns.push(expect_value(&mut lex)?);
            }
            Token::Program => {
                expect_equals(&mut lex)?;
                req.program = Some(expect_value(&mut lex)?);
            }
            Token::Option => {
                expect_equals(&mut lex)?;
                match lex.next() {
                    Token::Force => req.force = true,
                    Token::Broadcast => req.broadcast = true,
                    Token::Join => req.join = true,
                    Token::Regex => req.use_regex = true,
                    Token::Quiet => req.quiet = true,
                    Token::LexError(msg) => return Err(Error::Protocol(msg)),
                    _ => {
                        // Unknown OPTION value: skip, forward compatible.
                    }
                }
            }
            _ => {
                // Unknown clause keyword: skip to preserve forward
                // compatibility.
            }
        }
    }

    Ok(req)
}

fn expect_equals(lex: &mut Lexer) -> Result<()> {
    if lex.next() != Token::Equals {
        return Err(Error::Protocol(String::from("expected '='")));
    }
    Ok(())
}

fn expect_value(lex: &mut Lexer) -> Result<String> {
    match lex.next() {
        Token::Str(s) => Ok(s),
        Token::Ident(s) => Ok(s),
        Token::LexError(msg) => Err(Error::Protocol(msg)),
        _ => Err(Error::Protocol(String::from("expected a value"))),
    }
}

/// Resolves `req`'s console patterns against `known` console names and
/// validates the result against the action-specific cardinality rules
///:
///
/// - No match at all: `NoConsoles`.
/// - CONNECT/EXECUTE without `OPTION=BROADCAST` matching more than one
///   console: `TooManyConsoles`.
pub fn resolve_and_validate<'a>(req: &Request, known: &[&'a str]) -> std::result::Result<Vec<&'a str>, ErrorCode> {
    let matched = resolve_request(known, &req.console_patterns, req.use_regex).map_err(|_| ErrorCode::BadRegex)?;
    if matched.is_empty() {
        return Err(ErrorCode::NoConsoles);
    }
    let single_target = matches!(req.action, Action::Connect | Action::Execute);
    if single_target && matched.len() > 1 && !req.broadcast {
        return Err(ErrorCode::TooManyConsoles);
    }
    Ok(matched)
}

/// The message body sent alongside `code` when the caller has nothing more
/// specific to say. `BusyConsoles` is not covered here since its body must
/// list the actual offending console names; callers build that one
/// themselves.
pub fn default_error_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Local => "Internal error.",
        ErrorCode::BadRequest => "Malformed request.",
        ErrorCode::BadRegex => "Invalid regular expression.",
        ErrorCode::Authenticate => "This operation requires a local peer.",
        ErrorCode::NoConsoles => "Found no matching consoles.",
        ErrorCode::TooManyConsoles => "Request matched more than one console.",
        ErrorCode::BusyConsoles => "Console(s) busy.",
        ErrorCode::NoResources => "Insufficient resources to process request.",
        ErrorCode::NotImplemented => "Not implemented.",
    }
}

/// Formats a successful response line, e.g. `OK CONSOLE='nodeA'`.
pub fn format_ok(detail: &str) -> String {
    if detail.is_empty() {
        String::from("OK\n")
    } else {
        format!("OK {}\n", detail)
    }
}

/// Formats an `ERROR CODE=<n> MESSAGE='...'` response line, matching
/// `send_rsp`'s error path.
pub fn format_error(code: ErrorCode, message: &str) -> String {
    format!("ERROR CODE={} MESSAGE='{}'\n", code.code(), encode(message))
}

/// Decodes a quoted console/user value obtained from somewhere other than
/// the lexer (e.g. echoed back from a stored `String`). Exposed for
/// symmetry with `encode`'s use in `format_error`.
pub fn decode_value(s: &str) -> String {
    decode(s)
}
