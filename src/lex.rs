//!
//! Lexer for ConMan's single-line wire protocol.
//!
//! Tokenizes a fixed keyword set (case-insensitive whole words), the `=`
//! and end-of-line punctuators, and single-quoted string literals with
//! `\\`/`\'` backslash escapes. Mirrors `original_source/server-sock.c`'s
//! use of `lex_next`/`lex_prev`/`lex_text`/`lex_decode`/`lex_encode`; the
//! keyword set is `common.h`'s `enum proto_toks`.
//!

use std::fmt;

/// One lexical token. Keywords are matched case-insensitively as whole
/// words; anything else that looks like a bareword becomes `Ident` so the
/// parser can silently skip tokens it doesn't recognize, to preserve
/// forward compatibility with unknown option clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Hello,
    User,
    Connect,
    Monitor,
    Query,
    Execute,
    Console,
    Option,
    Program,
    Force,
    Broadcast,
    Join,
    Regex,
    Quiet,
    Ok,
    Error,
    Code,
    Message,
    /// `=`
    Equals,
    /// A decoded single-quoted string literal.
    Str(String),
    /// Any bareword that isn't one of the keywords above.
    Ident(String),
    /// End of line (newline or end of input without one).
    Eol,
    /// No more input at all (distinct from Eol so callers can tell a
    /// truncated read from a normal line end, mirroring `LEX_EOF`).
    Eof,
    /// An unterminated quoted string or other malformed lexeme. The
    /// parser treats this as a malformed request.
    LexError(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn keyword(word: &str) -> Option<Token> {
    // Case-insensitive whole-word match against the fixed keyword set.
    match word.to_ascii_uppercase().as_str() {
        "HELLO" => Some(Token::Hello),
        "USER" => Some(Token::User),
        "CONNECT" => Some(Token::Connect),
        "MONITOR" => Some(Token::Monitor),
        "QUERY" => Some(Token::Query),
        "EXECUTE" => Some(Token::Execute),
        "CONSOLE" => Some(Token::Console),
        "OPTION" => Some(Token::Option),
        "PROGRAM" => Some(Token::Program),
        "FORCE" => Some(Token::Force),
        "BROADCAST" => Some(Token::Broadcast),
        "JOIN" => Some(Token::Join),
        "REGEX" => Some(Token::Regex),
        "QUIET" => Some(Token::Quiet),
        "OK" => Some(Token::Ok),
        "ERROR" => Some(Token::Error),
        "CODE" => Some(Token::Code),
        "MESSAGE" => Some(Token::Message),
        _ => None,
    }
}

/// A single-line tokenizer over an owned copy of the input line.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    /// The token most recently returned by `next()`, with its raw source
    /// text, kept around so `push_back` can hand it back out again
    /// without re-scanning.
    current: Token,
    current_text: String,
    pushed_back: bool,
}

impl Lexer {
    pub fn new(line: &str) -> Self {
        Lexer {
            chars: line.chars().collect(),
            pos: 0,
            current: Token::Eol,
            current_text: String::new(),
            pushed_back: false,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' || !c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
    }

    fn scan_string(&mut self) -> Token {
        // Opening quote already consumed by the caller.
        let start = self.pos;
        let mut decoded = String::new();
        loop {
            match self.peek_char() {
                None => {
                    let raw: String = self.chars[start..self.pos].iter().collect();
                    self.current_text = raw;
                    return Token::LexError(String::from("unterminated quoted string"));
                }
                Some('\'') => {
                    self.pos += 1;
                    self.current_text = self.chars[start..self.pos - 1].iter().collect();
                    return Token::Str(decoded);
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek_char() {
                        Some('\\') => {
                            decoded.push('\\');
                            self.pos += 1;
                        }
                        Some('\'') => {
                            decoded.push('\'');
                            self.pos += 1;
                        }
                        Some(other) => {
                            // Unknown escape: keep both chars verbatim,
                            // matching a permissive decode rather than
                            // erroring on every novel sequence.
                            decoded.push('\\');
                            decoded.push(other);
                            self.pos += 1;
                        }
                        None => {
                            let raw: String = self.chars[start..self.pos].iter().collect();
                            self.current_text = raw;
                            return Token::LexError(String::from("unterminated quoted string"));
                        }
                    }
                }
                Some(c) => {
                    decoded.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn scan_word(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() || c == '=' || c == '\'' {
                break;
            }
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        self.current_text = word.clone();
        match keyword(&word) {
            Some(tok) => tok,
            None => Token::Ident(word),
        }
    }

    /// Advances to and returns the next token. If a token was pushed back
    /// via `push_back`, returns it again without consuming more input.
    pub fn next(&mut self) -> Token {
        if self.pushed_back {
            self.pushed_back = false;
            return self.current.clone();
        }
        self.skip_whitespace();
        let tok = match self.peek_char() {
            None => {
                self.current_text.clear();
                Token::Eof
            }
            Some('\n') => {
                self.pos += 1;
                self.current_text.clear();
                Token::Eol
            }
            Some('=') => {
                self.pos += 1;
                self.current_text = String::from("=");
                Token::Equals
            }
            Some('\'') => {
                self.pos += 1;
                self.scan_string()
            }
            Some(_) => self.scan_word(),
        };
        self.current = tok.clone();
        tok
    }

    /// Returns the token most recently produced by `next()` without
    /// advancing.
    pub fn current(&self) -> &Token {
        &self.current
    }

    /// Raw source text of the current token (pre-decode for strings).
    pub fn text(&self) -> &str {
        &self.current_text
    }

    /// Arranges for the next call to `next()` to re-return the current
    /// token instead of scanning further input. Used by the parser to
    /// resolve ambiguous option forms, e.g. peeking ahead to
    /// see whether `OPTION=` is followed by `FORCE` or `BROADCAST`.
    pub fn push_back(&mut self) {
        self.pushed_back = true;
    }
}

/// Decodes a backslash-escaped string into raw bytes/text. Inverse of
/// `encode`. Since `Lexer::scan_string` already decodes while scanning,
/// this is primarily useful for strings obtained from outside the lexer
/// (e.g. round-trip tests, or re-decoding a value read back from a
/// config file).
pub fn decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Encodes raw text for safe embedding in a single-quoted protocol string:
/// backslashes and single quotes are escaped so framing can never break on
/// embedded quotes, newlines, or control bytes.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_hello_greeting() {
        let mut l = Lexer::new("HELLO USER='alice'\n");
        assert_eq!(l.next(), Token::Hello);
        assert_eq!(l.next(), Token::User);
        assert_eq!(l.next(), Token::Equals);
        assert_eq!(l.next(), Token::Str("alice".into()));
        assert_eq!(l.next(), Token::Eol);
        assert_eq!(l.next(), Token::Eof);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let mut l = Lexer::new("hello user='bob'");
        assert_eq!(l.next(), Token::Hello);
        assert_eq!(l.next(), Token::User);
    }

    #[test]
    fn handles_escaped_quote_and_backslash() {
        let mut l = Lexer::new(r"CONSOLE='it\'s \\done'");
        l.next(); // CONSOLE
        l.next(); // =
        assert_eq!(l.next(), Token::Str("it's \\done".into()));
    }

    #[test]
    fn unterminated_string_is_lex_error() {
        let mut l = Lexer::new("CONSOLE='oops");
        l.next();
        l.next();
        assert!(matches!(l.next(), Token::LexError(_)));
    }

    #[test]
    fn push_back_replays_current_token() {
        let mut l = Lexer::new("OPTION=FORCE\n");
        assert_eq!(l.next(), Token::Option);
        assert_eq!(l.next(), Token::Equals);
        assert_eq!(l.next(), Token::Force);
        l.push_back();
        assert_eq!(l.next(), Token::Force);
        assert_eq!(l.next(), Token::Eol);
    }

    #[test]
    fn unknown_tokens_become_ident() {
        let mut l = Lexer::new("FOOBAR=1\n");
        assert_eq!(l.next(), Token::Ident("FOOBAR".into()));
    }

    #[test]
    fn lex_round_trip_property() {
        // property 5: decode(encode(s)) == s for arbitrary text.
        let samples = [
            "plain",
            "has 'quotes' inside",
            r"back\slash",
            "new\nline? no, single line text with \\ and '",
            "",
        ];
        for s in samples {
            assert_eq!(decode(&encode(s)), s);
        }
    }
}
