//!
//! `conmand`'s configuration file: listen address,
//! log destination, and the set of consoles to manage. Parsed with
//! `serde`/`toml`, the crates this corpus reaches for whenever a config
//! file is more than flag parsing (see DESIGN.md).
//!
//! This is an ambient collaborator, not core: the mux/session/registry
//! never touch a `toml::Value` directly, only the `ServerConfig`/
//! `ConsoleConfig` structs below.
//!

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::object::{Parity, TimestampMode};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/conman.conf";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7890";

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub logfile: Option<String>,
    #[serde(default)]
    pub console: Vec<ConsoleConfig>,
}

fn default_listen() -> String {
    String::from(DEFAULT_LISTEN)
}

#[derive(Debug, Deserialize)]
pub struct ConsoleConfig {
    pub name: String,
    /// Local serial device, e.g. `/dev/ttyS0`. Mutually exclusive with
    /// `host`/`port`.
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub parity: ConfigParity,
    #[serde(default = "default_stop_bits")]
    pub stopbits: u8,
    /// Remote terminal-server host:port. Mutually exclusive with `dev`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub logtimestamp: bool,
}

fn default_baud() -> u32 {
    9600
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigParity {
    None,
    Even,
    Odd,
}

impl Default for ConfigParity {
    fn default() -> Self {
        ConfigParity::None
    }
}

impl From<ConfigParity> for Parity {
    fn from(p: ConfigParity) -> Self {
        match p {
            ConfigParity::None => Parity::None,
            ConfigParity::Even => Parity::Even,
            ConfigParity::Odd => Parity::Odd,
        }
    }
}

impl ConsoleConfig {
    pub fn is_socket(&self) -> bool {
        self.host.is_some()
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        if self.logtimestamp {
            TimestampMode::LinePrefix
        } else {
            TimestampMode::None
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(toml::de::Error),
    /// A console entry named neither `dev` nor `host` (or both).
    AmbiguousTransport(String),
    BadListenAddr(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {}", e),
            ConfigError::AmbiguousTransport(name) => write!(
                f,
                "console '{}' must set exactly one of dev= or host=/port=",
                name
            ),
            ConfigError::BadListenAddr(addr) => write!(f, "invalid listen address: {}", addr),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Read)?;
        let cfg: ServerConfig = toml::from_str(&text).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for c in &self.console {
            let has_dev = c.dev.is_some();
            let has_sock = c.host.is_some() && c.port.is_some();
            if has_dev == has_sock {
                return Err(ConfigError::AmbiguousTransport(c.name.clone()));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::BadListenAddr(self.listen.clone()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            logfile: None,
            console: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            listen = "127.0.0.1:7890"

            [[console]]
            name = "nodeA"
            dev = "/dev/ttyS0"
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.console.len(), 1);
        assert_eq!(cfg.console[0].baud, 9600);
        assert!(!cfg.console[0].is_socket());
    }

    #[test]
    fn parses_socket_console() {
        let toml = r#"
            [[console]]
            name = "term1"
            host = "10.0.0.5"
            port = 7001
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert!(cfg.console[0].is_socket());
    }

    #[test]
    fn rejects_ambiguous_transport() {
        let toml = r#"
            [[console]]
            name = "bad"
            dev = "/dev/ttyS0"
            host = "10.0.0.5"
            port = 7001
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_file_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen = \"127.0.0.1:9999\"").unwrap();
        let cfg = ServerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9999");
        assert_eq!(cfg.listen_addr().unwrap().port(), 9999);
    }
}
