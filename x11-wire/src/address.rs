//! Where to find the server: display strings, host/port pairs and socket paths.
//!
//! Choosing *which* display to use is the caller's business; this module only
//! turns a display identifier into an [`Address`] that
//! [`crate::socket::DefaultStream::connect`] understands.
//!
//! Accepted forms:
//!
//! | Display string         | Address                              |
//! |------------------------|--------------------------------------|
//! | `:1`, `:1.0`           | Unix socket `/tmp/.X11-unix/X1`      |
//! | `unix/:1`, `unix:1`    | Unix socket `/tmp/.X11-unix/X1`      |
//! | `host:1`, `tcp/host:1` | TCP `host:6001`                      |
//! | `[::1]:0`              | TCP `::1:6000`                       |
//! | `/path/to/socket:0`    | Unix socket `/path/to/socket`        |

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Directory holding the per-display local sockets.
pub const UNIX_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// TCP port of display 0; display `n` listens on `TCP_PORT_BASE + n`.
pub const TCP_PORT_BASE: u16 = 6000;

/// A concrete substrate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A display string split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDisplay {
    pub address: Address,
    pub display: u16,
    pub screen: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("no display given and $DISPLAY is not set")]
    NoDisplay,
    #[error("display string {0:?} has no ':' separator")]
    MissingSeparator(String),
    #[error("invalid display number in {0:?}")]
    BadDisplayNumber(String),
    #[error("invalid screen number in {0:?}")]
    BadScreenNumber(String),
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("display {0} is out of range for TCP")]
    PortOutOfRange(u16),
}

/// Parse `[protocol/][host]:display[.screen]`.
pub fn parse_display(input: &str) -> Result<ParsedDisplay, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::NoDisplay);
    }

    let colon = input
        .rfind(':')
        .ok_or_else(|| AddressError::MissingSeparator(input.to_string()))?;
    let (before, after) = (&input[..colon], &input[colon + 1..]);
    let (display, screen) = parse_numbers(input, after)?;

    // A path to the socket itself (launchd and friends).
    if before.starts_with('/') {
        return Ok(ParsedDisplay {
            address: Address::Unix(PathBuf::from(before)),
            display,
            screen,
        });
    }

    let (protocol, host) = match before.split_once('/') {
        Some((protocol, host)) => (Some(protocol), host),
        None if before == "unix" => (Some("unix"), ""),
        None => (None, before),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let address = match protocol {
        Some("unix") => unix_address(display),
        Some("tcp") | Some("inet") | Some("inet6") => tcp_address(host, display)?,
        Some(other) => return Err(AddressError::UnsupportedProtocol(other.to_string())),
        None if host.is_empty() => unix_address(display),
        None => tcp_address(host, display)?,
    };

    Ok(ParsedDisplay {
        address,
        display,
        screen,
    })
}

/// Parse the display named by `$DISPLAY`.
pub fn from_env() -> Result<ParsedDisplay, AddressError> {
    match std::env::var("DISPLAY") {
        Ok(value) => parse_display(&value),
        Err(_) => Err(AddressError::NoDisplay),
    }
}

fn parse_numbers(input: &str, tail: &str) -> Result<(u16, u16), AddressError> {
    let (display, screen) = match tail.split_once('.') {
        Some((d, s)) => (d, Some(s)),
        None => (tail, None),
    };
    let display = display
        .parse()
        .map_err(|_| AddressError::BadDisplayNumber(input.to_string()))?;
    let screen = match screen {
        Some(s) => s
            .parse()
            .map_err(|_| AddressError::BadScreenNumber(input.to_string()))?,
        None => 0,
    };
    Ok((display, screen))
}

fn unix_address(display: u16) -> Address {
    Address::Unix(PathBuf::from(format!("{UNIX_SOCKET_DIR}/X{display}")))
}

fn tcp_address(host: &str, display: u16) -> Result<Address, AddressError> {
    let port = TCP_PORT_BASE
        .checked_add(display)
        .ok_or(AddressError::PortOutOfRange(display))?;
    let host = if host.is_empty() { "localhost" } else { host };
    Ok(Address::Tcp {
        host: host.to_string(),
        port,
    })
}
