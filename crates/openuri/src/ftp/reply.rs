//! FTP control replies and data-channel address encoding

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::trace;

use crate::error::{OpenError, Result};
use crate::transport::Connection;

/// A complete, possibly multi-line, control reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Reply text with the code prefixes removed; lines joined with `\n`
    pub text: String,
}

impl Reply {
    /// First digit of the code
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    pub fn is_complete(&self) -> bool {
        self.class() == 2
    }

    /// 2xx or 3xx
    pub fn is_positive(&self) -> bool {
        matches!(self.class(), 2 | 3)
    }

    /// Last line of the text, as used for status messages
    pub fn message(&self) -> &str {
        self.text.lines().last().unwrap_or_default().trim()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Read one reply from the control connection
pub async fn read_reply(conn: &mut Connection) -> Result<Reply> {
    let closed = || OpenError::Protocol("FTP control connection closed".to_string());

    let first = conn.read_line().await?.ok_or_else(closed)?;
    trace!("ftp < {first}");
    let code = reply_code(&first)
        .ok_or_else(|| OpenError::Protocol(format!("malformed FTP reply: {first:?}")))?;

    let mut text = first.get(4..).unwrap_or_default().to_string();
    if first.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{code} ");
        loop {
            let line = conn.read_line().await?.ok_or_else(closed)?;
            trace!("ftp < {line}");
            let last = line.starts_with(&terminator) || line == code.to_string();
            text.push('\n');
            text.push_str(if last {
                line.get(4..).unwrap_or_default()
            } else {
                &line
            });
            if last {
                break;
            }
        }
    }

    Ok(Reply { code, text })
}

/// Address advertised in a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
pub fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u8> = text[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .take(6)
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = (u16::from(numbers[4]) << 8) | u16::from(numbers[5]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Port from a `229 Entering Extended Passive Mode (|||port|)` reply
pub fn parse_epsv(text: &str) -> Option<u16> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let inner = &text[open + 1..close];
    let delim = inner.chars().next()?;
    let fields: Vec<&str> = inner.split(delim).collect();
    // "", "", "", port, ""
    if fields.len() != 5 {
        return None;
    }
    fields[3].parse().ok()
}

/// `PORT` or `EPRT` command announcing a local listening address
pub fn port_command(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let [a, b, c, d] = ip.octets();
            let port = addr.port();
            format!("PORT {a},{b},{c},{d},{},{}", port >> 8, port & 0xff)
        }
        IpAddr::V6(ip) => format!("EPRT |2|{ip}|{}|", addr.port()),
    }
}
