//! RESP connection to the server under test
//!
//! A small blocking client: enough to ping, flush and let tests issue commands.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection refused to {0}")]
    ConnectionRefused(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded server reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk or status payload as text
    pub fn as_text(&self) -> Option<String> {
        match self {
            Reply::Status(s) => Some(s.clone()),
            Reply::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s == "OK")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{s}"),
            Reply::Error(e) => write!(f, "(error) {e}"),
            Reply::Integer(i) => write!(f, "(integer) {i}"),
            Reply::Bulk(None) | Reply::Array(None) => write!(f, "(nil)"),
            Reply::Bulk(Some(bytes)) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Reply::Array(Some(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// Blocking connection speaking RESP2
pub struct Connection {
    addr: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    /// Connect with `timeout` applied to connect, reads and writes
    pub fn open(addr: &str, timeout: Duration) -> Result<Self, ConnectionError> {
        let socket = addr
            .to_socket_addrs()
            .map_err(|_| ConnectionError::InvalidAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| ConnectionError::InvalidAddress(addr.to_string()))?;

        let stream = TcpStream::connect_timeout(&socket, timeout)
            .map_err(|_| ConnectionError::ConnectionRefused(addr.to_string()))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            addr: addr.to_string(),
            writer: stream.try_clone()?,
            reader: BufReader::new(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command and read its reply. Error replies become `ConnectionError::Server`.
    pub fn command<S: AsRef<[u8]>>(&mut self, args: &[S]) -> Result<Reply, ConnectionError> {
        debug!("{} <- {}", self.addr, describe(args));
        self.writer.write_all(&encode_command(args))?;
        self.writer.flush()?;

        match read_reply(&mut self.reader)? {
            Reply::Error(e) => Err(ConnectionError::Server(e)),
            reply => Ok(reply),
        }
    }

    pub fn ping(&mut self) -> Result<(), ConnectionError> {
        match self.command(&["PING"])? {
            Reply::Status(s) if s == "PONG" => Ok(()),
            other => Err(ConnectionError::Protocol(format!(
                "unexpected PING reply: {other}"
            ))),
        }
    }
}

fn describe<S: AsRef<[u8]>>(args: &[S]) -> String {
    args.iter()
        .map(|a| String::from_utf8_lossy(a.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one reply from `reader`
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply, ConnectionError> {
    let line = read_line(reader)?;
    let (kind, rest) = line
        .split_at_checked(1)
        .ok_or_else(|| ConnectionError::Protocol("empty reply line".to_string()))?;

    match kind {
        "+" => Ok(Reply::Status(rest.to_string())),
        "-" => Ok(Reply::Error(rest.to_string())),
        ":" => Ok(Reply::Integer(parse_int(rest)?)),
        "$" => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut payload = vec![0u8; len as usize + 2];
            reader.read_exact(&mut payload)?;
            if !payload.ends_with(b"\r\n") {
                return Err(ConnectionError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            payload.truncate(len as usize);
            Ok(Reply::Bulk(Some(payload)))
        }
        "*" => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Reply::Array(None));
            }
            let items = (0..len)
                .map(|_| read_reply(reader))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Reply::Array(Some(items)))
        }
        other => Err(ConnectionError::Protocol(format!(
            "unknown reply type {other:?}"
        ))),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, ConnectionError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ConnectionError::Protocol(
            "connection closed by server".to_string(),
        ));
    }
    let trimmed = line
        .strip_suffix("\r\n")
        .ok_or_else(|| ConnectionError::Protocol(format!("line not terminated: {line:?}")))?;
    Ok(trimmed.to_string())
}

fn parse_int(text: &str) -> Result<i64, ConnectionError> {
    text.parse()
        .map_err(|_| ConnectionError::Protocol(format!("invalid integer {text:?}")))
}
