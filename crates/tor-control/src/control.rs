//! Control-port connection and the `ControlChannel` seam
//!
//! Replies are one or more lines of the form `CODE<sep>text`, where `sep` is
//! `-` for a continuation line, `+` for a data line and a space for the final
//! line. Only the code of the final line decides success.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::constants::REPLY_OK;
use crate::error::{Error, Result};

/// Anonymizing-network control channel as seen by the identity factory.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn ControlChannel>`).
pub trait ControlChannel: Send + Sync {
    /// Rotate onto a new circuit. Must fail rather than leave the caller on
    /// a stale circuit.
    fn request_new_circuit(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// How to authenticate to the control port.
#[derive(Debug, Clone)]
pub enum ControlAuth {
    /// `CookieAuthentication 0` and no `HashedControlPassword`
    Null,
    /// `HashedControlPassword` set in torrc
    Password(Secret<String>),
    /// `CookieAuthentication 1`; path to the cookie file
    Cookie(PathBuf),
}

/// Signals understood by `SIGNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    NewNym,
}

impl Signal {
    pub fn keyword(&self) -> &'static str {
        match self {
            Signal::NewNym => "NEWNYM",
        }
    }
}

/// A complete control reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == REPLY_OK
    }

    /// Text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }
}

/// Split a reply line into (code, separator, text).
pub fn parse_reply_line(line: &str) -> Result<(u16, char, &str)> {
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return Err(Error::Protocol(format!("reply line too short: {line:?}")));
    }
    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("non-numeric reply code: {line:?}")))?;
    let sep = line[3..4].chars().next().unwrap_or(' ');
    if !matches!(sep, ' ' | '-' | '+') {
        return Err(Error::Protocol(format!("bad reply separator: {line:?}")));
    }
    Ok((code, sep, &line[4..]))
}

/// Connects to a Tor control port on demand.
///
/// Each rotation opens its own short-lived connection, so a dropped control
/// connection never poisons later attempts.
#[derive(Debug, Clone)]
pub struct TorController {
    addr: SocketAddr,
    auth: ControlAuth,
    timeout: Duration,
}

impl TorController {
    pub fn new(addr: SocketAddr, auth: ControlAuth, timeout: Duration) -> Self {
        Self {
            addr,
            auth,
            timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open an unauthenticated control connection.
    pub async fn connect(&self) -> Result<ControlConnection> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Connect(format!("{}: {e}", self.addr))),
            Err(_) => return Err(Error::Timeout(self.timeout)),
        };
        debug!(addr = %self.addr, "control connection opened");
        let (read, write) = stream.into_split();
        Ok(ControlConnection {
            reader: BufReader::new(read),
            writer: write,
            timeout: self.timeout,
        })
    }
}

impl ControlChannel for TorController {
    fn request_new_circuit(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            conn.authenticate(&self.auth).await?;
            conn.signal(Signal::NewNym).await?;
            info!(addr = %self.addr, "requested new circuit");
            Ok(())
        })
    }
}

/// An open control connection.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl ControlConnection {
    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<()> {
        let command = match auth {
            ControlAuth::Null => "AUTHENTICATE".to_string(),
            ControlAuth::Password(password) => {
                format!("AUTHENTICATE {}", quote(password.expose()))
            }
            ControlAuth::Cookie(path) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    Error::Authentication(format!("reading cookie {}: {e}", path.display()))
                })?;
                format!("AUTHENTICATE {}", hex_upper(&cookie))
            }
        };
        let reply = self.command(&command).await?;
        if !reply.is_ok() {
            return Err(Error::Authentication(format!(
                "{} {}",
                reply.code,
                reply.message()
            )));
        }
        debug!("control connection authenticated");
        Ok(())
    }

    pub async fn signal(&mut self, signal: Signal) -> Result<()> {
        let command = format!("SIGNAL {}", signal.keyword());
        let reply = self.command(&command).await?;
        if !reply.is_ok() {
            return Err(Error::Rejected {
                command,
                code: reply.code,
                message: reply.message().to_string(),
            });
        }
        Ok(())
    }

    /// Send one command line and read its full reply.
    async fn command(&mut self, line: &str) -> Result<Reply> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange(line)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn exchange(&mut self, line: &str) -> Result<Reply> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing control command: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Io(format!("flushing control command: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let n = self
                .reader
                .read_line(&mut raw)
                .await
                .map_err(|e| Error::Io(format!("reading control reply: {e}")))?;
            if n == 0 {
                return Err(Error::Protocol("control connection closed mid-reply".into()));
            }
            let trimmed = raw.trim_end_matches(['\r', '\n']);
            let (code, sep, text) = parse_reply_line(trimmed)?;
            lines.push(text.to_string());
            if sep == '+' {
                self.skip_data_block().await?;
            }
            if sep == ' ' {
                return Ok(Reply { code, lines });
            }
        }
    }

    /// Consume a `+` data block up to its terminating `.` line.
    async fn skip_data_block(&mut self) -> Result<()> {
        loop {
            let mut raw = String::new();
            let n = self
                .reader
                .read_line(&mut raw)
                .await
                .map_err(|e| Error::Io(format!("reading control data: {e}")))?;
            if n == 0 {
                return Err(Error::Protocol("control connection closed mid-data".into()));
            }
            if raw.trim_end_matches(['\r', '\n']) == "." {
                return Ok(());
            }
        }
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
