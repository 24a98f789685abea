//! A minimal blocking SMTP client.
//!
//! Low-level on purpose: it speaks raw command lines and replies, which is
//! exactly what the integration tests need to pin the server's wire
//! contract. It is not a submission agent.

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::io::{DotTerminatedWriter, ExtraDotWriter};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed SMTP reply: {0}")]
    MalformedReply(String),

    #[error("server rejected command: {0}")]
    Rejected(Response),
}

/// One server reply: status code plus text. Multi-line replies are joined
/// with `\n` and carry the final line's code.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub message: String,
}

impl Response {
    /// Codes below 400 count as success (2xx done, 3xx intermediate).
    pub fn is_success(&self) -> bool {
        (100..400).contains(&self.code)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

pub struct SmtpClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl SmtpClient {
    /// Connect with the default timeouts. The greeting is not consumed;
    /// call [`receive`] for it.
    ///
    /// [`receive`]: SmtpClient::receive
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_timeout(addr, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REPLY_TIMEOUT)
    }

    /// Connect using a server configuration's `connect_timeout_ms` and
    /// `reply_timeout_ms` values.
    pub fn connect_with_config(addr: SocketAddr, config: &ServerConfig) -> Result<Self, ClientError> {
        Self::connect_timeout(addr, config.connect_timeout, config.reply_timeout)
    }

    pub fn connect_timeout(
        addr: SocketAddr,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_read_timeout(Some(reply_timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// Send one command line; CRLF is appended.
    pub fn send(&mut self, line: &str) -> Result<(), ClientError> {
        write!(self.stream, "{}\r\n", line)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one (possibly multi-line) reply.
    pub fn receive(&mut self) -> Result<Response, ClientError> {
        read_response(&mut self.reader)
    }

    pub fn send_receive(&mut self, line: &str) -> Result<Response, ClientError> {
        self.send(line)?;
        self.receive()
    }

    /// Like [`receive`], but a non-success reply becomes an error.
    ///
    /// [`receive`]: SmtpClient::receive
    pub fn receive_and_check(&mut self) -> Result<Response, ClientError> {
        let response = self.receive()?;
        if !response.is_success() {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub fn send_and_check(&mut self, line: &str) -> Result<Response, ClientError> {
        self.send(line)?;
        self.receive_and_check()
    }

    /// Run a DATA transaction: `DATA`, the dot-stuffed payload, the
    /// terminator, and the final reply.
    pub fn data(&mut self, payload: &[u8]) -> Result<Response, ClientError> {
        let response = self.send_receive("DATA")?;
        if response.code != 354 {
            return Err(ClientError::Rejected(response));
        }

        let raw = self.stream.try_clone()?;
        let mut terminated = DotTerminatedWriter::new(raw);
        {
            let mut stuffed = ExtraDotWriter::new(&mut terminated);
            stuffed.write_all(payload)?;
        }
        terminated.finish()?;

        self.receive()
    }

    /// Send one BDAT chunk: the command line followed immediately by the
    /// raw octets. No pauses are needed; the chunk is self-delimiting.
    pub fn bdat(&mut self, chunk: &[u8], last: bool) -> Result<Response, ClientError> {
        if last {
            write!(self.stream, "BDAT {} LAST\r\n", chunk.len())?;
        } else {
            write!(self.stream, "BDAT {}\r\n", chunk.len())?;
        }
        self.stream.write_all(chunk)?;
        self.stream.flush()?;
        self.receive()
    }

    /// Send QUIT and close the connection.
    pub fn quit(mut self) -> Result<Response, ClientError> {
        self.send_receive("QUIT")
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// Parse one reply off the stream. Every line must be at least four
/// characters: three digits and a `-` (continuation) or space (final).
fn read_response<R: BufRead>(reader: &mut R) -> Result<Response, ClientError> {
    let mut message = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            if message.is_empty() {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server disconnected, no reply received",
                )));
            }
            return Err(ClientError::MalformedReply(message));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
            return Err(ClientError::MalformedReply(line.to_string()));
        }
        message.push_str(&line[4..]);
        match line.as_bytes()[3] {
            b'-' => message.push('\n'),
            b' ' => {
                let code = line[..3]
                    .parse::<u16>()
                    .map_err(|_| ClientError::MalformedReply(line.to_string()))?;
                return Ok(Response { code, message });
            }
            _ => return Err(ClientError::MalformedReply(line.to_string())),
        }
    }
}
