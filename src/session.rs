//! One SMTP session: command dispatch, DATA/BDAT framing, STARTTLS.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::handler::{AuthHandler, Envelope, MessageHandler};
use crate::io::{read_line_bounded, Line, MAX_COMMAND_LINE, MAX_DATA_LINE};
use crate::reply::Reply;
use crate::stream::SessionStream;
use crate::tls::TlsSettings;

type SessionReader = BufReader<ReadHalf<SessionStream>>;
type SessionWriter = BufWriter<WriteHalf<SessionStream>>;

/// What the command loop should do after handling one command.
enum Flow {
    Reply(Reply),
    CloseAfter(Reply),
    Close,
}

pub(crate) struct Session {
    id: String,
    config: Arc<ServerConfig>,
    handler: Arc<dyn MessageHandler>,
    auth: Option<Arc<dyn AuthHandler>>,
    tls: Option<TlsSettings>,
    real_remote_addr: SocketAddr,
    declared_remote_addr: SocketAddr,
    helo: Option<String>,
    from: Option<String>,
    recipients: Vec<String>,
    data: Vec<u8>,
    authenticated: bool,
    tls_active: bool,
    peer_certificates: Vec<CertificateDer<'static>>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        config: Arc<ServerConfig>,
        handler: Arc<dyn MessageHandler>,
        auth: Option<Arc<dyn AuthHandler>>,
        tls: Option<TlsSettings>,
        real_remote_addr: SocketAddr,
        declared_remote_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            config,
            handler,
            auth,
            tls,
            real_remote_addr,
            declared_remote_addr,
            helo: None,
            from: None,
            recipients: Vec::new(),
            data: Vec::new(),
            authenticated: false,
            tls_active: false,
            peer_certificates: Vec::new(),
            shutdown,
        }
    }

    pub(crate) async fn run(mut self, stream: TcpStream) {
        info!(
            session = %self.id,
            peer = %self.real_remote_addr,
            declared = %self.declared_remote_addr,
            "session started"
        );

        let read_timeout = self.config.reply_timeout;
        let (r, w) = tokio::io::split(SessionStream::Plain(stream));
        let mut reader = BufReader::new(r);
        let mut writer = BufWriter::new(w);

        let greeting = Reply::new(
            220,
            format!("{} ESMTP {}", self.config.hostname, self.config.banner),
        );
        if write_reply(&mut writer, &greeting).await.is_err() {
            return;
        }

        loop {
            // Command boundary: this is where a cooperative quit is
            // observed. `wait_for` also covers a flag flipped before this
            // session started watching.
            let wake = tokio::select! {
                _ = self.shutdown.wait_for(|quit| *quit) => None,
                res = read_line_timed(&mut reader, MAX_COMMAND_LINE, read_timeout) => Some(res),
            };

            let line = match wake {
                None => {
                    let _ = write_reply(
                        &mut writer,
                        &Reply::new(421, "Service closing transmission channel"),
                    )
                    .await;
                    break;
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    let _ = write_reply(
                        &mut writer,
                        &Reply::new(421, "Timeout waiting for data from client"),
                    )
                    .await;
                    break;
                }
                Some(Err(e)) => {
                    debug!(session = %self.id, error = %e, "read error, closing session");
                    break;
                }
                Some(Ok(Line::Eof)) => break,
                Some(Ok(Line::TooLong)) => {
                    if write_reply(&mut writer, &Reply::new(500, "Line too long")).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Ok(Line::Data(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            };

            debug!(session = %self.id, command = %line, "command received");
            let (verb, arg) = split_command(&line);

            if verb == "STARTTLS" {
                if !arg.is_empty() {
                    let reply = Reply::new(501, "Syntax error (no parameters allowed)");
                    if write_reply(&mut writer, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                let settings = match &self.tls {
                    Some(settings) if self.config.enable_tls => settings.clone(),
                    _ => {
                        if write_reply(&mut writer, &Reply::new(454, "TLS not supported"))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    }
                };
                if self.tls_active {
                    let reply = Reply::new(
                        454,
                        "TLS not available due to temporary reason: TLS already active",
                    );
                    if write_reply(&mut writer, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }

                if write_reply(&mut writer, &Reply::new(220, "Ready to start TLS"))
                    .await
                    .is_err()
                {
                    break;
                }

                // Rebuild the socket from its halves and wrap it. Bytes a
                // client pipelined ahead of the handshake are discarded with
                // the read buffer, as RFC 3207 directs.
                let stream = reader.into_inner().unsplit(writer.into_inner());
                let tcp = match stream {
                    SessionStream::Plain(tcp) => tcp,
                    SessionStream::Tls(_) => {
                        warn!(session = %self.id, "unexpected TLS stream before STARTTLS");
                        return;
                    }
                };
                match settings.acceptor.accept(tcp).await {
                    Ok(tls_stream) => {
                        if settings.require_client_auth {
                            let (_, conn) = tls_stream.get_ref();
                            if let Some(certs) = conn.peer_certificates() {
                                self.peer_certificates = certs.to_vec();
                            }
                        }
                        self.tls_active = true;
                        self.reset_smtp_state();
                        debug!(session = %self.id, "connection upgraded to TLS");
                        let (r, w) = tokio::io::split(SessionStream::Tls(tls_stream));
                        reader = BufReader::new(r);
                        writer = BufWriter::new(w);
                    }
                    Err(e) => {
                        // Nothing can be reported to the client after the 220.
                        warn!(session = %self.id, error = %e, "STARTTLS handshake failed");
                        return;
                    }
                }
                continue;
            }

            let flow = match verb.as_str() {
                "HELO" => Flow::Reply(self.cmd_helo(arg)),
                "EHLO" => Flow::Reply(self.cmd_ehlo(arg)),
                "MAIL" => Flow::Reply(self.cmd_mail(arg)),
                "RCPT" => Flow::Reply(self.cmd_rcpt(arg)),
                "DATA" => match self.cmd_data(arg, &mut reader, &mut writer).await {
                    Ok(flow) => flow,
                    Err(_) => Flow::Close,
                },
                "BDAT" => match self.cmd_bdat(arg, &mut reader).await {
                    Ok(flow) => flow,
                    Err(_) => Flow::Close,
                },
                "AUTH" => match self.cmd_auth(arg, &mut reader, &mut writer).await {
                    Ok(flow) => flow,
                    Err(_) => Flow::Close,
                },
                "RSET" => {
                    self.reset_transaction();
                    Flow::Reply(Reply::ok())
                }
                "NOOP" => Flow::Reply(Reply::ok()),
                "QUIT" => Flow::CloseAfter(Reply::new(221, "Bye")),
                "VRFY" => Flow::Reply(Reply::new(252, "Cannot VRFY user")),
                "EXPN" => Flow::Reply(Reply::new(502, "EXPN command is disabled")),
                "HELP" => Flow::Reply(Reply::new(
                    214,
                    "Commands supported:\nHELO EHLO MAIL RCPT DATA BDAT RSET\nNOOP QUIT VRFY EXPN HELP AUTH STARTTLS\nEnd of HELP info",
                )),
                "" => Flow::Reply(Reply::new(500, "Error: bad syntax")),
                _ => Flow::Reply(Reply::new(500, "Command not recognized")),
            };

            match flow {
                Flow::Reply(reply) => {
                    if write_reply(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
                Flow::CloseAfter(reply) => {
                    let _ = write_reply(&mut writer, &reply).await;
                    break;
                }
                Flow::Close => break,
            }
        }

        debug!(session = %self.id, "session closed");
    }

    fn cmd_helo(&mut self, arg: &str) -> Reply {
        if arg.is_empty() {
            return Reply::new(501, "Syntax error: hostname required");
        }
        self.helo = Some(arg.to_string());
        self.reset_transaction();
        Reply::new(250, self.config.hostname.clone())
    }

    fn cmd_ehlo(&mut self, arg: &str) -> Reply {
        if arg.is_empty() {
            return Reply::new(501, "Syntax error: hostname required");
        }
        self.helo = Some(arg.to_string());
        self.reset_transaction();

        let mut lines = vec![
            self.config.hostname.clone(),
            "8BITMIME".to_string(),
            format!("SIZE {}", self.config.max_message_size),
            "CHUNKING".to_string(),
        ];
        if self.config.enable_tls && self.tls.is_some() && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if self.auth.is_some() && !self.authenticated {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("OK".to_string());
        Reply::new(250, lines.join("\n"))
    }

    fn cmd_mail(&mut self, arg: &str) -> Reply {
        if self.helo.is_none() {
            return Reply::new(503, "Error: send HELO/EHLO first");
        }
        if self.config.require_tls && !self.tls_active {
            return Reply::new(530, "Must issue a STARTTLS command first");
        }
        if self.config.require_auth && !self.authenticated {
            return Reply::new(530, "Authentication required");
        }
        if self.from.is_some() {
            return Reply::new(503, "Nested MAIL command");
        }

        let rest = match strip_keyword(arg, "FROM:") {
            Some(rest) => rest,
            None => return Reply::new(501, "Syntax error: MAIL FROM:<address> expected"),
        };
        let mut parts = rest.split_whitespace();
        let from = extract_address(parts.next().unwrap_or(""));

        for param in parts {
            let upper = param.to_ascii_uppercase();
            if let Some(size) = upper.strip_prefix("SIZE=") {
                match size.parse::<usize>() {
                    Ok(declared) if declared > self.config.max_message_size => {
                        return Reply::new(552, "Message size exceeds fixed maximum");
                    }
                    Ok(_) => {}
                    Err(_) => return Reply::new(501, "Syntax error: bad SIZE parameter"),
                }
            }
            // other ESMTP parameters are accepted and ignored
        }

        self.from = Some(from);
        Reply::ok()
    }

    fn cmd_rcpt(&mut self, arg: &str) -> Reply {
        if self.from.is_none() {
            return Reply::new(503, "Error: need MAIL command");
        }
        let rest = match strip_keyword(arg, "TO:") {
            Some(rest) => rest,
            None => return Reply::new(501, "Syntax error: RCPT TO:<address> expected"),
        };
        let recipient = extract_address(rest.split_whitespace().next().unwrap_or(""));
        if recipient.is_empty() {
            return Reply::new(501, "Syntax error: recipient address required");
        }
        if self.recipients.len() >= self.config.max_recipients {
            return Reply::new(452, "Too many recipients");
        }
        self.recipients.push(recipient);
        Reply::ok()
    }

    async fn cmd_data(
        &mut self,
        arg: &str,
        reader: &mut SessionReader,
        writer: &mut SessionWriter,
    ) -> io::Result<Flow> {
        if !arg.is_empty() {
            return Ok(Flow::Reply(Reply::new(501, "Syntax error (no parameters allowed)")));
        }
        if self.from.is_none() {
            return Ok(Flow::Reply(Reply::new(503, "Error: need MAIL command")));
        }
        if self.recipients.is_empty() {
            return Ok(Flow::Reply(Reply::new(503, "Error: need RCPT command")));
        }
        if !self.data.is_empty() {
            return Ok(Flow::Reply(Reply::new(503, "Error: BDAT transaction in progress")));
        }

        write_reply(writer, &Reply::new(354, "End data with <CRLF>.<CRLF>")).await?;

        let read_timeout = self.config.reply_timeout;
        let mut too_big = false;
        loop {
            let line = match read_line_timed(reader, MAX_DATA_LINE, read_timeout).await {
                Ok(Line::Data(line)) => line,
                Ok(Line::Eof) | Err(_) => return Ok(Flow::Close),
                Ok(Line::TooLong) => {
                    return Ok(Flow::CloseAfter(Reply::new(500, "Line too long")));
                }
            };
            if line == b"." {
                break;
            }
            // De-stuff the leading dot.
            let payload: &[u8] = if line.starts_with(b"..") { &line[1..] } else { &line };
            if !too_big {
                if self.data.len() + payload.len() + 2 > self.config.max_message_size {
                    too_big = true;
                    self.data.clear();
                } else {
                    self.data.extend_from_slice(payload);
                    self.data.extend_from_slice(b"\r\n");
                }
            }
        }

        if too_big {
            self.reset_transaction();
            return Ok(Flow::Reply(Reply::new(552, "Message size exceeds fixed maximum")));
        }
        Ok(Flow::Reply(self.deliver()))
    }

    async fn cmd_bdat(&mut self, arg: &str, reader: &mut SessionReader) -> io::Result<Flow> {
        let read_timeout = self.config.reply_timeout;
        let tokens: Vec<&str> = arg.split_whitespace().collect();

        // Without a parseable size the chunk boundary is unknowable, so the
        // connection cannot be recovered.
        let size = match tokens.first().and_then(|t| t.parse::<usize>().ok()) {
            Some(size) => size,
            None => {
                return Ok(Flow::CloseAfter(Reply::new(501, "Syntax error: BDAT <size> [LAST]")));
            }
        };
        let last = match tokens.len() {
            1 => false,
            2 if tokens[1].eq_ignore_ascii_case("LAST") => true,
            _ => {
                consume_exact(reader, size, read_timeout).await?;
                return Ok(Flow::Reply(Reply::new(501, "Syntax error: BDAT <size> [LAST]")));
            }
        };

        // A mis-sequenced chunk is still consumed so the command stream
        // stays framed.
        if self.from.is_none() {
            consume_exact(reader, size, read_timeout).await?;
            return Ok(Flow::Reply(Reply::new(503, "Error: need MAIL command")));
        }
        if self.recipients.is_empty() {
            consume_exact(reader, size, read_timeout).await?;
            return Ok(Flow::Reply(Reply::new(503, "Error: need RCPT command")));
        }
        if self.data.len() + size > self.config.max_message_size {
            consume_exact(reader, size, read_timeout).await?;
            self.reset_transaction();
            return Ok(Flow::Reply(Reply::new(552, "Message size exceeds fixed maximum")));
        }

        let start = self.data.len();
        self.data.resize(start + size, 0);
        match timeout(read_timeout, reader.read_exact(&mut self.data[start..])).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Ok(Flow::Close),
        }

        if last {
            Ok(Flow::Reply(self.deliver()))
        } else {
            Ok(Flow::Reply(Reply::new(250, format!("Message OK, {} octets received", size))))
        }
    }

    async fn cmd_auth(
        &mut self,
        arg: &str,
        reader: &mut SessionReader,
        writer: &mut SessionWriter,
    ) -> io::Result<Flow> {
        let handler = match &self.auth {
            Some(handler) => handler.clone(),
            None => return Ok(Flow::Reply(Reply::new(502, "Authentication not supported"))),
        };
        if self.authenticated {
            return Ok(Flow::Reply(Reply::new(503, "Already authenticated")));
        }
        if self.from.is_some() {
            return Ok(Flow::Reply(Reply::new(
                503,
                "AUTH command not allowed during a mail transaction",
            )));
        }

        let mut parts = arg.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();
        if parts.next().is_some() {
            return Ok(Flow::Reply(Reply::new(501, "Syntax error in parameters")));
        }

        let verdict = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload.to_string(),
                    None => match self.challenge(reader, writer, "").await? {
                        Some(line) => line,
                        None => return Ok(Flow::Close),
                    },
                };
                if payload == "*" {
                    return Ok(Flow::Reply(Reply::new(501, "Authentication cancelled")));
                }
                let decoded = match B64.decode(payload.as_bytes()) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        return Ok(Flow::Reply(Reply::new(501, "Invalid base64 encoding")));
                    }
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();
                // authzid NUL authcid NUL password
                let fields: Vec<&str> = decoded.split('\0').collect();
                if fields.len() < 3 {
                    return Ok(Flow::Reply(Reply::new(501, "Invalid AUTH PLAIN payload")));
                }
                handler.authenticate(fields[1], fields[2])
            }
            "LOGIN" => {
                let username = match initial {
                    Some(encoded) => match B64.decode(encoded.as_bytes()) {
                        Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                        Err(_) => {
                            return Ok(Flow::Reply(Reply::new(501, "Invalid base64 encoding")));
                        }
                    },
                    None => {
                        // "Username:"
                        match self.challenge(reader, writer, "VXNlcm5hbWU6").await? {
                            Some(line) if line == "*" => {
                                return Ok(Flow::Reply(Reply::new(501, "Authentication cancelled")));
                            }
                            Some(line) => match B64.decode(line.as_bytes()) {
                                Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                                Err(_) => {
                                    return Ok(Flow::Reply(Reply::new(
                                        501,
                                        "Invalid base64 encoding",
                                    )));
                                }
                            },
                            None => return Ok(Flow::Close),
                        }
                    }
                };
                // "Password:"
                let password = match self.challenge(reader, writer, "UGFzc3dvcmQ6").await? {
                    Some(line) if line == "*" => {
                        return Ok(Flow::Reply(Reply::new(501, "Authentication cancelled")));
                    }
                    Some(line) => match B64.decode(line.as_bytes()) {
                        Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                        Err(_) => {
                            return Ok(Flow::Reply(Reply::new(501, "Invalid base64 encoding")));
                        }
                    },
                    None => return Ok(Flow::Close),
                };
                handler.authenticate(&username, &password)
            }
            "" => return Ok(Flow::Reply(Reply::new(501, "Syntax error: mechanism required"))),
            _ => return Ok(Flow::Reply(Reply::new(504, "Unrecognized authentication type"))),
        };

        if verdict {
            self.authenticated = true;
            info!(session = %self.id, "client authenticated");
            Ok(Flow::Reply(Reply::new(235, "Authentication successful")))
        } else {
            warn!(session = %self.id, "authentication failed");
            Ok(Flow::Reply(Reply::new(535, "Authentication credentials invalid")))
        }
    }

    /// Send a `334` challenge and read the client's response line.
    /// Returns `None` when the client went away.
    async fn challenge(
        &self,
        reader: &mut SessionReader,
        writer: &mut SessionWriter,
        prompt: &str,
    ) -> io::Result<Option<String>> {
        write_reply(writer, &Reply::new(334, prompt)).await?;
        match read_line_timed(reader, MAX_COMMAND_LINE, self.config.reply_timeout).await {
            Ok(Line::Data(line)) => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
            Ok(Line::Eof) => Ok(None),
            Ok(Line::TooLong) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "over-long AUTH response",
            )),
            Err(e) => Err(e),
        }
    }

    /// Hand the assembled message to the host. Clears the transaction
    /// whether the handler accepts or rejects.
    fn deliver(&mut self) -> Reply {
        let envelope = Envelope {
            session_id: self.id.clone(),
            remote_addr: self.declared_remote_addr,
            helo: self.helo.clone(),
            tls_active: self.tls_active,
            peer_certificates: self.peer_certificates.clone(),
            from: self.from.take().unwrap_or_default(),
            recipients: std::mem::take(&mut self.recipients),
            data: std::mem::take(&mut self.data),
        };
        let bytes = envelope.data.len();
        match self.handler.deliver(envelope) {
            Ok(()) => {
                info!(session = %self.id, bytes, "message accepted");
                Reply::ok()
            }
            Err(rejection) => {
                info!(session = %self.id, code = rejection.code, "message rejected by handler");
                Reply::new(rejection.code, rejection.message)
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.recipients.clear();
        self.data.clear();
    }

    /// RFC 3207: a TLS upgrade resets the protocol to its initial state.
    fn reset_smtp_state(&mut self) {
        self.helo = None;
        self.authenticated = false;
        self.reset_transaction();
    }
}

async fn write_reply(writer: &mut SessionWriter, reply: &Reply) -> io::Result<()> {
    writer.write_all(reply.format().as_bytes()).await?;
    writer.flush().await
}

async fn read_line_timed(
    reader: &mut SessionReader,
    limit: usize,
    duration: Duration,
) -> io::Result<Line> {
    match timeout(duration, read_line_bounded(reader, limit)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

/// Read and discard exactly `remaining` payload bytes.
async fn consume_exact(
    reader: &mut SessionReader,
    mut remaining: usize,
    duration: Duration,
) -> io::Result<()> {
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        match timeout(duration, reader.read_exact(&mut scratch[..want])).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        };
        remaining -= want;
    }
    Ok(())
}

fn split_command(line: &str) -> (String, &str) {
    match line.find(' ') {
        Some(pos) => (line[..pos].to_ascii_uppercase(), line[pos + 1..].trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Case-insensitively strip a leading keyword such as `FROM:` or `TO:`.
fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let len = keyword.len();
    if arg.len() >= len && arg.as_bytes()[..len].eq_ignore_ascii_case(keyword.as_bytes()) {
        arg.get(len..).map(str::trim_start)
    } else {
        None
    }
}

/// Strip optional angle brackets around an address.
fn extract_address(field: &str) -> String {
    let field = field.trim();
    if field.starts_with('<') && field.ends_with('>') && field.len() >= 2 {
        field[1..field.len() - 1].trim().to_string()
    } else {
        field.to_string()
    }
}
