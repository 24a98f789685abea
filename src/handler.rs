//! Host-facing traits: message delivery and authentication.

use std::net::SocketAddr;

use tokio_rustls::rustls::pki_types::CertificateDer;

/// A received message together with its SMTP envelope and session facts.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Opaque server-assigned identifier, the same one used in log lines.
    pub session_id: String,
    /// The peer address the session acts on; equals the TCP peer unless a
    /// PROXY preamble declared a different source.
    pub remote_addr: SocketAddr,
    /// Client identity from HELO/EHLO.
    pub helo: Option<String>,
    pub tls_active: bool,
    /// Peer certificate chain, non-empty only when the TLS acceptor
    /// requires client authentication and the peer presented one.
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// Reverse-path from MAIL FROM; empty for the null sender `<>`.
    pub from: String,
    /// Forward-paths in RCPT order. Duplicates are not collapsed.
    pub recipients: Vec<String>,
    /// Message content with CRLF line endings, dot-stuffing removed.
    pub data: Vec<u8>,
}

/// Reply a handler returns to refuse a message; code and text are forwarded
/// to the client verbatim, so the code should be a valid SMTP 4xx or 5xx.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Consumes messages the server has accepted over the wire.
///
/// Called on the session task after the DATA terminator (or the final BDAT
/// chunk) has been read. The call is synchronous; implementations that do
/// slow work should hand it off and answer quickly, since the session's
/// reply waits on the return value.
pub trait MessageHandler: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope) -> Result<(), Rejection>;
}

/// Validates AUTH PLAIN / AUTH LOGIN credentials.
pub trait AuthHandler: Send + Sync + 'static {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}
