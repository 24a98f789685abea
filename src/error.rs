use std::io;

use thiserror::Error;

/// Errors surfaced at the library boundary.
///
/// Protocol-level conditions (bad syntax, bad command sequence, policy
/// rejections) are SMTP replies, not errors; they are handled inside the
/// session and never reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("malformed PROXY protocol header: {0}")]
    ProxyMalformed(String),
}
