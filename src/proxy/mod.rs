//! PROXY protocol preamble handling (v1 textual and v2 binary).
//!
//! An upstream L4 proxy may prepend a header declaring the original client
//! address before any SMTP byte. The dispatcher discriminates the two wire
//! formats from their leading bytes without consuming them, so a connection
//! that carries no preamble reaches the session with a pristine stream.

mod v1;
mod v2;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ProxyMode;
use crate::error::Error;

pub(crate) use v2::DEFAULT_MAX_DATA_LENGTH;

/// Outcome of a successfully parsed preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyResult {
    /// The header carried no usable address (UNKNOWN, LOCAL, UNSPEC or
    /// UNIX); the real TCP peer address stands.
    Nop,
    /// The upstream proxy declared this original source address.
    Proxied(SocketAddr),
}

const V1_PREFIX: &[u8; 6] = b"PROXY ";

/// Decide whether the connection starts with a v1 or v2 preamble and run
/// the matching parser. Consumes exactly the preamble bytes, or nothing
/// when the connection is plain SMTP.
///
/// In [`ProxyMode::Required`] a connection whose leading bytes match
/// neither format is rejected.
pub(crate) async fn negotiate(
    stream: &mut TcpStream,
    mode: ProxyMode,
    max_data_length: usize,
    session_id: &str,
) -> Result<ProxyResult, Error> {
    debug_assert!(mode != ProxyMode::Disabled);

    let mut buf = [0u8; v2::MAGIC.len()];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(Error::ProxyMalformed(
                "connection closed before the preamble".to_string(),
            ));
        }

        if buf[..n.min(v2::MAGIC.len())] == v2::MAGIC[..n.min(v2::MAGIC.len())] {
            if n >= v2::MAGIC.len() {
                return v2::parse(stream, max_data_length, session_id).await;
            }
        } else if buf[..n.min(V1_PREFIX.len())] == V1_PREFIX[..n.min(V1_PREFIX.len())] {
            if n >= V1_PREFIX.len() {
                return v1::parse(stream, session_id).await;
            }
        } else {
            debug!(session = %session_id, "no PROXY preamble on connection");
            return match mode {
                ProxyMode::Required => Err(Error::ProxyMalformed(
                    "PROXY header required but absent".to_string(),
                )),
                _ => Ok(ProxyResult::Nop),
            };
        }

        // A prefix matched but the discriminating bytes are not all here
        // yet; peek again once more of the header has arrived.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
