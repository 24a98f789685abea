//! PROXY protocol v1: a single ASCII line,
//! `PROXY <family> [<src> <dst> <sport> <dport>]` terminated by CRLF.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::ProxyResult;
use crate::error::Error;

/// Longest legal v1 header, CRLF included.
pub(crate) const MAX_HEADER_LENGTH: usize = 107;

const PREFIX: &[u8; 6] = b"PROXY ";

fn malformed(what: impl Into<String>) -> Error {
    Error::ProxyMalformed(what.into())
}

/// Parse a v1 header from the start of `input`.
///
/// Consumes bytes one at a time, never more than [`MAX_HEADER_LENGTH`], so
/// a malformed peer cannot make the parser read unbounded input.
pub(crate) async fn parse<R>(input: &mut R, session_id: &str) -> Result<ProxyResult, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MAX_HEADER_LENGTH];
    input
        .read_exact(&mut header[..PREFIX.len()])
        .await
        .map_err(|_| malformed("short read on v1 prefix"))?;
    if &header[..PREFIX.len()] != PREFIX {
        return Err(malformed("invalid v1 prefix"));
    }

    // Two-state recognizer: once a CR is seen, the next byte must be LF.
    let mut len = PREFIX.len();
    let mut saw_cr = false;
    let mut complete = false;
    while len < MAX_HEADER_LENGTH {
        let b = input
            .read_u8()
            .await
            .map_err(|_| malformed("EOF inside v1 header"))?;
        header[len] = b;
        len += 1;
        if saw_cr {
            if b == b'\n' {
                complete = true;
                break;
            }
            return Err(malformed("CR not followed by LF in v1 header"));
        }
        saw_cr = b == b'\r';
    }
    if !complete {
        return Err(malformed("no CRLF within the v1 header length limit"));
    }

    let line = std::str::from_utf8(&header[PREFIX.len()..len - 2])
        .map_err(|_| malformed("non-ASCII bytes in v1 header"))?;

    let mut fields = line.split(' ');
    let family = fields.next().unwrap_or("");
    match family {
        // The rest of an UNKNOWN line is ignored up to the CRLF.
        "UNKNOWN" => {
            debug!(session = %session_id, "PROXY v1 UNKNOWN, keeping the TCP peer address");
            Ok(ProxyResult::Nop)
        }
        "TCP4" | "TCP6" => {
            let rest: Vec<&str> = fields.collect();
            if rest.len() != 4 {
                return Err(malformed(format!("expected 4 fields after {}, got {}", family, rest.len())));
            }
            let src_ip: IpAddr = if family == "TCP4" {
                rest[0]
                    .parse::<Ipv4Addr>()
                    .map_err(|_| malformed(format!("bad IPv4 source address {:?}", rest[0])))?
                    .into()
            } else {
                rest[0]
                    .parse::<Ipv6Addr>()
                    .map_err(|_| malformed(format!("bad IPv6 source address {:?}", rest[0])))?
                    .into()
            };
            // The destination address and port are validated, then discarded.
            if family == "TCP4" {
                rest[1]
                    .parse::<Ipv4Addr>()
                    .map_err(|_| malformed(format!("bad IPv4 destination address {:?}", rest[1])))?;
            } else {
                rest[1]
                    .parse::<Ipv6Addr>()
                    .map_err(|_| malformed(format!("bad IPv6 destination address {:?}", rest[1])))?;
            }
            let src_port = parse_port(rest[2])?;
            parse_port(rest[3])?;

            debug!(
                session = %session_id,
                family = family,
                source = %src_ip,
                port = src_port,
                "accepted PROXY v1 header"
            );
            Ok(ProxyResult::Proxied(SocketAddr::new(src_ip, src_port)))
        }
        other => Err(malformed(format!("unknown v1 address family {:?}", other))),
    }
}

/// Ports are 1 to 5 decimal digits, value within [1, 65535].
fn parse_port(field: &str) -> Result<u16, Error> {
    if field.is_empty() || field.len() > 5 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(format!("bad port field {:?}", field)));
    }
    match field.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(malformed(format!("port {:?} out of range", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(header: &[u8]) -> Result<ProxyResult, Error> {
        let mut input = header;
        parse(&mut input, "test").await
    }

    #[tokio::test]
    async fn tcp4_source_is_extracted() {
        let result = run(b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 25\r\n").await.unwrap();
        assert_eq!(result, ProxyResult::Proxied("192.168.0.1:56324".parse().unwrap()));
    }

    #[tokio::test]
    async fn tcp6_source_is_extracted() {
        let result = run(b"PROXY TCP6 2001:db8::1 ::1 443 25\r\n").await.unwrap();
        assert_eq!(result, ProxyResult::Proxied("[2001:db8::1]:443".parse().unwrap()));
    }

    #[tokio::test]
    async fn unknown_family_is_a_nop() {
        assert_eq!(run(b"PROXY UNKNOWN\r\n").await.unwrap(), ProxyResult::Nop);
        // anything before the CRLF is ignored for UNKNOWN
        assert_eq!(
            run(b"PROXY UNKNOWN whatever comes here\r\n").await.unwrap(),
            ProxyResult::Nop
        );
    }

    #[tokio::test]
    async fn invalid_octet_fails() {
        assert!(run(b"PROXY TCP4 999.0.0.1 10.0.0.1 1 1\r\n").await.is_err());
    }

    #[tokio::test]
    async fn family_mismatch_fails() {
        assert!(run(b"PROXY TCP4 2001:db8::1 10.0.0.1 1 1\r\n").await.is_err());
        assert!(run(b"PROXY TCP6 10.0.0.1 ::1 1 1\r\n").await.is_err());
    }

    #[tokio::test]
    async fn port_bounds_are_enforced() {
        assert!(run(b"PROXY TCP4 10.0.0.1 10.0.0.2 0 25\r\n").await.is_err());
        assert!(run(b"PROXY TCP4 10.0.0.1 10.0.0.2 65536 25\r\n").await.is_err());
        assert!(run(b"PROXY TCP4 10.0.0.1 10.0.0.2 123456 25\r\n").await.is_err());
    }

    #[tokio::test]
    async fn cr_must_be_followed_by_lf() {
        assert!(run(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 2\rX\n").await.is_err());
    }

    #[tokio::test]
    async fn missing_terminator_within_limit_fails() {
        let mut header = b"PROXY TCP4 ".to_vec();
        header.extend(std::iter::repeat(b'1').take(MAX_HEADER_LENGTH));
        assert!(run(&header).await.is_err());
    }

    #[tokio::test]
    async fn double_space_fails() {
        assert!(run(b"PROXY TCP4  10.0.0.1 10.0.0.2 1 2\r\n").await.is_err());
    }

    #[tokio::test]
    async fn missing_fields_fail() {
        assert!(run(b"PROXY TCP4\r\n").await.is_err());
        assert!(run(b"PROXY TCP4 10.0.0.1 10.0.0.2 1\r\n").await.is_err());
    }

    #[tokio::test]
    async fn bad_prefix_fails() {
        assert!(run(b"PROXZ TCP4 10.0.0.1 10.0.0.2 1 2\r\n").await.is_err());
    }
}
