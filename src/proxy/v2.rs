//! PROXY protocol v2: a 16-byte binary header followed by a
//! variable-length address block.
//!
//! ```text
//! struct proxy_hdr_v2 {
//!     uint8_t  sig[12];  // 0D 0A 0D 0A 00 0D 0A 51 55 49 54 0A
//!     uint8_t  ver_cmd;  // protocol version and command
//!     uint8_t  fam;      // address family and transport
//!     uint16_t len;      // number of following bytes part of the header
//! };
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::ProxyResult;
use crate::error::Error;

pub(crate) const MAGIC: [u8; 12] =
    [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

/// Default cap on the variable-length block. The standard maximum is 216
/// bytes (two unix addresses); 2048 leaves room for optional TLV data while
/// bounding what a forged length field can make the parser read.
pub(crate) const DEFAULT_MAX_DATA_LENGTH: usize = 2048;

const HEADER_SIZE: usize = 16;

const IPV4_LEN: usize = 4;
const IPV6_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Local,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

fn malformed(what: impl Into<String>) -> Error {
    Error::ProxyMalformed(what.into())
}

/// Parse a v2 header from the start of `input`. Consumes exactly the fixed
/// header plus the declared address block, never more than
/// `HEADER_SIZE + max_data_length` bytes.
pub(crate) async fn parse<R>(
    input: &mut R,
    max_data_length: usize,
    session_id: &str,
) -> Result<ProxyResult, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    input
        .read_exact(&mut header)
        .await
        .map_err(|_| malformed("short read on v2 header"))?;

    if header[..MAGIC.len()] != MAGIC {
        return Err(malformed("invalid v2 magic"));
    }

    let ver_cmd = header[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(malformed(format!("unsupported v2 version {}", ver_cmd >> 4)));
    }
    let command = match ver_cmd & 0x0F {
        0x0 => Command::Local,
        0x1 => Command::Proxy,
        other => return Err(malformed(format!("invalid v2 command {}", other))),
    };

    let fam_trans = header[13];
    let family = match fam_trans >> 4 {
        0x0 => Family::Unspec,
        0x1 => Family::Inet,
        0x2 => Family::Inet6,
        0x3 => Family::Unix,
        other => return Err(malformed(format!("invalid v2 address family {}", other))),
    };
    // The transport nibble is validated for conformance but otherwise
    // unused: stream and datagram values are treated alike.
    match fam_trans & 0x0F {
        0x0..=0x2 => {}
        other => return Err(malformed(format!("invalid v2 transport {}", other))),
    }

    let len = u16::from_be_bytes([header[14], header[15]]) as usize;
    if len > max_data_length {
        return Err(malformed(format!(
            "v2 data length {} exceeds the configured maximum {}",
            len, max_data_length
        )));
    }
    let mut data = vec![0u8; len];
    input
        .read_exact(&mut data)
        .await
        .map_err(|_| malformed("EOF inside the v2 address block"))?;

    if command == Command::Local {
        // A health check, not a proxied connection; the address block, if
        // any, is consumed and ignored.
        debug!(session = %session_id, "PROXY v2 LOCAL, keeping the TCP peer address");
        return Ok(ProxyResult::Nop);
    }

    let source = match family {
        Family::Unix => {
            warn!(
                session = %session_id,
                "unsupported PROXY v2 family UNIX, falling back to UNSPEC"
            );
            return Ok(ProxyResult::Nop);
        }
        Family::Unspec => return Ok(ProxyResult::Nop),
        Family::Inet => {
            // src_addr[4] dst_addr[4] src_port[2] dst_port[2]
            if data.len() < IPV4_LEN * 2 + 4 {
                return Err(malformed("v2 INET address block too short"));
            }
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[IPV4_LEN * 2], data[IPV4_LEN * 2 + 1]]);
            SocketAddr::new(ip.into(), port)
        }
        Family::Inet6 => {
            // src_addr[16] dst_addr[16] src_port[2] dst_port[2]
            if data.len() < IPV6_LEN * 2 + 4 {
                return Err(malformed("v2 INET6 address block too short"));
            }
            let mut octets = [0u8; IPV6_LEN];
            octets.copy_from_slice(&data[..IPV6_LEN]);
            let port = u16::from_be_bytes([data[IPV6_LEN * 2], data[IPV6_LEN * 2 + 1]]);
            SocketAddr::new(Ipv6Addr::from(octets).into(), port)
        }
    };

    // Destination address and port, and any trailing TLV bytes, are
    // consumed and discarded.
    debug!(session = %session_id, source = %source, "accepted PROXY v2 header");
    Ok(ProxyResult::Proxied(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ver_cmd: u8, fam_trans: u8, data: &[u8]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.push(ver_cmd);
        out.push(fam_trans);
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    async fn run(wire: &[u8]) -> Result<ProxyResult, Error> {
        let mut input = wire;
        parse(&mut input, DEFAULT_MAX_DATA_LENGTH, "test").await
    }

    #[tokio::test]
    async fn local_with_empty_block_is_a_nop() {
        let wire = header(0x20, 0x00, &[]);
        assert_eq!(run(&wire).await.unwrap(), ProxyResult::Nop);
    }

    #[tokio::test]
    async fn inet_source_is_extracted() {
        let mut data = Vec::new();
        data.extend_from_slice(&[192, 168, 0, 1]); // src
        data.extend_from_slice(&[10, 0, 0, 1]); // dst, discarded
        data.extend_from_slice(&56324u16.to_be_bytes());
        data.extend_from_slice(&25u16.to_be_bytes());
        let wire = header(0x21, 0x11, &data);
        assert_eq!(
            run(&wire).await.unwrap(),
            ProxyResult::Proxied("192.168.0.1:56324".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn inet6_source_port_sits_after_both_addresses() {
        let mut data = Vec::new();
        let src = "2001:db8::1".parse::<Ipv6Addr>().unwrap();
        data.extend_from_slice(&src.octets());
        data.extend_from_slice(&[0u8; 16]); // dst, discarded
        data.extend_from_slice(&8025u16.to_be_bytes());
        data.extend_from_slice(&25u16.to_be_bytes());
        let wire = header(0x21, 0x21, &data);
        assert_eq!(
            run(&wire).await.unwrap(),
            ProxyResult::Proxied("[2001:db8::1]:8025".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn trailing_tlv_bytes_are_ignored() {
        let mut data = Vec::new();
        data.extend_from_slice(&[192, 168, 0, 1]);
        data.extend_from_slice(&[10, 0, 0, 1]);
        data.extend_from_slice(&443u16.to_be_bytes());
        data.extend_from_slice(&25u16.to_be_bytes());
        data.extend_from_slice(b"tlv junk after the address block");
        let wire = header(0x21, 0x11, &data);
        assert_eq!(
            run(&wire).await.unwrap(),
            ProxyResult::Proxied("192.168.0.1:443".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn unspec_and_unix_are_nops() {
        assert_eq!(run(&header(0x21, 0x01, &[])).await.unwrap(), ProxyResult::Nop);
        assert_eq!(run(&header(0x21, 0x31, &[0u8; 216])).await.unwrap(), ProxyResult::Nop);
    }

    #[tokio::test]
    async fn bad_version_fails() {
        assert!(run(&header(0x10, 0x11, &[0u8; 12])).await.is_err());
    }

    #[tokio::test]
    async fn bad_command_fails() {
        assert!(run(&header(0x22, 0x11, &[0u8; 12])).await.is_err());
    }

    #[tokio::test]
    async fn bad_family_and_transport_fail() {
        assert!(run(&header(0x21, 0x41, &[0u8; 12])).await.is_err());
        assert!(run(&header(0x21, 0x13, &[0u8; 12])).await.is_err());
    }

    #[tokio::test]
    async fn length_above_cap_fails() {
        let mut input: &[u8] = &header(0x21, 0x11, &[0u8; 64]);
        assert!(parse(&mut input, 32, "test").await.is_err());
    }

    #[tokio::test]
    async fn short_address_block_fails() {
        assert!(run(&header(0x21, 0x11, &[0u8; 8])).await.is_err());
        assert!(run(&header(0x21, 0x21, &[0u8; 20])).await.is_err());
    }

    #[tokio::test]
    async fn truncated_block_fails() {
        let mut wire = header(0x21, 0x11, &[0u8; 12]);
        wire.truncate(wire.len() - 4);
        assert!(run(&wire).await.is_err());
    }

    #[tokio::test]
    async fn bad_magic_fails() {
        let mut wire = header(0x21, 0x11, &[0u8; 12]);
        wire[5] ^= 0xFF;
        assert!(run(&wire).await.is_err());
    }
}
