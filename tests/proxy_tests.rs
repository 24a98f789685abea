//! PROXY-protocol preamble behavior over real sockets.

mod common;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use common::{start_server, test_config};
use gatemail::client::SmtpClient;
use gatemail::ProxyMode;

const V2_MAGIC: [u8; 12] = [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

fn permissive_config() -> gatemail::ServerConfig {
    let mut config = test_config();
    config.proxy_mode = ProxyMode::Permissive;
    config
}

/// Read one reply line off a raw stream.
fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn v1_header_rewrites_the_peer_address() {
    let (mut handle, rx) = start_server(permissive_config()).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut client = SmtpClient::connect_with_config(addr, &test_config()).unwrap();
        // the preamble goes out before the greeting comes back
        client.send("PROXY TCP4 192.168.0.1 10.0.0.1 56324 25").unwrap();
        assert_eq!(client.receive().unwrap().code, 220);

        client.send_and_check("EHLO a").unwrap();
        client.send_and_check("MAIL FROM:<s@x>").unwrap();
        client.send_and_check("RCPT TO:<r@y>").unwrap();
        assert_eq!(client.data(b"hi\r\n").unwrap().code, 250);
        client.quit().unwrap();
    })
    .await
    .unwrap();

    let envelope = rx.try_recv().unwrap();
    assert_eq!(envelope.remote_addr, "192.168.0.1:56324".parse().unwrap());
    assert_eq!(envelope.data, b"hi\r\n");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn v2_local_keeps_the_tcp_peer() {
    let (mut handle, rx) = start_server(permissive_config()).await;
    let addr = handle.local_addr();

    let local = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let local = stream.local_addr().unwrap();

        // LOCAL command, UNSPEC family, empty address block
        let mut header = V2_MAGIC.to_vec();
        header.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        stream.write_all(&header).unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        assert!(read_line(&mut reader).starts_with("220 "));

        write!(stream, "EHLO a\r\n").unwrap();
        loop {
            let line = read_line(&mut reader);
            assert!(line.starts_with("250"));
            if line.as_bytes()[3] == b' ' {
                break;
            }
        }
        write!(stream, "MAIL FROM:<s@x>\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "RCPT TO:<r@y>\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "DATA\r\nlocal\r\n.\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("354"));
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "QUIT\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("221"));

        local
    })
    .await
    .unwrap();

    let envelope = rx.try_recv().unwrap();
    // NOP result: the session kept the real TCP peer
    assert_eq!(envelope.remote_addr, local);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn v2_inet_rewrites_the_peer_address() {
    let (mut handle, rx) = start_server(permissive_config()).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut header = V2_MAGIC.to_vec();
        header.extend_from_slice(&[0x21, 0x11]); // PROXY, INET/STREAM
        header.extend_from_slice(&12u16.to_be_bytes());
        header.extend_from_slice(&[10, 1, 2, 3]); // src
        header.extend_from_slice(&[10, 0, 0, 1]); // dst
        header.extend_from_slice(&4567u16.to_be_bytes());
        header.extend_from_slice(&25u16.to_be_bytes());
        stream.write_all(&header).unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        assert!(read_line(&mut reader).starts_with("220 "));

        write!(stream, "HELO a\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "MAIL FROM:<s@x>\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "RCPT TO:<r@y>\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "DATA\r\nvia proxy\r\n.\r\n").unwrap();
        assert!(read_line(&mut reader).starts_with("354"));
        assert!(read_line(&mut reader).starts_with("250"));
        write!(stream, "QUIT\r\n").unwrap();
    })
    .await
    .unwrap();

    let envelope = rx.try_recv().unwrap();
    assert_eq!(envelope.remote_addr, "10.1.2.3:4567".parse().unwrap());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_v1_header_closes_before_greeting() {
    let (mut handle, rx) = start_server(permissive_config()).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(stream, "PROXY TCP4 999.0.0.1 10.0.0.1 1 1\r\n").unwrap();

        // no greeting: clean EOF or a reset, never data
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected reply: {:?}", &buf[..n]),
        }
    })
    .await
    .unwrap();

    assert!(rx.try_recv().is_err());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn required_mode_rejects_plain_connections() {
    let mut config = test_config();
    config.proxy_mode = ProxyMode::Required;
    let (mut handle, _rx) = start_server(config).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(stream, "EHLO a\r\n").unwrap();

        // no greeting: clean EOF or a reset, never data
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected reply: {:?}", &buf[..n]),
        }
    })
    .await
    .unwrap();

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permissive_mode_accepts_plain_smtp() {
    let (mut handle, rx) = start_server(permissive_config()).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        // A plain client must speak first in permissive mode for the
        // dispatcher to classify the connection; pipelining EHLO does it.
        let mut client = SmtpClient::connect_with_config(addr, &test_config()).unwrap();
        client.send("EHLO a").unwrap();
        assert_eq!(client.receive().unwrap().code, 220);
        assert_eq!(client.receive().unwrap().code, 250);

        client.send_and_check("MAIL FROM:<s@x>").unwrap();
        client.send_and_check("RCPT TO:<r@y>").unwrap();
        assert_eq!(client.data(b"plain\r\n").unwrap().code, 250);
        client.quit().unwrap();
    })
    .await
    .unwrap();

    let envelope = rx.try_recv().unwrap();
    assert_eq!(envelope.data, b"plain\r\n");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_mode_treats_proxy_line_as_a_command() {
    let (mut handle, _rx) = start_server(test_config()).await;
    let addr = handle.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut client = SmtpClient::connect_with_config(addr, &test_config()).unwrap();
        assert_eq!(client.receive().unwrap().code, 220);
        // with the dispatcher off, the preamble is just an unknown verb
        let reply = client
            .send_receive("PROXY TCP4 192.168.0.1 10.0.0.1 56324 25")
            .unwrap();
        assert_eq!(reply.code, 500);
        client.quit().unwrap();
    })
    .await
    .unwrap();

    handle.shutdown().await;
}
