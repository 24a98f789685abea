//! Shared scaffolding: a real server on an ephemeral port plus a channel
//! that collects every delivered envelope.

#![allow(dead_code)]

use std::sync::mpsc;
use std::time::Duration;

use gatemail::{
    Envelope, MessageHandler, Rejection, ServerConfig, ServerHandle, SmtpServer,
};

pub struct CollectingHandler {
    tx: mpsc::Sender<Envelope>,
}

impl CollectingHandler {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }
}

impl MessageHandler for CollectingHandler {
    fn deliver(&self, envelope: Envelope) -> Result<(), Rejection> {
        // Send failures only mean the test dropped the receiver already.
        let _ = self.tx.send(envelope);
        Ok(())
    }
}

/// Config with short timeouts so a hung exchange fails the test quickly.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        hostname: "mx.test".to_string(),
        banner: "gatemail-test".to_string(),
        reply_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

pub async fn start_server(config: ServerConfig) -> (ServerHandle, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel();
    let server = SmtpServer::new(config, CollectingHandler { tx });
    let handle = server.bind("127.0.0.1:0").await.expect("server should bind");
    (handle, rx)
}

pub async fn start_server_with(
    config: ServerConfig,
    handler: impl MessageHandler,
) -> ServerHandle {
    SmtpServer::new(config, handler)
        .bind("127.0.0.1:0")
        .await
        .expect("server should bind")
}
