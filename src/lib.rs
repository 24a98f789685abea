//! An embeddable SMTP server.
//!
//! `gatemail` accepts inbound TCP connections, optionally consumes an
//! upstream PROXY-protocol preamble (v1 textual or v2 binary), drives an
//! RFC 5321 session with STARTTLS and BDAT support, and hands every
//! received message to a host-supplied [`MessageHandler`]. It receives
//! mail; queueing, relaying and local delivery are up to the host.
//!
//! ```no_run
//! use gatemail::{Envelope, MessageHandler, Rejection, ServerConfig, SmtpServer};
//!
//! struct Printer;
//!
//! impl MessageHandler for Printer {
//!     fn deliver(&self, envelope: Envelope) -> Result<(), Rejection> {
//!         println!("mail from <{}> ({} bytes)", envelope.from, envelope.data.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gatemail::Error> {
//!     let server = SmtpServer::new(ServerConfig::default(), Printer);
//!     let mut handle = server.bind("0.0.0.0:2525").await?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
mod config;
mod error;
mod handler;
mod io;
pub mod proxy;
mod reply;
mod server;
mod session;
mod stream;
pub mod tls;
pub mod utils;

pub use config::{ProxyMode, ServerConfig};
pub use error::Error;
pub use handler::{AuthHandler, Envelope, MessageHandler, Rejection};
pub use io::{DotTerminatedWriter, ExtraDotWriter};
pub use server::{ServerHandle, SmtpServer};
pub use tls::TlsSettings;
