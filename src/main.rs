//! gatemaild: a small SMTP daemon around the gatemail library. Receives
//! messages and spools them to disk as `.eml` files.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use gatemail::utils::config::{Config, ConfigLoader};
use gatemail::{Envelope, MessageHandler, Rejection, ServerConfig, SmtpServer, TlsSettings};

const DEFAULT_CONFIG_PATH: &str = "/etc/gatemail/config.ini";

struct SpoolHandler {
    spool_dir: Option<PathBuf>,
}

impl MessageHandler for SpoolHandler {
    fn deliver(&self, envelope: Envelope) -> Result<(), Rejection> {
        info!(
            session = %envelope.session_id,
            from = %envelope.from,
            recipients = envelope.recipients.len(),
            bytes = envelope.data.len(),
            "message received"
        );

        let Some(dir) = &self.spool_dir else {
            return Ok(());
        };
        if let Err(e) = spool(dir, &envelope) {
            error!(session = %envelope.session_id, error = %e, "failed to spool message");
            return Err(Rejection::new(451, "Temporary failure storing message"));
        }
        Ok(())
    }
}

fn spool(dir: &Path, envelope: &Envelope) -> std::io::Result<()> {
    let path = dir.join(format!("{}.eml", envelope.session_id));
    let mut file = fs::File::create(&path)?;
    write!(file, "Return-Path: <{}>\r\n", envelope.from)?;
    for recipient in &envelope.recipients {
        write!(file, "X-Envelope-To: <{}>\r\n", recipient)?;
    }
    write!(file, "X-Remote-Address: {}\r\n", envelope.remote_addr)?;
    file.write_all(&envelope.data)?;
    info!(path = %path.display(), "message spooled");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut config_path = String::from(DEFAULT_CONFIG_PATH);
    let mut config_path_given = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args.next().context("--config requires a path")?;
                config_path_given = true;
            }
            other => {
                error!("unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    // The default config path is optional; an explicitly given one is not.
    let ini = if config_path_given || Path::new(&config_path).is_file() {
        ConfigLoader::new(config_path).load()?
    } else {
        info!("no config file, using defaults");
        Config::new()
    };

    let config = ServerConfig::from_ini(&ini);

    let tls = if config.enable_tls {
        let cert = ini.get_value("tls", "cert").context("tls.cert missing")?;
        let key = ini.get_value("tls", "key").context("tls.key missing")?;
        Some(match ini.get_value("tls", "client_ca") {
            Some(ca) => TlsSettings::from_pem_files_with_client_auth(cert, key, ca)?,
            None => TlsSettings::from_pem_files(cert, key)?,
        })
    } else {
        None
    };

    let spool_dir = ini.get_value("server", "spool_dir").map(PathBuf::from);
    if let Some(dir) = &spool_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create spool directory {}", dir.display()))?;
    }

    let listen = ini
        .get_value("server", "listen")
        .unwrap_or("0.0.0.0:2525")
        .to_string();

    let mut server = SmtpServer::new(config, SpoolHandler { spool_dir });
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }

    let mut handle = server.bind(listen.as_str()).await?;
    info!(addr = %handle.local_addr(), "gatemail started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
