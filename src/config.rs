use std::time::Duration;

use tracing::warn;

use crate::utils::config::Config;

/// How the server treats the PROXY-protocol preamble on new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Never look for a preamble; every connection starts with SMTP.
    #[default]
    Disabled,
    /// Accept a v1 or v2 preamble when present, plain SMTP otherwise.
    Permissive,
    /// Reject connections that do not begin with a valid preamble.
    Required,
}

/// Server tuning knobs. All fields have working defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name announced in the greeting and EHLO response.
    pub hostname: String,
    /// Software banner appended to the `220` greeting.
    pub banner: String,
    /// Name used to identify the accept loop in logs.
    pub server_thread_name: String,
    /// Maximum concurrently served connections.
    pub max_connections: usize,
    /// Maximum accepted message size in bytes (DATA and BDAT alike).
    pub max_message_size: usize,
    /// Maximum recipients per transaction.
    pub max_recipients: usize,
    /// Offer STARTTLS. Requires TLS settings to be installed on the server.
    pub enable_tls: bool,
    /// Reject MAIL until the connection has been upgraded to TLS.
    pub require_tls: bool,
    /// Reject MAIL until the client has authenticated.
    pub require_auth: bool,
    /// Client-side TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-command read timeout; also the client's reply timeout.
    pub reply_timeout: Duration,
    pub proxy_mode: ProxyMode,
    /// Upper bound on the v2 preamble's variable-length address block.
    pub proxy_v2_max_data_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            banner: "gatemail".to_string(),
            server_thread_name: "gatemail-accept".to_string(),
            max_connections: 200,
            max_message_size: 50 * 1024 * 1024,
            max_recipients: 100,
            enable_tls: false,
            require_tls: false,
            require_auth: false,
            connect_timeout: Duration::from_secs(300),
            reply_timeout: Duration::from_secs(600),
            proxy_mode: ProxyMode::Disabled,
            proxy_v2_max_data_length: crate::proxy::DEFAULT_MAX_DATA_LENGTH,
        }
    }
}

impl ServerConfig {
    /// Build a config from the `[server]` section of an INI file, falling
    /// back to the defaults for missing keys.
    pub fn from_ini(config: &Config) -> Self {
        let defaults = Self::default();

        let proxy_mode = match config.get_value("server", "proxy_mode") {
            None => defaults.proxy_mode,
            Some("disabled") => ProxyMode::Disabled,
            Some("permissive") => ProxyMode::Permissive,
            Some("required") => ProxyMode::Required,
            Some(other) => {
                warn!("unknown proxy_mode '{}', PROXY protocol disabled", other);
                ProxyMode::Disabled
            }
        };

        Self {
            hostname: config
                .get_value("server", "hostname")
                .unwrap_or(&defaults.hostname)
                .to_string(),
            banner: config
                .get_value("server", "banner")
                .unwrap_or(&defaults.banner)
                .to_string(),
            server_thread_name: config
                .get_value("server", "server_thread_name")
                .unwrap_or(&defaults.server_thread_name)
                .to_string(),
            max_connections: config.get_int(
                "server",
                "max_connections",
                defaults.max_connections as i64,
            ) as usize,
            max_message_size: config.get_int(
                "server",
                "max_message_size",
                defaults.max_message_size as i64,
            ) as usize,
            max_recipients: config.get_int(
                "server",
                "max_recipients",
                defaults.max_recipients as i64,
            ) as usize,
            enable_tls: config.get_bool("server", "enable_tls", defaults.enable_tls),
            require_tls: config.get_bool("server", "require_tls", defaults.require_tls),
            require_auth: config.get_bool("server", "require_auth", defaults.require_auth),
            connect_timeout: Duration::from_millis(config.get_int(
                "server",
                "connect_timeout_ms",
                defaults.connect_timeout.as_millis() as i64,
            ) as u64),
            reply_timeout: Duration::from_millis(config.get_int(
                "server",
                "reply_timeout_ms",
                defaults.reply_timeout.as_millis() as i64,
            ) as u64),
            proxy_mode,
            proxy_v2_max_data_length: config.get_int(
                "server",
                "proxy_v2_max_data_length",
                defaults.proxy_v2_max_data_length as i64,
            ) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.proxy_mode, ProxyMode::Disabled);
        assert_eq!(cfg.proxy_v2_max_data_length, 2048);
        assert!(cfg.max_connections > 0);
    }

    #[test]
    fn from_ini_overrides_and_defaults() {
        let mut ini = Config::new();
        ini.set_value("server", "hostname", "mx1.example.org").unwrap();
        ini.set_value("server", "max_connections", "7").unwrap();
        ini.set_value("server", "proxy_mode", "required").unwrap();
        ini.set_value("server", "reply_timeout_ms", "1500").unwrap();

        let cfg = ServerConfig::from_ini(&ini);
        assert_eq!(cfg.hostname, "mx1.example.org");
        assert_eq!(cfg.max_connections, 7);
        assert_eq!(cfg.proxy_mode, ProxyMode::Required);
        assert_eq!(cfg.reply_timeout, Duration::from_millis(1500));
        // untouched keys keep their defaults
        assert_eq!(cfg.max_recipients, ServerConfig::default().max_recipients);
    }
}
