//! The accept loop, session registry, and graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyMode, ServerConfig};
use crate::error::Error;
use crate::handler::{AuthHandler, MessageHandler};
use crate::proxy::{self, ProxyResult};
use crate::session::Session;
use crate::tls::{self, TlsSettings};
use crate::utils;

/// Permits kept beyond `max_connections` so sessions shutting down
/// gracefully can still get their last replies out.
const CONNECTION_PERMIT_SLACK: usize = 10;

/// Pause after an accept failure so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// An embeddable SMTP server. Configure it, install a [`MessageHandler`],
/// then [`bind`] or [`serve`] to get a running [`ServerHandle`].
///
/// [`bind`]: SmtpServer::bind
/// [`serve`]: SmtpServer::serve
pub struct SmtpServer {
    config: ServerConfig,
    handler: Arc<dyn MessageHandler>,
    auth: Option<Arc<dyn AuthHandler>>,
    tls: Option<TlsSettings>,
}

impl SmtpServer {
    pub fn new(config: ServerConfig, handler: impl MessageHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            auth: None,
            tls: None,
        }
    }

    /// Install an authentication handler; EHLO will advertise
    /// `AUTH PLAIN LOGIN`.
    pub fn with_auth_handler(mut self, auth: impl AuthHandler) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Install TLS material for STARTTLS. Only offered when
    /// [`ServerConfig::enable_tls`] is also set.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bind a listener and start serving.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<ServerHandle, Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Start serving on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<ServerHandle, Error> {
        if self.config.enable_tls && self.tls.is_none() {
            return Err(Error::Config(
                "enable_tls is set but no TLS settings were installed".to_string(),
            ));
        }
        if self.tls.is_some() {
            tls::install_crypto_provider();
        }

        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(SessionRegistry::default());
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_connections + CONNECTION_PERMIT_SLACK,
        ));

        info!(
            server = %self.config.server_thread_name,
            addr = %local_addr,
            "SMTP server started"
        );

        let shared = Arc::new(Shared {
            config: Arc::new(self.config),
            handler: self.handler,
            auth: self.auth,
            tls: self.tls,
            registry: registry.clone(),
        });
        let accept = tokio::spawn(accept_loop(listener, shared, semaphore, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept: Some(accept),
            registry,
        })
    }
}

struct Shared {
    config: Arc<ServerConfig>,
    handler: Arc<dyn MessageHandler>,
    auth: Option<Arc<dyn AuthHandler>>,
    tls: Option<TlsSettings>,
    registry: Arc<SessionRegistry>,
}

/// Control handle for a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
    registry: Arc<SessionRegistry>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions currently running.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Graceful shutdown: stop accepting, tell every open session to quit
    /// (each replies `421` at its next command boundary), and wait until
    /// the accept task has drained them all. Idempotent.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept.take() {
            if let Err(e) = task.await {
                error!(error = %e, "accept task failed during shutdown");
            }
        }
    }
}

/// Sessions currently running, keyed by session id.
///
/// Lock discipline: the lock is held only for map mutation, never while
/// signalling or awaiting a session. Session completion paths re-acquire it
/// to remove themselves, so holding it across an await on session progress
/// would deadlock.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<String, SocketAddr>>,
}

impl SessionRegistry {
    fn insert(&self, id: &str, peer: SocketAddr) {
        self.sessions.lock().unwrap().insert(id.to_string(), peer);
    }

    fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    let shutdown_check = shutdown.clone();

    loop {
        // Reap finished session tasks so the set does not grow with the
        // lifetime total of connections.
        while sessions.try_join_next().is_some() {}

        // Block while the allowed count of open connections is reached.
        let permit = tokio::select! {
            _ = shutdown.wait_for(|quit| *quit) => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accept_outcome = tokio::select! {
            _ = shutdown.wait_for(|quit| *quit) => None,
            accepted = listener.accept() => Some(accepted),
        };

        let (stream, peer) = match accept_outcome {
            None => {
                drop(permit);
                break;
            }
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                drop(permit);
                // expected while shutting down, when the socket closes
                if *shutdown_check.borrow() {
                    break;
                }
                error!(error = %e, "error accepting connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let id = utils::session_id();
        // Register before spawning; the task's completion path removes it.
        shared.registry.insert(&id, peer);

        let shared = shared.clone();
        let session_shutdown = shutdown.clone();
        sessions.spawn(async move {
            // Held for the whole session; dropping it releases the permit
            // on every exit path.
            let _permit = permit;
            run_connection(stream, peer, id.clone(), &shared, session_shutdown).await;
            shared.registry.remove(&id);
        });
    }

    // Stop accepting, then wait for the in-flight sessions to drain.
    drop(listener);
    while sessions.join_next().await.is_some() {}
    info!("SMTP server stopped accepting connections");
}

async fn run_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: String,
    shared: &Shared,
    shutdown: watch::Receiver<bool>,
) {
    debug!(session = %id, peer = %peer, "connection accepted");

    // The PROXY preamble, if configured, is consumed before any SMTP byte
    // is exchanged; only then is the session's peer address fixed.
    let declared = match shared.config.proxy_mode {
        ProxyMode::Disabled => peer,
        mode => {
            let negotiation = timeout(
                shared.config.reply_timeout,
                proxy::negotiate(&mut stream, mode, shared.config.proxy_v2_max_data_length, &id),
            )
            .await;
            match negotiation {
                Ok(Ok(ProxyResult::Proxied(addr))) => addr,
                Ok(Ok(ProxyResult::Nop)) => peer,
                Ok(Err(e)) => {
                    warn!(session = %id, error = %e, "rejecting connection before greeting");
                    return;
                }
                Err(_) => {
                    warn!(session = %id, "timed out waiting for PROXY preamble");
                    return;
                }
            }
        }
    };

    let session = Session::new(
        id,
        shared.config.clone(),
        shared.handler.clone(),
        shared.auth.clone(),
        shared.tls.clone(),
        peer,
        declared,
        shutdown,
    );
    session.run(stream).await;
}
