//! High-level xstream server API.
//!
//! [`Server`] accepts TCP connections, answers their hellos and routes them:
//! a *new* hello starts a session, a *fork* hello joins a running one and a
//! *resume* hello restarts a session under its persisted id and secrets.
//! Every started session is handed to the application as an
//! [`IncomingSession`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::SessionManager;
use crate::core::{util::unix_time, CryptoError, SessionError};
use crate::crypto::{accept, Established, HelloKind, PresharedKey, Role, SessionId, SessionSecrets};
use crate::session::{spawn_session, Session, SessionConfig, SessionEvent, SessionHandle};
use crate::transport::{recv_hello, send_hello};

/// Errors that can occur in the xstream server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hello rejected.
    #[error("handshake failed: {0}")]
    Handshake(#[from] CryptoError),

    /// Session refused the connection.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Fork hello for a session that is not running.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Session table is full.
    #[error("session limit reached")]
    SessionLimit,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Server is shut down.
    #[error("server shut down")]
    Shutdown,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Shared passphrase.
    pub crypto_key: String,

    /// Algorithm name mixed into the preshared key.
    pub crypto_alg: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// How long a client may take to send its hello.
    pub handshake_timeout: Duration,

    /// Tunables of every session.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19999)),
            crypto_key: String::new(),
            crypto_alg: "chacha20-poly1305".to_string(),
            max_sessions: 1000,
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Builder for creating a [`ServerConfig`].
#[derive(Debug)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the shared passphrase.
    pub fn crypto_key(mut self, key: impl Into<String>) -> Self {
        self.config.crypto_key = key.into();
        self
    }

    /// Set the algorithm name.
    pub fn crypto_alg(mut self, alg: impl Into<String>) -> Self {
        self.config.crypto_alg = alg.into();
        self
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the largest segment size offered to clients.
    pub fn mss(mut self, mss: usize) -> Self {
        self.config.session = self.config.session.with_mss(mss);
        self
    }

    /// Replace the session tunables.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A session started by a client.
#[derive(Debug)]
pub struct IncomingSession {
    /// Handle to the running session.
    pub handle: SessionHandle,
    /// Events of the session.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// The client restarted a persisted session.
    pub resumed: bool,
}

/// Shared state of the accept loop and its handshake tasks.
#[derive(Debug)]
struct Acceptor {
    config: ServerConfig,
    psk: PresharedKey,
    mss: u16,
    manager: Arc<RwLock<SessionManager>>,
    incoming: mpsc::UnboundedSender<IncomingSession>,
}

/// An xstream server.
///
/// # Example
///
/// ```ignore
/// use xstream::server::{Server, ServerBuilder};
///
/// let config = ServerBuilder::new()
///     .bind_addr("0.0.0.0:19999".parse()?)
///     .crypto_key("secret")
///     .build();
///
/// let mut server = Server::bind(config).await?;
/// while let Some(mut incoming) = server.accept().await {
///     tokio::spawn(async move {
///         while let Some(event) = incoming.events.recv().await {
///             // StreamOpened / StreamData / StreamClosed ...
///         }
///     });
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    manager: Arc<RwLock<SessionManager>>,
    incoming: mpsc::UnboundedReceiver<IncomingSession>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind to an address and start accepting.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let mss = u16::try_from(config.session.mss)
            .map_err(|_| ServerError::Config(format!("mss {} too large", config.session.mss)))?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let manager = Arc::new(RwLock::new(SessionManager::new(config.max_sessions)));
        let acceptor = Arc::new(Acceptor {
            psk: PresharedKey::from_passphrase(&config.crypto_key, &config.crypto_alg),
            mss,
            manager: Arc::clone(&manager),
            incoming: incoming_tx,
            config,
        });

        info!(addr = %local_addr, "server listening");
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, shutdown_rx));

        Ok(Self {
            local_addr,
            manager,
            incoming,
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next session started by a client.
    pub async fn accept(&mut self) -> Option<IncomingSession> {
        self.incoming.recv().await
    }

    /// Get the number of running sessions.
    pub async fn session_count(&self) -> usize {
        let mut manager = self.manager.write().await;
        manager.prune();
        manager.len()
    }

    /// Handle of a running session.
    pub async fn session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.manager.read().await.get(id).cloned()
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        for handle in self.manager.write().await.drain() {
            handle.close();
        }
        info!(addr = %self.local_addr, "server shut down");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = Arc::clone(&acceptor);
                    tokio::spawn(async move {
                        if let Err(err) = acceptor.handle_connection(stream, peer).await {
                            warn!(peer = %peer, error = %err, "connection refused");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

impl Acceptor {
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let (hello, leftover) = recv_hello(&mut stream, self.config.handshake_timeout).await?;
        let (reply, established) = {
            let manager = self.manager.read().await;
            let answer = accept(&self.psk, &hello, unix_time(), self.mss, |id| manager.secrets(id))?;
            if answer.1.kind == HelloKind::New && !manager.has_capacity() {
                return Err(ServerError::SessionLimit);
            }
            answer
        };
        send_hello(&mut stream, &reply).await?;
        let cipher = Box::new(established.cipher(Role::Server));

        match established.kind {
            HelloKind::Fork => {
                let handle = self
                    .manager
                    .read()
                    .await
                    .get(&established.session_id)
                    .cloned()
                    .ok_or(ServerError::UnknownSession(established.session_id))?;
                let conn = handle.add_connection(stream, leftover, cipher).await?;
                debug!(session = %handle.id(), conn = %conn, peer = %peer, "fork connection joined");
            }
            HelloKind::New | HelloKind::Resume => {
                let resumed = established.kind == HelloKind::Resume;
                let (handle, events) = self.start_session(&established).await;
                handle.add_connection(stream, leftover, cipher).await?;
                info!(session = %handle.id(), peer = %peer, resumed, "session started");
                let incoming = IncomingSession {
                    handle,
                    events,
                    resumed,
                };
                if self.incoming.send(incoming).is_err() {
                    return Err(ServerError::Shutdown);
                }
            }
        }
        Ok(())
    }

    async fn start_session(
        &self,
        established: &Established,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let session = Session::new(
            Role::Server,
            established.session_id,
            SessionSecrets {
                auth_key: established.auth_key.clone(),
                session_key: established.session_key.clone(),
            },
            self.config.session.clone().with_mss(usize::from(established.mss)),
            tokio::time::Instant::now().into_std(),
        );
        let (handle, events, driver) = spawn_session(session);

        if let Some(old) = self.manager.write().await.insert(handle.clone()) {
            info!(session = %old.id(), "replacing running session");
            old.close();
        }

        let manager = Arc::clone(&self.manager);
        let registered = handle.clone();
        tokio::spawn(async move {
            let _ = driver.await;
            manager.write().await.remove_if_same(&registered);
        });
        (handle, events)
    }
}
