//! High-level xstream client API.
//!
//! [`Client::connect`] opens (or resumes) a session with a full handshake on
//! the first connection, then keeps up to `max_connections` fork connections
//! attached to it. Lost and rotated connections are redialed with back-off
//! for as long as the session lives.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{util::unix_time, CryptoError, SessionError, SessionStore};
use crate::crypto::{ClientHandshake, Established, PresharedKey, Role, SessionSecrets};
use crate::session::{
    fingerprint, load_record, spawn_session, Session, SessionConfig, SessionEvent, SessionHandle,
    SessionRecord, StreamConfig,
};
use crate::transport::{recv_hello, send_hello};

/// First delay before redialing a failed fork connection.
const REDIAL_BACKOFF_MIN: Duration = Duration::from_millis(500);

/// Longest delay between redial attempts.
const REDIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Errors that can occur in the xstream client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] CryptoError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Shared passphrase.
    pub crypto_key: String,

    /// Algorithm name mixed into the preshared key.
    pub crypto_alg: String,

    /// Connections kept attached to the session.
    pub max_connections: usize,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// How long the server may take to answer a hello.
    pub handshake_timeout: Duration,

    /// Session tunables.
    pub session: SessionConfig,

    /// Where session records are persisted, if anywhere.
    pub store: Option<Arc<dyn SessionStore>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("crypto_alg", &self.crypto_alg)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("session", &self.session)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19999,
            crypto_key: String::new(),
            crypto_alg: "chacha20-poly1305".to_string(),
            max_connections: 3,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
            store: None,
        }
    }
}

impl ClientConfig {
    /// Key of this configuration's session record.
    pub fn record_key(&self) -> String {
        fingerprint(&self.host, self.port, &self.crypto_key, &self.crypto_alg)
    }

    fn mss(&self) -> Result<u16, ClientError> {
        u16::try_from(self.session.mss)
            .map_err(|_| ClientError::Config(format!("mss {} too large", self.session.mss)))
    }
}

/// Builder for creating a [`ClientConfig`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the server host and port.
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
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

    /// Set the number of connections kept attached.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max.max(1);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the segment size proposed to the server.
    pub fn mss(mut self, mss: usize) -> Self {
        self.config.session = self.config.session.with_mss(mss);
        self
    }

    /// Replace the session tunables.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Persist session records in `store`.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.config.store = Some(store);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial the server and run one handshake.
async fn dial(
    config: &ClientConfig,
    handshake: ClientHandshake,
) -> Result<(TcpStream, BytesMut, Established), ClientError> {
    let addr = (config.host.as_str(), config.port);
    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout)??;
    let hello = handshake.hello(unix_time())?;
    send_hello(&mut stream, &hello).await?;
    let (reply, leftover) = recv_hello(&mut stream, config.handshake_timeout).await?;
    let established = handshake.finish(&reply)?;
    Ok((stream, leftover, established))
}

/// An xstream client: one session over a pool of TCP connections.
///
/// # Example
///
/// ```ignore
/// use xstream::client::{Client, ClientBuilder};
/// use xstream::session::{SessionEvent, StreamConfig};
///
/// let config = ClientBuilder::new()
///     .server("example.com", 19999)
///     .crypto_key("secret")
///     .build();
///
/// let (client, mut events) = Client::connect(config).await?;
/// let stream = client.open_stream(StreamConfig::default()).await?;
/// client.write(stream, &b"hello"[..]).await?;
///
/// while let Some(event) = events.recv().await {
///     if let SessionEvent::StreamData { data, .. } = event {
///         // ...
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Client {
    handle: SessionHandle,
    config: Arc<ClientConfig>,
    supervisor: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect to the server.
    ///
    /// A fresh persisted record is resumed; if the server refuses it, the
    /// record is dropped and a new session is opened. Returns the client and
    /// the receiver of its session events.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        let mss = config.mss()?;
        let psk = PresharedKey::from_passphrase(&config.crypto_key, &config.crypto_alg);
        let record_key = config.record_key();

        let mut resumed = None;
        if let Some(store) = config.store.as_deref() {
            if let Some(record) = load_record(store, &record_key, unix_time()) {
                let handshake = ClientHandshake::resume(
                    psk.clone(),
                    record.session_id,
                    record.auth_key.clone(),
                    record.session_key.clone(),
                    mss,
                );
                match dial(&config, handshake).await {
                    Ok(dialed) => resumed = Some((dialed, record.key_exchanged)),
                    Err(err) => {
                        warn!(session = %record.session_id, error = %err, "resume refused, opening a new session");
                        store.remove(&record_key);
                    }
                }
            }
        }
        let ((stream, leftover, established), key_exchanged) = match resumed {
            Some(dialed) => dialed,
            None => (dial(&config, ClientHandshake::new_session(psk.clone(), mss)).await?, false),
        };

        let session = Session::new(
            Role::Client,
            established.session_id,
            SessionSecrets {
                auth_key: established.auth_key.clone(),
                session_key: established.session_key.clone(),
            },
            config.session.clone().with_mss(usize::from(established.mss)),
            tokio::time::Instant::now().into_std(),
        );
        let (handle, raw_events, _driver) = spawn_session(session);
        let cipher = Box::new(established.cipher(Role::Client));
        handle.add_connection(stream, leftover, cipher).await?;
        info!(
            session = %handle.id(),
            kind = ?established.kind,
            mss = established.mss,
            "connected"
        );

        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            config: Arc::clone(&config),
            psk,
            record_key,
            handle: handle.clone(),
            mss: established.mss,
            last_auth_time: unix_time(),
            key_exchanged,
        };
        let supervisor = tokio::spawn(supervisor.run(raw_events, events_tx));

        let client = Self {
            handle,
            config,
            supervisor: Some(supervisor),
        };
        Ok((client, events_rx))
    }

    /// Handle to the session.
    pub fn session(&self) -> &SessionHandle {
        &self.handle
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connections currently attached.
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// Check if the session has closed.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Open a stream.
    pub async fn open_stream(&self, config: StreamConfig) -> Result<u16, ClientError> {
        Ok(self.handle.open_stream(config).await?)
    }

    /// Write bytes to a stream.
    pub async fn write(&self, stream_id: u16, data: impl Into<Bytes>) -> Result<(), ClientError> {
        Ok(self.handle.write(stream_id, data).await?)
    }

    /// Start closing a stream.
    pub async fn close_stream(&self, stream_id: u16) -> Result<(), ClientError> {
        Ok(self.handle.close_stream(stream_id).await?)
    }

    /// Close the session and wait until it has finished.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.handle.close();
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.handle.close();
        }
    }
}

/// Watches the session: keeps the connection pool filled and the session
/// record current.
struct Supervisor {
    config: Arc<ClientConfig>,
    psk: PresharedKey,
    record_key: String,
    handle: SessionHandle,
    mss: u16,
    last_auth_time: u64,
    key_exchanged: bool,
}

impl Supervisor {
    async fn run(
        mut self,
        mut raw: mpsc::UnboundedReceiver<SessionEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        while let Some(event) = raw.recv().await {
            match &event {
                SessionEvent::Opened => {
                    self.persist();
                    let missing = self
                        .config
                        .max_connections
                        .saturating_sub(self.handle.connection_count());
                    for _ in 0..missing {
                        self.spawn_dial();
                    }
                }
                SessionEvent::KeyExchanged { .. } => {
                    self.key_exchanged = true;
                    self.persist();
                }
                SessionEvent::ConnectionWanted => self.spawn_dial(),
                SessionEvent::Closed(reason) => {
                    debug!(session = %self.handle.id(), reason = ?reason, "forgetting session record");
                    if let Some(store) = &self.config.store {
                        store.remove(&self.record_key);
                    }
                }
                _ => {}
            }
            let _ = events.send(event);
        }
    }

    fn persist(&self) {
        let Some(store) = &self.config.store else {
            return;
        };
        let Some(secrets) = self.handle.secrets() else {
            return;
        };
        let record = SessionRecord {
            session_id: self.handle.id(),
            auth_key: secrets.auth_key,
            session_key: secrets.session_key,
            last_auth_time: self.last_auth_time,
            key_exchanged: self.key_exchanged,
            mss: self.mss,
            timestamp: unix_time(),
        };
        store.save(&self.record_key, &record.encode());
    }

    fn spawn_dial(&self) {
        let config = Arc::clone(&self.config);
        let psk = self.psk.clone();
        let handle = self.handle.clone();
        let mss = self.mss;
        tokio::spawn(async move {
            let mut backoff = REDIAL_BACKOFF_MIN;
            while !handle.is_closed() {
                let Some(secrets) = handle.secrets() else {
                    return;
                };
                let handshake = ClientHandshake::fork(
                    psk.clone(),
                    handle.id(),
                    secrets.auth_key,
                    secrets.session_key,
                    mss,
                );
                match dial(&config, handshake).await {
                    Ok((stream, leftover, established)) => {
                        let cipher = Box::new(established.cipher(Role::Client));
                        match handle.add_connection(stream, leftover, cipher).await {
                            Ok(conn) => debug!(session = %handle.id(), conn = %conn, "fork connection added"),
                            Err(err) => debug!(session = %handle.id(), error = %err, "fork connection dropped"),
                        }
                        return;
                    }
                    Err(err) => {
                        debug!(
                            session = %handle.id(),
                            error = %err,
                            retry_in = ?backoff,
                            "fork connection failed"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(REDIAL_BACKOFF_MAX);
                    }
                }
            }
        });
    }
}
