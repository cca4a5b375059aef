//! Tokio driver of a [`Session`].
//!
//! One task owns the session and every socket task of its connections.
//! Applications talk to it through a cloneable [`SessionHandle`] and read
//! [`SessionEvent`]s from the receiver returned by [`spawn_session`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::session::{Session, SessionEvent};
use super::stream::StreamConfig;
use crate::core::{RecordCipher, SessionError};
use crate::crypto::{SessionId, SessionSecrets};
use crate::transport::{spawn_socket, ConnId, SocketEvent, SocketHandle};

/// Clock of the driver; follows tokio's paused clock in tests.
fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

enum Command {
    Open {
        config: StreamConfig,
        reply: oneshot::Sender<Result<u16, SessionError>>,
    },
    Write {
        stream_id: u16,
        data: Bytes,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    CloseStream {
        stream_id: u16,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    AddConnection {
        stream: TcpStream,
        leftover: BytesMut,
        cipher: Box<dyn RecordCipher>,
        reply: oneshot::Sender<Result<ConnId, SessionError>>,
    },
    Close,
}

/// State shared between the driver and its handles.
#[derive(Debug)]
struct Shared {
    secrets: Mutex<SessionSecrets>,
    closed: AtomicBool,
    connections: AtomicUsize,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Open { .. } => f.write_str("Open"),
            Command::Write { stream_id, data, .. } => {
                write!(f, "Write({stream_id}, {} bytes)", data.len())
            }
            Command::CloseStream { stream_id, .. } => write!(f, "CloseStream({stream_id})"),
            Command::AddConnection { .. } => f.write_str("AddConnection"),
            Command::Close => f.write_str("Close"),
        }
    }
}

impl SessionHandle {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current secrets, as a fork handshake needs them.
    pub fn secrets(&self) -> Option<SessionSecrets> {
        self.shared.secrets.lock().ok().map(|secrets| secrets.clone())
    }

    /// Check if the session has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Connections currently attached, any phase.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Check if `other` drives the same session instance.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Open a stream.
    pub async fn open_stream(&self, config: StreamConfig) -> Result<u16, SessionError> {
        self.request(|reply| Command::Open { config, reply }).await
    }

    /// Write bytes to a stream.
    pub async fn write(&self, stream_id: u16, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let data = data.into();
        self.request(|reply| Command::Write {
            stream_id,
            data,
            reply,
        })
        .await
    }

    /// Start closing a stream.
    pub async fn close_stream(&self, stream_id: u16) -> Result<(), SessionError> {
        self.request(|reply| Command::CloseStream { stream_id, reply })
            .await
    }

    /// Attach a TCP connection that completed its handshake.
    pub async fn add_connection(
        &self,
        stream: TcpStream,
        leftover: BytesMut,
        cipher: Box<dyn RecordCipher>,
    ) -> Result<ConnId, SessionError> {
        self.request(|reply| Command::AddConnection {
            stream,
            leftover,
            cipher,
            reply,
        })
        .await
    }

    /// Close the session. The driver exits once every connection is gone.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Spawn the driver of `session`.
///
/// The driver exits when the session has closed and every connection is
/// gone. Dropping every handle closes the session.
pub fn spawn_session(
    session: Session,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        secrets: Mutex::new(session.secrets()),
        closed: AtomicBool::new(false),
        connections: AtomicUsize::new(0),
    });
    let handle = SessionHandle {
        id: session.id(),
        commands: commands_tx,
        shared: Arc::clone(&shared),
    };
    let driver = Driver {
        session,
        sockets: HashMap::new(),
        shared,
        events: events_tx,
    };
    let task = tokio::spawn(driver.run(commands_rx));
    (handle, events_rx, task)
}

struct Driver {
    session: Session,
    sockets: HashMap<ConnId, SocketHandle>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<SocketEvent>();
        let mut commands_open = true;
        let id = self.session.id();
        debug!(session = %id, "session driver started");

        loop {
            let now = clock();
            self.session.run_deferred(now);
            self.transmit(now);
            self.forward_events();
            if self.session.is_finished() {
                break;
            }

            let deadline = self.session.poll_timeout();
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                event = socket_rx.recv() => {
                    if let Some(event) = event {
                        self.on_socket_event(event);
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command, &socket_tx),
                    None => {
                        commands_open = false;
                        self.session.close(now);
                    }
                },
                _ = tokio::task::yield_now(), if self.session.has_deferred() => {}
                _ = sleep => self.session.handle_timeout(clock()),
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        debug!(session = %id, "session driver stopped");
    }

    fn on_command(&mut self, command: Command, socket_tx: &mpsc::UnboundedSender<SocketEvent>) {
        let now = clock();
        trace!(session = %self.session.id(), ?command, "command");
        match command {
            Command::Open { config, reply } => {
                let _ = reply.send(self.session.open_stream(config, now));
            }
            Command::Write {
                stream_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.session.write(stream_id, &data, now));
            }
            Command::CloseStream { stream_id, reply } => {
                let _ = reply.send(self.session.close_stream(stream_id, now));
            }
            Command::AddConnection {
                stream,
                leftover,
                cipher,
                reply,
            } => {
                let result = self.session.add_connection(cipher, now);
                if let Ok(conn) = result {
                    let socket = spawn_socket(conn, stream, leftover, socket_tx.clone());
                    self.sockets.insert(conn, socket);
                    self.publish_connections();
                }
                let _ = reply.send(result);
            }
            Command::Close => self.session.close(now),
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        let now = clock();
        match event {
            SocketEvent::Data(conn, data) => {
                if let Err(err) = self.session.receive(conn, &data, now) {
                    debug!(session = %self.session.id(), conn = %conn, error = %err, "connection failed");
                }
            }
            SocketEvent::Drained(conn) => self.session.on_drained(conn),
            SocketEvent::Closed(conn, error) => {
                debug!(session = %self.session.id(), conn = %conn, error = ?error, "socket closed");
                self.session.connection_closed(conn, now);
            }
        }
    }

    fn transmit(&mut self, now: Instant) {
        while let Some((conn, bytes)) = self.session.poll_transmit(now) {
            let sent = self
                .sockets
                .get(&conn)
                .is_some_and(|socket| socket.send(bytes));
            if !sent {
                self.session.connection_closed(conn, now);
            }
        }
    }

    fn forward_events(&mut self) {
        while let Some(event) = self.session.poll_event() {
            match &event {
                SessionEvent::ConnectionClosed(conn) => {
                    self.sockets.remove(conn);
                    self.publish_connections();
                }
                SessionEvent::KeyExchanged { .. } | SessionEvent::Opened => {
                    if let Ok(mut secrets) = self.shared.secrets.lock() {
                        *secrets = self.session.secrets();
                    }
                }
                SessionEvent::Closed(_) => self.shared.closed.store(true, Ordering::Release),
                _ => {}
            }
            let _ = self.events.send(event);
        }
    }

    fn publish_connections(&self) {
        self.shared
            .connections
            .store(self.sockets.len(), Ordering::Release);
    }
}
