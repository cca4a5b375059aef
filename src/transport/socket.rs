//! Async TCP plumbing for one connection.
//!
//! Before the data phase a connection exchanges one handshake record in each
//! direction ([`send_hello`] / [`recv_hello`]). Afterwards the socket is split
//! into a reader task and a writer task ([`spawn_socket`]) that report to the
//! session driver through [`SocketEvent`]s.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::connection::ConnId;
use super::record::{encode_record, RecordReader, RecordType};

/// Read buffer size of socket reader tasks.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest hello body accepted before the data phase.
const MAX_HELLO_SIZE: usize = 512;

/// Write one handshake record.
pub async fn send_hello(stream: &mut TcpStream, hello: &[u8]) -> io::Result<()> {
    let mut out = BytesMut::new();
    encode_record(RecordType::Handshake, hello, &mut out)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    stream.write_all(&out).await
}

/// Read one handshake record within `timeout`.
///
/// Returns the hello body and any data-phase bytes that arrived behind it.
pub async fn recv_hello(stream: &mut TcpStream, timeout: Duration) -> io::Result<(Bytes, BytesMut)> {
    tokio::time::timeout(timeout, read_hello(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?
}

async fn read_hello(stream: &mut TcpStream) -> io::Result<(Bytes, BytesMut)> {
    let mut reader = RecordReader::new(false);
    let mut buf = vec![0u8; 1024];
    loop {
        match reader.next_record() {
            Ok(Some((RecordType::Handshake, body))) => return Ok((body, reader.into_remaining())),
            Ok(Some((other, _))) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected handshake record, got {other:?}"),
                ));
            }
            Ok(None) => {}
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
        if reader.buffered() > MAX_HELLO_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized hello"));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        reader.push(&buf[..n]);
    }
}

/// Report from a socket task to the session driver.
#[derive(Debug)]
pub enum SocketEvent {
    /// Bytes read from the socket.
    Data(ConnId, Bytes),
    /// The writer has nothing left to write.
    Drained(ConnId),
    /// The socket hit EOF or an error.
    Closed(ConnId, Option<io::Error>),
}

/// Owner side of a connection's socket tasks.
///
/// Dropping the handle stops the reader at once; the writer finishes what
/// was queued and shuts the write half down.
#[derive(Debug)]
pub struct SocketHandle {
    conn: ConnId,
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketHandle {
    /// Connection this socket carries.
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Queue bytes for the writer. Returns false if the writer is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).is_ok()
    }

    /// Check if both tasks have exited.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Split `stream` into reader and writer tasks.
///
/// `leftover` holds bytes read past the handshake; they are reported before
/// anything read afterwards.
pub fn spawn_socket(
    conn: ConnId,
    stream: TcpStream,
    leftover: BytesMut,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> SocketHandle {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(conn = %conn, error = %err, "failed to set TCP_NODELAY");
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        if !leftover.is_empty() && reader_events.send(SocketEvent::Data(conn, leftover.freeze())).is_err() {
            return;
        }
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            buf.reserve(READ_BUFFER_SIZE);
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = reader_events.send(SocketEvent::Closed(conn, None));
                    return;
                }
                Ok(n) => {
                    trace!(conn = %conn, len = n, "socket read");
                    if reader_events.send(SocketEvent::Data(conn, buf.split().freeze())).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = reader_events.send(SocketEvent::Closed(conn, Some(err)));
                    return;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(err) = write_half.write_all(&bytes).await {
                let _ = events.send(SocketEvent::Closed(conn, Some(err)));
                return;
            }
            if rx.is_empty() && events.send(SocketEvent::Drained(conn)).is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    SocketHandle {
        conn,
        tx,
        reader,
        writer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_hello_exchange_keeps_leftover() {
        let (mut client, mut server) = pair().await;
        send_hello(&mut client, b"hello").await.unwrap();
        client.write_all(b"data-phase").await.unwrap();

        let mut received = BytesMut::new();
        let (hello, leftover) = recv_hello(&mut server, Duration::from_secs(5)).await.unwrap();
        assert_eq!(&hello[..], b"hello");
        received.extend_from_slice(&leftover);
        while received.len() < b"data-phase".len() {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&received[..], b"data-phase");
    }

    #[tokio::test]
    async fn test_hello_eof_is_error() {
        let (client, mut server) = pair().await;
        drop(client);
        let err = recv_hello(&mut server, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_hello_rejects_data_record() {
        let (mut client, mut server) = pair().await;
        let mut out = BytesMut::new();
        encode_record(RecordType::Frame, b"x", &mut out).unwrap();
        client.write_all(&out).await.unwrap();
        let err = recv_hello(&mut server, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_socket_tasks_report_events() {
        let (a, b) = pair().await;
        let (events_a, mut rx_a) = mpsc::unbounded_channel();
        let (events_b, mut rx_b) = mpsc::unbounded_channel();
        let conn = crate::transport::ConnectionPool::new().allocate_id();
        let handle_a = spawn_socket(conn, a, BytesMut::from(&b"early"[..]), events_a);
        let handle_b = spawn_socket(conn, b, BytesMut::new(), events_b);

        match rx_a.recv().await.unwrap() {
            SocketEvent::Data(_, data) => assert_eq!(&data[..], b"early"),
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(handle_a.send(Bytes::from_static(b"ping")));
        assert!(matches!(rx_a.recv().await.unwrap(), SocketEvent::Drained(_)));
        let mut got = Vec::new();
        while got.len() < 4 {
            match rx_b.recv().await.unwrap() {
                SocketEvent::Data(_, data) => got.extend_from_slice(&data),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(got, b"ping");

        drop(handle_a);
        loop {
            match rx_b.recv().await.unwrap() {
                SocketEvent::Closed(id, _) => {
                    assert_eq!(id, conn);
                    break;
                }
                SocketEvent::Data(..) | SocketEvent::Drained(_) => {}
            }
        }
        drop(handle_b);
    }
}
