//! Connection handles and the per-connection I/O driver.
//!
//! A `Connection` is a cheap clonable handle: sessions hold it to send or
//! close, while a single task owns the socket and drains the outbound queue.

use crate::runtime::framing;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::trace;

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Stable identifier of a connection for its lifetime.
pub type ConnectionId = usize;

/// Work queued for the task that owns the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write one framed line.
    Line(String),
    /// Flush what is queued ahead, then close.
    Close,
}

/// Errors returned when queuing a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Handle to one open connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

impl Connection {
    /// Create a handle plus the receiving end of its outbound queue.
    pub fn new(id: ConnectionId, peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id,
            peer,
            outbound,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `text` for delivery. Fails once the connection is closing or gone.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed(self.id));
        }
        self.outbound
            .send(Outbound::Line(text.into()))
            .map_err(|_| SendError::Closed(self.id))
    }

    /// Request the connection be closed. Idempotent and best-effort.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            // The driver may already be gone; nothing left to close then.
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// How a driven connection ended.
#[derive(Debug)]
pub enum Ended {
    /// `close` was requested on this side.
    Local,
    /// The peer closed the stream.
    Remote,
    /// Read, write or framing failure.
    Failed(io::Error),
}

/// Drive `stream` until it ends: write queued lines, hand each inbound line
/// to `on_line`.
///
/// Lines that arrive after `close` was requested are discarded.
pub async fn drive<F>(
    conn: &Connection,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut on_line: F,
) -> Ended
where
    F: FnMut(String),
{
    let (mut reader, mut writer) = stream.into_split();
    let mut inbound = BytesMut::with_capacity(BUFFER_SIZE);
    let mut frame = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            queued = outbound.recv() => match queued {
                Some(Outbound::Line(text)) => {
                    frame.clear();
                    framing::encode(&text, &mut frame);
                    if let Err(e) = writer.write_all(&frame).await {
                        return Ended::Failed(e);
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.shutdown().await;
                    return Ended::Local;
                }
            },

            read = reader.read_buf(&mut inbound) => match read {
                Ok(0) => {
                    trace!(conn = conn.id, "Connection closed by peer");
                    return Ended::Remote;
                }
                Ok(_) => loop {
                    match framing::next_line(&mut inbound) {
                        Ok(Some(line)) => {
                            if conn.is_closing() {
                                break;
                            }
                            on_line(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return Ended::Failed(io::Error::new(io::ErrorKind::InvalidData, e));
                        }
                    }
                },
                Err(e) => return Ended::Failed(e),
            },
        }
    }
}
