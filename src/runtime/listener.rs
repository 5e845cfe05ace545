//! Server-side transport: listening socket, accept loop and connection table.
//!
//! The listener owns no chat semantics. It reports what happens through
//! `ServerHandler` and lets the handler decide what each event means.

use crate::runtime::connection::{drive, Connection, Ended};
use slab::Slab;
use std::future::poll_fn;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Callbacks the listener invokes. All of them run without listener locks held.
pub trait ServerHandler: Send + Sync + 'static {
    /// A peer was accepted and added to the connection table.
    fn connection_opened(&self, conn: &Connection);
    /// One complete line arrived from `conn`.
    fn message_received(&self, conn: &Connection, text: String);
    /// `conn` is gone, whichever side ended it.
    fn connection_closed(&self, conn: &Connection);
    /// `conn` failed; `connection_closed` follows.
    fn connection_error(&self, conn: &Connection, error: &io::Error);
    fn listening_started(&self, port: u16);
    fn listening_stopped(&self);
    fn endpoint_closed(&self);
}

/// Bound socket shared with the accept task. Taking it out closes the socket.
type SharedSocket = Arc<Mutex<Option<TcpListener>>>;

/// Accept side of a listening endpoint
struct Acceptor {
    socket: SharedSocket,
    stop: oneshot::Sender<()>,
}

/// Listening endpoint plus every connection it accepted.
pub struct Listener {
    host: String,
    port: AtomicU16,
    max_connections: usize,
    handler: Weak<dyn ServerHandler>,
    acceptor: Mutex<Option<Acceptor>>,
    /// Set by `listen`, cleared by `close`.
    open: AtomicBool,
    connections: Mutex<Slab<Connection>>,
}

impl Listener {
    /// Create a listener that is not yet listening.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        max_connections: usize,
        handler: Weak<dyn ServerHandler>,
    ) -> Self {
        Self {
            host: host.into(),
            port: AtomicU16::new(port),
            max_connections,
            handler,
            acceptor: Mutex::new(None),
            open: AtomicBool::new(false),
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Change the port used by the next `listen`.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.lock_acceptor().is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Bind and start accepting. Must be called from within a tokio runtime.
    ///
    /// Binding to port 0 picks an ephemeral port, which becomes this
    /// listener's port.
    pub fn listen(self: &Arc<Self>) -> io::Result<u16> {
        let handler = self.handler.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "server handler dropped")
        })?;

        let port = {
            let mut acceptor = self.lock_acceptor();
            if acceptor.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "already listening",
                ));
            }

            let addr = resolve(&self.host, self.port())?;
            let listener = TcpListener::from_std(create_listener(addr)?)?;
            let port = listener.local_addr()?.port();
            self.set_port(port);

            let socket: SharedSocket = Arc::new(Mutex::new(Some(listener)));
            let (stop, stop_rx) = oneshot::channel();
            *acceptor = Some(Acceptor {
                socket: Arc::clone(&socket),
                stop,
            });
            self.open.store(true, Ordering::SeqCst);

            info!(address = %addr, port, "Server listening");
            tokio::spawn(Arc::clone(self).accept_loop(socket, stop_rx, Arc::clone(&handler)));
            port
        };

        handler.listening_started(port);
        Ok(port)
    }

    /// Stop accepting new connections; open ones are untouched.
    ///
    /// The listening socket is closed before this returns, so the port can
    /// be bound again right away. Returns `false` if the listener was not
    /// listening.
    pub fn stop_listening(&self) -> bool {
        let Some(acceptor) = self.lock_acceptor().take() else {
            return false;
        };
        drop(lock_socket(&acceptor.socket).take());
        // The accept loop may have exited already.
        let _ = acceptor.stop.send(());
        info!(port = self.port(), "Server stopped listening");

        if let Some(handler) = self.handler.upgrade() {
            handler.listening_stopped();
        }
        true
    }

    /// Stop listening and drop every connection.
    ///
    /// Returns `false`, and fires no hooks, if the endpoint is already
    /// closed or never listened.
    pub fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.stop_listening();
        self.close_all();
        info!("Server closed");

        if let Some(handler) = self.handler.upgrade() {
            handler.endpoint_closed();
        }
        true
    }

    /// Ask every open connection to close.
    pub fn close_all(&self) {
        let open: Vec<Connection> = self
            .lock_connections()
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect();

        for conn in open {
            conn.close();
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        socket: SharedSocket,
        mut stop: oneshot::Receiver<()>,
        handler: Arc<dyn ServerHandler>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = poll_fn(|cx| poll_accept(&socket, cx)) => accepted,
            };
            match accepted {
                Some(Ok((stream, peer))) => self.adopt(stream, peer, &handler),
                Some(Err(e)) => error!(error = %e, "Failed to accept connection"),
                None => break,
            }
        }
        debug!("Accept loop finished");
    }

    fn adopt(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, handler: &Arc<dyn ServerHandler>) {
        let (conn, outbound) = {
            let mut table = self.lock_connections();
            if table.len() >= self.max_connections {
                warn!(peer = %peer, max = self.max_connections, "Connection table full, rejecting");
                return;
            }
            let entry = table.vacant_entry();
            let (conn, outbound) = Connection::new(entry.key(), peer);
            entry.insert(conn.clone());
            (conn, outbound)
        };

        debug!(conn = conn.id(), peer = %peer, "New connection");
        handler.connection_opened(&conn);

        let listener = Arc::clone(self);
        let handler = Arc::clone(handler);
        tokio::spawn(async move {
            let ended = drive(&conn, stream, outbound, |line| {
                handler.message_received(&conn, line)
            })
            .await;

            if let Ended::Failed(e) = &ended {
                handler.connection_error(&conn, e);
            }
            handler.connection_closed(&conn);

            listener.lock_connections().try_remove(conn.id());
            debug!(conn = conn.id(), ?ended, "Connection closed");
        });
    }

    fn lock_acceptor(&self) -> MutexGuard<'_, Option<Acceptor>> {
        self.acceptor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connections(&self) -> MutexGuard<'_, Slab<Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_socket(socket: &Mutex<Option<TcpListener>>) -> MutexGuard<'_, Option<TcpListener>> {
    socket.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accept from the shared socket; `None` once it has been taken away.
fn poll_accept(
    socket: &Mutex<Option<TcpListener>>,
    cx: &mut Context<'_>,
) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
    match lock_socket(socket).as_ref() {
        Some(listener) => listener.poll_accept(cx).map(Some),
        None => Poll::Ready(None),
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

/// Create a non-blocking TCP listener that can rebind while old sockets linger.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Records hook invocations in order.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ServerHandler for Recorder {
        fn connection_opened(&self, conn: &Connection) {
            self.push(format!("opened {}", conn.id()));
        }

        fn message_received(&self, conn: &Connection, text: String) {
            let _ = conn.send(format!("echo {text}"));
            self.push(format!("message {text}"));
        }

        fn connection_closed(&self, conn: &Connection) {
            self.push(format!("closed {}", conn.id()));
        }

        fn connection_error(&self, conn: &Connection, _error: &io::Error) {
            self.push(format!("error {}", conn.id()));
        }

        fn listening_started(&self, _port: u16) {
            self.push("started".to_string());
        }

        fn listening_stopped(&self) {
            self.push("stopped".to_string());
        }

        fn endpoint_closed(&self) {
            self.push("endpoint closed".to_string());
        }
    }

    fn listener(recorder: &Arc<Recorder>, max_connections: usize) -> Arc<Listener> {
        let handler: Weak<dyn ServerHandler> = Arc::downgrade(recorder) as Weak<dyn ServerHandler>;
        Arc::new(Listener::new("127.0.0.1", 0, max_connections, handler))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_listen_and_echo() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);

        let port = tokio_test::assert_ok!(listener.listen());
        assert_ne!(port, 0);
        assert_eq!(listener.port(), port);
        assert!(listener.is_listening());

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"ping\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap(), Some("echo ping".to_string()));
        assert_eq!(listener.connection_count(), 1);

        drop(writer);
        drop(lines);
        settle().await;

        assert_eq!(
            recorder.events(),
            vec!["started", "opened 0", "message ping", "closed 0"]
        );
        assert_eq!(listener.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);

        tokio_test::assert_ok!(listener.listen());
        tokio_test::assert_err!(listener.listen());
    }

    #[tokio::test]
    async fn test_stop_keeps_connections() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);
        let port = listener.listen().unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        settle().await;

        assert!(listener.stop_listening());
        assert!(!listener.stop_listening());
        assert!(!listener.is_listening());
        settle().await;

        assert_eq!(listener.connection_count(), 1);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        drop(stream);
    }

    #[tokio::test]
    async fn test_close_drops_connections() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);
        let port = listener.listen().unwrap();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        settle().await;

        listener.close();
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
        settle().await;

        assert_eq!(listener.connection_count(), 0);
        let events = recorder.events();
        assert_eq!(events.first().map(String::as_str), Some("started"));
        assert!(events.contains(&"stopped".to_string()));
        assert!(events.contains(&"endpoint closed".to_string()));
        assert!(events.contains(&"closed 0".to_string()));
    }

    #[tokio::test]
    async fn test_restart_on_same_port() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);
        let port = listener.listen().unwrap();

        assert!(listener.stop_listening());
        assert_eq!(tokio_test::assert_ok!(listener.listen()), port);
        tokio_test::assert_ok!(TcpStream::connect(("127.0.0.1", port)).await);

        listener.close();
        assert_eq!(tokio_test::assert_ok!(listener.listen()), port);
    }

    #[tokio::test]
    async fn test_close_twice_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 8);
        assert!(!listener.close());

        listener.listen().unwrap();
        assert!(listener.close());
        assert!(!listener.close());

        let closed = recorder
            .events()
            .iter()
            .filter(|e| *e == "endpoint closed")
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_connection_table_limit() {
        let recorder = Arc::new(Recorder::default());
        let listener = listener(&recorder, 1);
        let port = listener.listen().unwrap();

        let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        settle().await;
        let second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        settle().await;

        assert_eq!(listener.connection_count(), 1);
        let mut lines = BufReader::new(second).lines();
        assert!(matches!(lines.next_line().await, Ok(None) | Err(_)));
    }
}
