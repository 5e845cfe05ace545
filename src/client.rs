//! Chat client session.
//!
//! Owns the link to one server, performs the login handshake on every new
//! link and routes console lines either to the command interpreter or to
//! the server.

use crate::command::{self, Endpoint, Entry, Guard, Outcome, Rejection, Syntax};
use crate::config::ClientSettings;
use crate::console::{Console, Flow};
use crate::runtime::{drive, Connection, ConnectionId, Ended, SendError};
use std::io;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest wait for the server to accept a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest wait on exit for queued lines to reach the server
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const SEND_FAILED: &str = "Could not send message to server.  Terminating client.";

const LINK_LOST: &str = "SERVER SHUTTING DOWN! DISCONNECTING!\nAbnormal termination of connection.";

/// Operator actions on the client endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Quit,
    Logoff,
    SetHost(String),
    SetPort(u16),
    Login,
    GetHost,
    GetPort,
}

const CLIENT_COMMANDS: &[Entry<ChatClient>] = &[
    Entry {
        name: "#quit",
        guard: None,
        syntax: Syntax::Bare(ClientAction::Quit),
    },
    Entry {
        name: "#logoff",
        guard: None,
        syntax: Syntax::Bare(ClientAction::Logoff),
    },
    Entry {
        name: "#sethost",
        guard: Some(Guard {
            holds: ChatClient::is_disconnected,
            refusal: "Can't set host while connected",
        }),
        syntax: Syntax::Text {
            label: "Host",
            build: ClientAction::SetHost,
        },
    },
    Entry {
        name: "#setport",
        guard: Some(Guard {
            holds: ChatClient::is_disconnected,
            refusal: "Can't set port while connected",
        }),
        syntax: Syntax::Port {
            label: "Port",
            build: ClientAction::SetPort,
        },
    },
    Entry {
        name: "#login",
        guard: Some(Guard {
            holds: ChatClient::is_disconnected,
            refusal: "Can't login when connected",
        }),
        syntax: Syntax::Bare(ClientAction::Login),
    },
    Entry {
        name: "#gethost",
        guard: None,
        syntax: Syntax::Bare(ClientAction::GetHost),
    },
    Entry {
        name: "#getport",
        guard: None,
        syntax: Syntax::Bare(ClientAction::GetPort),
    },
];

/// The chat client
pub struct ChatClient {
    login_id: String,
    host: Mutex<String>,
    port: AtomicU16,
    /// Current link, `None` while disconnected.
    link: Mutex<Option<Connection>>,
    /// Task driving the most recent link.
    driver: Mutex<Option<JoinHandle<()>>>,
    next_link: AtomicUsize,
    console: Arc<dyn Console>,
    me: Weak<ChatClient>,
}

impl ChatClient {
    /// Create a client and try to connect and log in right away.
    ///
    /// A failed first attempt is reported and leaves the client disconnected,
    /// waiting for `#login`.
    pub async fn connect(settings: &ClientSettings, console: Arc<dyn Console>) -> Arc<Self> {
        let client = Arc::new_cyclic(|me| ChatClient {
            login_id: settings.login_id.clone(),
            host: Mutex::new(settings.host.clone()),
            port: AtomicU16::new(settings.port),
            link: Mutex::new(None),
            driver: Mutex::new(None),
            next_link: AtomicUsize::new(0),
            console,
            me: me.clone(),
        });

        if let Err(e) = client.login().await {
            debug!(error = %e, "Initial connection failed");
            client
                .console
                .display("Cannot open connection. Awaiting command.");
        }
        client
    }

    pub fn host(&self) -> String {
        self.lock_host().clone()
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.lock_link().is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        !self.is_connected()
    }

    /// Queue `text` for the server.
    pub fn send_to_server(&self, text: &str) -> Result<(), SendError> {
        match self.lock_link().as_ref() {
            Some(link) => link.send(text),
            None => Err(SendError::NotConnected),
        }
    }

    /// Handle one line typed by the user.
    pub async fn handle_ui_line(&self, line: &str) -> Flow {
        if line.starts_with('#') {
            return command::interpret(self, line)
                .await
                .settle(self.console.as_ref());
        }

        match self.send_to_server(line) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!(error = %e, "Send to server failed");
                self.console.display(SEND_FAILED);
                self.quit().await
            }
        }
    }

    /// Drop the link and ask the run loop to exit.
    ///
    /// Waits briefly for the link to write what is already queued.
    pub async fn quit(&self) -> Flow {
        self.close_connection();
        let driver = self.lock_driver().take();
        if let Some(driver) = driver {
            if tokio::time::timeout(FLUSH_TIMEOUT, driver).await.is_err() {
                warn!("Link still busy at exit, dropping it");
            }
        }
        Flow::Exit
    }

    /// Lines from the server are shown as they are.
    fn handle_server_message(&self, text: &str) {
        self.console.display(text);
    }

    /// Open a link and send the handshake as its first message.
    async fn login(&self) -> io::Result<()> {
        self.open_connection().await?;
        self.send_to_server(&format!("#login {}", self.login_id))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn open_connection(&self) -> io::Result<()> {
        let host = self.host();
        let port = self.port();

        let stream = connect_within(&host, port, CONNECT_TIMEOUT).await?;
        let peer = stream.peer_addr()?;

        let (conn, outbound) = Connection::new(self.next_link.fetch_add(1, Ordering::SeqCst), peer);
        *self.lock_link() = Some(conn.clone());
        info!(host = %host, port, "Connected to server");

        let me = self.me.clone();
        let driver = tokio::spawn(async move {
            let ended = drive(&conn, stream, outbound, |line| {
                if let Some(client) = me.upgrade() {
                    client.handle_server_message(&line);
                }
            })
            .await;

            if let Some(client) = me.upgrade() {
                client.link_ended(conn.id(), ended);
            }
        });
        *self.lock_driver() = Some(driver);
        Ok(())
    }

    /// Close the current link, if any. The driver reports the close.
    fn close_connection(&self) {
        if let Some(link) = self.lock_link().take() {
            link.close();
        }
    }

    fn link_ended(&self, id: ConnectionId, ended: Ended) {
        {
            let mut link = self.lock_link();
            if link.as_ref().map(Connection::id) == Some(id) {
                *link = None;
            }
        }

        match ended {
            Ended::Local => debug!(link = id, "Link closed locally"),
            Ended::Remote => {
                info!(link = id, "Server closed the connection");
                self.console.display(LINK_LOST);
            }
            Ended::Failed(e) => {
                warn!(link = id, error = %e, "Connection to server failed");
                self.console.display(LINK_LOST);
            }
        }
        self.console.display("Connection closed");
    }

    fn lock_host(&self) -> MutexGuard<'_, String> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Connection>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connect to `host:port`, giving up after `limit`.
async fn connect_within(host: &str, port: u16, limit: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(stream) => stream,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connecting to {host}:{port} timed out"),
        )),
    }
}

impl Endpoint for ChatClient {
    type Action = ClientAction;

    fn commands() -> &'static [Entry<Self>] {
        CLIENT_COMMANDS
    }

    async fn execute(&self, action: ClientAction) -> Outcome {
        match action {
            ClientAction::Quit => {
                // Best-effort notice; quitting proceeds either way.
                let _ = self.send_to_server("#quit");
                self.quit().await;
                Outcome::Terminate
            }
            ClientAction::Logoff => {
                let _ = self.send_to_server("#logoff");
                self.close_connection();
                Outcome::Done
            }
            ClientAction::SetHost(host) => {
                let report = format!("Host set to: {host}");
                *self.lock_host() = host;
                Outcome::Report(report)
            }
            ClientAction::SetPort(port) => {
                self.port.store(port, Ordering::SeqCst);
                Outcome::Report(format!("Port set to: {port}"))
            }
            ClientAction::Login => match self.login().await {
                Ok(()) => Outcome::Done,
                Err(e) => {
                    self.close_connection();
                    Outcome::Rejected(Rejection::Failed(format!(
                        "Cannot open connection: {e}"
                    )))
                }
            },
            ClientAction::GetHost => Outcome::Report(self.host()),
            ClientAction::GetPort => Outcome::Report(self.port().to_string()),
        }
    }
}
