//! Chat server session.
//!
//! Interprets what each client line means (login handshake, termination
//! request, chat), announces arrivals and departures, and exposes the
//! listening endpoint to operator commands.

use crate::broadcast::{broadcast, send_to_one};
use crate::command::{self, Endpoint, Entry, Guard, Outcome, Rejection, Syntax};
use crate::config::ServerSettings;
use crate::console::{Console, Flow};
use crate::registry::{disconnect_notice, SessionError, SessionRegistry};
use crate::runtime::{Connection, Listener, ServerHandler};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Prefix for lines typed by the server operator
const OPERATOR_PREFIX: &str = "SERVER MSG> ";

/// Sent to a connection that chats before logging in, just before it is closed
const LOGIN_REQUIRED: &str = "ERROR - login required";

/// Broadcast when the server stops accepting connections
const STOPPED_WARNING: &str = "WARNING - server has stopped listening to connections";

/// Operator actions on the server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Quit,
    Stop,
    Close,
    SetPort(u16),
    Start,
    GetPort,
}

const SERVER_COMMANDS: &[Entry<ChatServer>] = &[
    Entry {
        name: "#quit",
        guard: None,
        syntax: Syntax::Bare(ServerAction::Quit),
    },
    Entry {
        name: "#stop",
        guard: None,
        syntax: Syntax::Bare(ServerAction::Stop),
    },
    Entry {
        name: "#close",
        guard: None,
        syntax: Syntax::Bare(ServerAction::Close),
    },
    Entry {
        name: "#setport",
        guard: Some(Guard {
            holds: ChatServer::is_closed,
            refusal: "Server must be closed to set port",
        }),
        syntax: Syntax::Port {
            label: "Port",
            build: ServerAction::SetPort,
        },
    },
    Entry {
        name: "#start",
        guard: Some(Guard {
            holds: ChatServer::is_stopped,
            refusal: "Server must be stopped to start",
        }),
        syntax: Syntax::Bare(ServerAction::Start),
    },
    Entry {
        name: "#getport",
        guard: None,
        syntax: Syntax::Bare(ServerAction::GetPort),
    },
];

/// The chat server
pub struct ChatServer {
    listener: Arc<Listener>,
    registry: SessionRegistry,
    /// Set once the endpoint is fully closed, cleared when listening starts.
    /// A server that has never listened counts as closed.
    closed: AtomicBool,
    console: Arc<dyn Console>,
}

impl ChatServer {
    /// Create a server that is not listening yet.
    pub fn new(settings: &ServerSettings, console: Arc<dyn Console>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ChatServer>| {
            let handler: Weak<dyn ServerHandler> = me.clone();
            ChatServer {
                listener: Arc::new(Listener::new(
                    settings.listen.clone(),
                    settings.port,
                    settings.max_connections,
                    handler,
                )),
                registry: SessionRegistry::new(),
                closed: AtomicBool::new(true),
                console,
            }
        })
    }

    /// Start listening. Must be called from within a tokio runtime.
    pub fn listen(&self) -> io::Result<u16> {
        self.listener.listen()
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_listening()
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_listening()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Close the endpoint and every connection. Closing twice is a no-op.
    pub fn close(&self) {
        if !self.listener.close() {
            debug!("Server already closed");
        }
    }

    /// Handle one line typed by the server operator.
    pub async fn handle_operator_line(&self, line: &str) -> Flow {
        if line.starts_with('#') {
            command::interpret(self, line)
                .await
                .settle(self.console.as_ref())
        } else {
            broadcast(&self.registry, &format!("{OPERATOR_PREFIX}{line}"));
            Flow::Continue
        }
    }

    /// Handle one line received from a client connection.
    pub fn handle_client_message(&self, conn: &Connection, text: &str) {
        let login_id = self.registry.login_id(conn.id());
        debug!(conn = conn.id(), login_id = ?login_id, message = text, "Message received");

        if text.starts_with("#login") {
            self.handle_login(conn, text);
        } else if text == "#logoff" || text == "#quit" {
            // The disconnect notice goes out from `connection_closed`.
            conn.close();
        } else if let Some(login_id) = login_id {
            broadcast(&self.registry, &format!("{login_id}> {text}"));
        } else {
            warn!(conn = conn.id(), "Chat before login, closing connection");
            let _ = send_to_one(conn, LOGIN_REQUIRED);
            conn.close();
        }
    }

    fn handle_login(&self, conn: &Connection, text: &str) {
        let Some(login_id) = text.split_whitespace().nth(1) else {
            warn!(conn = conn.id(), "Login without an id, closing connection");
            conn.close();
            return;
        };

        match self.registry.set_login_id(conn.id(), login_id) {
            Ok(notice) => {
                self.console.display(&notice);
                broadcast(&self.registry, &notice);
            }
            Err(e @ SessionError::AlreadyLoggedIn { .. }) => {
                warn!(error = %e, "Error, already logged in");
                conn.close();
            }
            Err(e @ SessionError::UnknownConnection(_)) => {
                warn!(error = %e, "Login on untracked connection");
                conn.close();
            }
        }
    }
}

impl Endpoint for ChatServer {
    type Action = ServerAction;

    fn commands() -> &'static [Entry<Self>] {
        SERVER_COMMANDS
    }

    async fn execute(&self, action: ServerAction) -> Outcome {
        match action {
            ServerAction::Quit => {
                self.close();
                Outcome::Terminate
            }
            ServerAction::Stop => {
                self.listener.stop_listening();
                Outcome::Done
            }
            ServerAction::Close => {
                self.close();
                Outcome::Done
            }
            ServerAction::SetPort(port) => {
                self.listener.set_port(port);
                Outcome::Report(format!("Port set to: {port}"))
            }
            ServerAction::Start => match self.listen() {
                Ok(_) => Outcome::Done,
                Err(e) => Outcome::Rejected(Rejection::Failed(format!(
                    "Could not listen for clients: {e}"
                ))),
            },
            ServerAction::GetPort => Outcome::Report(self.port().to_string()),
        }
    }
}

impl ServerHandler for ChatServer {
    fn connection_opened(&self, conn: &Connection) {
        info!(
            conn = conn.id(),
            peer = %conn.peer(),
            open = self.listener.connection_count(),
            "A new client is attempting to connect to the server"
        );
        self.registry.register(conn.clone());
    }

    fn message_received(&self, conn: &Connection, text: String) {
        self.handle_client_message(conn, &text);
    }

    fn connection_closed(&self, conn: &Connection) {
        let Some(session) = self.registry.deregister(conn.id()) else {
            return;
        };
        debug!(conn = conn.id(), remaining = self.session_count(), "Session ended");
        if let Some(login_id) = session.login_id() {
            let notice = disconnect_notice(login_id);
            self.console.display(&notice);
            broadcast(&self.registry, &notice);
        }
    }

    fn connection_error(&self, conn: &Connection, error: &io::Error) {
        warn!(conn = conn.id(), error = %error, "Connection error");
    }

    fn listening_started(&self, port: u16) {
        self.closed.store(false, Ordering::SeqCst);
        self.console
            .display(&format!("Server listening for connections on port {port}"));
    }

    fn listening_stopped(&self) {
        self.console
            .display("Server has stopped listening for connections.");
        broadcast(&self.registry, STOPPED_WARNING);
    }

    fn endpoint_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.console.display("Server has been closed");
    }
}
