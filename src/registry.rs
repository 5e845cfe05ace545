//! Session registry: the server's view of who is on which connection.
//!
//! Every accepted connection gets a `Session` record. The login id on that
//! record is written at most once and never changes afterwards.

use crate::runtime::{Connection, ConnectionId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, trace};

/// Text announced when `login_id` completes the handshake.
pub fn logon_notice(login_id: &str) -> String {
    format!("<{login_id}> has logged on")
}

/// Text announced when `login_id` leaves.
pub fn disconnect_notice(login_id: &str) -> String {
    format!("<{login_id}> has disconnected")
}

/// Session state attached to one connection
#[derive(Debug, Clone)]
pub struct Session {
    connection: Connection,
    login_id: Option<String>,
}

impl Session {
    pub fn login_id(&self) -> Option<&str> {
        self.login_id.as_deref()
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The connection already completed its handshake.
    #[error("connection {conn} is already logged in as {login_id}")]
    AlreadyLoggedIn { conn: ConnectionId, login_id: String },
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Thread-safe map from connection to session
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `connection` as an unauthenticated session.
    pub fn register(&self, connection: Connection) {
        let id = connection.id();
        self.write().insert(
            id,
            Session {
                connection,
                login_id: None,
            },
        );
        trace!(conn = id, "Session registered");
    }

    /// Forget `conn`, returning its final session state.
    pub fn deregister(&self, conn: ConnectionId) -> Option<Session> {
        let session = self.write().remove(&conn);
        if session.is_some() {
            trace!(conn, "Session deregistered");
        }
        session
    }

    pub fn login_id(&self, conn: ConnectionId) -> Option<String> {
        self.read().get(&conn)?.login_id.clone()
    }

    /// Record the login id for `conn` and return the logon announcement.
    ///
    /// Fails without touching the session if a login id is already set.
    pub fn set_login_id(&self, conn: ConnectionId, login_id: &str) -> Result<String, SessionError> {
        let mut sessions = self.write();
        let session = sessions
            .get_mut(&conn)
            .ok_or(SessionError::UnknownConnection(conn))?;

        if let Some(existing) = &session.login_id {
            return Err(SessionError::AlreadyLoggedIn {
                conn,
                login_id: existing.clone(),
            });
        }

        session.login_id = Some(login_id.to_string());
        debug!(conn, login_id, "Session logged in");
        Ok(logon_notice(login_id))
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.read()
            .values()
            .map(|session| session.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
