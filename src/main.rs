//! chat-relay: a multi-client chat relay
//!
//! One binary, two roles:
//! - `server`: accepts clients, relays chat to everyone, announces logons
//!   and departures
//! - `client`: logs in under a name and exchanges lines with a server
//!
//! Both read operator lines from stdin. Lines starting with `#` are
//! commands (`#quit`, `#setport`, `#start`, `#login`, ...); anything else
//! is chat.
//!
//! Wire protocol: newline-terminated UTF-8 text. A client's first line is
//! `#login <id>`; chat is relayed as `<id>> <text>`.

mod broadcast;
mod client;
mod command;
mod config;
mod console;
mod registry;
mod runtime;
mod server;

use client::ChatClient;
use config::{ClientSettings, Config, Role, ServerSettings};
use console::{Console, Flow, Stdout};
use server::ChatServer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the console
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.role {
        Role::Server(settings) => run_server(settings).await,
        Role::Client(settings) => run_client(settings).await,
    }
}

/// Listen and relay until the operator quits or stdin closes.
async fn run_server(settings: ServerSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %settings.listen,
        port = settings.port,
        max_connections = settings.max_connections,
        "Starting chat-relay server"
    );

    let console: Arc<dyn Console> = Arc::new(Stdout);
    let server = ChatServer::new(&settings, Arc::clone(&console));

    if let Err(e) = server.listen() {
        error!(error = %e, "Initial listen failed");
        console.display("ERROR - Could not listen for clients!");
    }

    let mut lines = operator_lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if server.handle_operator_line(&line).await == Flow::Exit {
            return Ok(());
        }
    }

    server.handle_operator_line("#quit").await;
    Ok(())
}

/// Chat until the user quits, stdin closes, or the server becomes unreachable.
async fn run_client(settings: ClientSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        login_id = %settings.login_id,
        host = %settings.host,
        port = settings.port,
        "Starting chat-relay client"
    );

    let client = ChatClient::connect(&settings, Arc::new(Stdout)).await;

    let mut lines = operator_lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if client.handle_ui_line(&line).await == Flow::Exit {
            return Ok(());
        }
    }

    client.handle_ui_line("#quit").await;
    Ok(())
}

fn operator_lines() -> Lines<BufReader<Stdin>> {
    BufReader::new(tokio::io::stdin()).lines()
}

#[cfg(test)]
mod tests {
    use super::*;
    use console::Transcript;
    use std::time::Duration;

    struct Relay {
        server: Arc<ChatServer>,
        log: Arc<Transcript>,
    }

    impl Relay {
        fn start() -> Self {
            let log = Arc::new(Transcript::default());
            let settings = ServerSettings {
                listen: "127.0.0.1".to_string(),
                port: 0,
                max_connections: 16,
            };
            let server = ChatServer::new(&settings, log.clone());
            server.listen().unwrap();
            Relay { server, log }
        }

        /// Connect `login_id` and wait until the server has seen its logon.
        async fn join(&self, login_id: &str) -> (Arc<ChatClient>, Arc<Transcript>) {
            let screen = Arc::new(Transcript::default());
            let settings = ClientSettings {
                login_id: login_id.to_string(),
                host: "127.0.0.1".to_string(),
                port: self.server.port(),
            };
            let client = ChatClient::connect(&settings, screen.clone()).await;
            let notice = format!("<{login_id}> has logged on");
            self.log.wait_for(&notice).await;
            screen.wait_for(&notice).await;
            (client, screen)
        }
    }

    #[tokio::test]
    async fn test_login_is_announced_to_everyone() {
        let relay = Relay::start();
        let (_alice, alice_screen) = relay.join("alice").await;
        let (_bob, bob_screen) = relay.join("bob").await;

        alice_screen.wait_for("<bob> has logged on").await;
        assert_eq!(alice_screen.lines()[0], "<alice> has logged on");
        assert!(!bob_screen.contains("<alice> has logged on"));
        assert_eq!(relay.server.session_count(), 2);
    }

    #[tokio::test]
    async fn test_chat_reaches_sender_and_others() {
        let relay = Relay::start();
        let (alice, alice_screen) = relay.join("alice").await;
        let (_bob, bob_screen) = relay.join("bob").await;

        assert_eq!(alice.handle_ui_line("hi").await, Flow::Continue);
        alice_screen.wait_for("alice> hi").await;
        bob_screen.wait_for("alice> hi").await;
    }

    #[tokio::test]
    async fn test_logoff_text_ends_session() {
        let relay = Relay::start();
        let (alice, alice_screen) = relay.join("alice").await;
        let (_bob, bob_screen) = relay.join("bob").await;

        alice.send_to_server("#logoff").unwrap();

        bob_screen.wait_for("<alice> has disconnected").await;
        relay.log.wait_for("<alice> has disconnected").await;
        alice_screen.wait_for("Connection closed").await;
        assert!(!alice.is_connected());
        assert!(!bob_screen.contains("alice> #logoff"));
        assert_eq!(relay.server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_client_logoff_command() {
        let relay = Relay::start();
        let (alice, alice_screen) = relay.join("alice").await;
        let (_bob, bob_screen) = relay.join("bob").await;

        assert_eq!(alice.handle_ui_line("#logoff").await, Flow::Continue);
        bob_screen.wait_for("<alice> has disconnected").await;
        alice_screen.wait_for("Connection closed").await;

        assert_eq!(alice.handle_ui_line("#login").await, Flow::Continue);
        bob_screen.wait_for("<alice> has logged on").await;
        assert_eq!(relay.log.count("<alice> has logged on"), 2);
    }

    #[tokio::test]
    async fn test_login_while_connected_sends_nothing() {
        let relay = Relay::start();
        let (alice, alice_screen) = relay.join("alice").await;

        assert_eq!(alice.handle_ui_line("#login").await, Flow::Continue);
        assert!(alice_screen.contains("Can't login when connected"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice.is_connected());
        assert_eq!(relay.log.count("<alice> has logged on"), 1);
        assert_eq!(relay.server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_keeps_existing_clients() {
        let relay = Relay::start();
        let (alice, _alice_screen) = relay.join("alice").await;
        let (_bob, bob_screen) = relay.join("bob").await;

        relay.server.handle_operator_line("#stop").await;
        bob_screen
            .wait_for("WARNING - server has stopped listening to connections")
            .await;

        alice.handle_ui_line("still here").await;
        bob_screen.wait_for("alice> still here").await;
    }

    #[tokio::test]
    async fn test_close_drops_clients() {
        let relay = Relay::start();
        let (alice, alice_screen) = relay.join("alice").await;

        relay.server.handle_operator_line("#close").await;
        alice_screen.wait_for("Connection closed").await;
        assert!(!alice.is_connected());
        assert!(relay.log.contains("Server has been closed"));

        assert_eq!(alice.handle_ui_line("anyone?").await, Flow::Exit);
    }

    #[tokio::test]
    async fn test_operator_message_is_broadcast() {
        let relay = Relay::start();
        let (_alice, alice_screen) = relay.join("alice").await;

        relay.server.handle_operator_line("back in five").await;
        alice_screen.wait_for("SERVER MSG> back in five").await;
    }
}
