//! Fan-out of one message to every registered connection.

use crate::registry::SessionRegistry;
use crate::runtime::{Connection, SendError};
use tracing::{debug, trace};

/// Per-call delivery tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Send `text` to every connection registered when the call starts.
///
/// A failed send is logged and skipped; it never stops delivery to the rest.
pub fn broadcast(registry: &SessionRegistry, text: &str) -> Delivery {
    let mut delivery = Delivery::default();

    for conn in registry.connections() {
        match send_to_one(&conn, text) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "Broadcast send failed");
                delivery.failed += 1;
            }
        }
    }

    trace!(delivered = delivery.delivered, failed = delivery.failed, "Broadcast");
    delivery
}

/// Send `text` to exactly one connection.
pub fn send_to_one(conn: &Connection, text: &str) -> Result<(), SendError> {
    conn.send(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Outbound;

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let registry = SessionRegistry::new();
        let mut receivers = Vec::new();
        for id in 0..3 {
            let (conn, rx) = Connection::new(id, peer());
            registry.register(conn);
            receivers.push(rx);
        }

        let delivery = broadcast(&registry, "alice> hi");
        assert_eq!(delivery, Delivery { delivered: 3, failed: 0 });

        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Outbound::Line("alice> hi".to_string()));
        }
    }

    #[test]
    fn test_failed_sink_does_not_block_others() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx) = Connection::new(0, peer());
        let (broken, broken_rx) = Connection::new(1, peer());
        let (third, mut third_rx) = Connection::new(2, peer());
        registry.register(first);
        registry.register(broken);
        registry.register(third);
        drop(broken_rx);

        let delivery = broadcast(&registry, "hello");
        assert_eq!(delivery, Delivery { delivered: 2, failed: 1 });
        assert_eq!(first_rx.try_recv().unwrap(), Outbound::Line("hello".to_string()));
        assert_eq!(third_rx.try_recv().unwrap(), Outbound::Line("hello".to_string()));
    }

    #[test]
    fn test_closing_connection_is_skipped() {
        let registry = SessionRegistry::new();
        let (open, mut open_rx) = Connection::new(0, peer());
        let (closing, mut closing_rx) = Connection::new(1, peer());
        closing.close();
        registry.register(open);
        registry.register(closing);

        let delivery = broadcast(&registry, "hello");
        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
        assert_eq!(open_rx.try_recv().unwrap(), Outbound::Line("hello".to_string()));
        assert_eq!(closing_rx.try_recv().unwrap(), Outbound::Close);
        assert!(closing_rx.try_recv().is_err());
    }

    #[test]
    fn test_late_registration_misses_message() {
        let registry = SessionRegistry::new();
        let (early, mut early_rx) = Connection::new(0, peer());
        registry.register(early);

        broadcast(&registry, "first");

        let (late, mut late_rx) = Connection::new(1, peer());
        registry.register(late);

        assert_eq!(early_rx.try_recv().unwrap(), Outbound::Line("first".to_string()));
        assert!(late_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_to_one() {
        let (conn, mut rx) = Connection::new(0, peer());
        tokio_test::assert_ok!(send_to_one(&conn, "just you"));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Line("just you".to_string()));
    }
}
