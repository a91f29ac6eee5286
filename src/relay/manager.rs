//! Fan-in / fan-out over all configured relays.
//!
//! Each relay runs as its own task feeding one bounded channel. The single
//! consumer (the chat session) reads through [`RelayManager::recv`], which
//! applies the dedup filter so an event relayed by several endpoints is
//! dispatched exactly once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{InboundEvent, RelayConnection};
use super::dedup::DedupSet;
use crate::event::Event;

/// Inbound channel depth shared by all relay tasks.
const INBOUND_CAPACITY: usize = 1024;

pub struct RelayManager {
    connections: Vec<Arc<RelayConnection>>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    dedup: DedupSet,
    connected: Arc<Notify>,
    /// Token handed to [`RelayManager::start`]; in-flight sends abort on it.
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayManager {
    pub fn new(urls: &[String]) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let subscription_id = format!("relaychat-{}", &nonce[..12]);
        let connected = Arc::new(Notify::new());
        let connections = urls
            .iter()
            .map(|url| {
                Arc::new(RelayConnection::new(
                    url,
                    &subscription_id,
                    Arc::clone(&connected),
                ))
            })
            .collect();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        Self {
            connections,
            inbound_tx,
            inbound_rx,
            dedup: DedupSet::default(),
            connected,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn relay_count(&self) -> usize {
        self.connections.len()
    }

    /// Spawn one task per relay. Tasks stop when `shutdown` is cancelled.
    pub fn start(&mut self, shutdown: &CancellationToken) {
        self.shutdown = shutdown.clone();
        for conn in &self.connections {
            let conn = Arc::clone(conn);
            let tx = self.inbound_tx.clone();
            let token = shutdown.clone();
            tracing::debug!(relay = conn.url(), "Starting relay task");
            self.tasks.push(tokio::spawn(conn.run(tx, token)));
        }
    }

    /// Wait until at least one relay is connected, or `timeout` elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        for conn in &self.connections {
            if conn.is_connected().await {
                return true;
            }
        }
        tokio::time::timeout(timeout, self.connected.notified())
            .await
            .is_ok()
    }

    /// Send `event` to every relay without waiting for any of them.
    pub fn broadcast(&self, event: &Event) {
        for conn in &self.connections {
            let conn = Arc::clone(conn);
            let event = event.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { conn.send(&event, &shutdown).await });
        }
    }

    /// Next event not seen before from any relay.
    ///
    /// Returns `None` only if every sender is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let InboundEvent { relay, event } = self.inbound_rx.recv().await?;
            if self.dedup.insert(&event.id) {
                return Some(event);
            }
            tracing::trace!(relay = %relay, event_id = %event.id, "Duplicate event");
        }
    }

    /// Sender feeding the same dedup pipeline as the relay tasks.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundEvent> {
        self.inbound_tx.clone()
    }

    /// Wait for all relay tasks to finish after cancellation.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_event, KIND_PUBLIC};
    use crate::identity::Identity;
    use tokio::net::TcpListener;

    fn event(content: &str) -> Event {
        build_event(&Identity::generate(), 1, KIND_PUBLIC, vec![], content.into()).unwrap()
    }

    #[tokio::test]
    async fn same_event_from_two_relays_dispatched_once() {
        let mut manager = RelayManager::new(&[]);
        let tx = manager.inbound_sender();
        let ev = event("hello");
        let other = event("world");

        for relay in ["wss://a.example", "wss://b.example"] {
            tx.send(InboundEvent {
                relay: Arc::from(relay),
                event: ev.clone(),
            })
            .await
            .unwrap();
        }
        tx.send(InboundEvent {
            relay: Arc::from("wss://a.example"),
            event: other.clone(),
        })
        .await
        .unwrap();

        assert_eq!(manager.recv().await.unwrap().id, ev.id);
        assert_eq!(manager.recv().await.unwrap().id, other.id);

        // nothing else queued
        let next = tokio::time::timeout(Duration::from_millis(50), manager.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn no_relays_never_connects() {
        let manager = RelayManager::new(&[]);
        assert_eq!(manager.relay_count(), 0);
        assert!(!manager.wait_for_connection(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn unreachable_relay_stops_on_shutdown() {
        let mut manager = RelayManager::new(&["ws://127.0.0.1:1".to_string()]);
        let shutdown = CancellationToken::new();
        manager.start(&shutdown);
        assert!(!manager.wait_for_connection(Duration::from_millis(50)).await);

        // broadcasting while disconnected is a silent no-op
        manager.broadcast(&event("dropped"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), manager.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_relay_does_not_block_shutdown() {
        // accepts the websocket, then never reads another byte
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let mut manager = RelayManager::new(&[url]);
        let shutdown = CancellationToken::new();
        manager.start(&shutdown);
        assert!(manager.wait_for_connection(Duration::from_secs(5)).await);

        // enough to fill both socket buffers and leave writers queued
        let bulky = event(&"x".repeat(64 * 1024));
        for _ in 0..500 {
            manager.broadcast(&bulky);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), manager.join())
            .await
            .expect("relay task did not stop after cancellation");
    }
}
