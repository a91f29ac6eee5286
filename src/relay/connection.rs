//! One relay endpoint: connect, subscribe, read, reconnect with backoff.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::frame::{ClientFrame, Filter, RelayFrame};
use crate::event::{unix_now, verify_event, Event, KIND_ENCRYPTED, KIND_PUBLIC};

/// How far back the standing subscription looks on every (re)connect.
pub const SUBSCRIPTION_LOOKBACK_SECS: u64 = 600;

/// A single frame write that takes longer marks the socket as dead.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for the writer when tearing a socket down.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Writer half of the live socket. `dead` is cancelled when a write stalls,
/// ending the read loop of the same socket.
struct Socket {
    sink: WsSink,
    dead: CancellationToken,
}

/// A verified event tagged with the relay it came from.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub relay: Arc<str>,
    pub event: Event,
}

/// Connection to a single relay.
///
/// The writer half lives behind a mutex that doubles as the per-connection
/// send lock, so concurrent senders never interleave frames on one socket.
pub struct RelayConnection {
    url: Arc<str>,
    subscription_id: String,
    writer: Mutex<Option<Socket>>,
    connected: Arc<Notify>,
}

impl RelayConnection {
    pub fn new(url: &str, subscription_id: &str, connected: Arc<Notify>) -> Self {
        Self {
            url: Arc::from(url),
            subscription_id: subscription_id.to_string(),
            writer: Mutex::new(None),
            connected,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Fire-and-forget publish. Failures are logged and otherwise ignored.
    ///
    /// Gives up when `shutdown` fires. A write that stalls for
    /// [`SEND_TIMEOUT`] drops the socket and wakes the read loop so the
    /// connection is re-established.
    pub async fn send(&self, event: &Event, shutdown: &CancellationToken) {
        let frame = match ClientFrame::Event(event).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(relay = %self.url, "Failed to encode event frame: {e}");
                return;
            }
        };

        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!(relay = %self.url, event_id = %event.id, "Send abandoned on shutdown");
            }
            () = self.write_frame(frame, &event.id) => {}
        }
    }

    async fn write_frame(&self, frame: String, event_id: &str) {
        let mut writer = self.writer.lock().await;
        let Some(socket) = writer.as_mut() else {
            tracing::debug!(relay = %self.url, %event_id, "Not connected, event not sent");
            return;
        };
        let write = socket.sink.send(WsMessage::Text(frame.into()));
        match tokio::time::timeout(SEND_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(relay = %self.url, "Send failed: {e}"),
            Err(_) => {
                tracing::warn!(
                    relay = %self.url,
                    timeout_secs = SEND_TIMEOUT.as_secs(),
                    "Send stalled, dropping connection"
                );
                if let Some(socket) = writer.take() {
                    socket.dead.cancel();
                }
            }
        }
    }

    /// Run until `shutdown` fires, reconnecting forever on failure.
    pub async fn run(self: Arc<Self>, inbound: mpsc::Sender<InboundEvent>, shutdown: CancellationToken) {
        let mut backoff = Backoff::default();

        loop {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => break,
                outcome = self.connect_and_read(&inbound, &mut backoff) => outcome,
            };
            self.drop_writer().await;

            match outcome {
                Ok(()) => tracing::info!(relay = %self.url, "Relay connection closed"),
                Err(e) => tracing::warn!(relay = %self.url, "Relay connection failed: {e:#}"),
            }
            if inbound.is_closed() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::debug!(relay = %self.url, delay_secs = delay.as_secs(), "Reconnecting after backoff");
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.close().await;
        tracing::debug!(relay = %self.url, "Relay task stopped");
    }

    async fn connect_and_read(
        &self,
        inbound: &mpsc::Sender<InboundEvent>,
        backoff: &mut Backoff,
    ) -> anyhow::Result<()> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("connect failed: {e}"))?;
        let (mut sink, mut reader) = stream.split();

        let filters = [Filter {
            kinds: vec![KIND_PUBLIC, KIND_ENCRYPTED],
            since: unix_now().saturating_sub(SUBSCRIPTION_LOOKBACK_SECS),
        }];
        let req = ClientFrame::Req {
            subscription_id: &self.subscription_id,
            filters: &filters,
        }
        .to_json()?;
        sink.send(WsMessage::Text(req.into()))
            .await
            .map_err(|e| anyhow::anyhow!("subscribe failed: {e}"))?;

        let dead = CancellationToken::new();
        *self.writer.lock().await = Some(Socket {
            sink,
            dead: dead.clone(),
        });
        backoff.reset();
        self.connected.notify_one();
        tracing::info!(relay = %self.url, subscription = %self.subscription_id, "Connected to relay");

        loop {
            let message = tokio::select! {
                () = dead.cancelled() => anyhow::bail!("send stalled"),
                message = reader.next() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };
            match message.map_err(|e| anyhow::anyhow!("read failed: {e}"))? {
                WsMessage::Text(text) => {
                    if !self.handle_frame(text.as_str(), inbound).await {
                        return Ok(());
                    }
                }
                WsMessage::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    /// Returns `false` once the inbound channel has closed.
    async fn handle_frame(&self, text: &str, inbound: &mpsc::Sender<InboundEvent>) -> bool {
        let frame = match RelayFrame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(relay = %self.url, "Ignoring frame: {e}");
                return true;
            }
        };

        match frame {
            RelayFrame::Event {
                subscription_id,
                event,
            } => {
                if subscription_id != self.subscription_id {
                    tracing::debug!(relay = %self.url, %subscription_id, "Event for unknown subscription");
                    return true;
                }
                if !verify_event(&event) {
                    tracing::debug!(relay = %self.url, event_id = %event.id, "Dropped event with invalid id or signature");
                    return true;
                }
                inbound
                    .send(InboundEvent {
                        relay: Arc::clone(&self.url),
                        event,
                    })
                    .await
                    .is_ok()
            }
            RelayFrame::Notice(text) => {
                tracing::info!(relay = %self.url, notice = %text, "Relay notice");
                true
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => {
                if !accepted {
                    tracing::debug!(relay = %self.url, %event_id, %message, "Relay rejected event");
                }
                true
            }
            RelayFrame::Closed {
                subscription_id,
                message,
            } => {
                tracing::warn!(relay = %self.url, %subscription_id, %message, "Relay closed subscription");
                true
            }
            RelayFrame::Eose(_) => true,
        }
    }

    async fn drop_writer(&self) {
        if let Ok(mut writer) = tokio::time::timeout(TEARDOWN_TIMEOUT, self.writer.lock()).await {
            writer.take();
        }
    }

    /// Best-effort unsubscribe and close on shutdown.
    async fn close(&self) {
        let Ok(mut writer) = tokio::time::timeout(TEARDOWN_TIMEOUT, self.writer.lock()).await else {
            tracing::debug!(relay = %self.url, "Writer busy, closing without CLOSE frame");
            return;
        };
        let Some(Socket { mut sink, .. }) = writer.take() else {
            return;
        };
        drop(writer);
        if let Ok(frame) = (ClientFrame::Close {
            subscription_id: &self.subscription_id,
        })
        .to_json()
        {
            let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
                let _ = sink.send(WsMessage::Text(frame.into())).await;
                let _ = sink.close().await;
            })
            .await;
        }
    }
}
