//! Interactive chat session.
//!
//! Owns the protocol engine and the relay manager and multiplexes three
//! sources on one task: deduplicated relay events, local input lines and
//! the shutdown token. Engine effects are applied in order.

use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::unix_now;
use crate::protocol::{ChatLine, Effect, ProtocolEngine};
use crate::relay::RelayManager;

/// How long startup waits for the first relay before announcing anyway.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Input line that ends the session.
pub const QUIT_COMMAND: &str = "/quit";

/// Sink for user-visible output.
pub trait Console: Send {
    fn show(&mut self, line: &ChatLine);
    fn warn(&mut self, message: &str);
}

/// Chat lines on stdout, warnings on stderr.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn show(&mut self, line: &ChatLine) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }

    fn warn(&mut self, message: &str) {
        eprintln!("! {message}");
    }
}

pub struct ChatSession<C: Console> {
    engine: ProtocolEngine,
    relays: RelayManager,
    console: C,
    connect_timeout: Duration,
}

impl<C: Console> ChatSession<C> {
    pub fn new(engine: ProtocolEngine, relays: RelayManager, console: C) -> Self {
        Self {
            engine,
            relays,
            console,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn into_console(self) -> C {
        self.console
    }

    /// Run until `/quit` or `shutdown` is cancelled.
    ///
    /// Closing `input` (stdin EOF) stops reading lines but keeps the session
    /// receiving until shutdown.
    pub async fn run(
        &mut self,
        mut input: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        self.relays.start(&shutdown);

        tokio::select! {
            () = shutdown.cancelled() => {
                self.relays.join().await;
                return Ok(());
            }
            connected = self.relays.wait_for_connection(self.connect_timeout) => {
                if !connected {
                    let timeout_ms =
                        u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(
                        relays = self.relays.relay_count(),
                        timeout_ms,
                        "No relay connected, announcing anyway"
                    );
                }
            }
        }

        let effects = self.engine.start(unix_now());
        self.apply(effects);

        let mut input_open = true;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                inbound = self.relays.recv() => {
                    let Some(event) = inbound else { break };
                    let effects = self.engine.handle_event(&event, unix_now());
                    self.apply(effects);
                }
                line = input.recv(), if input_open => match line {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line == QUIT_COMMAND {
                            tracing::info!("Quit requested");
                            break;
                        }
                        let effects = self.engine.send_text(line, unix_now());
                        self.apply(effects);
                    }
                    None => {
                        tracing::debug!("Input closed");
                        input_open = false;
                    }
                },
            }
        }

        shutdown.cancel();
        self.relays.join().await;
        Ok(())
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => {
                    tracing::debug!(event_id = %event.id, kind = event.kind, "Publishing event");
                    self.relays.broadcast(&event);
                }
                Effect::Display(line) => self.console.show(&line),
                Effect::Warn(message) => {
                    tracing::warn!("{message}");
                    self.console.warn(&message);
                }
            }
        }
    }
}

/// Forward stdin lines into a channel. The channel closes on EOF.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::Allowlist;
    use crate::crypto::Cipher;
    use crate::event::{build_event, KIND_ENCRYPTED, TAG_CHANNEL, TAG_SESSION, TAG_VERSION};
    use crate::identity::Identity;
    use crate::protocol::engine::SessionConfig;
    use crate::protocol::payload::{Body, MessageBody, Payload};
    use crate::protocol::Mode;
    use crate::relay::InboundEvent;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<ChatLine>,
        warnings: Vec<String>,
    }

    impl Console for Recorder {
        fn show(&mut self, line: &ChatLine) {
            self.lines.push(line.clone());
        }
        fn warn(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }
    }

    fn config(mode: Mode) -> SessionConfig {
        SessionConfig {
            session_id: "s1".into(),
            channel: "general".into(),
            mode,
            leader: false,
            enforce_allowlist: false,
            cipher: Cipher::ChaCha20Poly1305,
        }
    }

    fn plain_msg(author: &Identity, text: &str) -> crate::event::Event {
        let payload = Payload::new(
            "s1",
            "general",
            Body::Msg {
                from: author.pubkey_hex().to_string(),
                msg_id: "m1".into(),
                reply_to: None,
                body: MessageBody { text: text.into() },
            },
        );
        build_event(
            author,
            unix_now(),
            KIND_ENCRYPTED,
            vec![
                vec![TAG_CHANNEL.into(), "general".into()],
                vec![TAG_SESSION.into(), "s1".into()],
                vec![TAG_VERSION.into(), "1".into()],
            ],
            payload.to_json().unwrap(),
        )
        .unwrap()
    }

    fn session(mode: Mode) -> ChatSession<Recorder> {
        let engine = ProtocolEngine::new(Identity::generate(), Allowlist::default(), config(mode));
        ChatSession::new(engine, RelayManager::new(&[]), Recorder::default())
            .with_connect_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn quit_command_ends_session() {
        let mut session = session(Mode::Plain);
        let (tx, rx) = mpsc::channel(4);
        tx.send("   ".into()).await.unwrap();
        tx.send(" /quit ".into()).await.unwrap();

        session.run(rx, CancellationToken::new()).await.unwrap();
        assert!(session.into_console().lines.is_empty());
    }

    #[tokio::test]
    async fn relayed_message_shown_once() {
        let mut session = session(Mode::Plain);
        let author = Identity::generate();
        let event = plain_msg(&author, "hi");
        let inbound = session.relays.inbound_sender();
        for relay in ["ws://a", "ws://b"] {
            inbound
                .send(InboundEvent {
                    relay: Arc::from(relay),
                    event: event.clone(),
                })
                .await
                .unwrap();
        }

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
            drop(tx);
        });

        session.run(rx, shutdown).await.unwrap();
        let console = session.into_console();
        assert_eq!(console.lines.len(), 1);
        assert_eq!(
            console.lines[0].to_string(),
            format!("[{}] hi", &author.pubkey_hex()[..8])
        );
    }

    #[tokio::test]
    async fn send_without_key_warns_user() {
        let mut session = session(Mode::Enc);
        let (tx, rx) = mpsc::channel(4);
        tx.send("secret".into()).await.unwrap();
        tx.send(QUIT_COMMAND.into()).await.unwrap();

        session.run(rx, CancellationToken::new()).await.unwrap();
        let console = session.into_console();
        assert_eq!(console.warnings.len(), 1);
        assert!(console.warnings[0].contains("No session key"));
    }

    #[tokio::test]
    async fn closed_input_keeps_session_running() {
        let mut session = session(Mode::Plain);
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            session.run(rx, shutdown).await.unwrap();
            session
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        stop.cancel();
        let session = handle.await.unwrap();
        assert!(session.into_console().lines.is_empty());
    }
}
