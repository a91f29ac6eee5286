//! End-to-end sessions through an in-process relay.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use relaychat::crypto::Cipher;
use relaychat::protocol::EngineState;
use relaychat::{
    Allowlist, ChatLine, ChatSession, Console, Identity, Mode, ProtocolEngine, RelayManager,
    SessionConfig,
};
use relaychat::event::{build_event, KIND_PUBLIC};

// ── Mock relay ──────────────────────────────────────────────────

#[derive(Default)]
struct RelayState {
    events: Vec<Value>,
    subscribers: Vec<(String, mpsc::UnboundedSender<String>)>,
    /// Arrival time and filter of every REQ.
    reqs: Vec<(Instant, Value)>,
    /// Connections still to be cut right after their REQ.
    drop_connections: usize,
}

async fn spawn_relay() -> (String, Arc<Mutex<RelayState>>) {
    spawn_relay_dropping(0).await
}

/// Minimal relay: stores every event, replays history on REQ and fans new
/// events out to all subscriptions, including the author's. The first
/// `drop_connections` connections are closed as soon as they subscribe.
async fn spawn_relay_dropping(drop_connections: usize) -> (String, Arc<Mutex<RelayState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let state = Arc::new(Mutex::new(RelayState {
        drop_connections,
        ..RelayState::default()
    }));

    let shared = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut reader) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(message)) = reader.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(frame) = serde_json::from_str::<Vec<Value>>(text.as_str()) else {
                        continue;
                    };
                    match frame.first().and_then(Value::as_str) {
                        Some("REQ") => {
                            let sub = frame[1].as_str().unwrap_or_default().to_string();
                            let mut state = state.lock();
                            state.reqs.push((Instant::now(), frame[2].clone()));
                            if state.drop_connections > 0 {
                                state.drop_connections -= 1;
                                return;
                            }
                            for event in &state.events {
                                let _ = tx.send(json!(["EVENT", sub, event]).to_string());
                            }
                            let _ = tx.send(json!(["EOSE", sub]).to_string());
                            state.subscribers.push((sub, tx.clone()));
                        }
                        Some("EVENT") => {
                            let event = frame[1].clone();
                            let _ = tx.send(json!(["OK", event["id"], true, ""]).to_string());
                            let mut state = state.lock();
                            state.events.push(event.clone());
                            for (sub, subscriber) in &state.subscribers {
                                let _ = subscriber.send(json!(["EVENT", sub, event]).to_string());
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (url, state)
}

// ── Harness ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct SharedConsole {
    lines: Arc<Mutex<Vec<String>>>,
    warnings: Arc<Mutex<Vec<String>>>,
}

impl Console for SharedConsole {
    fn show(&mut self, line: &ChatLine) {
        self.lines.lock().push(line.to_string());
    }
    fn warn(&mut self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }
}

struct Participant {
    input: mpsc::Sender<String>,
    console: SharedConsole,
    handle: tokio::task::JoinHandle<ChatSession<SharedConsole>>,
}

fn session_config(mode: Mode, leader: bool, enforce: bool) -> SessionConfig {
    SessionConfig {
        session_id: "standup".into(),
        channel: "general".into(),
        mode,
        leader,
        enforce_allowlist: enforce,
        cipher: Cipher::ChaCha20Poly1305,
    }
}

fn join(
    identity: Identity,
    allowlist: Allowlist,
    config: SessionConfig,
    relays: &[String],
    shutdown: &CancellationToken,
) -> Participant {
    let console = SharedConsole::default();
    let engine = ProtocolEngine::new(identity, allowlist, config);
    let mut session = ChatSession::new(engine, RelayManager::new(relays), console.clone());
    let (input, rx) = mpsc::channel(16);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        session.run(rx, token).await.unwrap();
        session
    });
    Participant {
        input,
        console,
        handle,
    }
}

async fn wait_for(lines: &Arc<Mutex<Vec<String>>>, count: usize) -> bool {
    for _ in 0..100 {
        if lines.lock().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn allowlist(members: &[&Identity]) -> Allowlist {
    let keys: Vec<&str> = members.iter().map(|id| id.pubkey_hex()).collect();
    Allowlist::from_json(&json!({ "standup": { "general": keys } }).to_string()).unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn plain_message_delivered_once_across_duplicate_relays() {
    let (url, _relay) = spawn_relay().await;
    let shutdown = CancellationToken::new();

    let alice = Identity::generate();
    let alice_short = alice.pubkey_hex()[..8].to_string();
    let a = join(
        alice,
        Allowlist::default(),
        session_config(Mode::Plain, false, false),
        std::slice::from_ref(&url),
        &shutdown,
    );
    let b = join(
        Identity::generate(),
        Allowlist::default(),
        session_config(Mode::Plain, false, false),
        &[url.clone(), url.clone()],
        &shutdown,
    );

    a.input.send("hi".into()).await.unwrap();
    assert!(wait_for(&b.console.lines, 1).await, "message never arrived");

    // give the second relay connection time to deliver its copy
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*b.console.lines.lock(), vec![format!("[{alice_short}] hi")]);
    // no local echo
    assert!(a.console.lines.lock().is_empty());

    shutdown.cancel();
    a.handle.await.unwrap();
    b.handle.await.unwrap();
}

#[tokio::test]
async fn encrypted_session_key_distribution_and_chat() {
    let (url, relay) = spawn_relay().await;
    let shutdown = CancellationToken::new();

    let leader = Identity::generate();
    let member = Identity::generate();
    let outsider = Identity::generate();
    let leader_short = leader.pubkey_hex()[..8].to_string();
    let acl = allowlist(&[&leader, &member]);
    let relays = std::slice::from_ref(&url);

    let l = join(
        leader,
        acl.clone(),
        session_config(Mode::Enc, true, true),
        relays,
        &shutdown,
    );
    let m = join(
        member,
        acl.clone(),
        session_config(Mode::Enc, false, true),
        relays,
        &shutdown,
    );
    let o = join(
        outsider,
        acl,
        session_config(Mode::Enc, false, true),
        relays,
        &shutdown,
    );

    l.input.send("quarterly numbers".into()).await.unwrap();
    assert!(wait_for(&m.console.lines, 1).await, "member never decrypted");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        *m.console.lines.lock(),
        vec![format!("[{leader_short}] quarterly numbers")]
    );
    assert!(o.console.lines.lock().is_empty());

    // the ciphertext on the relay never carries the plaintext
    let stored = relay.lock().events.clone();
    assert!(stored
        .iter()
        .all(|event| !event["content"].as_str().unwrap_or_default().contains("quarterly")));

    shutdown.cancel();
    let l = l.handle.await.unwrap();
    let m = m.handle.await.unwrap();
    let o = o.handle.await.unwrap();

    assert_eq!(l.engine().state(), EngineState::Active);
    assert_eq!(m.engine().state(), EngineState::Active);
    assert_eq!(
        m.engine().session_key().map(|k| *k.as_bytes()),
        l.engine().session_key().map(|k| *k.as_bytes())
    );
    assert!(o.engine().session_key().is_none());
}

#[tokio::test]
async fn relay_drop_triggers_resubscribe_with_reset_backoff() {
    let (url, relay) = spawn_relay_dropping(2).await;
    let shutdown = CancellationToken::new();
    let mut manager = RelayManager::new(std::slice::from_ref(&url));
    manager.start(&shutdown);

    // two cut connections, each followed by a 1 s backoff
    let mut attempts = 0;
    for _ in 0..100 {
        attempts = relay.lock().reqs.len();
        if attempts >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(attempts, 3, "relay was not re-subscribed twice");

    let reqs = relay.lock().reqs.clone();
    let since = |i: usize| reqs[i].1["since"].as_u64().unwrap();
    assert!(since(2) > since(0), "subscription window not refreshed");
    assert_eq!(reqs[2].1["kinds"], json!([24242, 24243]));
    // a successful connect resets the delay to 1 s instead of doubling to 2 s
    let second_gap = reqs[2].0 - reqs[1].0;
    assert!(second_gap < Duration::from_millis(1700), "gap was {second_gap:?}");

    // the surviving connection carries traffic both ways
    assert!(manager.wait_for_connection(Duration::from_secs(1)).await);
    // the REQ lands before the writer is installed on our side
    tokio::time::sleep(Duration::from_millis(200)).await;
    let author = Identity::generate();
    let event = build_event(&author, 1, KIND_PUBLIC, vec![], "after reconnect".into()).unwrap();
    manager.broadcast(&event);
    let echoed = tokio::time::timeout(Duration::from_secs(2), manager.recv())
        .await
        .expect("event not relayed after reconnect")
        .unwrap();
    assert_eq!(echoed.id, event.id);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), manager.join())
        .await
        .unwrap();
}
