//! Per-participant session state machine.
//!
//! Non-leader, enc: `Init → Announced → AwaitingKey → Keyed → Active`. The
//! engine waits in `AwaitingKey` right after its HELLO goes out; the leader
//! latch is independent of state.
//! Non-leader, plain: `Init → Announced → Active`.
//! Leader: `Init → LeaderAnnounced → Active`, distributing the session key
//! while announced.
//!
//! The engine performs no I/O. Every operation returns [`Effect`]s that the
//! caller executes (publish to relays, print, warn the local user).

use std::fmt;

use crate::allowlist::Allowlist;
use crate::crypto::{self, Cipher, Sealed, SessionKey};
use crate::event::{
    build_event, Event, KIND_ENCRYPTED, KIND_PUBLIC, TAG_CHANNEL, TAG_RECIPIENT, TAG_SESSION,
    TAG_VERSION,
};
use crate::identity::Identity;

use super::payload::{
    truncate_utf8, Body, EncryptedWrapper, MessageBody, Mode, Payload, MAX_CONTENT_BYTES,
    MAX_TEXT_BYTES, PROTOCOL_VERSION,
};
use super::Rejection;

/// Static parameters of the local session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub channel: String,
    pub mode: Mode,
    /// Whether the local identity announces itself as leader.
    pub leader: bool,
    /// Drop events from pubkeys missing from the allowlist.
    pub enforce_allowlist: bool,
    /// AEAD suite used for outgoing ciphertexts.
    pub cipher: Cipher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Announced,
    AwaitingKey,
    Keyed,
    LeaderAnnounced,
    Active,
}

/// A line for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Full hex pubkey of the author.
    pub sender: String,
    pub text: String,
    pub notice: bool,
}

impl ChatLine {
    /// First 8 hex chars of the sender pubkey.
    pub fn short_sender(&self) -> &str {
        short_id(&self.sender)
    }
}

impl fmt::Display for ChatLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.notice {
            write!(f, "* [{}] {}", self.short_sender(), self.text)
        } else {
            write!(f, "[{}] {}", self.short_sender(), self.text)
        }
    }
}

/// Work the caller must perform on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Broadcast a signed event to every relay.
    Publish(Event),
    /// Show a line to the local user.
    Display(ChatLine),
    /// User-blocking condition (e.g. message not sent).
    Warn(String),
}

fn short_id(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}

pub struct ProtocolEngine {
    identity: Identity,
    allowlist: Allowlist,
    config: SessionConfig,
    state: EngineState,
    /// Latched once from the first LEADER/KEY_OFFER seen, never overwritten.
    leader_pubkey: Option<String>,
    session_key: Option<SessionKey>,
}

impl ProtocolEngine {
    pub fn new(identity: Identity, allowlist: Allowlist, config: SessionConfig) -> Self {
        Self {
            identity,
            allowlist,
            config,
            state: EngineState::Init,
            leader_pubkey: None,
            session_key: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn leader_pubkey(&self) -> Option<&str> {
        self.leader_pubkey.as_deref()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    pub fn pubkey(&self) -> &str {
        self.identity.pubkey_hex()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn transition(&mut self, to: EngineState) {
        tracing::debug!(from = ?self.state, to = ?to, "State transition");
        self.state = to;
    }

    // ── Startup ────────────────────────────────────────────────

    /// Announce ourselves and, as leader, distribute the session key.
    pub fn start(&mut self, now: u64) -> Vec<Effect> {
        if self.state != EngineState::Init {
            tracing::debug!(state = ?self.state, "Engine already started");
            return Vec::new();
        }

        let mut effects = Vec::new();
        let agent = self.pubkey().to_string();
        let mode = self.config.mode;

        self.publish_control(&mut effects, now, Body::Hello { agent: agent.clone(), mode }, None);

        if !self.config.leader {
            self.transition(EngineState::Announced);
            self.transition(match mode {
                Mode::Enc => EngineState::AwaitingKey,
                Mode::Plain => EngineState::Active,
            });
            tracing::info!(
                session_id = %self.config.session_id,
                channel = %self.config.channel,
                mode = %mode,
                "Joined session"
            );
            return effects;
        }

        self.leader_pubkey = Some(agent.clone());
        self.transition(EngineState::LeaderAnnounced);
        self.publish_control(
            &mut effects,
            now,
            Body::Leader {
                agent: agent.clone(),
                mode,
            },
            None,
        );

        if mode == Mode::Enc {
            self.session_key = Some(SessionKey::generate());
            self.publish_control(&mut effects, now, Body::KeyOffer { agent, mode }, None);

            let recipients: Vec<String> = self
                .allowlist
                .members(&self.config.session_id, &self.config.channel)
                .iter()
                .filter(|member| member.as_str() != self.pubkey())
                .cloned()
                .collect();
            if recipients.is_empty() {
                tracing::warn!(
                    session_id = %self.config.session_id,
                    channel = %self.config.channel,
                    "No allowlisted members to receive the session key"
                );
            }
            for recipient in &recipients {
                self.send_key_dm(&mut effects, recipient, now);
            }
        }

        self.transition(EngineState::Active);
        tracing::info!(
            session_id = %self.config.session_id,
            channel = %self.config.channel,
            mode = %mode,
            "Leading session"
        );
        effects
    }

    // ── Outbound ───────────────────────────────────────────────

    /// Turn a line typed by the local user into a chat event.
    pub fn send_text(&mut self, text: &str, now: u64) -> Vec<Effect> {
        let text = truncate_utf8(text, MAX_TEXT_BYTES);
        let payload = Payload::new(
            &self.config.session_id,
            &self.config.channel,
            Body::Msg {
                from: self.pubkey().to_string(),
                msg_id: uuid::Uuid::new_v4().simple().to_string(),
                reply_to: None,
                body: MessageBody {
                    text: text.to_string(),
                },
            },
        );
        let inner = match payload.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                return Vec::new();
            }
        };

        let content = match self.config.mode {
            Mode::Plain => inner,
            Mode::Enc => {
                let Some(key) = self.session_key.as_ref() else {
                    return vec![Effect::Warn(
                        "No session key yet; message not sent".to_string(),
                    )];
                };
                match self.seal_message(key, inner.as_bytes()) {
                    Ok(wrapped) => wrapped,
                    Err(e) => {
                        tracing::error!("Failed to encrypt message: {e}");
                        return vec![Effect::Warn("Encryption failed; message not sent".into())];
                    }
                }
            }
        };

        if content.len() > MAX_CONTENT_BYTES {
            return vec![Effect::Warn(format!(
                "Message too large ({} bytes > {MAX_CONTENT_BYTES}); not sent",
                content.len()
            ))];
        }

        match build_event(
            &self.identity,
            now,
            KIND_ENCRYPTED,
            self.base_tags(),
            content,
        ) {
            Ok(event) => vec![Effect::Publish(event)],
            Err(e) => {
                tracing::error!("Failed to sign message event: {e}");
                Vec::new()
            }
        }
    }

    fn seal_message(&self, key: &SessionKey, inner: &[u8]) -> anyhow::Result<String> {
        let sealed = self.config.cipher.seal(key.as_bytes(), inner)?;
        let wrapper = EncryptedWrapper {
            v: PROTOCOL_VERSION,
            enc: sealed.cipher.as_str().to_string(),
            sid: self.config.session_id.clone(),
            nonce: sealed.nonce_b64(),
            ciphertext: sealed.ciphertext_b64(),
        };
        Ok(serde_json::to_string(&wrapper)?)
    }

    fn base_tags(&self) -> Vec<Vec<String>> {
        vec![
            vec![TAG_CHANNEL.into(), self.config.channel.clone()],
            vec![TAG_SESSION.into(), self.config.session_id.clone()],
            vec![TAG_VERSION.into(), PROTOCOL_VERSION.to_string()],
        ]
    }

    fn publish_control(
        &self,
        effects: &mut Vec<Effect>,
        now: u64,
        body: Body,
        recipient: Option<&str>,
    ) {
        let type_name = body.type_name();
        let payload = Payload::new(&self.config.session_id, &self.config.channel, body);
        let mut tags = self.base_tags();
        if let Some(recipient) = recipient {
            tags.push(vec![TAG_RECIPIENT.into(), recipient.to_string()]);
        }

        let event = payload
            .to_json()
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                build_event(&self.identity, now, KIND_PUBLIC, tags, content).map_err(Into::into)
            });
        match event {
            Ok(event) => effects.push(Effect::Publish(event)),
            Err(e) => tracing::error!(payload = type_name, "Failed to build control event: {e}"),
        }
    }

    fn send_key_dm(&self, effects: &mut Vec<Effect>, recipient: &str, now: u64) {
        let Some(key) = self.session_key.as_ref() else {
            return;
        };
        let sealed = match crypto::wrap_session_key(
            &self.identity,
            recipient,
            &self.config.session_id,
            key,
            self.config.cipher,
        ) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!(recipient = short_id(recipient), "Failed to wrap session key: {e}");
                return;
            }
        };

        tracing::debug!(recipient = short_id(recipient), enc = %sealed.cipher, "Sending session key");
        self.publish_control(
            effects,
            now,
            Body::KeyDm {
                from: self.pubkey().to_string(),
                enc: sealed.cipher.as_str().to_string(),
                nonce: sealed.nonce_b64(),
                ciphertext: sealed.ciphertext_b64(),
            },
            Some(recipient),
        );
    }

    // ── Inbound ────────────────────────────────────────────────

    /// Process a signature-verified event from the relays.
    ///
    /// Anything malformed, unauthorized or mis-addressed is dropped with a
    /// debug log; this never fails.
    pub fn handle_event(&mut self, event: &Event, now: u64) -> Vec<Effect> {
        match self.process(event, now) {
            Ok(effects) => effects,
            Err(Rejection::NoSessionKey) => {
                tracing::warn!(
                    event_id = %event.id,
                    sender = short_id(&event.pubkey),
                    "Encrypted message received before session key; dropped"
                );
                Vec::new()
            }
            Err(reason) => {
                tracing::debug!(
                    event_id = %event.id,
                    sender = short_id(&event.pubkey),
                    kind = event.kind,
                    %reason,
                    "Dropped event"
                );
                Vec::new()
            }
        }
    }

    fn process(&mut self, event: &Event, now: u64) -> Result<Vec<Effect>, Rejection> {
        self.admit(event)?;
        match event.kind {
            KIND_PUBLIC => self.handle_control(event, now),
            KIND_ENCRYPTED => self.handle_message(event),
            other => Err(Rejection::UnknownKind(other)),
        }
    }

    fn admit(&self, event: &Event) -> Result<(), Rejection> {
        if event.pubkey == self.pubkey() {
            return Err(Rejection::OwnEvent);
        }
        if self.config.enforce_allowlist
            && !self
                .allowlist
                .contains(&self.config.session_id, &self.config.channel, &event.pubkey)
        {
            return Err(Rejection::NotAllowlisted);
        }
        if !event.has_tag(TAG_CHANNEL, &self.config.channel)
            || !event.has_tag(TAG_SESSION, &self.config.session_id)
        {
            return Err(Rejection::TagMismatch);
        }
        if event.content.len() > MAX_CONTENT_BYTES {
            return Err(Rejection::Oversized(event.content.len()));
        }
        Ok(())
    }

    fn handle_control(&mut self, event: &Event, now: u64) -> Result<Vec<Effect>, Rejection> {
        let payload = Payload::parse(event.content.as_bytes())?;
        payload.validate(&self.config.session_id, &self.config.channel)?;

        let mut effects = Vec::new();
        match payload.body {
            Body::Hello { mode, .. } => {
                tracing::info!(peer = short_id(&event.pubkey), mode = %mode, "Peer joined");
                if mode != self.config.mode {
                    tracing::debug!(
                        peer = short_id(&event.pubkey),
                        "Peer announced a different mode"
                    );
                }
                if self.config.leader
                    && self.config.mode == Mode::Enc
                    && self.allowlist.contains(
                        &self.config.session_id,
                        &self.config.channel,
                        &event.pubkey,
                    )
                {
                    self.send_key_dm(&mut effects, &event.pubkey, now);
                }
            }
            Body::Leader { .. } | Body::KeyOffer { .. } => self.latch_leader(&event.pubkey),
            Body::KeyAck { .. } => {
                if self.config.leader {
                    tracing::info!(peer = short_id(&event.pubkey), "Session key acknowledged");
                }
            }
            Body::KeyDm {
                from,
                enc,
                nonce,
                ciphertext,
            } => {
                let sealed = Sealed::from_wire(&enc, &nonce, &ciphertext)
                    .map_err(|e| Rejection::Decrypt(e.to_string()));
                self.receive_key(event, &from, sealed, &mut effects, now)?;
            }
            Body::Notice { text, .. } => effects.push(Effect::Display(ChatLine {
                sender: event.pubkey.clone(),
                text,
                notice: true,
            })),
            Body::Msg { .. } => return Err(Rejection::WrongKind("MSG")),
        }
        Ok(effects)
    }

    fn latch_leader(&mut self, pubkey: &str) {
        match &self.leader_pubkey {
            None => {
                tracing::info!(leader = short_id(pubkey), "Leader latched");
                self.leader_pubkey = Some(pubkey.to_string());
            }
            Some(current) if current != pubkey => {
                tracing::debug!(
                    leader = short_id(current),
                    claimant = short_id(pubkey),
                    "Ignoring competing leader claim"
                );
            }
            Some(_) => {}
        }
    }

    fn receive_key(
        &mut self,
        event: &Event,
        from: &str,
        sealed: Result<Sealed, Rejection>,
        effects: &mut Vec<Effect>,
        now: u64,
    ) -> Result<(), Rejection> {
        if self.config.mode != Mode::Enc || self.config.leader {
            return Err(Rejection::NotApplicable);
        }
        if !event.has_tag(TAG_RECIPIENT, self.pubkey()) {
            return Err(Rejection::NotAddressed);
        }
        if from != event.pubkey {
            return Err(Rejection::Schema("KEY_DM sender does not match author".into()));
        }
        if let Some(leader) = &self.leader_pubkey {
            if *leader != event.pubkey {
                return Err(Rejection::NotLeader);
            }
        }
        if self.session_key.is_some() {
            return Err(Rejection::NotApplicable);
        }

        let sealed = sealed?;
        let key = crypto::unwrap_session_key(
            &self.identity,
            &event.pubkey,
            &self.config.session_id,
            &sealed,
        )
        .map_err(|e| Rejection::Decrypt(e.to_string()))?;

        self.session_key = Some(key);
        self.transition(EngineState::Keyed);
        tracing::info!(
            leader = short_id(&event.pubkey),
            enc = %sealed.cipher,
            "Session key received"
        );

        self.publish_control(
            effects,
            now,
            Body::KeyAck {
                agent: self.pubkey().to_string(),
                mode: self.config.mode,
            },
            None,
        );
        self.transition(EngineState::Active);
        Ok(())
    }

    fn handle_message(&self, event: &Event) -> Result<Vec<Effect>, Rejection> {
        let payload = match self.config.mode {
            Mode::Plain => Payload::parse(event.content.as_bytes())?,
            Mode::Enc => {
                let key = self.session_key.as_ref().ok_or(Rejection::NoSessionKey)?;
                let wrapper = EncryptedWrapper::parse(&event.content)?;
                wrapper.validate(&self.config.session_id)?;
                let plaintext = Sealed::from_wire(&wrapper.enc, &wrapper.nonce, &wrapper.ciphertext)
                    .and_then(|sealed| sealed.open(key.as_bytes()))
                    .map_err(|e| Rejection::Decrypt(e.to_string()))?;
                Payload::parse(&plaintext)?
            }
        };
        payload.validate(&self.config.session_id, &self.config.channel)?;

        match payload.body {
            Body::Msg { body, .. } => Ok(vec![Effect::Display(ChatLine {
                sender: event.pubkey.clone(),
                text: body.text,
                notice: false,
            })]),
            other => Err(Rejection::WrongKind(other.type_name())),
        }
    }
}
