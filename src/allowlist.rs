//! Read-only access control: which pubkeys may take part in a session channel.

use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;

/// `session_id -> channel -> [pubkey]`, consulted but never mutated.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    sessions: HashMap<String, HashMap<String, Vec<String>>>,
}

impl Allowlist {
    /// Build from an already parsed mapping, normalising pubkeys to lowercase.
    pub fn new(sessions: HashMap<String, HashMap<String, Vec<String>>>) -> anyhow::Result<Self> {
        let mut normalized = HashMap::with_capacity(sessions.len());
        for (session_id, channels) in sessions {
            let mut out = HashMap::with_capacity(channels.len());
            for (channel, pubkeys) in channels {
                let mut keys = Vec::with_capacity(pubkeys.len());
                for pubkey in pubkeys {
                    let key = pubkey.trim().to_ascii_lowercase();
                    if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                        anyhow::bail!(
                            "allowlist entry '{pubkey}' in {session_id}/{channel} is not a 64-char hex pubkey"
                        );
                    }
                    keys.push(key);
                }
                out.insert(channel, keys);
            }
            normalized.insert(session_id, out);
        }
        Ok(Self {
            sessions: normalized,
        })
    }

    /// Parse the JSON allowlist format.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, HashMap<String, Vec<String>>> =
            serde_json::from_str(json).context("allowlist is not a session -> channel -> [pubkey] object")?;
        Self::new(raw)
    }

    /// Load the allowlist from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read allowlist {}", path.display()))?;
        let allowlist = Self::from_json(&contents)
            .with_context(|| format!("invalid allowlist {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            sessions = allowlist.sessions.len(),
            "Loaded allowlist"
        );
        Ok(allowlist)
    }

    /// Members of `session_id/channel`, empty if unknown.
    pub fn members(&self, session_id: &str, channel: &str) -> &[String] {
        self.sessions
            .get(session_id)
            .and_then(|channels| channels.get(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, session_id: &str, channel: &str, pubkey: &str) -> bool {
        self.members(session_id, channel)
            .iter()
            .any(|member| member.eq_ignore_ascii_case(pubkey))
    }
}
