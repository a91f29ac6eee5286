//! On-disk configuration (`<config_dir>/relaychat/config.toml`).
//!
//! Every field has a default so an empty file parses; [`Config::validate`]
//! runs after command-line overrides are applied.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

use crate::allowlist::Allowlist;
use crate::crypto::Cipher;
use crate::protocol::{Mode, SessionConfig};

const APP_DIR: &str = "relaychat";
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

fn default_mode() -> Mode {
    Mode::Enc
}

fn default_cipher() -> Cipher {
    Cipher::ChaCha20Poly1305
}

fn default_log_level() -> String {
    "info".into()
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn deserialize_path<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|opt| opt.map(|s| expand_path(&s)))
}

fn check_relay_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        bail!("Invalid relay URL '{url}': must start with ws:// or wss://")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Hex secret key file; created on first run.
    #[serde(default, deserialize_with = "deserialize_path")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowlistConfig {
    #[serde(default, deserialize_with = "deserialize_path")]
    pub path: Option<PathBuf>,
    /// Defaults to `true` when `path` is set.
    #[serde(default)]
    pub enforce: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub leader: bool,
    #[serde(default = "default_cipher")]
    pub cipher: Cipher,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            session_id: String::new(),
            channel: String::new(),
            mode: default_mode(),
            leader: false,
            cipher: default_cipher(),
            log_level: default_log_level(),
            identity: IdentityConfig::default(),
            allowlist: AllowlistConfig::default(),
        }
    }
}

impl Config {
    /// `<config_dir>/relaychat`.
    pub fn default_dir() -> Result<PathBuf> {
        directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join(APP_DIR))
            .context("Could not determine the user config directory")
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::default_dir()?.join("config.toml"))
    }

    /// Load from `path`, or from the default location if it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        if metadata.len() > MAX_CONFIG_SIZE {
            bail!("Config file {} is too large", path.display());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))
    }

    /// Check the merged configuration before anything connects.
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            bail!("At least one relay URL is required");
        }
        for relay in &self.relays {
            check_relay_url(relay)?;
        }
        if self.session_id.trim().is_empty() {
            bail!("session_id must not be empty");
        }
        if self.channel.trim().is_empty() {
            bail!("channel must not be empty");
        }
        Ok(())
    }

    pub fn key_file(&self) -> Result<PathBuf> {
        match &self.identity.key_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::default_dir()?.join("identity.key")),
        }
    }

    pub fn enforce_allowlist(&self) -> bool {
        self.allowlist
            .enforce
            .unwrap_or(self.allowlist.path.is_some())
    }

    /// Allowlist from the configured file, or an empty one.
    pub fn load_allowlist(&self) -> Result<Allowlist> {
        match &self.allowlist.path {
            Some(path) => Allowlist::load(path),
            None => Ok(Allowlist::default()),
        }
    }

    /// Engine parameters, with the AEAD suite chosen at startup.
    pub fn session_config(&self, cipher: Cipher) -> SessionConfig {
        SessionConfig {
            session_id: self.session_id.clone(),
            channel: self.channel.clone(),
            mode: self.mode,
            leader: self.leader,
            enforce_allowlist: self.enforce_allowlist(),
            cipher,
        }
    }
}
