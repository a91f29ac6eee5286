use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use relaychat::crypto::{self, Cipher};
use relaychat::{
    session, ChatSession, Config, Identity, Mode, ProtocolEngine, RelayManager, StdoutConsole,
};

/// Group chat for agents over public relays.
#[derive(Debug, Parser)]
#[command(name = "relaychat", version, about)]
struct Cli {
    /// Config file (default: <config_dir>/relaychat/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay URL; repeat for several relays. Replaces configured relays.
    #[arg(short, long = "relay")]
    relays: Vec<String>,

    /// Session id
    #[arg(short, long)]
    session: Option<String>,

    /// Channel within the session
    #[arg(short = 'C', long)]
    channel: Option<String>,

    /// Operating mode: plain or enc
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Announce as session leader and distribute the session key
    #[arg(long)]
    leader: bool,

    /// Preferred AEAD suite: chacha20poly1305 or aes256gcm
    #[arg(long)]
    cipher: Option<Cipher>,

    /// Secret key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Allowlist JSON file
    #[arg(long)]
    allowlist: Option<PathBuf>,

    /// Accept events from senders missing from the allowlist
    #[arg(long)]
    no_enforce: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if !self.relays.is_empty() {
            config.relays = self.relays;
        }
        if let Some(session) = self.session {
            config.session_id = session;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.leader {
            config.leader = true;
        }
        if let Some(cipher) = self.cipher {
            config.cipher = cipher;
        }
        if let Some(key_file) = self.key_file {
            config.identity.key_file = Some(key_file);
        }
        if let Some(path) = self.allowlist {
            config.allowlist.path = Some(path);
        }
        if self.no_enforce {
            config.allowlist.enforce = Some(false);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

/// `RUST_LOG` wins; otherwise `relaychat` logs at `level`.
fn log_subscriber<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relaychat={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .finish()
}

/// Load the config file with a provisional subscriber, since the final log
/// level may come from the file itself.
fn load_config(path: Option<&std::path::Path>, level: Option<&str>) -> Result<Config> {
    let bootstrap = log_subscriber(level.unwrap_or("info"), std::io::stderr);
    tracing::subscriber::with_default(bootstrap, || Config::load(path))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
    cli.apply(&mut config);

    log_subscriber(&config.log_level, std::io::stderr).init();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(config));
    // stdin reads cannot be cancelled; don't wait for the blocking reader
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(config: Config) -> Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cipher = crypto::select_cipher(config.cipher).context("No usable AEAD cipher")?;
    let identity = Identity::load_or_generate(&config.key_file()?)?;
    let allowlist = config.load_allowlist()?;
    let session_config = config.session_config(cipher);

    tracing::info!(
        pubkey = %identity.pubkey_hex(),
        session_id = %session_config.session_id,
        channel = %session_config.channel,
        mode = %session_config.mode,
        leader = session_config.leader,
        cipher = %cipher,
        relays = config.relays.len(),
        "Starting relaychat"
    );

    let engine = ProtocolEngine::new(identity, allowlist, session_config);
    let relays = RelayManager::new(&config.relays);
    let mut chat = ChatSession::new(engine, relays, StdoutConsole);

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, shutting down");
                interrupt.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    chat.run(session::spawn_stdin_reader(), shutdown).await?;
    tracing::info!("Session ended");
    Ok(())
}
