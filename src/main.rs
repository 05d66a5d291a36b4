//! Sealpost CLI entry point.
//!
//! `start` runs the dispatch loop until interrupted. The remaining
//! subcommands are one-shot helpers for setup and troubleshooting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use sealpost::audit::{AuditKind, AuditLog};
use sealpost::codec;
use sealpost::config::{load_config_or_default, runtime_paths, Config, RuntimePaths};
use sealpost::credentials::{
    enforce_private_file_permissions, load_credentials_if_present, Credentials,
};
use sealpost::dispatch::status::{read_status_file, run_status_reporter};
use sealpost::dispatch::{deliver_once, DispatchHandle, DispatchLoop};
use sealpost::logging;
use sealpost::ring::MessageRing;
use sealpost::target::{heuristic_thread_id, Target, TargetDescriptor, TargetResolver};
use sealpost::transport::graph::GraphClient;
use sealpost::transport::{IdentityLookup, NoLookup};
use sealpost::vault::{CryptoKey, KeyVault};

/// Sealpost: encrypted message rotation to a Messenger recipient.
#[derive(Parser)]
#[command(name = "sealpost", version, about)]
struct Cli {
    /// Runtime directory (defaults to `$SEALPOST_HOME`, then `~/.sealpost`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the runtime directory with template files.
    Init,
    /// Run the dispatch loop until interrupted.
    Start,
    /// Seal and deliver one message, then exit.
    SendTest {
        /// Message to send (defaults to the first configured message).
        message: Option<String>,
    },
    /// Classify a target and print what it resolves to.
    Resolve {
        /// Numeric id, thread URL, or profile URL.
        raw: String,
    },
    /// Encrypt text and print the envelope.
    Seal {
        /// Plaintext to encrypt.
        text: String,
        /// Print the full framed message body instead of the bare envelope.
        #[arg(long)]
        framed: bool,
    },
    /// Decrypt an envelope or framed body.
    Open {
        /// Envelope text (read from stdin when omitted).
        text: Option<String>,
    },
    /// Create or load the configured key and print its fingerprint.
    Keygen,
    /// Check the access token against the Graph API.
    VerifyToken,
    /// Print the last status snapshot written by `start`.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = runtime_paths(cli.home.as_deref())?;

    if !matches!(cli.command, Command::Start) {
        logging::init_cli()?;
    }

    match cli.command {
        Command::Init => handle_init(&paths),
        Command::Start => handle_start(&paths).await,
        Command::SendTest { message } => handle_send_test(&paths, message).await,
        Command::Resolve { raw } => handle_resolve(&paths, &raw).await,
        Command::Seal { text, framed } => handle_seal(&paths, &text, framed),
        Command::Open { text } => handle_open(&paths, text),
        Command::Keygen => handle_keygen(&paths),
        Command::VerifyToken => handle_verify_token(&paths).await,
        Command::Status => handle_status(&paths).await,
    }
}

const CONFIG_TEMPLATE: &str = r#"# Sealpost configuration.

[target]
# Numeric user id, numeric thread id, e2ee thread URL, or profile URL.
raw = ""

[messages]
file = "messages.txt"

[schedule]
interval_secs = 120
backoff_secs = 60
"#;

const ENV_TEMPLATE: &str = "\
# Sealpost credentials. Keep this file private (0600).
SEALPOST_ACCESS_TOKEN=
# Optional: derive the encryption key from a passphrase.
SEALPOST_PASSPHRASE=
";

const MESSAGES_TEMPLATE: &str = "\
# One message per line. Blank lines and lines starting with '#' are ignored.
Hello from sealpost.
";

/// Create the runtime layout, leaving existing files untouched.
fn handle_init(paths: &RuntimePaths) -> anyhow::Result<()> {
    for dir in [&paths.root, &paths.keys_dir, &paths.logs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let messages_path = paths.root.join("messages.txt");
    for (path, template) in [
        (&paths.config_toml, CONFIG_TEMPLATE),
        (&paths.env_file, ENV_TEMPLATE),
        (&messages_path, MESSAGES_TEMPLATE),
    ] {
        if path.exists() {
            println!("exists   {}", path.display());
            continue;
        }
        std::fs::write(path, template)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("created  {}", path.display());
    }
    enforce_private_file_permissions(&paths.env_file)?;

    println!("\nEdit {} and set [target] raw.", paths.config_toml.display());
    Ok(())
}

/// Run the dispatch loop with status reporting and signal handling.
async fn handle_start(paths: &RuntimePaths) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&paths.logs_dir)?;

    let config = load_config(paths)?;
    config.validate()?;
    let credentials = load_credentials_if_present(&paths.env_file)?;

    let key = load_key(paths, &config, &credentials)?;
    let client = Arc::new(GraphClient::new(
        &config.graph,
        credentials.access_token()?,
    ));

    let target = resolver(&config, Arc::clone(&client) as Arc<dyn IdentityLookup>)
        .resolve(&config.target.raw)
        .await;
    log_target(&target);

    let ring = MessageRing::new(config.message_items(&paths.root)?)?;
    let audit = Arc::new(AuditLog::open(&paths.audit_log, &paths.audit_jsonl)?);

    let (dispatch, handle) = DispatchLoop::new(
        config.dispatch_settings(),
        key,
        target,
        ring,
        client,
        audit,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(run_status_reporter(
        handle.clone(),
        paths.status_json.clone(),
        config.status_interval(),
        shutdown_rx,
    ));
    let signals = tokio::spawn(watch_signals(handle.clone(), paths.clone()));

    let result = dispatch.run().await;

    signals.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = reporter.await {
        warn!(error = %e, "status reporter task failed");
    }

    let summary = result?;
    println!(
        "stopped: sent={} failed={} cycles={}",
        summary.sent, summary.failed, summary.cycles
    );
    Ok(())
}

/// Deliver a single sealed message.
async fn handle_send_test(paths: &RuntimePaths, message: Option<String>) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    config.validate()?;
    let credentials = load_credentials_if_present(&paths.env_file)?;

    let message = match message {
        Some(m) if !m.trim().is_empty() => m,
        _ => config
            .message_items(&paths.root)?
            .into_iter()
            .next()
            .context("no message to send")?,
    };

    let key = load_key(paths, &config, &credentials)?;
    let client = Arc::new(GraphClient::new(
        &config.graph,
        credentials.access_token()?,
    ));
    let target = resolver(&config, Arc::clone(&client) as Arc<dyn IdentityLookup>)
        .resolve(&config.target.raw)
        .await;
    let audit = AuditLog::open(&paths.audit_log, &paths.audit_jsonl)?;

    deliver_once(
        client.as_ref(),
        &key,
        &target,
        &message,
        &config.dispatch_settings(),
        &audit,
    )
    .await?;

    println!("delivered to {}", target.canonical_value().unwrap_or("?"));
    Ok(())
}

/// Print the classification of a target.
async fn handle_resolve(paths: &RuntimePaths, raw: &str) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    let credentials = load_credentials_if_present(&paths.env_file)?;

    let lookup: Arc<dyn IdentityLookup> = match credentials.access_token() {
        Ok(token) => Arc::new(GraphClient::new(&config.graph, token)),
        Err(_) => Arc::new(NoLookup),
    };
    let target = resolver(&config, lookup).resolve(raw).await;

    println!("kind:      {}", target.kind());
    match target.target() {
        Target::UserId(id) => {
            println!("value:     {id}");
            println!("thread id: {} (unverified guess)", heuristic_thread_id(id));
        }
        Target::ThreadId(id) => println!("value:     {id}"),
        Target::UnresolvedUrl { username } => println!("username:  {username}"),
        Target::Unknown => {}
    }
    Ok(())
}

/// Encrypt `text` under the configured key.
fn handle_seal(paths: &RuntimePaths, text: &str, framed: bool) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    let credentials = load_credentials_if_present(&paths.env_file)?;
    let key = load_key(paths, &config, &credentials)?;

    if framed {
        let (_, body) =
            codec::seal_framed(text, &key, &config.framing.header, &chrono::Local::now())?;
        println!("{body}");
    } else {
        println!("{}", codec::seal(text, &key)?);
    }
    Ok(())
}

/// Decrypt an envelope or framed body under the configured key.
fn handle_open(paths: &RuntimePaths, text: Option<String>) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    let credentials = load_credentials_if_present(&paths.env_file)?;
    let key = load_key(paths, &config, &credentials)?;

    let input = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };

    let plaintext = codec::open(&input, &key)?;

    let audit = AuditLog::open(&paths.audit_log, &paths.audit_jsonl)?;
    audit.record(AuditKind::Decrypted, "local", &plaintext, input.trim(), "opened via cli");

    println!("{plaintext}");
    Ok(())
}

/// Create or load the key and print where it lives.
fn handle_keygen(paths: &RuntimePaths) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    let credentials = load_credentials_if_present(&paths.env_file)?;
    let key = load_key(paths, &config, &credentials)?;

    let vault = KeyVault::new(&paths.keys_dir);
    println!("label:       {}", config.vault.label);
    println!("fingerprint: {}", key.fingerprint());
    println!("key file:    {}", vault.key_path(&config.vault.label).display());
    Ok(())
}

/// Check the access token with the Graph API.
async fn handle_verify_token(paths: &RuntimePaths) -> anyhow::Result<()> {
    let config = load_config(paths)?;
    let credentials = load_credentials_if_present(&paths.env_file)?;
    let client = GraphClient::new(&config.graph, credentials.access_token()?);

    let name = client
        .verify_token()
        .await
        .context("access token rejected")?;
    println!("token valid for {name}");
    Ok(())
}

/// Print the last status snapshot.
async fn handle_status(paths: &RuntimePaths) -> anyhow::Result<()> {
    let report = read_status_file(&paths.status_json)
        .await
        .context("no status available; is `sealpost start` running?")?;
    let state = &report.state;

    println!("updated:  {} (pid {})", report.updated_at, report.pid);
    println!("phase:    {}", state.phase);
    println!("running:  {}", state.running);
    println!("target:   {}", state.target);
    println!(
        "sent:     {}  failed: {}  cycles: {}",
        state.sent_count, state.failed_count, state.cycle_count
    );
    println!("cursor:   {}/{}", state.cursor, state.ring_len);
    if let Some(error) = &state.last_error {
        println!("error:    {error}");
    }
    Ok(())
}

/// Load `config.toml` (or defaults) and apply environment overrides.
fn load_config(paths: &RuntimePaths) -> anyhow::Result<Config> {
    let mut config = load_config_or_default(&paths.config_toml)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

fn load_key(
    paths: &RuntimePaths,
    config: &Config,
    credentials: &Credentials,
) -> anyhow::Result<CryptoKey> {
    KeyVault::new(&paths.keys_dir)
        .derive_or_load(&config.vault.label, credentials.passphrase())
        .context("failed to load encryption key")
}

fn resolver(config: &Config, lookup: Arc<dyn IdentityLookup>) -> TargetResolver {
    TargetResolver::new(config.thresholds(), lookup, config.lookup_timeout())
}

fn log_target(target: &TargetDescriptor) {
    match target.target() {
        Target::UserId(id) => info!(
            kind = %target.kind(),
            value = %id,
            thread_hint = %heuristic_thread_id(id),
            "target resolved"
        ),
        _ => info!(
            kind = %target.kind(),
            value = target.canonical_value().unwrap_or_default(),
            "target resolved"
        ),
    }
}

/// Stop on Ctrl-C or SIGTERM; reload messages on SIGHUP.
#[cfg(unix)]
async fn watch_signals(handle: DispatchHandle, paths: RuntimePaths) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(t), Ok(h)) => (t, h),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to install signal handlers, using ctrl-c only");
                wait_for_interrupt(&handle).await;
                return;
            }
        };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                handle.stop();
                return;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                handle.stop();
                return;
            }
            _ = hangup.recv() => reload_messages(&handle, &paths),
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals(handle: DispatchHandle, _paths: RuntimePaths) {
    wait_for_interrupt(&handle).await;
}

async fn wait_for_interrupt(handle: &DispatchHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => warn!(error = %e, "ctrl-c handler failed, stopping"),
    }
    handle.stop();
}

#[cfg(unix)]
fn reload_messages(handle: &DispatchHandle, paths: &RuntimePaths) {
    let items = load_config(paths).and_then(|config| config.message_items(&paths.root));
    match items {
        Ok(items) => {
            let count = items.len();
            match handle.reload(items) {
                Ok(()) => info!(messages = count, "message reload queued"),
                Err(e) => warn!(error = %e, "message reload rejected"),
            }
        }
        Err(e) => warn!(error = %e, "message reload failed, keeping current messages"),
    }
}
