//! Daemon lifecycle: unlock, watch the container, serve the broker

use anyhow::{bail, Context, Result};
use kw_broker::{Broker, Consent, SharedSession};
use kw_core::config::KeywardConfig;
use kw_core::KwError;
use kw_crypto::CompositeKey;
use kw_db::format::{detect_file, FormatKind};
use kw_db::watch::watch_container;
use kw_db::{ChangeDecision, OpenOptions, SaveOutcome, Session};
use secrecy::SecretString;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RunOptions {
    pub no_password: bool,
    pub read_only: bool,
    pub interactive_consent: bool,
}

pub async fn run(config: KeywardConfig, options: RunOptions) -> Result<()> {
    info!("daemon starting");

    let path = config
        .database
        .path
        .clone()
        .context("no database configured: set [database] path or pass --database")?;
    if detect_file(&path).with_context(|| format!("reading {}", path.display()))?
        == FormatKind::Legacy
    {
        bail!(
            "{} is a legacy database; convert it first with `kw migrate`",
            path.display()
        );
    }

    let composite = composite_key(&config, options.no_password)?;
    let open_options = OpenOptions::from_config(&config.database).read_only(options.read_only);

    // ── Unlock (interruptible) ───────────────────────────────────────────
    let token = CancellationToken::new();
    let interrupt = tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        }
    });
    info!(path = %path.display(), "unlocking database");
    let opened = Session::open_cancellable(&path, composite, open_options, token).await;
    interrupt.abort();
    let session = match opened {
        Ok(session) => session,
        Err(KwError::Cancelled) => {
            info!("unlock cancelled");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    if !session.holds_lock() && !session.is_read_only() {
        warn!(path = %path.display(), "serving without the database lock");
    }
    let shared: SharedSession = Arc::new(RwLock::new(Some(session)));

    // ── Consent ──────────────────────────────────────────────────────────
    let timeout = Duration::from_secs(config.broker.consent_timeout_secs);
    let consent = if options.interactive_consent && std::io::stdin().is_terminal() {
        info!("consent prompts on this terminal");
        crate::consent::terminal(timeout)
    } else {
        warn!("no consent provider: new associations and ask-mode requests are refused");
        Consent::unavailable()
    };

    // ── External changes ─────────────────────────────────────────────────
    let _watcher = match watch_container(&path) {
        Ok((watcher, mut events)) => {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    debug!(kind = ?event.kind, "container event");
                    reload_if_changed(&shared).await;
                }
            });
            Some(watcher)
        }
        Err(e) => {
            warn!("container watcher failed to start: {e}");
            None
        }
    };

    notify_ready();

    let broker = Arc::new(Broker::new(shared.clone(), config.broker.clone(), consent));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    crate::server::serve(&config.broker.socket, broker, shutdown).await?;

    // Releases the lock file.
    shared.write().await.take();
    info!("daemon stopped");
    Ok(())
}

/// React to a watcher event on the container.
async fn reload_if_changed(shared: &SharedSession) {
    let mut guard = shared.write().await;
    if let Some(session) = guard.as_mut() {
        on_external_change(session);
    }
}

/// Pick up another device's save. A clean session reloads; one holding
/// unsaved changes merges the file in and saves, so neither side is lost.
fn on_external_change(session: &mut Session) {
    let path = session.path().display().to_string();
    match session.external_change() {
        Ok(false) => {}
        Ok(true) if session.is_dirty() => match session.save(&ChangeDecision::MergeThenSave) {
            Ok(SaveOutcome::Merged(report)) => warn!(
                %path,
                reconciled = report.reconciled(),
                "external change merged with unsaved changes"
            ),
            Ok(outcome) => info!(%path, ?outcome, "saved after external change"),
            Err(e) => warn!(%path, "could not merge external change, unsaved changes kept: {e}"),
        },
        Ok(true) => match session.reload() {
            Ok(()) => info!(%path, "reloaded after external change"),
            Err(e) => warn!(%path, "reload failed: {e}"),
        },
        Err(e) => debug!("change check failed: {e}"),
    }
}

/// Password from `KEYWARD_PASSWORD` or the terminal, plus the key file.
fn composite_key(config: &KeywardConfig, no_password: bool) -> Result<CompositeKey> {
    let mut key = CompositeKey::new();
    if !no_password {
        let password = match std::env::var("KEYWARD_PASSWORD") {
            Ok(password) => password,
            Err(_) => rpassword::prompt_password("Database password: ")
                .context("reading password")?,
        };
        key = key.with_password(&SecretString::from(password));
    }
    if let Some(key_file) = &config.database.key_file {
        key = key
            .with_key_file(key_file)
            .with_context(|| format!("reading key file {}", key_file.display()))?;
    }
    Ok(key)
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", Path::new(&socket));
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
