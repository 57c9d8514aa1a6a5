//! kwd: keyward daemon
//!
//! Usage:
//!   kwd [--config ~/.config/keyward/config.toml] [--database vault.kwdb]
//!
//! Unlocks the database once, keeps it open, and serves the access broker
//! on a Unix socket until interrupted.

mod consent;
mod daemon;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kwd", version, about = "keyward credential daemon")]
struct Cli {
    /// Path to keyward.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "KEYWARD_CONFIG",
        default_value = "~/.config/keyward/config.toml"
    )]
    config: PathBuf,

    /// Database to open (overrides [database] path)
    #[arg(long, short = 'd', env = "KEYWARD_DATABASE")]
    database: Option<PathBuf>,

    /// Key file combined with the password (overrides [database] key_file)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// The database has no password component
    #[arg(long)]
    no_password: bool,

    /// Serve without ever writing the database
    #[arg(long)]
    read_only: bool,

    /// Never prompt on the terminal; new associations are refused
    #[arg(long)]
    no_consent: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KEYWARD_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "KEYWARD_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (mut config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "kwd starting"
    );
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    } else if config.config_file_mode_check {
        check_config_mode(&config_path);
    }

    if let Some(db) = cli.database {
        config.database.path = Some(db);
    }
    if let Some(key_file) = cli.key_file {
        config.database.key_file = Some(key_file);
    }
    config.database.path = config.database.path.as_deref().map(expand_tilde);
    config.database.key_file = config.database.key_file.as_deref().map(expand_tilde);
    config.broker.socket = expand_tilde(&config.broker.socket);

    daemon::run(
        config,
        daemon::RunOptions {
            no_password: cli.no_password,
            read_only: cli.read_only,
            interactive_consent: !cli.no_consent,
        },
    )
    .await
}

async fn load_config(path: &Path) -> Result<(kw_core::config::KeywardConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((kw_core::config::KeywardConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[cfg(unix)]
fn check_config_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o004 != 0 {
            warn!(
                path = %path.display(),
                "config file is world-readable; consider chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_mode(_path: &Path) {}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}
