//! kw: keyward command-line interface
//!
//! Commands:
//!   create <path>                  - new empty database
//!   ls [group]                     - list groups and entries
//!   show <entry>                   - one entry (password/TOTP on request)
//!   extract                        - whole tree as plaintext JSON
//!   merge <source>                 - fold another copy into the database
//!   migrate <legacy> <output>      - convert a legacy file to the current format
//!   config show                    - display current configuration
//!
//! The password comes from KEYWARD_PASSWORD or an interactive prompt.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kw_core::config::KeywardConfig;
use kw_crypto::CompositeKey;
use kw_db::format::FormatKind;
use kw_db::{
    merge, ChangeDecision, Entry, LegacyDatabase, MergeChange, OpenOptions, OpenedDatabase,
    Session, Tree,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "kw",
    version,
    about = "keyward credential database tool",
    long_about = "kw: create, inspect, merge and migrate encrypted keyward databases"
)]
struct Cli {
    /// Path to keyward.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "KEYWARD_CONFIG",
        default_value = "~/.config/keyward/config.toml"
    )]
    config: PathBuf,

    /// Database file (default: [database] path from the config)
    #[arg(long, short = 'd', env = "KEYWARD_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Key file combined with the password
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// The database has no password component
    #[arg(long, global = true)]
    no_password: bool,

    /// Never write the database
    #[arg(long, global = true)]
    read_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KEYWARD_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "KEYWARD_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty database
    Create {
        /// Where to write it (must not exist)
        path: PathBuf,
        /// Database name (default: file stem)
        #[arg(long)]
        name: Option<String>,
    },

    /// List a group's subgroups and entries
    Ls {
        /// Group path such as `Work/Servers` (default: root)
        group: Option<String>,
        /// Descend into subgroups
        #[arg(long, short = 'r')]
        recursive: bool,
    },

    /// Show one entry by path (`Group/Title`) or uuid
    Show {
        entry: String,
        /// Print the password instead of masking it
        #[arg(long)]
        password: bool,
        /// Print the current TOTP code
        #[arg(long)]
        totp: bool,
    },

    /// Print the whole tree as plaintext JSON
    Extract,

    /// Merge another copy of the database into this one
    Merge {
        /// The other copy
        source: PathBuf,
        /// Unlock the source with the target's credentials
        #[arg(long)]
        same_credentials: bool,
        /// Key file for the source (ignored with --same-credentials)
        #[arg(long)]
        source_key_file: Option<PathBuf>,
        /// Report what would change without saving
        #[arg(long)]
        dry_run: bool,
    },

    /// Convert a legacy database into a new current-format file
    Migrate {
        legacy: PathBuf,
        output: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;

    match &cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Create { path, name } => cmd_create(&cli, &config, path, name.as_deref()),
        Commands::Ls { group, recursive } => {
            cmd_ls(&cli, &config, group.as_deref(), *recursive)
        }
        Commands::Show {
            entry,
            password,
            totp,
        } => cmd_show(&cli, &config, entry, *password, *totp),
        Commands::Extract => cmd_extract(&cli, &config),
        Commands::Merge {
            source,
            same_credentials,
            source_key_file,
            dry_run,
        } => cmd_merge(
            &cli,
            &config,
            source,
            *same_credentials,
            source_key_file.as_deref(),
            *dry_run,
        ),
        Commands::Migrate { legacy, output } => cmd_migrate(&cli, &config, legacy, output),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<KeywardConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(KeywardConfig::default())
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

// ── Unlocking ─────────────────────────────────────────────────────────────────

/// Resolve the database path: --database > config > error
fn database_path(cli: &Cli, config: &KeywardConfig) -> Result<PathBuf> {
    cli.database
        .clone()
        .or_else(|| config.database.path.clone())
        .map(|p| expand_tilde(&p))
        .context("no database given; use --database or set [database] path in config")
}

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(password) = std::env::var("KEYWARD_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(password))
}

fn read_new_password() -> Result<SecretString> {
    if let Ok(password) = std::env::var("KEYWARD_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let first = read_password("New database password: ")?;
    let second = read_password("Repeat password: ")?;
    if first.expose_secret() != second.expose_secret() {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn composite_key(
    no_password: bool,
    key_file: Option<&Path>,
    password: impl FnOnce() -> Result<SecretString>,
) -> Result<CompositeKey> {
    if no_password && key_file.is_none() {
        bail!("--no-password needs a key file (--key-file or [database] key_file)");
    }
    let mut key = CompositeKey::new();
    if !no_password {
        key = key.with_password(&password()?);
    }
    if let Some(path) = key_file {
        let path = expand_tilde(path);
        key = key
            .with_key_file(&path)
            .with_context(|| format!("reading key file {}", path.display()))?;
    }
    Ok(key)
}

fn key_file<'a>(cli: &'a Cli, config: &'a KeywardConfig) -> Option<&'a Path> {
    cli.key_file
        .as_deref()
        .or(config.database.key_file.as_deref())
}

fn unlock(cli: &Cli, config: &KeywardConfig) -> Result<CompositeKey> {
    composite_key(cli.no_password, key_file(cli, config), || {
        read_password("Database password: ")
    })
}

/// Open for reading; either format, never locked.
fn open_read_only(cli: &Cli, config: &KeywardConfig) -> Result<OpenedDatabase> {
    let path = database_path(cli, config)?;
    let key = unlock(cli, config)?;
    let options = OpenOptions::from_config(&config.database).read_only(true);
    OpenedDatabase::open(&path, key, options).with_context(|| format!("opening {}", path.display()))
}

// ── `kw config show` ──────────────────────────────────────────────────────────

fn cmd_config_show(config: &KeywardConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `kw create` ───────────────────────────────────────────────────────────────

fn cmd_create(cli: &Cli, config: &KeywardConfig, path: &Path, name: Option<&str>) -> Result<()> {
    let name = name
        .map(str::to_string)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "Keyward".into());
    let key = composite_key(cli.no_password, key_file(cli, config), read_new_password)?;
    let tree = Tree::new(&name, &config.history);
    Session::create(path, tree, key, config)
        .with_context(|| format!("creating {}", path.display()))?;
    println!("Created {} ({name})", path.display());
    Ok(())
}

// ── `kw ls` ───────────────────────────────────────────────────────────────────

fn cmd_ls(cli: &Cli, config: &KeywardConfig, group: Option<&str>, recursive: bool) -> Result<()> {
    let db = open_read_only(cli, config)?;
    let tree = db.tree();
    let start = match group {
        Some(path) => {
            tree.find_group_by_path(path)
                .with_context(|| format!("no group {path:?}"))?
                .uuid
        }
        None => tree.root_id(),
    };
    for line in listing(tree, start, recursive) {
        println!("{line}");
    }
    Ok(())
}

/// Subgroups end in `/`; nested levels are indented two spaces.
fn listing(tree: &Tree, group: Uuid, recursive: bool) -> Vec<String> {
    let mut lines = Vec::new();
    list_into(tree, group, recursive, 0, &mut lines);
    lines
}

fn list_into(tree: &Tree, group: Uuid, recursive: bool, depth: usize, out: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for child in tree.children(group) {
        out.push(format!("{indent}{}/", child.name));
        if recursive {
            list_into(tree, child.uuid, true, depth + 1, out);
        }
    }
    for entry in tree.entries_in(group) {
        out.push(format!("{indent}{}", entry.title()));
    }
}

// ── `kw show` ─────────────────────────────────────────────────────────────────

fn cmd_show(
    cli: &Cli,
    config: &KeywardConfig,
    query: &str,
    reveal: bool,
    totp: bool,
) -> Result<()> {
    let db = open_read_only(cli, config)?;
    let tree = db.tree();
    let entry = find_entry(tree, query).with_context(|| format!("no entry {query:?}"))?;

    for line in describe(entry, reveal) {
        println!("{line}");
    }
    if totp {
        let now = kw_core::time::now().timestamp();
        match kw_db::totp::entry_totp(entry, now).context("computing TOTP")? {
            Some(code) => println!("totp:     {} ({}s left)", code.code, code.seconds_remaining),
            None => bail!("entry {query:?} has no TOTP configured"),
        }
    }
    Ok(())
}

fn find_entry<'a>(tree: &'a Tree, query: &str) -> Option<&'a Entry> {
    if let Ok(id) = Uuid::parse_str(query) {
        if let Some(entry) = tree.entry(id) {
            return Some(entry);
        }
    }
    tree.find_entry_by_path(query)
}

const MASK: &str = "********";

fn describe(entry: &Entry, reveal: bool) -> Vec<String> {
    let mut lines = vec![
        format!("uuid:     {}", entry.uuid),
        format!("title:    {}", entry.title()),
        format!("username: {}", entry.username()),
        format!(
            "password: {}",
            if reveal { entry.password() } else { MASK }
        ),
        format!("url:      {}", entry.url()),
    ];
    if !entry.notes().is_empty() {
        lines.push(format!("notes:    {}", entry.notes()));
    }
    for (name, attr) in entry.custom_attributes() {
        let value = if attr.protected && !reveal {
            MASK
        } else {
            attr.value.as_str()
        };
        lines.push(format!("{name}: {value}"));
    }
    if !entry.attachments.is_empty() {
        let names: Vec<&str> = entry.attachments.keys().map(String::as_str).collect();
        lines.push(format!("files:    {}", names.join(", ")));
    }
    if entry.times.expires {
        lines.push(format!("expires:  {}", entry.times.expiry.to_rfc3339()));
    }
    lines.push(format!("history:  {} version(s)", entry.history.len()));
    lines
}

// ── `kw extract` ──────────────────────────────────────────────────────────────

fn cmd_extract(cli: &Cli, config: &KeywardConfig) -> Result<()> {
    let db = open_read_only(cli, config)?;
    let json = kw_db::export_json(db.tree()).context("rendering JSON")?;
    println!("{json}");
    Ok(())
}

// ── `kw merge` ────────────────────────────────────────────────────────────────

fn cmd_merge(
    cli: &Cli,
    config: &KeywardConfig,
    source_path: &Path,
    same_credentials: bool,
    source_key_file: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let target_path = database_path(cli, config)?;
    let key = unlock(cli, config)?;
    let options = OpenOptions::from_config(&config.database).read_only(cli.read_only || dry_run);
    let mut target = Session::open(&target_path, key, options)
        .with_context(|| format!("opening {}", target_path.display()))?;

    let source_key = if same_credentials {
        target.composite_key().clone()
    } else {
        composite_key(cli.no_password, source_key_file, || {
            read_password("Source database password: ")
        })?
    };
    let source = OpenedDatabase::open(
        source_path,
        source_key,
        OpenOptions::default().read_only(true),
    )
    .with_context(|| format!("opening {}", source_path.display()))?;

    let report = merge(target.tree_mut(), source.tree());
    for line in summarize(&report.changes) {
        println!("  {line}");
    }
    for conflict in &report.conflicts {
        println!(
            "  conflict on {} (both changed at {}); kept this copy, the other is in history",
            conflict.entry,
            conflict.modified.to_rfc3339()
        );
    }

    if report.is_empty() {
        println!("Already up to date");
        return Ok(());
    }
    if target.is_read_only() {
        println!("{} change(s) not saved (read-only)", report.reconciled());
        return Ok(());
    }
    target
        .save(&ChangeDecision::MergeThenSave)
        .with_context(|| format!("saving {}", target_path.display()))?;
    println!(
        "Merged {} change(s) into {}",
        report.reconciled(),
        target_path.display()
    );
    Ok(())
}

/// Counts per kind of change, in a fixed order.
fn summarize(changes: &[MergeChange]) -> Vec<String> {
    let labels = [
        "groups added",
        "groups updated",
        "groups moved",
        "groups deleted",
        "entries added",
        "entries updated",
        "entries moved",
        "entries deleted",
        "histories merged",
        "attachments copied",
        "icons copied",
        "custom data copied",
    ];
    let mut counts = [0usize; 12];
    for change in changes {
        let slot = match change {
            MergeChange::GroupAdded(_) => 0,
            MergeChange::GroupUpdated(_) => 1,
            MergeChange::GroupRelocated(_) => 2,
            MergeChange::GroupDeleted(_) => 3,
            MergeChange::EntryAdded(_) => 4,
            MergeChange::EntryUpdated(_) => 5,
            MergeChange::EntryRelocated(_) => 6,
            MergeChange::EntryDeleted(_) => 7,
            MergeChange::HistoryMerged(_) => 8,
            MergeChange::BinaryCopied(_) => 9,
            MergeChange::CustomIconCopied(_) => 10,
            MergeChange::CustomDataCopied(_) => 11,
        };
        counts[slot] += 1;
    }
    labels
        .iter()
        .zip(counts)
        .filter(|(_, n)| *n > 0)
        .map(|(label, n)| format!("{n} {label}"))
        .collect()
}

// ── `kw migrate` ──────────────────────────────────────────────────────────────

fn cmd_migrate(cli: &Cli, config: &KeywardConfig, legacy: &Path, output: &Path) -> Result<()> {
    let kind = kw_db::format::detect_file(legacy)
        .with_context(|| format!("reading {}", legacy.display()))?;
    if kind != FormatKind::Legacy {
        bail!("{} is already in the current format", legacy.display());
    }
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let key = unlock(cli, config)?;
    let db = LegacyDatabase::open_file(legacy, &key)
        .with_context(|| format!("opening {}", legacy.display()))?;
    let entries = db.tree().entry_count();
    let tree = db.migrate(&config.history);
    Session::create(output, tree, key, config)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "Migrated {} entries from {} to {}",
        entries,
        legacy.display(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kw_core::config::HistoryConfig;
    use kw_db::Group;

    fn sample() -> Tree {
        let mut tree = Tree::new("Vault", &HistoryConfig::default());
        let root = tree.root_id();
        let work = tree.add_group(root, Group::new("Work")).unwrap();
        tree.add_entry(work, Entry::with_login("VPN", "bob", "s3cret", "https://vpn"))
            .unwrap();
        tree.add_entry(root, Entry::with_login("Bank", "bob", "b4nk", "https://bank"))
            .unwrap();
        tree
    }

    #[test]
    fn test_listing() {
        let tree = sample();
        assert_eq!(listing(&tree, tree.root_id(), false), ["Work/", "Bank"]);
        assert_eq!(
            listing(&tree, tree.root_id(), true),
            ["Work/", "  VPN", "Bank"]
        );
    }

    #[test]
    fn test_describe_masks_unless_revealed() {
        let tree = sample();
        let entry = find_entry(&tree, "Work/VPN").unwrap();
        let masked = describe(entry, false).join("\n");
        assert!(!masked.contains("s3cret"));
        assert!(masked.contains(MASK));
        assert!(describe(entry, true).join("\n").contains("s3cret"));

        let by_id = find_entry(&tree, &entry.uuid.to_string()).unwrap();
        assert_eq!(by_id.uuid, entry.uuid);
        assert!(find_entry(&tree, "Work/Nope").is_none());
    }

    #[test]
    fn test_summarize_counts() {
        let id = Uuid::new_v4();
        let lines = summarize(&[
            MergeChange::EntryAdded(id),
            MergeChange::EntryAdded(Uuid::new_v4()),
            MergeChange::GroupDeleted(id),
        ]);
        assert_eq!(lines, ["1 groups deleted", "2 entries added"]);
    }

    #[test]
    fn test_no_password_needs_key_file() {
        assert!(composite_key(true, None, || unreachable!()).is_err());
    }
}
