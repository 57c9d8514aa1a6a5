//! Notifications when the container file changes underneath an open session

use anyhow::Context;
use kw_core::KwResult;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Watch the container at `path`. The watcher must be kept alive for events
/// to flow. Saves by this process are reported too; compare fingerprints
/// with `Session::external_change` to tell them apart.
pub fn watch_container(
    path: &Path,
) -> KwResult<(RecommendedWatcher, mpsc::Receiver<ExternalChange>)> {
    let (tx, rx) = mpsc::channel(32);
    let target = path.to_path_buf();
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            let kind = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => ChangeKind::Modified,
                EventKind::Remove(_) => ChangeKind::Removed,
                _ => return,
            };
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if ours {
                let _ = tx.blocking_send(ExternalChange {
                    path: target.clone(),
                    kind,
                });
            }
        },
        Config::default(),
    )
    .context("creating file watcher")?;

    // Atomic saves replace the inode, so watch the directory.
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", dir.display()))?;

    info!(path = %path.display(), "watching container for external changes");
    Ok((watcher, rx))
}
