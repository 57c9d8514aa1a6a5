//! Container files on disk: advisory lock, atomic replace, backups, fingerprints

use chrono::{DateTime, Utc};
use fs2::FileExt;
use kw_core::{KwError, KwResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockPolicy {
    /// Fail with `Locked` if another process holds the lock
    #[default]
    Respect,
    /// Open anyway without holding the lock
    Override,
}

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".into()),
            user: whoami::username(),
            acquired_at: kw_core::time::now(),
        }
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} (pid {}) since {}",
            self.user,
            self.host,
            self.pid,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Exclusive advisory lock on `<dir>/.<file name>.lock`, released on drop.
/// The lock file is never unlinked, so every contender locks the same inode.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    pub fn lock_path(database: &Path) -> PathBuf {
        let name = database
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database".into());
        database.with_file_name(format!(".{name}.lock"))
    }

    pub fn acquire(database: &Path) -> KwResult<Self> {
        let path = Self::lock_path(database);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                let owner = read_owner(&mut file)
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "another process".into());
                return Err(KwError::Locked { owner });
            }
            return Err(e.into());
        }

        let owner = LockOwner::current();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&serde_json::to_vec(&owner)?)?;
        file.sync_all()?;
        debug!(lock = %path.display(), "database lock acquired");
        Ok(Self { path, file })
    }

    /// Who holds the lock on `database`, if anyone wrote it down.
    pub fn owner(database: &Path) -> Option<LockOwner> {
        let mut file = File::open(Self::lock_path(database)).ok()?;
        read_owner(&mut file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_owner(file: &mut File) -> Option<LockOwner> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(lock = %self.path.display(), error = %e, "could not clear lock owner");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Replace `path` with `data` via a temp file in the same directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> KwResult<()> {
    let dir = parent_dir(path);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| KwError::Io(e.error))?;
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    debug!(path = %path.display(), bytes = data.len(), "container written");
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `<dir>/<stem>.old.kwdb`
pub fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database".into());
    path.with_file_name(format!("{stem}.old.kwdb"))
}

/// Copy the current container aside before it is replaced.
pub fn backup(path: &Path) -> KwResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let target = backup_path(path);
    let data = std::fs::read(path)?;
    atomic_write(&target, &data)?;
    Ok(Some(target))
}

/// What the session last saw on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub hash: blake3::Hash,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    pub fn of_bytes(data: &[u8], modified: Option<SystemTime>) -> Self {
        Self {
            hash: blake3::hash(data),
            len: data.len() as u64,
            modified,
        }
    }

    /// `None` if the file does not exist.
    pub fn read(path: &Path) -> KwResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(data) => {
                let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                Ok(Some(Self::of_bytes(&data, modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
