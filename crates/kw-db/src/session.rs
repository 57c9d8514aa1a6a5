//! An open, writable database: tree + key + file

use kw_core::config::{DatabaseConfig, KeywardConfig};
use kw_core::{KwError, KwResult};
use kw_crypto::{derive, derive_cancellable, CipherId, CompositeKey, Compression, KdfParams, TransformedKey};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::file::{self, FileLock, FileStamp, LockPolicy};
use crate::format::current::{parse_container, write_container, RawContainer};
use crate::format::header::ContainerHeader;
use crate::merge::{merge, MergeReport};
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub read_only: bool,
    pub lock: LockPolicy,
    pub backup_on_save: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            lock: LockPolicy::Respect,
            backup_on_save: true,
        }
    }
}

impl OpenOptions {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            read_only: false,
            lock: if config.lock_override {
                LockPolicy::Override
            } else {
                LockPolicy::Respect
            },
            backup_on_save: config.backup_on_save,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// What to do when the container changed on disk since it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Discard in-memory changes and load the file
    Reload,
    /// Merge the file into the session, then save
    MergeThenSave,
    /// Replace the file with the session's tree
    Overwrite,
    /// Leave both alone
    Cancel,
}

/// Decides how a save proceeds after an external change. Usually backed by
/// a prompt.
pub trait ExternalChangePolicy {
    fn decide(&self, path: &Path) -> ChangeDecision;
}

/// A fixed answer.
impl ExternalChangePolicy for ChangeDecision {
    fn decide(&self, _path: &Path) -> ChangeDecision {
        *self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Merged(MergeReport),
    Reloaded,
    Cancelled,
}

/// The tree as it stood before a change, for undoing that change.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    tree: Tree,
    dirty: bool,
}

#[derive(Debug)]
pub struct Session {
    tree: Tree,
    header: ContainerHeader,
    composite: CompositeKey,
    key: TransformedKey,
    path: PathBuf,
    lock: Option<FileLock>,
    read_only: bool,
    backup_on_save: bool,
    stamp: Option<FileStamp>,
    /// In-memory changes not yet written
    dirty: bool,
}

impl Session {
    /// Write `tree` to a new container at `path` using the configured cipher,
    /// compression and KDF.
    pub fn create(
        path: &Path,
        tree: Tree,
        composite: CompositeKey,
        config: &KeywardConfig,
    ) -> KwResult<Self> {
        if path.exists() {
            return Err(KwError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        let header = ContainerHeader::new(
            CipherId::from_name(&config.database.cipher)?,
            Compression::from_name(&config.database.compression)?,
            KdfParams::from_config(&config.kdf)?,
        );
        let key = derive(&composite, &header.kdf, &header.master_seed)?;
        let options = OpenOptions::from_config(&config.database);
        let lock = take_lock(path, &options)?;

        let mut session = Self {
            tree,
            header,
            composite,
            key,
            path: path.to_path_buf(),
            lock,
            read_only: false,
            backup_on_save: options.backup_on_save,
            stamp: None,
            dirty: true,
        };
        session.write()?;
        info!(
            path = %path.display(),
            kdf = session.header.kdf.name(),
            cipher = session.header.cipher.name(),
            "database created"
        );
        Ok(session)
    }

    pub fn open(path: &Path, composite: CompositeKey, options: OpenOptions) -> KwResult<Self> {
        let lock = take_lock(path, &options)?;
        let data = std::fs::read(path)?;
        let raw = parse_container(&data)?;
        let key = derive(&composite, &raw.header().kdf, &raw.header().master_seed)?;
        Self::finish_open(path, &data, raw, composite, key, lock, options)
    }

    /// Like `open`, with key derivation on the blocking pool. Cancelling
    /// `token` abandons the derivation and returns `Cancelled`.
    pub async fn open_cancellable(
        path: &Path,
        composite: CompositeKey,
        options: OpenOptions,
        token: CancellationToken,
    ) -> KwResult<Self> {
        let lock = take_lock(path, &options)?;
        let data = tokio::fs::read(path).await?;
        let raw = parse_container(&data)?;
        let key = derive_cancellable(
            composite.clone(),
            raw.header().kdf.clone(),
            raw.header().master_seed.to_vec(),
            token,
        )
        .await?;
        Self::finish_open(path, &data, raw, composite, key, lock, options)
    }

    fn finish_open(
        path: &Path,
        data: &[u8],
        raw: RawContainer,
        composite: CompositeKey,
        key: TransformedKey,
        lock: Option<FileLock>,
        options: OpenOptions,
    ) -> KwResult<Self> {
        let tree = raw.decrypt(&key)?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        info!(
            path = %path.display(),
            entries = tree.entry_count(),
            read_only = options.read_only,
            "database opened"
        );
        Ok(Self {
            tree,
            header: raw.header().clone(),
            composite,
            key,
            path: path.to_path_buf(),
            lock,
            read_only: options.read_only,
            backup_on_save: options.backup_on_save,
            stamp: Some(FileStamp::of_bytes(data, modified)),
            dirty: false,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable access marks the session as having unsaved changes.
    pub fn tree_mut(&mut self) -> &mut Tree {
        self.dirty = true;
        &mut self.tree
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tree: self.tree.clone(),
            dirty: self.dirty,
        }
    }

    /// Put the tree back as it was at `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.tree = checkpoint.tree;
        self.dirty = checkpoint.dirty;
        debug!(path = %self.path.display(), "in-memory changes rolled back");
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn composite_key(&self) -> &CompositeKey {
        &self.composite
    }

    // ── Saving ───────────────────────────────────────────────────────────────

    /// Whether the file on disk differs from what this session last loaded
    /// or saved.
    pub fn external_change(&self) -> KwResult<bool> {
        let current = FileStamp::read(&self.path)?;
        Ok(match (&self.stamp, &current) {
            (Some(seen), Some(now)) => seen.hash != now.hash,
            (None, None) => false,
            _ => true,
        })
    }

    /// Save in place. If the file changed underneath, `policy` decides.
    pub fn save(&mut self, policy: &dyn ExternalChangePolicy) -> KwResult<SaveOutcome> {
        if self.read_only {
            return Err(KwError::ReadOnly);
        }
        if self.external_change()? {
            let decision = policy.decide(&self.path);
            warn!(path = %self.path.display(), ?decision, "container changed on disk");
            match decision {
                ChangeDecision::Reload => {
                    self.reload()?;
                    return Ok(SaveOutcome::Reloaded);
                }
                ChangeDecision::MergeThenSave => {
                    let (disk, _) = self.load_from_disk()?;
                    let report = merge(&mut self.tree, &disk);
                    self.write()?;
                    return Ok(SaveOutcome::Merged(report));
                }
                ChangeDecision::Overwrite => {}
                ChangeDecision::Cancel => return Ok(SaveOutcome::Cancelled),
            }
        }
        self.write()?;
        Ok(SaveOutcome::Saved)
    }

    /// Write to a new path, which becomes the session's file.
    pub fn save_as(&mut self, path: &Path) -> KwResult<()> {
        let options = OpenOptions {
            read_only: false,
            lock: LockPolicy::Respect,
            backup_on_save: self.backup_on_save,
        };
        let lock = take_lock(path, &options)?;
        let old_path = std::mem::replace(&mut self.path, path.to_path_buf());
        let old_lock = std::mem::replace(&mut self.lock, lock);
        if let Err(e) = self.write() {
            self.path = old_path;
            self.lock = old_lock;
            return Err(e);
        }
        self.read_only = false;
        drop(old_lock);
        info!(from = %old_path.display(), to = %path.display(), "database saved under new name");
        Ok(())
    }

    /// Discard the in-memory tree and load the file again.
    pub fn reload(&mut self) -> KwResult<()> {
        let (tree, stamp) = self.load_from_disk()?;
        self.tree = tree;
        self.stamp = Some(stamp);
        self.dirty = false;
        info!(path = %self.path.display(), "database reloaded");
        Ok(())
    }

    /// Replace the key material. Takes effect on the next save.
    pub fn change_key(&mut self, composite: CompositeKey) -> KwResult<()> {
        let mut kdf = self.header.kdf.clone();
        kdf.randomize_seed();
        let key = derive(&composite, &kdf, &self.header.master_seed)?;
        self.header.kdf = kdf;
        self.composite = composite;
        self.key = key;
        self.dirty = true;
        Ok(())
    }

    fn load_from_disk(&mut self) -> KwResult<(Tree, FileStamp)> {
        let data = std::fs::read(&self.path)?;
        let raw = parse_container(&data)?;
        let header = raw.header();
        let reuse = header.kdf == self.header.kdf && !self.composite.has_challenge_response();
        let tree = if reuse {
            raw.decrypt(&self.key)?
        } else {
            let key = derive(&self.composite, &header.kdf, &header.master_seed)?;
            let tree = raw.decrypt(&key)?;
            self.key = key;
            tree
        };
        self.header = raw.header().clone();
        let modified = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        Ok((tree, FileStamp::of_bytes(&data, modified)))
    }

    fn write(&mut self) -> KwResult<()> {
        let pruned = self.tree.prune_binaries();
        if pruned > 0 {
            debug!(pruned, "unreferenced attachments dropped");
        }
        self.header.refresh_seeds();
        if self.composite.has_challenge_response() {
            // the challenge is the master seed, which just changed
            self.key = derive(&self.composite, &self.header.kdf, &self.header.master_seed)?;
        }
        let bytes = write_container(&self.header, &self.key, &self.tree)?;
        if self.backup_on_save {
            if let Some(backup) = file::backup(&self.path)? {
                debug!(backup = %backup.display(), "previous container kept");
            }
        }
        file::atomic_write(&self.path, &bytes)?;
        let modified = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        self.stamp = Some(FileStamp::of_bytes(&bytes, modified));
        self.dirty = false;
        info!(
            path = %self.path.display(),
            entries = self.tree.entry_count(),
            bytes = bytes.len(),
            "database saved"
        );
        Ok(())
    }
}

fn take_lock(path: &Path, options: &OpenOptions) -> KwResult<Option<FileLock>> {
    if options.read_only {
        return Ok(None);
    }
    match FileLock::acquire(path) {
        Ok(lock) => Ok(Some(lock)),
        Err(KwError::Locked { owner }) if options.lock == LockPolicy::Override => {
            warn!(path = %path.display(), %owner, "opening despite lock held elsewhere");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, PASSWORD};
    use kw_core::config::HistoryConfig;
    use kw_crypto::challenge::HmacSha1Responder;
    use secrecy::SecretString;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fast_config() -> KeywardConfig {
        let mut config = KeywardConfig::default();
        config.kdf.algorithm = "aes".into();
        config.kdf.aes_rounds = 100;
        config
    }

    fn key(pw: &str) -> CompositeKey {
        CompositeKey::new().with_password(&SecretString::from(pw))
    }

    fn create(dir: &TempDir) -> (PathBuf, Session) {
        let path = dir.path().join("vault.kwdb");
        let mut tree = Tree::new("Vault", &HistoryConfig::default());
        let root = tree.root_id();
        tree.add_entry(root, Entry::with_login("Mail", "me", "p1", "https://mail"))
            .unwrap();
        let session = Session::create(&path, tree, key("pw"), &fast_config()).unwrap();
        (path, session)
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let (path, session) = create(&dir);
        drop(session);
        let tree = Tree::new("Other", &HistoryConfig::default());
        assert!(Session::create(&path, tree, key("pw"), &fast_config()).is_err());
    }

    #[test]
    fn test_read_only_refuses_save_and_skips_lock() {
        let dir = TempDir::new().unwrap();
        let (path, _writer) = create(&dir);
        let mut reader =
            Session::open(&path, key("pw"), OpenOptions::default().read_only(true)).unwrap();
        assert!(!reader.holds_lock());
        assert!(matches!(
            reader.save(&ChangeDecision::Overwrite),
            Err(KwError::ReadOnly)
        ));
    }

    #[test]
    fn test_lock_respected_and_overridden() {
        let dir = TempDir::new().unwrap();
        let (path, _writer) = create(&dir);
        assert!(matches!(
            Session::open(&path, key("pw"), OpenOptions::default()),
            Err(KwError::Locked { .. })
        ));
        let options = OpenOptions {
            lock: LockPolicy::Override,
            ..OpenOptions::default()
        };
        let second = Session::open(&path, key("pw"), options).unwrap();
        assert!(!second.holds_lock());
    }

    #[test]
    fn test_save_refreshes_seeds_and_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let (path, mut session) = create(&dir);
        let before = session.header().clone();
        session.save(&ChangeDecision::Cancel).unwrap();
        assert_ne!(session.header().master_seed, before.master_seed);
        assert_ne!(session.header().stream_start, before.stream_start);
        assert_eq!(session.header().kdf, before.kdf);
        assert!(file::backup_path(&path).exists());
    }

    #[test]
    fn test_external_change_consults_policy() {
        let dir = TempDir::new().unwrap();
        let (path, mut ours) = create(&dir);
        let options = OpenOptions {
            lock: LockPolicy::Override,
            ..OpenOptions::default()
        };
        let mut theirs = Session::open(&path, key("pw"), options).unwrap();
        let root = theirs.tree().root_id();
        theirs
            .tree_mut()
            .add_entry(root, Entry::with_login("Bank", "", "b", ""))
            .unwrap();
        theirs.save(&ChangeDecision::Overwrite).unwrap();

        assert!(ours.external_change().unwrap());
        assert_eq!(
            ours.save(&ChangeDecision::Cancel).unwrap(),
            SaveOutcome::Cancelled
        );

        let id = ours.tree().iter_entries().next().unwrap().uuid;
        ours.tree_mut()
            .edit_entry(id, |e| e.set(PASSWORD, "p2", true))
            .unwrap();
        match ours.save(&ChangeDecision::MergeThenSave).unwrap() {
            SaveOutcome::Merged(report) => assert!(report.reconciled() > 0),
            other => panic!("expected merge, got {other:?}"),
        }
        assert!(!ours.external_change().unwrap());
        assert_eq!(ours.tree().entry_count(), 2);
        assert_eq!(ours.tree().entry(id).unwrap().password(), "p2");
    }

    #[test]
    fn test_reload_discards_local_changes() {
        let dir = TempDir::new().unwrap();
        let (path, mut ours) = create(&dir);
        let options = OpenOptions {
            lock: LockPolicy::Override,
            ..OpenOptions::default()
        };
        let mut theirs = Session::open(&path, key("pw"), options).unwrap();
        let root = theirs.tree().root_id();
        theirs
            .tree_mut()
            .add_entry(root, Entry::with_login("Bank", "", "b", ""))
            .unwrap();
        theirs.save(&ChangeDecision::Overwrite).unwrap();

        assert_eq!(
            ours.save(&ChangeDecision::Reload).unwrap(),
            SaveOutcome::Reloaded
        );
        assert_eq!(ours.tree().entry_count(), 2);
    }

    #[test]
    fn test_dirty_tracking_and_rollback() {
        let dir = TempDir::new().unwrap();
        let (_path, mut session) = create(&dir);
        assert!(!session.is_dirty());

        let checkpoint = session.checkpoint();
        let root = session.tree().root_id();
        session
            .tree_mut()
            .add_entry(root, Entry::with_login("Bank", "", "b", ""))
            .unwrap();
        assert!(session.is_dirty());
        session.rollback(checkpoint);
        assert!(!session.is_dirty());
        assert_eq!(session.tree().entry_count(), 1);

        session
            .tree_mut()
            .add_entry(root, Entry::with_login("Bank", "", "b", ""))
            .unwrap();
        session.save(&ChangeDecision::Overwrite).unwrap();
        assert!(!session.is_dirty());
        session.change_key(key("new")).unwrap();
        assert!(session.is_dirty());
    }

    #[test]
    fn test_challenge_response_rederived_per_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.kwdb");
        let responder = Arc::new(HmacSha1Responder::new(b"token secret".to_vec()));
        let composite = key("pw").with_challenge_response(responder.clone());
        let tree = Tree::new("Vault", &HistoryConfig::default());
        let mut session = Session::create(&path, tree, composite, &fast_config()).unwrap();
        session.save(&ChangeDecision::Overwrite).unwrap();
        drop(session);

        let reopened = key("pw").with_challenge_response(responder);
        Session::open(&path, reopened, OpenOptions::default()).unwrap();
        let err = Session::open(&path, key("pw"), OpenOptions::default()).unwrap_err();
        assert!(matches!(err, KwError::WrongKeyOrCorruptFile));
    }

    #[test]
    fn test_change_key() {
        let dir = TempDir::new().unwrap();
        let (path, mut session) = create(&dir);
        session.change_key(key("new")).unwrap();
        session.save(&ChangeDecision::Overwrite).unwrap();
        drop(session);
        assert!(Session::open(&path, key("new"), OpenOptions::default()).is_ok());
        assert!(matches!(
            Session::open(&path, key("pw"), OpenOptions::default()),
            Err(KwError::WrongKeyOrCorruptFile)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_open() {
        let dir = TempDir::new().unwrap();
        let (path, session) = create(&dir);
        drop(session);
        let token = CancellationToken::new();
        token.cancel();
        let err = Session::open_cancellable(&path, key("pw"), OpenOptions::default(), token)
            .await
            .unwrap_err();
        assert!(matches!(err, KwError::Cancelled));
        // the lock was released
        Session::open(&path, key("pw"), OpenOptions::default()).unwrap();
    }
}
