//! Container files end to end: create, reopen, tamper, wrong key, history caps,
//! forward compatibility with unknown header fields and payload members.

use kw_core::config::{HistoryConfig, KeywardConfig};
use kw_core::KwError;
use kw_crypto::{derive, CipherId, CompositeKey, Compression, KdfParams};
use kw_db::entry::PASSWORD;
use kw_db::format::current::{parse_container, write_container};
use kw_db::format::header::ContainerHeader;
use kw_db::{ChangeDecision, Entry, Group, OpenOptions, OpenedDatabase, Session, Tree};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn config(cipher: &str) -> KeywardConfig {
    let mut config = KeywardConfig::default();
    config.kdf.algorithm = "aes".into();
    config.kdf.aes_rounds = 50;
    config.database.cipher = cipher.into();
    config
}

fn password(pw: &str) -> CompositeKey {
    CompositeKey::new().with_password(&SecretString::from(pw))
}

fn sample_tree() -> Tree {
    let mut tree = Tree::new("Personal", &HistoryConfig::default());
    let root = tree.root_id();
    let web = tree.add_group(root, Group::new("Web")).unwrap();
    let mail = tree
        .add_entry(web, Entry::with_login("Mail", "alice", "hunter2", "https://mail.example"))
        .unwrap();
    tree.set_attachment(mail, "recovery.txt", b"codes".to_vec())
        .unwrap();
    tree.add_entry(root, Entry::with_login("Router", "admin", "admin", "http://192.168.1.1"))
        .unwrap();
    tree
}

fn create(dir: &TempDir, cipher: &str) -> PathBuf {
    let path = dir.path().join("personal.kwdb");
    Session::create(&path, sample_tree(), password("pw"), &config(cipher)).unwrap();
    path
}

fn reopen(path: &Path) -> Session {
    Session::open(path, password("pw"), OpenOptions::default()).unwrap()
}

// ── Round trips ─────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_both_ciphers() {
    for cipher in ["aes256", "chacha20"] {
        let dir = TempDir::new().unwrap();
        let path = create(&dir, cipher);
        let session = reopen(&path);
        let tree = session.tree();

        assert_eq!(session.header().cipher, CipherId::from_name(cipher).unwrap());
        assert_eq!(tree.entry_count(), 2);
        let mail = tree.find_entry_by_path("Web/Mail").unwrap();
        assert_eq!(mail.username(), "alice");
        assert_eq!(mail.password(), "hunter2");
        assert!(mail.attributes[PASSWORD].protected);
        assert_eq!(tree.attachment(mail.uuid, "recovery.txt"), Some(&b"codes"[..]));
    }
}

#[test]
fn test_opened_database_dispatches_on_signature() {
    let dir = TempDir::new().unwrap();
    let path = create(&dir, "aes256");
    let opened = OpenedDatabase::open(&path, password("pw"), OpenOptions::default()).unwrap();
    assert!(matches!(opened, OpenedDatabase::Current(_)));
    assert_eq!(opened.tree().entry_count(), 2);

    let junk = dir.path().join("notes.txt");
    std::fs::write(&junk, b"just some text").unwrap();
    assert!(matches!(
        OpenedDatabase::open(&junk, password("pw"), OpenOptions::default()),
        Err(KwError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_wrong_key_is_reported_as_such() {
    let dir = TempDir::new().unwrap();
    let path = create(&dir, "chacha20");
    let err = Session::open(&path, password("nope"), OpenOptions::default()).unwrap_err();
    assert!(matches!(err, KwError::WrongKeyOrCorruptFile));
}

#[test]
fn test_tampering_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = create(&dir, "aes256");
    let pristine = std::fs::read(&path).unwrap();
    let (_, header_len) = ContainerHeader::parse(&pristine).unwrap();

    // stored header hash
    let mut data = pristine.clone();
    data[header_len + 3] ^= 0x01;
    std::fs::write(&path, &data).unwrap();
    let err = Session::open(&path, password("pw"), OpenOptions::default()).unwrap_err();
    assert!(matches!(err, KwError::Integrity(_)), "got {err:?}");

    // payload past the stream-start marker
    let mut data = pristine;
    data[header_len + 64 + 40] ^= 0x01;
    std::fs::write(&path, &data).unwrap();
    let err = Session::open(&path, password("pw"), OpenOptions::default()).unwrap_err();
    assert!(matches!(err, KwError::Integrity(_)), "got {err:?}");
}

#[test]
fn test_edits_persist_with_capped_history() {
    let dir = TempDir::new().unwrap();
    let path = create(&dir, "aes256");
    let mut session = reopen(&path);
    session.tree_mut().meta.history_max_items = 3;
    let id = session.tree().find_entry_by_path("Router").unwrap().uuid;
    for i in 0..6 {
        session
            .tree_mut()
            .edit_entry(id, |e| e.set(PASSWORD, format!("pw-{i}"), true))
            .unwrap();
    }
    session.save(&ChangeDecision::Overwrite).unwrap();
    drop(session);

    let session = reopen(&path);
    let entry = session.tree().entry(id).unwrap();
    assert_eq!(entry.password(), "pw-5");
    assert_eq!(entry.history.len(), 3);
    // newest first
    assert_eq!(entry.history[0].password(), "pw-4");
    assert!(entry.history.iter().all(|h| h.history.is_empty()));
}

#[test]
fn test_deleted_entry_leaves_tombstone_across_save() {
    let dir = TempDir::new().unwrap();
    let path = create(&dir, "aes256");
    let mut session = reopen(&path);
    let id = session.tree().find_entry_by_path("Router").unwrap().uuid;
    session
        .tree_mut()
        .delete_entry(id, kw_db::DeleteMode::Permanent)
        .unwrap();
    session.save(&ChangeDecision::Overwrite).unwrap();
    drop(session);

    let session = reopen(&path);
    assert!(session.tree().entry(id).is_none());
    assert!(session.tree().tombstone(id).is_some());
}

// ── Forward compatibility ───────────────────────────────────────────────────

#[test]
fn test_unknown_header_fields_survive_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("future.kwdb");
    let composite = password("pw");

    let mut header = ContainerHeader::new(
        CipherId::ChaCha20,
        Compression::Zstd,
        KdfParams::from_config(&config("chacha20").kdf).unwrap(),
    );
    header.unknown.push((0x40, b"written by a newer release".to_vec()));
    let key = derive(&composite, &header.kdf, &header.master_seed).unwrap();
    let bytes = write_container(&header, &key, &sample_tree()).unwrap();
    std::fs::write(&path, bytes).unwrap();

    let mut session = Session::open(&path, composite, OpenOptions::default()).unwrap();
    session.save(&ChangeDecision::Overwrite).unwrap();
    drop(session);

    let raw = parse_container(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(
        raw.header().unknown,
        vec![(0x40, b"written by a newer release".to_vec())]
    );
}

#[test]
fn test_key_file_only_database() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("vault.key");
    std::fs::write(&key_path, [7u8; 32]).unwrap();
    let key = || CompositeKey::new().with_key_file(&key_path).unwrap();

    let path = dir.path().join("vault.kwdb");
    Session::create(&path, sample_tree(), key(), &config("aes256")).unwrap();
    let session = Session::open(&path, key(), OpenOptions::default()).unwrap();
    assert_eq!(session.tree().entry_count(), 2);
    assert!(Session::open(&path, password("pw"), OpenOptions::default()).is_err());
}
