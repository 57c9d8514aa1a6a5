//! End-to-end broker conversations against a real container on disk.
//!
//! A scripted consent task stands in for the user: it answers prompts from a
//! queue and records what it was asked. An empty queue dismisses the prompt.

use kw_broker::association::{self, Decision};
use kw_broker::protocol::{
    AssociationInfo, Empty, GetLogins, GetTotp, LoginStored, Logins, SetLogin, Totp,
};
use kw_broker::{
    Action, Broker, BrokerClient, Consent, ConsentPrompt, ConsentReply, PendingAssociation,
    Request, Response, SharedKey, SharedSession, BROWSER_GROUP,
};
use kw_core::config::{BrokerConfig, HistoryConfig, KeywardConfig};
use kw_crypto::CompositeKey;
use kw_db::totp::OTP_ATTRIBUTE;
use kw_db::{ChangeDecision, Entry, Group, LockPolicy, OpenOptions, Session, Tree};
use secrecy::SecretString;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;
use uuid::Uuid;

fn key() -> CompositeKey {
    CompositeKey::new().with_password(&SecretString::from("broker test"))
}

fn config() -> KeywardConfig {
    let mut config = KeywardConfig::default();
    config.kdf.algorithm = "aes".into();
    config.kdf.aes_rounds = 50;
    config
}

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    broker: Broker,
    replies: Arc<Mutex<VecDeque<ConsentReply>>>,
    prompts: Arc<Mutex<Vec<ConsentPrompt>>>,
    example_a: Uuid,
    example_b: Uuid,
    mail: Uuid,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    fn with_config(broker_config: BrokerConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.kwdb");

        let mut tree = Tree::new("Broker", &HistoryConfig::default());
        let root = tree.root_id();
        let web = tree.add_group(root, Group::new("Web")).unwrap();
        let example_a = tree
            .add_entry(
                web,
                Entry::with_login("Example A", "alice", "pa", "https://example.com/login"),
            )
            .unwrap();
        let example_b = tree
            .add_entry(
                web,
                Entry::with_login("Example B", "bob", "pb", "https://example.com/"),
            )
            .unwrap();
        let mut mail = Entry::with_login("Mail", "alice", "pm", "https://mail.test/");
        mail.set(
            OTP_ATTRIBUTE,
            "otpauth://totp/Mail:alice?secret=JBSWY3DPEHPK3PXP",
            true,
        );
        let mail = tree.add_entry(web, mail).unwrap();
        Session::create(&path, tree, key(), &config()).unwrap();
        let session = Session::open(&path, key(), OpenOptions::default()).unwrap();
        let shared: SharedSession = Arc::new(RwLock::new(Some(session)));

        let (consent, mut rx) = Consent::channel(Duration::from_secs(5));
        let replies: Arc<Mutex<VecDeque<ConsentReply>>> = Arc::default();
        let prompts: Arc<Mutex<Vec<ConsentPrompt>>> = Arc::default();
        {
            let replies = replies.clone();
            let prompts = prompts.clone();
            tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    prompts.lock().unwrap().push(request.prompt);
                    if let Some(reply) = replies.lock().unwrap().pop_front() {
                        let _ = request.reply.send(reply);
                    }
                }
            });
        }

        Self {
            _dir: dir,
            path,
            broker: Broker::new(shared, broker_config, consent),
            replies,
            prompts,
            example_a,
            example_b,
            mail,
        }
    }

    fn script(&self, reply: ConsentReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    async fn associate(&self, client_id: &str, reply: ConsentReply) -> Result<BrokerClient, Response> {
        self.script(reply);
        let (pending, request) = PendingAssociation::new(client_id);
        let response = self.broker.handle(request).await;
        match pending.finish(&response) {
            Ok((client, info)) => {
                assert_eq!(info.client_id, client_id);
                Ok(client)
            }
            Err(_) => Err(response),
        }
    }

    async fn get_logins(&self, client: &BrokerClient, url: &str) -> Result<Logins, Response> {
        let request = client
            .request(
                Action::GetLogins,
                GetLogins {
                    url: url.into(),
                    submit_url: None,
                },
            )
            .unwrap();
        let response = self.broker.handle(request).await;
        client.open(&response).map_err(|_| response)
    }

    /// The container as another process would read it.
    fn on_disk(&self) -> Session {
        Session::open(&self.path, key(), OpenOptions::default().read_only(true)).unwrap()
    }
}

fn titles(logins: &Logins) -> Vec<&str> {
    logins.entries.iter().map(|l| l.title.as_str()).collect()
}

// ── Association ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_client_is_denied_without_prompt() {
    let h = Harness::new();
    let stranger = BrokerClient::new("stranger", SharedKey::from_bytes([7; 32]));
    let response = h.get_logins(&stranger, "https://example.com/login").await.unwrap_err();
    assert!(!response.success);
    assert_eq!(response.action, Some(Action::GetLogins));
    assert!(response.message.is_none());
    assert_eq!(h.prompt_count(), 0);
}

#[tokio::test]
async fn test_associate_allow_remembered_then_get_logins() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered().labelled("Laptop"))
        .await
        .unwrap();

    let logins = h.get_logins(&client, "https://example.com/login").await.unwrap();
    assert_eq!(titles(&logins), ["Example A", "Example B"]);
    assert_eq!(logins.entries[0].password, "pa");
    // only the association itself was prompted for
    assert_eq!(h.prompt_count(), 1);

    let info: AssociationInfo = client
        .open(
            &h.broker
                .handle(client.request(Action::TestAssociate, Empty {}).unwrap())
                .await,
        )
        .unwrap();
    assert_eq!(info.label, "Laptop");

    let disk = h.on_disk();
    let record = association::load(disk.tree(), "firefox").unwrap().unwrap();
    assert_eq!(record.decision, Decision::Allow);
    assert_eq!(record.key, *client.key());
}

#[tokio::test]
async fn test_refused_association_remembered_as_deny() {
    let h = Harness::new();
    let refused = h
        .associate("intruder", ConsentReply::deny().remembered())
        .await
        .unwrap_err();
    assert!(!refused.success);
    assert!(refused.public_key.is_none());

    let disk = h.on_disk();
    let record = association::load(disk.tree(), "intruder").unwrap().unwrap();
    assert_eq!(record.decision, Decision::Deny);

    // a denied client is refused before anything is decrypted
    let guess = BrokerClient::new("intruder", record.key.clone());
    assert!(h.get_logins(&guess, "https://example.com/").await.is_err());
    assert_eq!(h.prompt_count(), 1);
}

#[tokio::test]
async fn test_no_consent_provider_denies_association() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.kwdb");
    Session::create(&path, Tree::new("db", &HistoryConfig::default()), key(), &config()).unwrap();
    let session = Session::open(&path, key(), OpenOptions::default()).unwrap();
    let broker = Broker::new(
        Arc::new(RwLock::new(Some(session))),
        BrokerConfig::default(),
        Consent::unavailable(),
    );

    let (_pending, request) = PendingAssociation::new("firefox");
    let response = broker.handle(request).await;
    assert!(!response.success);
    let guard = broker.session().read().await;
    assert!(association::list(guard.as_ref().unwrap().tree()).is_empty());
}

#[tokio::test]
async fn test_no_open_database() {
    let (consent, _rx) = Consent::channel(Duration::from_secs(1));
    let broker = Broker::new(Arc::new(RwLock::new(None)), BrokerConfig::default(), consent);
    let (_pending, request) = PendingAssociation::new("firefox");
    let response = broker.handle(request).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("no database"));
}

// ── Per-entry consent ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_ask_mode_prompts_per_entry_and_remembers() {
    let h = Harness::new();
    let client = h.associate("chrome", ConsentReply::allow()).await.unwrap();

    h.script(ConsentReply::allow().remembered().only(vec![h.example_a]));
    let logins = h.get_logins(&client, "https://example.com/login").await.unwrap();
    assert_eq!(titles(&logins), ["Example A"]);
    assert_eq!(h.prompt_count(), 2);
    match &h.prompts.lock().unwrap()[1] {
        ConsentPrompt::Access { entries, .. } => assert_eq!(entries.len(), 2),
        other => panic!("unexpected prompt {other:?}"),
    }

    // both entries now have a remembered answer: no new prompt
    let again = h.get_logins(&client, "https://example.com/login").await.unwrap();
    assert_eq!(titles(&again), ["Example A"]);
    assert_eq!(h.prompt_count(), 2);

    let disk = h.on_disk();
    let record = association::load(disk.tree(), "chrome").unwrap().unwrap();
    assert_eq!(record.entry_decision(h.example_a), Some(Decision::Allow));
    assert_eq!(record.entry_decision(h.example_b), Some(Decision::Deny));
}

#[tokio::test]
async fn test_dismissed_access_prompt_releases_nothing() {
    let h = Harness::new();
    let client = h.associate("chrome", ConsentReply::allow()).await.unwrap();
    // nothing scripted: the prompt is dismissed
    let response = h.get_logins(&client, "https://example.com/login").await.unwrap_err();
    assert!(!response.success);
    assert!(response.message.is_none());
}

#[tokio::test]
async fn test_no_match_is_a_failure() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();
    assert!(h.get_logins(&client, "https://unrelated.org/").await.is_err());
}

#[tokio::test]
async fn test_best_match_only() {
    let h = Harness::with_config(BrokerConfig {
        best_match_only: true,
        ..BrokerConfig::default()
    });
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();
    let logins = h.get_logins(&client, "https://example.com/login").await.unwrap();
    assert_eq!(titles(&logins), ["Example A"]);
}

// ── Replay protection ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_replayed_and_stale_requests_denied() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();

    let request = client.request(Action::TestAssociate, Empty {}).unwrap();
    assert!(h.broker.handle(request.clone()).await.success);
    assert!(!h.broker.handle(request).await.success);

    let stale = kw_core::time::now().timestamp() - 3600;
    let old = client
        .request_at(Action::TestAssociate, Empty {}, stale)
        .unwrap();
    assert!(!h.broker.handle(old).await.success);
}

#[tokio::test]
async fn test_tampered_request_denied() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();
    let mut request = client.request(Action::TestAssociate, Empty {}).unwrap();
    // sealed for another client id
    request.client_id = "someone-else".into();
    assert!(!h.broker.handle(request).await.success);
}

#[tokio::test]
async fn test_reflected_response_denied() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();
    let response = h
        .broker
        .handle(client.request(Action::TestAssociate, Empty {}).unwrap())
        .await;
    assert!(response.success);

    // a sealed response echoed back as if the client had sent it
    let reflected = Request {
        action: Action::TestAssociate,
        client_id: "firefox".into(),
        nonce: response.nonce.clone().unwrap(),
        message: response.message.clone(),
        public_key: None,
    };
    assert!(!h.broker.handle(reflected).await.success);
}

#[tokio::test]
async fn test_garbage_frame() {
    let h = Harness::new();
    let bytes = h.broker.handle_frame(b"{not json").await;
    let response: Response = serde_json::from_slice(&bytes).unwrap();
    assert!(!response.success);
    assert!(response.action.is_none());
}

// ── Writes and TOTP ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_login_creates_then_updates() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();

    let create = client
        .request(
            Action::SetLogin,
            SetLogin {
                url: "https://shop.example.org/signin".into(),
                username: "carol".into(),
                password: "first".into(),
                uuid: None,
            },
        )
        .unwrap();
    let stored: LoginStored = client.open(&h.broker.handle(create).await).unwrap();
    assert!(stored.created);

    let update = client
        .request(
            Action::SetLogin,
            SetLogin {
                url: "https://shop.example.org/signin".into(),
                username: "carol".into(),
                password: "second".into(),
                uuid: Some(stored.uuid),
            },
        )
        .unwrap();
    let updated: LoginStored = client.open(&h.broker.handle(update).await).unwrap();
    assert!(!updated.created);
    assert_eq!(updated.uuid, stored.uuid);

    let disk = h.on_disk();
    let tree = disk.tree();
    let entry = tree.entry(stored.uuid).unwrap();
    assert_eq!(entry.title(), "shop.example.org");
    assert_eq!(entry.password(), "second");
    assert_eq!(entry.history.len(), 1);
    assert_eq!(entry.history[0].password(), "first");
    let group = tree.group(entry.parent().unwrap()).unwrap();
    assert_eq!(group.name, BROWSER_GROUP);
}

#[tokio::test]
async fn test_failed_save_leaves_tree_untouched() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();
    let before = h.broker.session().read().await.as_ref().unwrap().tree().entry_count();

    // another device rekeys the file, so merging it before the save fails
    let options = OpenOptions {
        lock: LockPolicy::Override,
        ..OpenOptions::default()
    };
    let mut other = Session::open(&h.path, key(), options).unwrap();
    other
        .change_key(CompositeKey::new().with_password(&SecretString::from("rotated")))
        .unwrap();
    other.save(&ChangeDecision::Overwrite).unwrap();

    let request = client
        .request(
            Action::SetLogin,
            SetLogin {
                url: "https://shop.example.org/signin".into(),
                username: "carol".into(),
                password: "lost".into(),
                uuid: None,
            },
        )
        .unwrap();
    assert!(!h.broker.handle(request).await.success);
    // refused by the save, not by a prompt
    assert_eq!(h.prompt_count(), 1);

    let guard = h.broker.session().read().await;
    let session = guard.as_ref().unwrap();
    assert_eq!(session.tree().entry_count(), before);
    assert!(session
        .tree()
        .iter_entries()
        .all(|e| e.title() != "shop.example.org"));
    assert!(!session.is_dirty());
}

#[tokio::test]
async fn test_set_login_in_ask_mode_needs_consent() {
    let h = Harness::new();
    let client = h.associate("chrome", ConsentReply::allow()).await.unwrap();
    let request = client
        .request(
            Action::SetLogin,
            SetLogin {
                url: "https://example.com/login".into(),
                username: "mallory".into(),
                password: "x".into(),
                uuid: Some(h.example_a),
            },
        )
        .unwrap();
    h.script(ConsentReply::deny().remembered());
    assert!(!h.broker.handle(request).await.success);

    let disk = h.on_disk();
    assert_eq!(disk.tree().entry(h.example_a).unwrap().username(), "alice");
    let record = association::load(disk.tree(), "chrome").unwrap().unwrap();
    assert_eq!(record.entry_decision(h.example_a), Some(Decision::Deny));
}

#[tokio::test]
async fn test_get_totp() {
    let h = Harness::new();
    let client = h
        .associate("firefox", ConsentReply::allow().remembered())
        .await
        .unwrap();

    let request = client
        .request(Action::GetTotp, GetTotp { uuid: h.mail })
        .unwrap();
    let totp: Totp = client.open(&h.broker.handle(request).await).unwrap();
    assert_eq!(totp.totp.len(), 6);
    assert!(totp.totp.chars().all(|c| c.is_ascii_digit()));
    assert!((1..=30).contains(&totp.seconds_remaining));

    // an entry without TOTP settings
    let request = client
        .request(Action::GetTotp, GetTotp { uuid: h.example_a })
        .unwrap();
    assert!(!h.broker.handle(request).await.success);

    // the settings entry is never exposed
    let request = client
        .request(
            Action::GetTotp,
            GetTotp {
                uuid: association::SETTINGS_ENTRY_UUID,
            },
        )
        .unwrap();
    assert!(!h.broker.handle(request).await.success);
}
