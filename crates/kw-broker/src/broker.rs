//! Request handling against the shared open database
//!
//! Per client and request:
//! ```text
//! Unassociated ──associate──▶ AwaitingUserConsent ──allow──▶ Associated
//! Associated ──valid sealed request──▶ Authenticated
//! any state ──refusal──▶ Denied
//! ```
//! Every failure becomes `{success: false, error}`; nothing partial is sent.

use kw_core::config::BrokerConfig;
use kw_core::{KwError, KwResult};
use kw_db::entry::{PASSWORD, URL, USERNAME};
use kw_db::{ChangeDecision, Entry, Group, SaveOutcome, Session, Tree};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::association::{self, AssociationRecord, Decision, SETTINGS_ENTRY_UUID};
use crate::channel::{self, Direction, KeyPair, SharedKey};
use crate::consent::{Consent, ConsentPrompt};
use crate::matching::{self, SiteUrl};
use crate::protocol::{
    Action, AssociationInfo, GetLogins, GetTotp, Login, LoginStored, Logins, Request, Response,
    SetLogin, Timed, Totp,
};
use crate::replay::ReplayGuard;

/// Group that receives logins created by clients.
pub const BROWSER_GROUP: &str = "Browser Passwords";

const MAX_CLIENT_ID_LEN: usize = 128;

/// The open database as shared between the daemon and the broker.
pub type SharedSession = Arc<RwLock<Option<Session>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unassociated,
    AwaitingUserConsent,
    Associated,
    Authenticated,
    Denied,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientState::Unassociated => "unassociated",
            ClientState::AwaitingUserConsent => "awaiting-consent",
            ClientState::Associated => "associated",
            ClientState::Authenticated => "authenticated",
            ClientState::Denied => "denied",
        })
    }
}

fn transition(client: &str, from: ClientState, to: ClientState) {
    info!(client = %client, %from, %to, "client state changed");
}

pub struct Broker {
    session: SharedSession,
    config: BrokerConfig,
    consent: Consent,
    replay: Mutex<ReplayGuard>,
}

impl Broker {
    pub fn new(session: SharedSession, config: BrokerConfig, consent: Consent) -> Self {
        let replay = Mutex::new(ReplayGuard::new(config.nonce_window_secs));
        Self {
            session,
            config,
            consent,
            replay,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Decode one JSON frame, handle it, encode the answer.
    pub async fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<Request>(frame) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "unparseable request");
                Response::failure(None, &KwError::Format(format!("bad request: {e}")))
            }
        };
        serde_json::to_vec(&response)
            .unwrap_or_else(|_| br#"{"success":false,"error":"internal error"}"#.to_vec())
    }

    pub async fn handle(&self, request: Request) -> Response {
        let action = request.action;
        let result = match action {
            Action::Associate => self.associate(&request).await,
            _ => self.authenticated(&request).await,
        };
        match result {
            Ok(response) => {
                debug!(client = %request.client_id, %action, "request served");
                response
            }
            Err(e) => {
                warn!(client = %request.client_id, %action, error = %e, "request refused");
                Response::failure(Some(action), &e)
            }
        }
    }

    // ── Association ──────────────────────────────────────────────────────────

    async fn associate(&self, request: &Request) -> KwResult<Response> {
        let client_id = validate_client_id(&request.client_id)?;
        let client_pk = request.public_key_bytes()?;
        let pair = KeyPair::generate();
        let broker_pk = pair.public_bytes();
        let key = pair.agree(&client_pk, false)?;
        {
            let guard = self.session.read().await;
            let session = open_session(&guard)?;
            if association::key_in_use(session.tree(), client_id, &key) {
                return Err(KwError::AccessDenied(
                    "channel key already belongs to another client".into(),
                ));
            }
        }

        transition(client_id, ClientState::Unassociated, ClientState::AwaitingUserConsent);
        let prompt = ConsentPrompt::Associate {
            client_id: client_id.to_string(),
        };
        let reply = match self.consent.ask(prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                transition(client_id, ClientState::AwaitingUserConsent, ClientState::Denied);
                return Err(e);
            }
        };
        let label = reply
            .label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| client_id.to_string());

        if !reply.allow {
            if reply.remember {
                let record = AssociationRecord::new(client_id, &label, key, Decision::Deny);
                self.persist(&record).await?;
            }
            transition(client_id, ClientState::AwaitingUserConsent, ClientState::Denied);
            return Err(KwError::AccessDenied("association refused".into()));
        }

        let decision = if reply.remember {
            Decision::Allow
        } else {
            Decision::Ask
        };
        let record = AssociationRecord::new(client_id, &label, key, decision);
        self.persist(&record).await?;
        self.replay.lock().await.forget(client_id);
        transition(client_id, ClientState::AwaitingUserConsent, ClientState::Associated);

        let info = AssociationInfo {
            client_id: client_id.to_string(),
            label,
        };
        Ok(seal(Action::Associate, &record.key, client_id, info)?.with_public_key(&broker_pk))
    }

    // ── Sealed requests ──────────────────────────────────────────────────────

    async fn authenticated(&self, request: &Request) -> KwResult<Response> {
        let action = request.action;
        let client_id = request.client_id.as_str();
        let record = {
            let guard = self.session.read().await;
            association::load(open_session(&guard)?.tree(), client_id)?
        };
        let Some(mut record) = record else {
            transition(client_id, ClientState::Unassociated, ClientState::Denied);
            return Err(KwError::AccessDenied("client is not associated".into()));
        };
        if record.decision == Decision::Deny {
            transition(client_id, ClientState::Associated, ClientState::Denied);
            return Err(KwError::AccessDenied("client was denied".into()));
        }

        let nonce = request.nonce_bytes()?;
        let plaintext = channel::open(
            &record.key,
            Direction::Request,
            client_id,
            &nonce,
            &request.message_bytes()?,
        )?;
        let payload: serde_json::Value = serde_json::from_slice(&plaintext)
            .map_err(|e| KwError::AccessDenied(format!("malformed payload: {e}")))?;
        let timestamp = payload
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| KwError::AccessDenied("payload carries no timestamp".into()))?;
        let now = kw_core::time::now().timestamp();
        if let Err(e) = self
            .replay
            .lock()
            .await
            .check(client_id, &nonce, timestamp, now)
        {
            transition(client_id, ClientState::Associated, ClientState::Denied);
            return Err(e);
        }
        transition(client_id, ClientState::Associated, ClientState::Authenticated);

        if record.touch() {
            if let Err(e) = self.persist(&record).await {
                debug!(client = %client_id, error = %e, "last-used time not recorded");
            }
        }

        match action {
            Action::TestAssociate => {
                let info = AssociationInfo {
                    client_id: client_id.to_string(),
                    label: record.label.clone(),
                };
                seal(action, &record.key, client_id, info)
            }
            Action::GetLogins => {
                let body: GetLogins = body_of(payload)?;
                let logins = self.get_logins(&mut record, body).await?;
                seal(action, &record.key, client_id, logins)
            }
            Action::SetLogin => {
                let body: SetLogin = body_of(payload)?;
                let stored = self.set_login(&mut record, body).await?;
                seal(action, &record.key, client_id, stored)
            }
            Action::GetTotp => {
                let body: GetTotp = body_of(payload)?;
                let totp = self.get_totp(&mut record, body).await?;
                seal(action, &record.key, client_id, totp)
            }
            Action::Associate => Err(KwError::AccessDenied("unexpected action".into())),
        }
    }

    async fn get_logins(&self, record: &mut AssociationRecord, body: GetLogins) -> KwResult<Logins> {
        let candidates: Vec<Login> = {
            let guard = self.session.read().await;
            let tree = open_session(&guard)?.tree();
            matching::find_logins(tree, &body.url, body.submit_url.as_deref(), &self.config)
                .into_iter()
                .map(|(_, e)| Login {
                    uuid: e.uuid,
                    title: e.title().to_string(),
                    username: e.username().to_string(),
                    password: e.password().to_string(),
                })
                .collect()
        };
        if candidates.is_empty() {
            return Err(KwError::Other(anyhow::anyhow!("no logins found")));
        }

        let listed = candidates
            .iter()
            .map(|l| (l.uuid, l.title.clone()))
            .collect();
        let granted = self.permitted(record, &body.url, listed).await?;
        let entries: Vec<Login> = candidates
            .into_iter()
            .filter(|l| granted.contains(&l.uuid))
            .collect();
        if entries.is_empty() {
            return Err(KwError::AccessDenied("access to the matching entries was denied".into()));
        }
        info!(client = %record.client_id, count = entries.len(), "logins released");
        Ok(Logins { entries })
    }

    async fn get_totp(&self, record: &mut AssociationRecord, body: GetTotp) -> KwResult<Totp> {
        let (title, url) = {
            let guard = self.session.read().await;
            let entry = visible_entry(open_session(&guard)?.tree(), body.uuid)?;
            (entry.title().to_string(), entry.url().to_string())
        };
        let granted = self.permitted(record, &url, vec![(body.uuid, title)]).await?;
        if !granted.contains(&body.uuid) {
            return Err(KwError::AccessDenied("access to the entry was denied".into()));
        }

        let guard = self.session.read().await;
        let entry = visible_entry(open_session(&guard)?.tree(), body.uuid)?;
        let code = kw_db::totp::entry_totp(entry, kw_core::time::now().timestamp())?
            .ok_or_else(|| KwError::Other(anyhow::anyhow!("entry has no TOTP configured")))?;
        Ok(Totp {
            totp: code.code,
            seconds_remaining: code.seconds_remaining,
        })
    }

    async fn set_login(&self, record: &mut AssociationRecord, body: SetLogin) -> KwResult<LoginStored> {
        let existing = match body.uuid {
            Some(id) => {
                let guard = self.session.read().await;
                let entry = visible_entry(open_session(&guard)?.tree(), id)?;
                Some((id, entry.title().to_string()))
            }
            None => None,
        };
        let existing_id = existing.as_ref().map(|(id, _)| *id);
        if let Some(id) = existing_id {
            if record.entry_decision(id) == Some(Decision::Deny) {
                return Err(KwError::AccessDenied("updates to this entry are denied".into()));
            }
        }

        let pre_approved = record.decision == Decision::Allow
            || existing_id.is_some_and(|id| record.entry_decision(id) == Some(Decision::Allow));
        if !pre_approved {
            let prompt = ConsentPrompt::Store {
                client_id: record.client_id.clone(),
                label: record.label.clone(),
                url: body.url.clone(),
                username: body.username.clone(),
                existing,
            };
            let reply = self.consent.ask(prompt).await?;
            if let (true, Some(id)) = (reply.remember, existing_id) {
                let decision = if reply.allow {
                    Decision::Allow
                } else {
                    Decision::Deny
                };
                record.entries.insert(id, decision);
                self.persist(record).await?;
            }
            if !reply.allow {
                return Err(KwError::AccessDenied("storing the login was refused".into()));
            }
        }

        let stored = self.update(|tree| store_login(tree, &body)).await?;
        info!(
            client = %record.client_id,
            entry = %stored.uuid,
            created = stored.created,
            "login stored"
        );
        Ok(stored)
    }

    /// The subset of `entries` this client may read, asking the user about
    /// entries with no remembered answer when the client is `Ask`.
    async fn permitted(
        &self,
        record: &mut AssociationRecord,
        url: &str,
        entries: Vec<(Uuid, String)>,
    ) -> KwResult<HashSet<Uuid>> {
        let mut granted = HashSet::new();
        let mut undecided = Vec::new();
        for (id, title) in entries {
            match record.entry_decision(id) {
                Some(Decision::Deny) => {}
                Some(Decision::Allow) => {
                    granted.insert(id);
                }
                _ if record.decision == Decision::Allow => {
                    granted.insert(id);
                }
                _ => undecided.push((id, title)),
            }
        }
        if undecided.is_empty() {
            return Ok(granted);
        }

        let prompt = ConsentPrompt::Access {
            client_id: record.client_id.clone(),
            label: record.label.clone(),
            url: url.to_string(),
            entries: undecided.clone(),
        };
        let reply = self.consent.ask(prompt).await?;
        let allowed: HashSet<Uuid> = if !reply.allow {
            HashSet::new()
        } else if reply.entries.is_empty() {
            undecided.iter().map(|(id, _)| *id).collect()
        } else {
            undecided
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| reply.entries.contains(id))
                .collect()
        };
        if reply.remember {
            for (id, _) in &undecided {
                let decision = if allowed.contains(id) {
                    Decision::Allow
                } else {
                    Decision::Deny
                };
                record.entries.insert(*id, decision);
            }
            self.persist(record).await?;
        }
        granted.extend(allowed);
        Ok(granted)
    }

    // ── Database access ──────────────────────────────────────────────────────

    async fn persist(&self, record: &AssociationRecord) -> KwResult<()> {
        self.update(|tree| association::store(tree, record)).await
    }

    /// Mutate the tree under the write lock, saving afterwards if configured.
    /// If either step fails the tree is left as it was.
    async fn update<T>(&self, f: impl FnOnce(&mut Tree) -> KwResult<T>) -> KwResult<T> {
        let mut guard = self.session.write().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| KwError::AccessDenied("no database is open".into()))?;
        if session.is_read_only() {
            return Err(KwError::ReadOnly);
        }
        let checkpoint = session.checkpoint();
        let result = f(session.tree_mut()).and_then(|out| {
            if self.config.save_on_update {
                if let SaveOutcome::Merged(report) =
                    session.save(&ChangeDecision::MergeThenSave)?
                {
                    info!(
                        reconciled = report.reconciled(),
                        "merged external changes before saving"
                    );
                }
            }
            Ok(out)
        });
        if let Err(e) = &result {
            warn!(error = %e, "change not applied");
            session.rollback(checkpoint);
        }
        result
    }
}

fn open_session(guard: &Option<Session>) -> KwResult<&Session> {
    guard
        .as_ref()
        .ok_or_else(|| KwError::AccessDenied("no database is open".into()))
}

fn validate_client_id(id: &str) -> KwResult<&str> {
    if id.is_empty() || id.len() > MAX_CLIENT_ID_LEN || id.chars().any(char::is_control) {
        return Err(KwError::AccessDenied("invalid client id".into()));
    }
    Ok(id)
}

/// An entry clients may see: not the settings entry, not recycled.
fn visible_entry(tree: &Tree, id: Uuid) -> KwResult<&Entry> {
    match tree.entry(id) {
        Some(entry) if id != SETTINGS_ENTRY_UUID && !tree.is_in_recycle_bin(id) => Ok(entry),
        _ => Err(KwError::AccessDenied("unknown entry".into())),
    }
}

fn body_of<T: DeserializeOwned>(payload: serde_json::Value) -> KwResult<T> {
    let timed: Timed<T> = serde_json::from_value(payload)
        .map_err(|e| KwError::AccessDenied(format!("malformed payload: {e}")))?;
    Ok(timed.body)
}

fn seal<T: Serialize>(
    action: Action,
    key: &SharedKey,
    client_id: &str,
    body: T,
) -> KwResult<Response> {
    let json = Zeroizing::new(serde_json::to_vec(&Timed::now(body))?);
    let (nonce, message) = channel::seal(key, Direction::Response, client_id, &json)?;
    Ok(Response::sealed(action, &nonce, &message))
}

fn store_login(tree: &mut Tree, body: &SetLogin) -> KwResult<LoginStored> {
    if let Some(id) = body.uuid {
        tree.edit_entry(id, |e| {
            e.set(USERNAME, body.username.as_str(), false);
            e.set(PASSWORD, body.password.as_str(), true);
            if e.url().is_empty() {
                e.set(URL, body.url.as_str(), false);
            }
        })?;
        return Ok(LoginStored {
            uuid: id,
            created: false,
        });
    }

    let group = browser_group(tree)?;
    let title = SiteUrl::parse(&body.url)
        .map(|u| u.host)
        .unwrap_or_else(|| body.url.clone());
    let entry = Entry::with_login(&title, &body.username, &body.password, &body.url);
    let id = tree.add_entry(group, entry)?;
    Ok(LoginStored {
        uuid: id,
        created: true,
    })
}

fn browser_group(tree: &mut Tree) -> KwResult<Uuid> {
    let root = tree.root_id();
    if let Some(group) = tree
        .children(root)
        .into_iter()
        .find(|g| g.name == BROWSER_GROUP)
    {
        return Ok(group.uuid);
    }
    Ok(tree.add_group(root, Group::new(BROWSER_GROUP))?)
}
