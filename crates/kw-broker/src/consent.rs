//! Asking the user before a client gets anything
//!
//! The broker sends a `ConsentRequest` down an mpsc channel and waits on its
//! oneshot reply. Whoever owns the receiver (a terminal prompt, a test)
//! answers. One prompt per database is outstanding at a time.

use kw_core::{KwError, KwResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentPrompt {
    /// A new client wants to associate.
    Associate { client_id: String },
    /// An `Ask` client wants these entries.
    Access {
        client_id: String,
        label: String,
        url: String,
        entries: Vec<(Uuid, String)>,
    },
    /// An `Ask` client wants to create or update a login.
    Store {
        client_id: String,
        label: String,
        url: String,
        username: String,
        existing: Option<(Uuid, String)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsentReply {
    pub allow: bool,
    pub remember: bool,
    /// Label for a new association
    pub label: Option<String>,
    /// For `Access`: the granted subset. Empty with `allow` grants all.
    pub entries: Vec<Uuid>,
}

impl ConsentReply {
    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Self::default()
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }

    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn only(mut self, entries: Vec<Uuid>) -> Self {
        self.entries = entries;
        self
    }
}

#[derive(Debug)]
pub struct ConsentRequest {
    pub prompt: ConsentPrompt,
    pub reply: oneshot::Sender<ConsentReply>,
}

#[derive(Debug, Clone)]
pub struct Consent {
    tx: Option<mpsc::Sender<ConsentRequest>>,
    gate: Arc<Mutex<()>>,
    timeout: Duration,
}

impl Consent {
    pub fn channel(timeout: Duration) -> (Self, mpsc::Receiver<ConsentRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let consent = Self {
            tx: Some(tx),
            gate: Arc::new(Mutex::new(())),
            timeout,
        };
        (consent, rx)
    }

    /// No one to ask: every prompt is a denial.
    pub fn unavailable() -> Self {
        Self {
            tx: None,
            gate: Arc::new(Mutex::new(())),
            timeout: Duration::ZERO,
        }
    }

    pub async fn ask(&self, prompt: ConsentPrompt) -> KwResult<ConsentReply> {
        let Some(tx) = &self.tx else {
            return Err(KwError::AccessDenied("no consent provider".into()));
        };
        let _gate = self.gate.lock().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        debug!(?prompt, "asking for consent");
        tx.send(ConsentRequest {
            prompt,
            reply: reply_tx,
        })
        .await
        .map_err(|_| KwError::AccessDenied("consent provider is gone".into()))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KwError::AccessDenied("consent request dismissed".into())),
            Err(_) => Err(KwError::AccessDenied("consent timed out".into())),
        }
    }
}
