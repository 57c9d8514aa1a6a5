//! kw-broker: hands credentials to associated local clients
//!
//! A client associates once (X25519 agreement, user consent), then sends
//! sealed, timestamped requests. The broker matches URLs against the open
//! database, asks the user where the association says to, and answers only
//! with what was granted.

pub mod association;
pub mod broker;
pub mod channel;
pub mod client;
pub mod consent;
pub mod matching;
pub mod protocol;
pub mod replay;

pub use association::{AssociationRecord, Decision};
pub use broker::{Broker, ClientState, SharedSession, BROWSER_GROUP};
pub use channel::SharedKey;
pub use client::{BrokerClient, PendingAssociation};
pub use consent::{Consent, ConsentPrompt, ConsentReply, ConsentRequest};
pub use matching::{MatchRank, SiteUrl};
pub use protocol::{Action, Request, Response};
