//! kw-db: the credential tree and everything that persists it
//!
//! - `tree`, `group`, `entry`, `meta`: the in-memory model
//! - `format`: legacy reader and the current container codec
//! - `session`: an open container with lock, save and reload
//! - `merge`: two-way reconciliation of diverged copies
//! - `file`, `watch`: locking, atomic writes, change notification

pub mod entry;
pub mod file;
pub mod format;
pub mod group;
pub mod merge;
pub mod meta;
pub mod session;
pub mod times;
pub mod totp;
pub mod tree;
pub mod watch;

pub use entry::{Attribute, Entry};
pub use file::{FileLock, LockPolicy};
pub use format::legacy::LegacyDatabase;
pub use format::{detect, export_json, FormatKind, OpenedDatabase};
pub use group::{Group, Icon};
pub use merge::{merge, MergeChange, MergeConflict, MergeReport};
pub use meta::Metadata;
pub use session::{ChangeDecision, ExternalChangePolicy, OpenOptions, SaveOutcome, Session};
pub use times::Times;
pub use tree::{DeleteMode, Deleted, Tree};
