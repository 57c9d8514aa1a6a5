use thiserror::Error;
use uuid::Uuid;

pub type KwResult<T> = Result<T, KwError>;

#[derive(Debug, Error)]
pub enum KwError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("key component unavailable: {0}")]
    KeyDerivationUnavailable(String),

    #[error("no key material supplied (confirm an empty key explicitly)")]
    EmptyPassword,

    #[error("operation cancelled")]
    Cancelled,

    #[error("wrong password or key file, or the database file is corrupt")]
    WrongKeyOrCorruptFile,

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed database: {0}")]
    Format(String),

    #[error("database is open read-only")]
    ReadOnly,

    #[error("database is locked by {owner}")]
    Locked { owner: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Violations of credential tree invariants. These indicate a caller bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("unknown group {0}")]
    UnknownGroup(Uuid),

    #[error("unknown entry {0}")]
    UnknownEntry(Uuid),

    #[error("duplicate id {0}")]
    DuplicateId(Uuid),

    #[error("moving group {0} would create a cycle")]
    Cycle(Uuid),

    #[error("the root group cannot be moved or deleted")]
    RootImmutable,
}

impl From<serde_json::Error> for KwError {
    fn from(e: serde_json::Error) -> Self {
        KwError::Format(e.to_string())
    }
}
