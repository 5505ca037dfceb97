use std::time::Duration;

use gchat_types::pagination::InvalidPage;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A query expected a row but found none.
    #[error("Record not found")]
    NotFound,

    /// Optimistic concurrency check failed on update.
    #[error("Edit conflict")]
    EditConflict,

    #[error("Username already taken")]
    DuplicateUsername,

    #[error("Email already taken")]
    DuplicateEmail,

    #[error("User is already a participant")]
    DuplicateParticipant,

    #[error("User does not exist")]
    UserNotFound,

    #[error("Conversation does not exist")]
    ConversationNotFound,

    #[error(transparent)]
    InvalidPage(#[from] InvalidPage),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store call cancelled")]
    Cancelled,

    /// Something upstream validation should have made impossible.
    #[error("Invariant violated: {0}")]
    Invariant(&'static str),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal store error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// True when `err` is a UNIQUE/PRIMARY KEY violation whose message names
/// `target` (e.g. `users.email`).
pub(crate) fn is_unique_violation(err: &rusqlite::Error, target: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
                && msg.contains(target)
        }
        _ => false,
    }
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
