//! Row mapping between SQLite and the gchat-types models.
//!
//! Ids are stored as hyphenated UUID text and timestamps as fixed-width
//! RFC 3339 UTC strings (microsecond precision), so ordering by either
//! column lexically is ordering chronologically.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use gchat_types::models::{Message, PublicUser, User};

/// Input for [`crate::Database::insert_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub bio: Option<String>,
    /// Argon2 PHC string. Never the plaintext.
    pub password_hash: String,
}

pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision timestamps are stored with, so a value
/// handed back to a caller equals the one a later read returns.
pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn now() -> String {
    timestamp(now_utc())
}

fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_failure(idx, e))
    })
    .transpose()
}

pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_failure(idx, e))
}

/// Columns read by [`user_from_row`], for a table aliased `u`.
pub(crate) const USER_COLUMNS: &str =
    "u.id, u.username, u.email, u.bio, u.is_active, u.email_verified_at, u.created_at, u.version";

pub(crate) fn user_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: get_uuid(row, offset)?,
        username: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        bio: row.get(offset + 3)?,
        is_active: row.get(offset + 4)?,
        email_verified_at: get_opt_ts(row, offset + 5)?,
        created_at: get_ts(row, offset + 6)?,
        version: row.get(offset + 7)?,
    })
}

/// Columns read by [`public_user_from_row`], for a table aliased `u`.
pub(crate) const PUBLIC_USER_COLUMNS: &str = "u.id, u.username, u.email, u.bio, u.is_active";

pub(crate) fn public_user_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<PublicUser> {
    Ok(PublicUser {
        id: get_uuid(row, offset)?,
        username: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        bio: row.get(offset + 3)?,
        is_active: row.get(offset + 4)?,
    })
}

/// Message columns for a table alias, in the order [`message_from_row`]
/// reads them.
pub(crate) fn message_columns(alias: &str) -> String {
    format!(
        "{a}.id, {a}.conversation_id, {a}.sender_id, {a}.type, {a}.content, \
         {a}.replied_message_id, {a}.created_at, {a}.updated_at",
        a = alias
    )
}

pub(crate) fn message_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Message> {
    Ok(Message {
        id: get_uuid(row, offset)?,
        conversation_id: get_uuid(row, offset + 1)?,
        sender_id: get_uuid(row, offset + 2)?,
        kind: get_parsed(row, offset + 3)?,
        content: row.get(offset + 4)?,
        replied_message_id: get_opt_uuid(row, offset + 5)?,
        created_at: get_ts(row, offset + 6)?,
        updated_at: get_ts(row, offset + 7)?,
    })
}

/// Same as [`message_from_row`] for a LEFT JOINed message that may be absent.
pub(crate) fn opt_message_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<Message>> {
    let id: Option<String> = row.get(offset)?;
    match id {
        Some(_) => message_from_row(row, offset).map(Some),
        None => Ok(None),
    }
}
