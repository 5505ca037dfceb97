//! Message storage and the paginated private and group message lists.
//!
//! Both lists compute the total with `count(*) OVER()` in the page query
//! itself. A page past the end returns no rows and therefore a zero total,
//! which the pagination metadata reports as an invalid page.

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, error};
use uuid::Uuid;

use gchat_types::models::{ConversationType, GroupMessage, Message, MessageWithReply, NewMessage};
use gchat_types::pagination::{
    Filters, PaginationMetadata, SortDirection, calculate_pagination_metadata,
};

use crate::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    PUBLIC_USER_COLUMNS, message_columns, message_from_row, now_utc, opt_message_from_row,
    public_user_from_row, timestamp,
};

/// Sort keys accepted for group message lists.
pub const GROUP_MESSAGE_SORT: &[&str] = &["created_at", "-created_at", "id", "-id"];

pub const DEFAULT_GROUP_MESSAGE_SORT: &str = "-created_at";

/// Resolve the ORDER BY clause for a group list. Only allow-listed keys map
/// to a column; anything else is refused before a query is built.
fn group_order_by(filters: &Filters) -> Result<String> {
    let (key, direction) = if filters.sort.is_empty() {
        ("created_at", SortDirection::Desc)
    } else {
        match filters.sort_column() {
            Some(key) => (key, filters.sort_direction()),
            None => {
                error!(sort = %filters.sort, "Unlisted sort key reached the message store");
                return Err(StoreError::Invariant("unlisted sort key"));
            }
        }
    };

    let column = match key {
        "created_at" => "m.created_at",
        "id" => "m.id",
        _ => return Err(StoreError::Invariant("unlisted sort key")),
    };
    let dir = direction.as_sql();
    Ok(format!("{column} {dir}, m.id {dir}"))
}

/// Run a page query whose first column is the window count.
fn collect_page<T, F>(
    conn: &Connection,
    sql: &str,
    conversation_id: Uuid,
    filters: &Filters,
    map: F,
) -> Result<(i64, Vec<T>)>
where
    F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(
        rusqlite::params![conversation_id.to_string(), filters.limit(), filters.offset()],
        |row| Ok((row.get::<_, i64>(0)?, map(row)?)),
    )?;

    let mut total = 0;
    let mut items = Vec::new();
    for row in rows {
        let (count, item) = row?;
        total = count;
        items.push(item);
    }
    Ok((total, items))
}

impl Database {
    /// Store a validated message. Id and timestamps are assigned here and the
    /// conversation's `updated_at` moves with it.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let now = now_utc();
        let message = Message {
            id: Uuid::now_v7(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            kind: new.kind,
            content: new.content.clone(),
            replied_message_id: new.replied_message_id,
            created_at: now,
            updated_at: now,
        };
        let ts = timestamp(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO conversation_messages
                     (id, conversation_id, sender_id, type, content, replied_message_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                rusqlite::params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    message.kind.as_str(),
                    message.content,
                    message.replied_message_id.map(|id| id.to_string()),
                    ts,
                ],
            )?;
            let touched = tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![ts, message.conversation_id.to_string()],
            )?;
            if touched == 0 {
                return Err(StoreError::ConversationNotFound);
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(message_id = %message.id, conversation_id = %message.conversation_id, "Stored message");
        Ok(message)
    }

    /// Newest first, each message with the message it replies to.
    pub fn list_private_messages(
        &self,
        conversation_id: Uuid,
        filters: &Filters,
    ) -> Result<(Vec<MessageWithReply>, PaginationMetadata)> {
        let sql = format!(
            "SELECT count(*) OVER(), {m}, {r}
             FROM conversation_messages m
             LEFT JOIN conversation_messages r ON r.id = m.replied_message_id
             WHERE m.conversation_id = ?1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?2 OFFSET ?3",
            m = message_columns("m"),
            r = message_columns("r"),
        );

        let (total, messages) = self.with_conn(|conn| {
            collect_page(conn, &sql, conversation_id, filters, |row| {
                Ok(MessageWithReply {
                    message: message_from_row(row, 1)?,
                    replied_message: opt_message_from_row(row, 9)?,
                })
            })
        })?;

        let metadata = calculate_pagination_metadata(total, filters.page, filters.page_size)?;
        Ok((messages, metadata))
    }

    /// Like [`Database::list_private_messages`], with the sender's public
    /// profile joined in and an allow-listed sort key.
    pub fn list_group_messages(
        &self,
        conversation_id: Uuid,
        filters: &Filters,
    ) -> Result<(Vec<GroupMessage>, PaginationMetadata)> {
        let order_by = group_order_by(filters)?;
        let sql = format!(
            "SELECT count(*) OVER(), {m}, {PUBLIC_USER_COLUMNS}, {r}
             FROM conversation_messages m
             JOIN users u ON u.id = m.sender_id
             LEFT JOIN conversation_messages r ON r.id = m.replied_message_id
             WHERE m.conversation_id = ?1
             ORDER BY {order_by}
             LIMIT ?2 OFFSET ?3",
            m = message_columns("m"),
            r = message_columns("r"),
        );

        let (total, messages) = self.with_conn(|conn| {
            collect_page(conn, &sql, conversation_id, filters, |row| {
                Ok(GroupMessage {
                    message: message_from_row(row, 1)?,
                    sender: public_user_from_row(row, 9)?,
                    replied_message: opt_message_from_row(row, 14)?,
                })
            })
        })?;

        let metadata = calculate_pagination_metadata(total, filters.page, filters.page_size)?;
        Ok((messages, metadata))
    }

    /// Whether `message_id` lives in `conversation_id` and that conversation
    /// is of type `kind`. Guards reply references.
    pub fn message_belongs_to_conversation(
        &self,
        message_id: Uuid,
        conversation_id: Uuid,
        kind: ConversationType,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM conversation_messages m
                     JOIN conversations c ON c.id = m.conversation_id
                     WHERE m.id = ?1 AND m.conversation_id = ?2 AND c.type = ?3
                 )",
                [
                    message_id.to_string(),
                    conversation_id.to_string(),
                    kind.as_str().to_string(),
                ],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }
}
