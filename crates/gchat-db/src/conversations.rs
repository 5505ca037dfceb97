//! Conversation resolution: private get-or-create, group creation and the
//! conversation list with last-message previews.
//!
//! A private conversation carries `private_key`, the two participant ids in
//! canonical order. The column is `UNIQUE`, so two callers racing to open the
//! same pair can never both succeed; the loser reads back the winner's row.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use gchat_types::models::{Conversation, ConversationPreview, ConversationType};
use gchat_types::pagination::{Filters, PaginationMetadata, calculate_pagination_metadata};

use crate::Database;
use crate::error::{Result, StoreError, is_foreign_key_violation, is_unique_violation};
use crate::models::{
    get_opt_uuid, get_parsed, get_ts, get_uuid, message_columns, now_utc, opt_message_from_row,
    timestamp,
};

/// Columns read by [`conversation_from_row`]. Expects `conversations c` with
/// `group_metadata g` LEFT JOINed.
const CONVERSATION_COLUMNS: &str = "c.id, c.type, g.name, g.owner_id, c.created_at, c.updated_at";

const CONVERSATION_FROM: &str =
    "conversations c LEFT JOIN group_metadata g ON g.conversation_id = c.id";

fn conversation_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: get_uuid(row, offset)?,
        kind: get_parsed(row, offset + 1)?,
        name: row.get(offset + 2)?,
        owner_id: get_opt_uuid(row, offset + 3)?,
        created_at: get_ts(row, offset + 4)?,
        updated_at: get_ts(row, offset + 5)?,
    })
}

/// Canonical key for an unordered pair of users.
pub(crate) fn private_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

fn private_by_key(conn: &Connection, key: &str) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM {CONVERSATION_FROM} WHERE c.private_key = ?1");
    Ok(conn
        .query_row(&sql, [key], |row| conversation_from_row(row, 0))
        .optional()?)
}

fn map_membership_error(e: rusqlite::Error) -> StoreError {
    if is_foreign_key_violation(&e) {
        StoreError::UserNotFound
    } else {
        e.into()
    }
}

fn insert_private(conn: &mut Connection, key: &str, a: Uuid, b: Uuid) -> Result<Conversation> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(existing) = private_by_key(&tx, key)? {
        return Ok(existing);
    }

    let now = now_utc();
    let conversation = Conversation {
        id: Uuid::now_v7(),
        kind: ConversationType::Private,
        name: None,
        owner_id: None,
        created_at: now,
        updated_at: now,
    };
    let id = conversation.id.to_string();
    let ts = timestamp(now);

    tx.execute(
        "INSERT INTO conversations (id, type, private_key, created_at, updated_at)
         VALUES (?1, 'private', ?2, ?3, ?3)",
        rusqlite::params![id, key, ts],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO conversation_participants (conversation_id, user_id, created_at)
             VALUES (?1, ?2, ?3)",
        )?;
        for user in [a, b] {
            stmt.execute(rusqlite::params![id, user.to_string(), ts])
                .map_err(map_membership_error)?;
        }
    }

    tx.commit()?;
    info!(conversation_id = %conversation.id, "Created private conversation");
    Ok(conversation)
}

impl Database {
    /// The private conversation whose participants are exactly `a` and `b`.
    /// [`StoreError::NotFound`] means the pair has no history yet.
    pub fn find_private_between(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM {CONVERSATION_FROM}
                 JOIN conversation_participants pa ON pa.conversation_id = c.id AND pa.user_id = ?1
                 JOIN conversation_participants pb ON pb.conversation_id = c.id AND pb.user_id = ?2
                 WHERE c.type = 'private'
                   AND (SELECT COUNT(*) FROM conversation_participants p WHERE p.conversation_id = c.id) = 2
                 LIMIT 1"
            );
            conn.query_row(&sql, [a.to_string(), b.to_string()], |row| {
                conversation_from_row(row, 0)
            })
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Get-or-create the private conversation for `a` and `b`. The
    /// conversation and both participant rows are written in one transaction.
    pub fn create_private_between(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        if a == b {
            return Err(StoreError::Invariant(
                "private conversation needs two distinct users",
            ));
        }
        let key = private_key(a, b);

        self.with_conn_mut(|conn| match insert_private(conn, &key, a, b) {
            Err(StoreError::Sqlite(e)) if is_unique_violation(&e, "conversations.private_key") => {
                debug!(key = %key, "Private conversation created concurrently, reusing it");
                private_by_key(conn, &key)?.ok_or(StoreError::NotFound)
            }
            other => other,
        })
    }

    /// Create a group owned by `owner_id`. The owner is enrolled as the first
    /// participant in the same transaction.
    pub fn create_group(&self, owner_id: Uuid, name: &str) -> Result<Conversation> {
        let now = now_utc();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            kind: ConversationType::Group,
            name: Some(name.to_string()),
            owner_id: Some(owner_id),
            created_at: now,
            updated_at: now,
        };
        let id = conversation.id.to_string();
        let owner = owner_id.to_string();
        let ts = timestamp(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO conversations (id, type, created_at, updated_at)
                 VALUES (?1, 'group', ?2, ?2)",
                rusqlite::params![id, ts],
            )?;
            tx.execute(
                "INSERT INTO group_metadata (conversation_id, owner_id, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, owner, name],
            )
            .map_err(map_membership_error)?;
            tx.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, owner, ts],
            )
            .map_err(map_membership_error)?;
            tx.commit()?;
            Ok(())
        })?;

        info!(conversation_id = %conversation.id, owner_id = %owner_id, "Created group");
        Ok(conversation)
    }

    pub fn conversation_exists(&self, id: Uuid, kind: ConversationType) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1 AND type = ?2)",
                [id.to_string(), kind.as_str().to_string()],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }

    pub fn get_conversation(&self, id: Uuid, kind: ConversationType) -> Result<Conversation> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM {CONVERSATION_FROM} WHERE c.id = ?1 AND c.type = ?2"
            );
            conn.query_row(&sql, [id.to_string(), kind.as_str().to_string()], |row| {
                conversation_from_row(row, 0)
            })
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Every conversation `user_id` takes part in, each with its newest
    /// message. Most recently active first.
    pub fn list_conversations_with_preview(
        &self,
        user_id: Uuid,
        filters: &Filters,
    ) -> Result<(Vec<ConversationPreview>, PaginationMetadata)> {
        let (total, previews) = self.with_conn(|conn| {
            let sql = format!(
                "SELECT count(*) OVER(), {CONVERSATION_COLUMNS},
                        (SELECT o.user_id FROM conversation_participants o
                         WHERE c.type = 'private' AND o.conversation_id = c.id AND o.user_id <> ?1
                         LIMIT 1),
                        {last}
                 FROM conversation_participants p
                 JOIN conversations c ON c.id = p.conversation_id
                 LEFT JOIN group_metadata g ON g.conversation_id = c.id
                 LEFT JOIN conversation_messages m ON m.id = (
                     SELECT lm.id FROM conversation_messages lm
                     WHERE lm.conversation_id = c.id
                     ORDER BY lm.created_at DESC, lm.id DESC
                     LIMIT 1
                 )
                 WHERE p.user_id = ?1
                 ORDER BY COALESCE(m.created_at, c.created_at) DESC, c.id DESC
                 LIMIT ?2 OFFSET ?3",
                last = message_columns("m"),
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![user_id.to_string(), filters.limit(), filters.offset()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        ConversationPreview {
                            conversation: conversation_from_row(row, 1)?,
                            peer_id: get_opt_uuid(row, 7)?,
                            last_message: opt_message_from_row(row, 8)?,
                        },
                    ))
                },
            )?;

            let mut total = 0;
            let mut previews = Vec::new();
            for row in rows {
                let (count, preview) = row?;
                total = count;
                previews.push(preview);
            }
            Ok((total, previews))
        })?;

        let metadata = calculate_pagination_metadata(total, filters.page, filters.page_size)?;
        Ok((previews, metadata))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use gchat_types::models::{MessageType, NewMessage};

    use super::*;
    use crate::testing;

    #[test]
    fn private_key_is_order_independent() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        assert_eq!(private_key(a, b), private_key(b, a));
    }

    #[test]
    fn find_is_symmetric() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");

        assert!(matches!(
            db.find_private_between(alice.id, bob.id),
            Err(StoreError::NotFound)
        ));

        let created = db.create_private_between(alice.id, bob.id).unwrap();
        assert_eq!(created.kind, ConversationType::Private);
        assert_eq!(db.find_private_between(alice.id, bob.id).unwrap(), created);
        assert_eq!(db.find_private_between(bob.id, alice.id).unwrap().id, created.id);

        // Second call returns the same conversation instead of a new one.
        assert_eq!(db.create_private_between(bob.id, alice.id).unwrap().id, created.id);
    }

    #[test]
    fn private_with_self_is_rejected() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");
        assert!(matches!(
            db.create_private_between(alice.id, alice.id),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn private_with_unknown_user_leaves_nothing_behind() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");

        let result = db.create_private_between(alice.id, Uuid::now_v7());
        assert!(matches!(result, Err(StoreError::UserNotFound)));

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn concurrent_creation_converges_on_one_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gchat.db");

        let seed = Database::open(&path).unwrap();
        let alice = testing::user(&seed, "alice");
        let bob = testing::user(&seed, "bob");

        const WORKERS: usize = 8;
        let handles: Vec<Database> = (0..WORKERS).map(|_| Database::open(&path).unwrap()).collect();
        let barrier = Arc::new(Barrier::new(WORKERS));

        let threads: Vec<_> = handles
            .into_iter()
            .enumerate()
            .map(|(i, db)| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let (a, b) = if i % 2 == 0 { (alice.id, bob.id) } else { (bob.id, alice.id) };
                    db.create_private_between(a, b).unwrap().id
                })
            })
            .collect();

        let ids: Vec<Uuid> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let (count, members): (i64, i64) = seed
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM conversations WHERE type = 'private'),
                            (SELECT COUNT(*) FROM conversation_participants)",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(members, 2);
    }

    #[test]
    fn group_owner_is_enrolled() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");

        let group = db.create_group(alice.id, "book club").unwrap();
        assert_eq!(group.owner_id, Some(alice.id));

        let loaded = db.get_conversation(group.id, ConversationType::Group).unwrap();
        assert_eq!(loaded, group);
        assert_eq!(loaded.name.as_deref(), Some("book club"));
        assert!(db.participant_exists(alice.id, group.id, ConversationType::Group).unwrap());
    }

    #[test]
    fn group_with_unknown_owner_fails() {
        let (_dir, db) = testing::open_temp();
        assert!(matches!(
            db.create_group(Uuid::now_v7(), "ghosts"),
            Err(StoreError::UserNotFound)
        ));
    }

    #[test]
    fn lookups_are_scoped_by_type() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let private = db.create_private_between(alice.id, bob.id).unwrap();

        assert!(db.conversation_exists(private.id, ConversationType::Private).unwrap());
        assert!(!db.conversation_exists(private.id, ConversationType::Group).unwrap());
        assert!(matches!(
            db.get_conversation(private.id, ConversationType::Group),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_carries_newest_message_and_peer() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let private = db.create_private_between(alice.id, bob.id).unwrap();
        let group = db.create_group(alice.id, "quiet").unwrap();

        for content in ["first", "second"] {
            db.insert_message(&NewMessage {
                conversation_id: private.id,
                sender_id: bob.id,
                kind: MessageType::Text,
                content: content.to_string(),
                replied_message_id: None,
            })
            .unwrap();
        }

        let (previews, meta) = db
            .list_conversations_with_preview(alice.id, &Filters::default())
            .unwrap();
        assert_eq!(meta.total_records, 2);
        assert_eq!(previews.len(), 2);

        let p = previews.iter().find(|p| p.conversation.id == private.id).unwrap();
        assert_eq!(p.peer_id, Some(bob.id));
        assert_eq!(p.last_message.as_ref().unwrap().content, "second");

        let g = previews.iter().find(|p| p.conversation.id == group.id).unwrap();
        assert_eq!(g.peer_id, None);
        assert!(g.last_message.is_none());
        assert_eq!(g.conversation.name.as_deref(), Some("quiet"));

        // Bob only sees the private conversation.
        let (previews, meta) = db
            .list_conversations_with_preview(bob.id, &Filters::default())
            .unwrap();
        assert_eq!(meta.total_records, 1);
        assert_eq!(previews[0].peer_id, Some(alice.id));
    }

    #[test]
    fn list_pages_through_window_count() {
        let (_dir, db) = testing::open_temp();
        let alice = testing::user(&db, "alice");
        for i in 0..5 {
            db.create_group(alice.id, &format!("group {i}")).unwrap();
        }

        let (page, meta) = db
            .list_conversations_with_preview(alice.id, &Filters::new(3, 2))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(meta.total_records, 5);
        assert_eq!(meta.last_page, 3);

        let empty = db.list_conversations_with_preview(Uuid::now_v7(), &Filters::new(2, 10));
        assert!(matches!(empty, Err(StoreError::InvalidPage(_))));
    }
}
