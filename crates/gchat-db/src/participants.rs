use rusqlite::TransactionBehavior;
use tracing::info;
use uuid::Uuid;

use gchat_types::models::ConversationType;

use crate::Database;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::now;

impl Database {
    /// Whether `user_id` is a member of `conversation_id`, and that
    /// conversation is of type `kind`.
    pub fn participant_exists(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        kind: ConversationType,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM conversation_participants p
                     JOIN conversations c ON c.id = p.conversation_id
                     WHERE p.user_id = ?1 AND p.conversation_id = ?2 AND c.type = ?3
                 )",
                [
                    user_id.to_string(),
                    conversation_id.to_string(),
                    kind.as_str().to_string(),
                ],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Enroll `user_id` in a group.
    ///
    /// SQLite reports foreign key failures without naming the constraint, so
    /// both parents are checked inside the write transaction before the
    /// insert. Private conversations are fixed at two members and count as
    /// missing here.
    pub fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let conversation = conversation_id.to_string();
        let user = user_id.to_string();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let group_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1 AND type = 'group')",
                [&conversation],
                |r| r.get(0),
            )?;
            if !group_exists {
                return Err(StoreError::ConversationNotFound);
            }

            let user_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [&user],
                |r| r.get(0),
            )?;
            if !user_exists {
                return Err(StoreError::UserNotFound);
            }

            tx.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation, user, now()],
            )
            .map_err(|e| {
                if is_unique_violation(&e, "conversation_participants.conversation_id") {
                    StoreError::DuplicateParticipant
                } else {
                    e.into()
                }
            })?;

            tx.commit()?;
            Ok(())
        })?;

        info!(conversation_id = %conversation_id, user_id = %user_id, "Added participant");
        Ok(())
    }
}
