use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use crate::error::{Result, StoreError};

const MIGRATIONS: &[(i64, &str, &str)] = &[(1, "initial schema", V1_INITIAL)];

const V1_INITIAL: &str = "
    CREATE TABLE users (
        id                  TEXT PRIMARY KEY,
        username            TEXT NOT NULL,
        email               TEXT NOT NULL,
        bio                 TEXT,
        password_hash       TEXT NOT NULL,
        is_active           INTEGER NOT NULL DEFAULT 0,
        email_verified_at   TEXT,
        version             INTEGER NOT NULL DEFAULT 1,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL,
        CONSTRAINT users_username_key UNIQUE (username),
        CONSTRAINT users_email_key UNIQUE (email)
    );

    CREATE TABLE tokens (
        hash        BLOB PRIMARY KEY,
        user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expiry      TEXT NOT NULL,
        scope       TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );

    CREATE INDEX idx_tokens_user_scope ON tokens(user_id, scope);

    -- private_key holds 'min:max' of the two user ids for private
    -- conversations and NULL for groups.
    CREATE TABLE conversations (
        id          TEXT PRIMARY KEY,
        type        TEXT NOT NULL CHECK (type IN ('private', 'group')),
        private_key TEXT UNIQUE,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        CHECK ((type = 'private') = (private_key IS NOT NULL))
    );

    CREATE TABLE group_metadata (
        conversation_id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
        owner_id        TEXT NOT NULL REFERENCES users(id),
        name            TEXT NOT NULL
    );

    CREATE TABLE conversation_participants (
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at      TEXT NOT NULL,
        CONSTRAINT unique_participant UNIQUE (conversation_id, user_id)
    );

    CREATE INDEX idx_participants_user ON conversation_participants(user_id);

    CREATE TABLE conversation_messages (
        id                  TEXT PRIMARY KEY,
        conversation_id     TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender_id           TEXT NOT NULL REFERENCES users(id),
        type                TEXT NOT NULL CHECK (type IN ('text', 'image', 'video', 'audio', 'file')),
        content             TEXT NOT NULL CHECK (length(CAST(content AS BLOB)) <= 500),
        replied_message_id  TEXT REFERENCES conversation_messages(id) ON DELETE SET NULL,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE INDEX idx_messages_conversation
        ON conversation_messages(conversation_id, created_at DESC, id DESC);
";

pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    for &(version, name, sql) in MIGRATIONS {
        // Another handle on the same file may be migrating concurrently, so
        // the version is re-read under the write lock.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )?;
        if current >= version {
            continue;
        }

        info!("Running migration v{} ({})", version, name);
        tx.execute_batch(sql)
            .map_err(|e| StoreError::Migration(format!("v{version} ({name}): {e}")))?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
    }

    info!("Database migrations complete");
    Ok(())
}
