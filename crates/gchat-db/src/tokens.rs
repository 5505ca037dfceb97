use rand_core::{OsRng, RngCore};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use gchat_types::models::{Token, TokenScope, User};

use crate::Database;
use crate::error::{Result, StoreError, is_foreign_key_violation};
use crate::models::{USER_COLUMNS, now, now_utc, timestamp, user_from_row};

const TOKEN_BYTES: usize = 16;

/// RFC 4648 base32 without padding.
fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut output = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer = 0u32;
    let mut bits = 0;

    for byte in data {
        buffer = (buffer << 8) | u32::from(*byte);
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            output.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }

    if bits > 0 {
        output.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }

    output
}

pub fn hash_token(plaintext: &str) -> [u8; 32] {
    Sha256::digest(plaintext.as_bytes()).into()
}

fn generate_plaintext() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base32_encode(&bytes)
}

impl Database {
    /// Create and persist a token for `user_id`. The returned value is the
    /// only place the plaintext ever exists.
    pub fn issue_token(
        &self,
        user_id: Uuid,
        ttl: chrono::Duration,
        scope: TokenScope,
    ) -> Result<Token> {
        self.with_conn_mut(|conn| insert_token_in(conn, user_id, ttl, scope))
    }

    /// Resolve a plaintext token to its owner. Unknown, wrong-scope and
    /// expired tokens all come back as [`StoreError::NotFound`].
    pub fn user_for_token(&self, plaintext: &str, scope: TokenScope) -> Result<User> {
        let hash = hash_token(plaintext);

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {USER_COLUMNS}
                 FROM users u
                 JOIN tokens t ON t.user_id = u.id
                 WHERE t.hash = ?1 AND t.scope = ?2 AND t.expiry > ?3"
            );
            conn.query_row(
                &sql,
                rusqlite::params![&hash[..], scope.as_str(), now()],
                |row| user_from_row(row, 0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Delete every token of `scope` held by `user_id`.
    pub fn revoke_tokens(&self, user_id: Uuid, scope: TokenScope) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM tokens WHERE user_id = ?1 AND scope = ?2",
                rusqlite::params![user_id.to_string(), scope.as_str()],
            )?;
            Ok(n)
        })
    }

    /// Drop tokens whose expiry has passed. Expired tokens are already
    /// unusable; this only reclaims space.
    pub fn purge_expired_tokens(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM tokens WHERE expiry <= ?1", [now()])?;
            Ok(n)
        })
    }
}

pub(crate) fn insert_token_in(
    conn: &Connection,
    user_id: Uuid,
    ttl: chrono::Duration,
    scope: TokenScope,
) -> Result<Token> {
    let token = Token {
        plaintext: generate_plaintext(),
        user_id,
        expiry: now_utc() + ttl,
        scope,
    };
    let hash = hash_token(&token.plaintext);

    conn.execute(
        "INSERT INTO tokens (hash, user_id, expiry, scope, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            &hash[..],
            user_id.to_string(),
            timestamp(token.expiry),
            scope.as_str(),
            now(),
        ],
    )
    .map_err(|e| {
        if is_foreign_key_violation(&e) {
            StoreError::UserNotFound
        } else {
            StoreError::from(e)
        }
    })?;

    debug!(user_id = %user_id, scope = %scope, "Issued token");
    Ok(token)
}
