use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::error;
use uuid::Uuid;

use gchat_types::models::{Token, TokenScope, User};

use crate::Database;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::{NewUser, USER_COLUMNS, now, now_utc, timestamp, user_from_row};
use crate::tokens::insert_token_in;

/// A user together with the stored password hash, for credential checks.
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

impl Database {
    /// Insert a new, inactive user. Id, timestamps and version are assigned
    /// here.
    pub fn insert_user(&self, new: &NewUser) -> Result<User> {
        check_password_hash(new)?;
        self.with_conn_mut(|conn| insert_user_in(conn, new))
    }

    /// Insert a new user together with its first activation token, in one
    /// transaction.
    pub fn register_user(&self, new: &NewUser) -> Result<(User, Token)> {
        check_password_hash(new)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let user = insert_user_in(&tx, new)?;
            let token = insert_token_in(
                &tx,
                user.id,
                TokenScope::Activation.ttl(),
                TokenScope::Activation,
            )?;
            tx.commit()?;
            Ok((user, token))
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<User> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1");
            conn.query_row(&sql, [id.to_string()], |row| user_from_row(row, 0))
                .optional()?
                .ok_or(StoreError::NotFound)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<User> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.email = ?1");
            conn.query_row(&sql, [email], |row| user_from_row(row, 0))
                .optional()?
                .ok_or(StoreError::NotFound)
        })
    }

    pub fn get_credentials_by_email(&self, email: &str) -> Result<UserCredentials> {
        let creds = self.with_conn(|conn| {
            let sql = format!("SELECT {USER_COLUMNS}, u.password_hash FROM users u WHERE u.email = ?1");
            conn.query_row(&sql, [email], |row| {
                Ok(UserCredentials {
                    user: user_from_row(row, 0)?,
                    password_hash: row.get(8)?,
                })
            })
            .optional()?
            .ok_or(StoreError::NotFound)
        })?;

        if creds.password_hash.is_empty() {
            error!(user_id = %creds.user.id, "Stored user has no password hash");
            return Err(StoreError::Invariant("stored user has no password hash"));
        }
        Ok(creds)
    }

    pub fn user_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [id.to_string()],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Write back every mutable field, guarded by `version`. On success the
    /// version on `user` is bumped; a stale version yields
    /// [`StoreError::EditConflict`].
    pub fn update_user(&self, user: &mut User) -> Result<()> {
        let version = self.with_conn_mut(|conn| update_user_in(conn, user))?;
        user.version = version;
        Ok(())
    }

    /// Mark the user active and verified and revoke every outstanding
    /// activation token, in one transaction.
    pub fn activate_user(&self, user: &mut User) -> Result<()> {
        let mut updated = user.clone();
        updated.is_active = true;
        updated.email_verified_at = Some(now_utc());

        let version = self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = update_user_in(&tx, &updated)?;
            tx.execute(
                "DELETE FROM tokens WHERE user_id = ?1 AND scope = ?2",
                rusqlite::params![updated.id.to_string(), TokenScope::Activation.as_str()],
            )?;
            tx.commit()?;
            Ok(version)
        })?;

        updated.version = version;
        *user = updated;
        Ok(())
    }
}

fn check_password_hash(new: &NewUser) -> Result<()> {
    if new.password_hash.is_empty() {
        error!(username = %new.username, "Refusing to insert user without a password hash");
        return Err(StoreError::Invariant("user inserted without a password hash"));
    }
    Ok(())
}

fn insert_user_in(conn: &Connection, new: &NewUser) -> Result<User> {
    let id = Uuid::now_v7();
    let created = now_utc();

    conn.execute(
        "INSERT INTO users (id, username, email, bio, password_hash, is_active, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, ?6, ?6)",
        rusqlite::params![
            id.to_string(),
            new.username,
            new.email,
            new.bio,
            new.password_hash,
            timestamp(created),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e, "users.username") {
            StoreError::DuplicateUsername
        } else if is_unique_violation(&e, "users.email") {
            StoreError::DuplicateEmail
        } else {
            e.into()
        }
    })?;

    Ok(User {
        id,
        username: new.username.clone(),
        email: new.email.clone(),
        bio: new.bio.clone(),
        is_active: false,
        email_verified_at: None,
        created_at: created,
        version: 1,
    })
}

fn update_user_in(conn: &Connection, user: &User) -> Result<i64> {
    let changed = conn
        .execute(
            "UPDATE users
             SET username = ?1, email = ?2, bio = ?3, is_active = ?4, email_verified_at = ?5,
                 version = version + 1, updated_at = ?6
             WHERE id = ?7 AND version = ?8",
            rusqlite::params![
                user.username,
                user.email,
                user.bio,
                user.is_active,
                user.email_verified_at.map(timestamp),
                now(),
                user.id.to_string(),
                user.version,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e, "users.username") {
                StoreError::DuplicateUsername
            } else if is_unique_violation(&e, "users.email") {
                StoreError::DuplicateEmail
            } else {
                e.into()
            }
        })?;

    if changed == 0 {
        return Err(StoreError::EditConflict);
    }
    Ok(user.version + 1)
}
