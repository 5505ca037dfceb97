use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{MAX_MESSAGE_CONTENT_BYTES, MessageType, NewMessage};

/// Length of a base32 (unpadded) encoding of a 16-byte token.
pub const TOKEN_PLAINTEXT_LEN: usize = 26;

/// Field-keyed validation failures. The first message recorded for a field
/// wins, so checks should run from most to least fundamental.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(transparent)]
#[error("validation failed: {0:?}")]
pub struct ValidationErrors(BTreeMap<String, String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field shorthand.
    pub fn field(key: &str, message: &str) -> Self {
        let mut errors = Self::new();
        errors.add(key, message);
        errors
    }

    pub fn add(&mut self, key: &str, message: &str) {
        self.0
            .entry(key.to_string())
            .or_insert_with(|| message.to_string());
    }

    pub fn check(&mut self, condition: bool, key: &str, message: &str) {
        if !condition {
            self.add(key, message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

pub fn validate_token_plaintext(v: &mut ValidationErrors, token: &str) {
    v.check(!token.is_empty(), "token", "must be provided");
    v.check(
        token.len() == TOKEN_PLAINTEXT_LEN,
        "token",
        "must be 26 bytes long",
    );
}

pub fn validate_email(v: &mut ValidationErrors, email: &str) {
    v.check(!email.is_empty(), "email", "must be provided");
    v.check(email.len() <= 254, "email", "must not be more than 254 bytes long");

    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'));
    v.check(well_formed, "email", "must be a valid email address");
}

pub fn validate_password_plaintext(v: &mut ValidationErrors, password: &str) {
    v.check(!password.is_empty(), "password", "must be provided");
    v.check(password.len() >= 8, "password", "must be at least 8 bytes long");
    v.check(password.len() <= 72, "password", "must not be more than 72 bytes long");
}

pub fn validate_username(v: &mut ValidationErrors, username: &str) {
    v.check(!username.is_empty(), "username", "must be provided");
    v.check(username.len() >= 3, "username", "must be at least 3 bytes long");
    v.check(username.len() <= 32, "username", "must not be more than 32 bytes long");
}

pub fn validate_bio(v: &mut ValidationErrors, bio: Option<&str>) {
    if let Some(bio) = bio {
        v.check(bio.len() <= 500, "bio", "must not be more than 500 bytes long");
    }
}

pub fn validate_group_name(v: &mut ValidationErrors, name: &str) {
    v.check(!name.trim().is_empty(), "name", "must be provided");
    v.check(name.len() <= 100, "name", "must not be more than 100 bytes long");
}

/// Unvalidated message input as it arrives from a caller.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: String,
    pub content: String,
    pub replied_message_id: Option<Uuid>,
}

/// Field checks on what the sender wrote. Returns the parsed type when it is
/// one of the closed set.
fn check_message_body(
    v: &mut ValidationErrors,
    kind: &str,
    content: &str,
    replied_message_id: Option<Uuid>,
) -> Option<MessageType> {
    v.check(!kind.is_empty(), "type", "must be provided");
    let parsed = kind.parse::<MessageType>().ok();
    v.check(
        parsed.is_some(),
        "type",
        "must be one of text, image, video, audio, or file",
    );

    v.check(!content.is_empty(), "content", "must be provided");
    v.check(
        content.len() <= MAX_MESSAGE_CONTENT_BYTES,
        "content",
        "must not be more than 500 bytes long",
    );

    if let Some(replied) = replied_message_id {
        v.check(!replied.is_nil(), "replied_message_id", "must be a valid message id");
    }

    parsed
}

/// Validate what the sender wrote, before the message has a conversation.
pub fn validate_message_body(
    kind: &str,
    content: &str,
    replied_message_id: Option<Uuid>,
) -> Result<MessageType, ValidationErrors> {
    let mut v = ValidationErrors::new();
    let parsed = check_message_body(&mut v, kind, content, replied_message_id);
    v.into_result()?;
    parsed.ok_or_else(|| ValidationErrors::field("type", "must be provided"))
}

pub fn validate_message(draft: MessageDraft) -> Result<NewMessage, ValidationErrors> {
    let mut v = ValidationErrors::new();

    v.check(!draft.conversation_id.is_nil(), "conversation_id", "must be provided");
    v.check(!draft.sender_id.is_nil(), "sender_id", "must be provided");
    let kind = check_message_body(&mut v, &draft.kind, &draft.content, draft.replied_message_id);

    match (v.into_result(), kind) {
        (Ok(()), Some(kind)) => Ok(NewMessage {
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            kind,
            content: draft.content,
            replied_message_id: draft.replied_message_id,
        }),
        (Err(v), _) => Err(v),
        (Ok(()), None) => Err(ValidationErrors::field("type", "must be provided")),
    }
}
