use axum::{
    Extension, Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use gchat_db::StoreError;
use gchat_db::messages::GROUP_MESSAGE_SORT;
use gchat_types::api::{
    GroupMessagesResponse, MessageResponse, PageQuery, PrivateMessagesResponse, SendMessageRequest,
};
use gchat_types::models::{ConversationType, NewMessage, User};
use gchat_types::pagination::calculate_pagination_metadata;
use gchat_types::validator::{MessageDraft, validate_message, validate_message_body};

use crate::AppState;
use crate::conversations::{page_filters, path_id};
use crate::error::{ApiError, ApiResult};

const REPLY_NOT_IN_CONVERSATION: &str = "must reference a message in this conversation";

fn other_user(path: Result<Path<Uuid>, PathRejection>, me: &User) -> ApiResult<Uuid> {
    let other = path_id(path, "other_user_id")?;
    if other == me.id {
        return Err(ApiError::field(
            "other_user_id",
            "cannot open a private conversation with yourself",
        ));
    }
    Ok(other)
}

/// GET /conversations/private/{other_user_id}/messages
///
/// A pair with no conversation yet reads as an empty list.
pub async fn list_private(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let other = other_user(path, &user)?;
    let filters = page_filters(query, &[])?;
    let (page, page_size) = (filters.page, filters.page_size);

    let result = state
        .store
        .run(move |db| {
            let conversation = db.find_private_between(user.id, other)?;
            db.list_private_messages(conversation.id, &filters)
        })
        .await;

    let (messages, metadata) = match result {
        Ok(listed) => listed,
        Err(StoreError::NotFound) => (Vec::new(), calculate_pagination_metadata(0, page, page_size)?),
        Err(e) => return Err(e.into()),
    };

    Ok(Json(PrivateMessagesResponse { messages, metadata }))
}

/// POST /conversations/private/{other_user_id}/messages
///
/// The first valid message between two users opens their conversation.
pub async fn send_private(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let other = other_user(path, &user)?;
    let Json(req) = payload?;
    let kind = validate_message_body(&req.kind, &req.content, req.replied_message_id)?;
    let sender_id = user.id;

    let message = state
        .store
        .run(move |db| {
            if !db.user_exists(other)? {
                return Err(StoreError::NotFound);
            }
            // A reply can only point into history that already exists.
            if let Some(reply) = req.replied_message_id {
                let existing = match db.find_private_between(sender_id, other) {
                    Ok(conversation) => conversation,
                    Err(StoreError::NotFound) => return Ok(None),
                    Err(e) => return Err(e),
                };
                if !db.message_belongs_to_conversation(reply, existing.id, ConversationType::Private)? {
                    return Ok(None);
                }
            }

            let conversation = db.create_private_between(sender_id, other)?;
            db.insert_message(&NewMessage {
                conversation_id: conversation.id,
                sender_id,
                kind,
                content: req.content,
                replied_message_id: req.replied_message_id,
            })
            .map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::field("replied_message_id", REPLY_NOT_IN_CONVERSATION))?;

    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}

/// GET /conversations/group/{group_id}/messages
///
/// Only members may read; everyone else sees 404.
pub async fn list_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let group_id = path_id(path, "group_id")?;
    let filters = page_filters(query, GROUP_MESSAGE_SORT)?;

    let (messages, metadata) = state
        .store
        .run(move |db| {
            if !db.participant_exists(user.id, group_id, ConversationType::Group)? {
                return Err(StoreError::NotFound);
            }
            db.list_group_messages(group_id, &filters)
        })
        .await?;

    Ok(Json(GroupMessagesResponse { messages, metadata }))
}

/// POST /conversations/group/{group_id}/messages
pub async fn send_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let group_id = path_id(path, "group_id")?;
    let Json(req) = payload?;

    let new = validate_message(MessageDraft {
        conversation_id: group_id,
        sender_id: user.id,
        kind: req.kind,
        content: req.content,
        replied_message_id: req.replied_message_id,
    })?;

    let message = state
        .store
        .run(move |db| {
            if !db.participant_exists(new.sender_id, new.conversation_id, ConversationType::Group)? {
                return Err(StoreError::NotFound);
            }
            if let Some(reply) = new.replied_message_id {
                if !db.message_belongs_to_conversation(reply, new.conversation_id, ConversationType::Group)? {
                    return Ok(None);
                }
            }
            db.insert_message(&new).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::field("replied_message_id", REPLY_NOT_IN_CONVERSATION))?;

    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}
