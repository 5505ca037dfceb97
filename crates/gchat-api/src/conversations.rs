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
use gchat_types::api::{
    AddParticipantRequest, ConversationListResponse, ConversationResponse, CreateGroupRequest,
    PageQuery, ParticipantResponse,
};
use gchat_types::models::{ConversationType, User};
use gchat_types::pagination::Filters;
use gchat_types::validator::{ValidationErrors, validate_group_name};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Page parameters from the query string, checked before any store access.
pub(crate) fn page_filters(
    query: Result<Query<PageQuery>, QueryRejection>,
    sort_safe_list: &'static [&'static str],
) -> ApiResult<Filters> {
    let Query(query) = query?;
    let filters = Filters::new(query.page, query.page_size).with_sort(query.sort, sort_safe_list);

    let mut v = ValidationErrors::new();
    filters.validate(&mut v);
    v.into_result()?;
    Ok(filters)
}

/// A UUID path segment; malformed values are a field error on `key`.
pub(crate) fn path_id(path: Result<Path<Uuid>, PathRejection>, key: &str) -> ApiResult<Uuid> {
    path.map(|Path(id)| id)
        .map_err(|_| ApiError::field(key, "must be a valid uuid"))
}

/// GET /conversations
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let filters = page_filters(query, &[])?;

    let (conversations, metadata) = state
        .store
        .run(move |db| db.list_conversations_with_preview(user.id, &filters))
        .await?;

    Ok(Json(ConversationListResponse {
        conversations,
        metadata,
    }))
}

/// POST /conversations/group
pub async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    payload: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;

    let mut v = ValidationErrors::new();
    validate_group_name(&mut v, &req.name);
    v.into_result()?;

    let name = req.name.trim().to_string();
    let conversation = state
        .store
        .run(move |db| db.create_group(user.id, &name))
        .await?;

    Ok((StatusCode::CREATED, Json(ConversationResponse { conversation })))
}

/// POST /conversations/group/{group_id}/participants
///
/// Non-members get 404 so a group's existence is not confirmed to them;
/// members who are not the owner get 403.
pub async fn add_participant(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AddParticipantRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let group_id = path_id(path, "group_id")?;
    let Json(req) = payload?;
    let new_member = req.user_id;

    let group = state
        .store
        .run(move |db| {
            if !db.participant_exists(user.id, group_id, ConversationType::Group)? {
                return Err(StoreError::NotFound);
            }
            db.get_conversation(group_id, ConversationType::Group)
        })
        .await?;

    if group.owner_id != Some(user.id) {
        return Err(ApiError::Forbidden(
            "only the group owner can add participants",
        ));
    }

    state
        .store
        .run(move |db| db.add_participant(group_id, new_member))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ParticipantResponse {
            conversation_id: group_id,
            user_id: new_member,
        }),
    ))
}
