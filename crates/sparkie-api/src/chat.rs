use std::convert::Infallible;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::info;

use sparkie_db::models::parse_timestamp;
use sparkie_types::api::{ChatRequest, ChatResponse, ConversationResponse, MessageResponse};

use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::relay::Turn;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// Buffered turn: the reply comes back in one JSON body.
pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    req.validate().map_err(ApiError::Validation)?;

    let (conversation_id, message) = state
        .relay
        .complete(&user.caller(), Turn::from(req))
        .await
        .map_err(|e| state.relay_error(e))?;

    Ok(Json(ChatResponse {
        conversation_id,
        message,
    }))
}

/// Streaming turn over server-sent events. Each event carries one JSON
/// `StreamFrame`.
pub async fn chat_stream(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    req.validate().map_err(ApiError::Validation)?;
    if !req.stream {
        return Err(ApiError::BadRequest("Use /api/v1/chat for non-streaming requests".into()));
    }

    let frames = state
        .relay
        .stream(&user.caller(), Turn::from(req))
        .await
        .map_err(|e| state.relay_error(e))?;

    let events = frames.map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<ConversationResponse>>, ApiError> {
    if !(1..=100).contains(&query.limit) {
        return Err(ApiError::Validation("limit must be between 1 and 100".into()));
    }

    let user_id = user.id;
    let rows = state
        .with_db(move |db| db.list_conversations(user_id, query.limit, query.offset))
        .await?;

    let conversations = rows
        .into_iter()
        .map(|row| ConversationResponse {
            id: row.id,
            title: row.title,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            message_count: row.message_count,
        })
        .collect();

    Ok(Json(conversations))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let user_id = user.id;
    let rows = state
        .with_db(move |db| match db.get_conversation(conversation_id)? {
            Some(c) if c.user_id == user_id => db.get_messages(conversation_id).map(Some),
            _ => Ok(None),
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;

    let messages = rows
        .into_iter()
        .map(|row| MessageResponse {
            id: row.id,
            conversation_id: row.conversation_id,
            role: row.role,
            content: row.content,
            created_at: parse_timestamp(&row.created_at),
        })
        .collect();

    Ok(Json(messages))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user_id = user.id;
    let deleted = state
        .with_db(move |db| db.delete_conversation(conversation_id, user_id))
        .await?;

    if !deleted {
        return Err(ApiError::NotFound("Conversation not found".into()));
    }

    info!(conversation_id, user_id, "Deleted conversation");
    Ok(StatusCode::NO_CONTENT)
}
