//! HTTP request handlers

use super::types::{
    ConversationListResponse, ConversationResponse, ConversationWithMessagesResponse,
    CreateConversationRequest, ErrorResponse, LastSeenResponse, MessageSentResponse, MessagesQuery,
    MessagesResponse, OnlineResponse, RespondRequest, RespondResponse, SendMessageRequest,
    StatusRequest, SuggestedPriceResponse, UnreadCountResponse,
};
use super::ws::connect_socket;
use super::AppState;
use crate::db::{ItemRef, ParticipantId};
use crate::engine::MessageTarget;
use crate::error::{ChatError, ErrorKind};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Header carrying the caller's participant id
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Conversations
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/:id", get(get_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", post(mark_read))
        .route("/api/conversations/:id/online", get(list_online))
        // Proposals
        .route("/api/messages/:id/respond", post(respond_to_offer))
        // Participant
        .route("/api/unread-count", get(unread_count))
        .route("/api/status", post(set_status))
        .route("/api/participants/:id/last-seen", get(last_seen))
        .route("/api/items/:item/suggested-price", get(suggested_price))
        // Realtime
        .route("/ws", get(connect_socket))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Caller identity
// ============================================================

/// The authenticated participant, taken from `x-participant-id`.
/// Authentication itself happens upstream.
pub struct CurrentParticipant(pub ParticipantId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentParticipant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(format!("missing {PARTICIPANT_HEADER} header")))?;
        ParticipantId::parse(raw)
            .map(Self)
            .map_err(|e| AppError::Unauthorized(e.to_string()))
    }
}

// ============================================================
// Conversations
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state.engine.list_conversations(&me)?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn create_conversation(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state
        .engine
        .get_or_create(&me, &req.peer_id, req.item_ref.as_ref())
        .await?;
    Ok(Json(ConversationResponse { conversation }))
}

async fn get_conversation(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessagesResponse>, AppError> {
    let (conversation, messages) = state.engine.conversation_with_messages(&id, &me)?;
    Ok(Json(ConversationWithMessagesResponse {
        conversation,
        messages,
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, AppError> {
    let messages = state
        .engine
        .list_messages(&id, &me, query.after, query.limit)?;
    Ok(Json(MessagesResponse { messages }))
}

async fn send_message(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessageSentResponse>, AppError> {
    let content = req.draft.into_content()?;
    let appended = state
        .engine
        .send_message(&me, MessageTarget::Conversation(id), content)
        .await?;
    Ok(Json(MessageSentResponse {
        conversation: appended.conversation,
        message: appended.message,
    }))
}

async fn mark_read(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.mark_read(&id, &me)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_online(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(id): Path<String>,
) -> Result<Json<OnlineResponse>, AppError> {
    let participants = state.engine.list_online(&id, &me)?;
    Ok(Json(OnlineResponse {
        conversation_id: id,
        participants,
    }))
}

// ============================================================
// Proposals
// ============================================================

async fn respond_to_offer(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Path(offer_id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, AppError> {
    let responded = state
        .engine
        .respond_to_offer(&me, &offer_id, req.action, req.counter_price)?;
    Ok(Json(RespondResponse {
        conversation: responded.conversation,
        offer_id: responded.offer_id,
        action: responded.action,
        messages: responded.messages,
    }))
}

// ============================================================
// Participant
// ============================================================

async fn unread_count(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
) -> Result<Json<UnreadCountResponse>, AppError> {
    let unread_count = state.engine.unread_count(&me)?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn last_seen(
    State(state): State<AppState>,
    Path(participant): Path<String>,
) -> Result<Json<LastSeenResponse>, AppError> {
    let participant_id = ParticipantId::parse(&participant).map_err(ChatError::from)?;
    let last_seen = state.engine.last_seen(&participant_id)?;
    Ok(Json(LastSeenResponse {
        participant_id,
        last_seen,
    }))
}

async fn set_status(
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
    Json(req): Json<StatusRequest>,
) -> Result<Json<LastSeenResponse>, AppError> {
    let last_seen = state.engine.set_status(&me, req.online)?;
    Ok(Json(LastSeenResponse {
        participant_id: me,
        last_seen: Some(last_seen),
    }))
}

async fn suggested_price(
    State(state): State<AppState>,
    Path(item): Path<String>,
) -> Result<Json<SuggestedPriceResponse>, AppError> {
    let item_ref = ItemRef::parse(&item).map_err(ChatError::from)?;
    let suggested_price = state.engine.suggest_price(&item_ref).await;
    Ok(Json(SuggestedPriceResponse {
        item_ref,
        suggested_price,
    }))
}

async fn get_version() -> &'static str {
    concat!("barter-chat ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

pub enum AppError {
    Unauthorized(String),
    Chat(ChatError),
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        Self::Chat(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::ConversationNotFound | ErrorKind::MessageNotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidMessage => StatusCode::BAD_REQUEST,
        ErrorKind::SelfResponseNotAllowed
        | ErrorKind::OfferExpired
        | ErrorKind::OfferAlreadyResolved
        | ErrorKind::OfferSuperseded
        | ErrorKind::ConversationFinalized => StatusCode::CONFLICT,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ErrorResponse::new(msg)),
            AppError::Chat(e) => {
                let kind = e.kind();
                if kind == ErrorKind::InternalError {
                    tracing::error!(error = %e, "Request failed");
                }
                (status_for(kind), ErrorResponse::new(e.to_string()).with_kind(kind))
            }
        };
        (status, Json(body)).into_response()
    }
}
