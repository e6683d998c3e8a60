//! Request/response REST surface (spec.md §6).

use super::dto::{
    ConversationDto, CreateConversationRequest, HistoryQuery, ListConversationsQuery, ListMessagesQuery, MessageDto,
    MessagesPageDto, ModelsResponse, UpdateConversationRequest,
};
use super::hub::GroupEvent;
use super::AppState;
use crate::auth::{AuthenticatedUser, InternalServiceCaller};
use crate::domain::MessageRole;
use crate::error::{AppError, AppResult};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

pub async fn list_conversations(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Query(params): Query<ListConversationsQuery>,
) -> AppResult<Response> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(50);
    let page_result = state
        .store
        .list_conversations(&user, page, page_size, params.q.as_deref())
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert("X-Total-Count", header_value(page_result.total_count));
    headers.insert("X-Page-Number", header_value(page_result.page));
    headers.insert("X-Page-Size", header_value(page_result.page_size));
    headers.insert("X-Total-Pages", header_value(page_result.total_pages));
    if let Some(link) = pagination_link_header(&params, page_result.page, page_result.total_pages) {
        headers.insert(axum::http::header::LINK, link);
    }

    let items: Vec<ConversationDto> = page_result.items.into_iter().map(Into::into).collect();
    Ok((headers, Json(items)).into_response())
}

fn header_value(n: impl std::fmt::Display) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// RFC-5988 `Link` relations for `first`/`last`/`prev`/`next`.
fn pagination_link_header(params: &ListConversationsQuery, page: u32, total_pages: u32) -> Option<HeaderValue> {
    let base_query = params
        .q
        .as_ref()
        .map(|q| format!("&q={}", urlencode(q)))
        .unwrap_or_default();
    let page_size = params.page_size.unwrap_or(50);
    let link_for = |p: u32| format!("</conversations?page={p}&pageSize={page_size}{base_query}>");

    let mut rels = vec![
        format!("{}; rel=\"first\"", link_for(1)),
        format!("{}; rel=\"last\"", link_for(total_pages.max(1))),
    ];
    if page > 1 {
        rels.push(format!("{}; rel=\"prev\"", link_for(page - 1)));
    }
    if page < total_pages {
        rels.push(format!("{}; rel=\"next\"", link_for(page + 1)));
    }
    HeaderValue::from_str(&rels.join(", ")).ok()
}

fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

pub async fn get_conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<ConversationDto>> {
    let conversation = state.store.get_conversation(&id).await?;
    if !conversation.is_owned_by(&user) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(conversation.into()))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(body): Json<CreateConversationRequest>,
) -> AppResult<Response> {
    let conversation = state.store.create_conversation(&user, &body.title).await?;
    Ok((StatusCode::CREATED, Json::<ConversationDto>(conversation.into())).into_response())
}

pub async fn update_conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateConversationRequest>,
) -> AppResult<Json<ConversationDto>> {
    let conversation = state.store.update_conversation_title(&id, &body.title, &user).await?;
    Ok(Json(conversation.into()))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.store.delete_conversation(&id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Path(id): Path<String>,
    Query(params): Query<ListMessagesQuery>,
) -> AppResult<Json<MessagesPageDto>> {
    let limit = params.limit.unwrap_or(crate::validation::PAGE_SIZE_DEFAULT);
    let page = state
        .store
        .list_messages(&id, params.cursor.as_deref(), limit, &user)
        .await?;
    Ok(Json(MessagesPageDto {
        items: page.items.into_iter().map(Into::into).collect(),
        next_cursor: page.next_cursor,
    }))
}

/// `InternalService`-only: the orchestrator's alternative delivery path to
/// the bus (spec.md §6, §9 "both are acceptable").
pub async fn agent_response(
    State(state): State<AppState>,
    _caller: InternalServiceCaller,
    Path(id): Path<String>,
    Json(body): Json<crate::bus::AgentResponse>,
) -> AppResult<StatusCode> {
    let message = state
        .store
        .append_message(&id, None, &body.content, MessageRole::Assistant, body.is_error)
        .await?;

    state
        .hub
        .broadcast_to_conversation(&id, GroupEvent::all(super::dto::ServerMessage::ReceiveMessage { message: message.into() }));
    state
        .hub
        .broadcast_to_conversation(&id, GroupEvent::all(super::dto::ServerMessage::AgentTyping { is_typing: false }));

    Ok(StatusCode::ACCEPTED)
}

/// `InternalService`-only: context fetch for the orchestration worker.
pub async fn messages_history(
    State(state): State<AppState>,
    _caller: InternalServiceCaller,
    Path(id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> AppResult<Json<Vec<MessageDto>>> {
    let limit = params.limit.unwrap_or(crate::validation::PAGE_SIZE_DEFAULT);
    let items = state.store.list_messages_for_service(&id, limit).await?;
    Ok(Json(items.into_iter().map(Into::into).collect()))
}

pub async fn list_models(State(state): State<AppState>, _user: AuthenticatedUser) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.llm_registry.available_model_info(),
        default: state.llm_registry.default_model_id().to_string(),
    })
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    match state.store.get_conversation("__readyz_probe__").await {
        Err(AppError::NotFound(_)) | Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
