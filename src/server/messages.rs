use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::{decode_cursor, effective_limit, paginate, ApiError, Cursor};
use super::validation::{validate_body, validate_subject};
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::events::{Event, MESSAGE_ACKNOWLEDGED, MESSAGE_DELIVERED};
use crate::types::{MailPriority, Message};

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub workspace_id: String,
    pub to_alias: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Option<MailPriority>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message_id: String,
    pub to_alias: String,
    pub created_at: DateTime<Utc>,
}

pub async fn send(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    identity.require_writer()?;
    validate_subject(&req.subject)?;
    validate_body(&req.body)?;
    let sender = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&sender, &identity.project.slug);

    let recipient = state
        .store
        .get_workspace_by_alias(identity.project_id(), &req.to_alias)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("No workspace with alias '{}'", req.to_alias)))?;

    let message = Message {
        id: Uuid::new_v4().to_string(),
        project_id: identity.project_id().to_string(),
        from_workspace_id: sender.workspace_id.clone(),
        from_alias: sender.alias.clone(),
        to_workspace_id: recipient.workspace_id.clone(),
        to_alias: recipient.alias.clone(),
        subject: req.subject.clone(),
        body: req.body.clone(),
        priority: req.priority.unwrap_or(MailPriority::Normal),
        thread_id: req.thread_id.clone(),
        read: false,
        read_by: None,
        read_at: None,
        created_at: Utc::now(),
    };
    state.store.create_message(&message).map_err(ApiError::from)?;

    state.events.publish(
        Event::new(
            MESSAGE_DELIVERED,
            identity.project_id(),
            &recipient.workspace_id,
        )
        .slug(&identity.project.slug)
        .with("message_id", message.id.clone())
        .with("from_workspace", sender.workspace_id.clone())
        .with("from_alias", sender.alias.clone())
        .with("to_alias", recipient.alias.clone())
        .with("subject", message.subject.clone())
        .with("priority", message.priority.as_str()),
    );

    Ok(Json(SendResponse {
        message_id: message.id,
        to_alias: recipient.alias,
        created_at: message.created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    pub workspace_id: String,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub messages: Vec<Message>,
    pub unread: i64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn inbox(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<InboxResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    let limit = effective_limit(query.limit);
    let before = match &query.cursor {
        Some(raw) => {
            let cursor = decode_cursor(raw)?;
            let ts = DateTime::parse_from_rfc3339(&cursor.k)
                .map_err(|_| ApiError::bad_request("Invalid cursor timestamp"))?
                .with_timezone(&Utc);
            Some((ts, cursor.id))
        }
        None => None,
    };

    let messages = state
        .store
        .list_inbox(
            identity.project_id(),
            &workspace.workspace_id,
            limit + 1,
            query.unread_only,
            before,
        )
        .map_err(ApiError::from)?;
    let unread = state
        .store
        .count_unread(identity.project_id(), &workspace.workspace_id)
        .map_err(ApiError::from)?;

    let (page, next_cursor, has_more) = paginate(messages, limit, |m| Cursor {
        k: m.created_at.to_rfc3339(),
        id: m.id.clone(),
    });

    Ok(Json(InboxResponse {
        messages: page,
        unread,
        has_more,
        next_cursor,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub workspace_id: String,
}

pub async fn ack(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AckRequest>,
) -> Result<Json<Message>, ApiError> {
    identity.require_writer()?;
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let already_read = state
        .store
        .get_message(identity.project_id(), &id)
        .map_err(ApiError::from)?
        .map(|m| m.read)
        .unwrap_or(false);

    let message = state
        .store
        .ack_message(identity.project_id(), &id, &workspace.workspace_id, Utc::now())
        .map_err(ApiError::from)?;

    // Only the first ack publishes; repeats are silent no-ops.
    if !already_read {
        state.events.publish(
            Event::new(
                MESSAGE_ACKNOWLEDGED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("message_id", message.id.clone())
            .with("from_alias", message.from_alias.clone())
            .with("subject", message.subject.clone()),
        );
    }

    Ok(Json(message))
}
