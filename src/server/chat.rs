//! Chat sessions: persistent participant-set conversations with
//! send-and-wait semantics.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::ApiError;
use super::validation::{validate_alias, validate_body};
use super::AppState;
use crate::auth::{verify_workspace_access, AuthIdentity, RequireIdentity};
use crate::ephemeral::{
    WaitRelease, CONVERSATION_WAIT_SECONDS, DEFAULT_WAIT_SECONDS, MAX_WAIT_SECONDS,
};
use crate::events::{Event, CHAT_MESSAGE_SENT};
use crate::types::{ChatMessage, ChatParticipant, ChatSession, Workspace, WorkspaceKind};

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub workspace_id: String,
    pub to_aliases: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub start_conversation: bool,
    /// Seconds to block for a reply. 0 returns immediately; omitted uses
    /// the defaults (300 for start-conversation, 60 otherwise).
    #[serde(default)]
    pub wait_seconds: Option<i64>,
    #[serde(default)]
    pub leaving: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionMessageResponse {
    pub session_id: String,
    pub message_id: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<WaitRelease>,
    pub waited: bool,
    pub sse_url: String,
}

fn wait_deadline(
    wait_seconds: Option<i64>,
    start_conversation: bool,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let default = if start_conversation {
        CONVERSATION_WAIT_SECONDS
    } else {
        DEFAULT_WAIT_SECONDS
    };
    let seconds = wait_seconds.unwrap_or(default);
    if seconds < 0 || seconds > MAX_WAIT_SECONDS {
        return Err(ApiError::bad_request(format!(
            "wait_seconds must be between 0 and {MAX_WAIT_SECONDS}"
        )));
    }
    Ok((seconds > 0).then(|| now + Duration::seconds(seconds)))
}

async fn await_release(
    state: &AppState,
    session_id: &str,
    workspace_id: &str,
    deadline: DateTime<Utc>,
) -> Option<WaitRelease> {
    let (mut rx, guard) = state
        .ephemeral
        .waits
        .register(session_id, workspace_id, deadline);
    loop {
        let current = *guard.deadline.lock().expect("wait deadline lock");
        let now = Utc::now();
        if current <= now {
            return None;
        }
        let sleep_for = (current - now).to_std().unwrap_or_default();
        tokio::select! {
            released = &mut rx => return released.ok(),
            // The deadline may have been extended while sleeping; loop and
            // re-check before giving up.
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

fn record_message(
    state: &AppState,
    identity: &AuthIdentity,
    session: &ChatSession,
    sender: &Workspace,
    sender_alias: &str,
    body: &str,
    leaving: bool,
) -> Result<ChatMessage, ApiError> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        project_id: identity.project_id().to_string(),
        from_workspace_id: sender.workspace_id.clone(),
        from_alias: sender_alias.to_string(),
        body: body.to_string(),
        leaving,
        created_at: Utc::now(),
    };
    state
        .store
        .insert_chat_message(&message)
        .map_err(ApiError::from)?;

    let to_aliases: Vec<String> = session
        .participants
        .iter()
        .filter(|p| p.workspace_id != sender.workspace_id)
        .map(|p| p.alias.clone())
        .collect();
    let preview: String = body.chars().take(120).collect();
    state.events.publish(
        Event::new(
            CHAT_MESSAGE_SENT,
            identity.project_id(),
            &sender.workspace_id,
        )
        .slug(&identity.project.slug)
        .with("session_id", session.id.clone())
        .with("message_id", message.id.clone())
        .with("from_alias", sender_alias)
        .with("to_aliases", to_aliases)
        .with("preview", preview)
        .with("leaving", leaving),
    );

    // Any message (or leave) from this sender releases the other
    // participants' waits.
    state.ephemeral.waits.signal(
        &session.id,
        &sender.workspace_id,
        WaitRelease {
            message_id: Some(message.id.clone()),
            from_alias: sender_alias.to_string(),
            body: Some(body.to_string()),
            leaving,
        },
    );

    Ok(message)
}

fn delivered_now(state: &AppState, session_id: &str, sender_workspace_id: &str, project_id: &str) -> bool {
    state.ephemeral.waits.has_waiter(session_id, sender_workspace_id)
        || state.events.has_subscribers(project_id)
}

fn sse_url(project_slug: &str) -> String {
    format!("/v1/status/stream?project_slug={project_slug}&event_types=chat")
}

pub async fn start_session(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<SessionMessageResponse>, ApiError> {
    identity.require_writer()?;
    validate_body(&req.message)?;
    if req.to_aliases.is_empty() {
        return Err(ApiError::bad_request("to_aliases cannot be empty"));
    }
    for alias in &req.to_aliases {
        validate_alias(alias)?;
    }
    let sender = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&sender, &identity.project.slug);

    let mut participants = vec![ChatParticipant {
        workspace_id: sender.workspace_id.clone(),
        alias: sender.alias.clone(),
    }];
    for alias in &req.to_aliases {
        let ws = state
            .store
            .get_workspace_by_alias(identity.project_id(), alias)
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found(format!("No workspace with alias '{alias}'")))?;
        if ws.workspace_id != sender.workspace_id {
            participants.push(ChatParticipant {
                workspace_id: ws.workspace_id,
                alias: ws.alias,
            });
        }
    }
    if participants.len() < 2 {
        return Err(ApiError::bad_request("chat needs at least two participants"));
    }

    let now = Utc::now();
    let (session, _created) = state
        .store
        .get_or_create_chat_session(identity.project_id(), &participants, now)
        .map_err(ApiError::from)?;

    // Sampled before the send releases any waits: delivered means someone
    // was observing when the message landed.
    let delivered = delivered_now(&state, &session.id, &sender.workspace_id, identity.project_id());
    let message = record_message(
        &state,
        &identity,
        &session,
        &sender,
        &sender.alias,
        &req.message,
        req.leaving,
    )?;

    let deadline = wait_deadline(req.wait_seconds, req.start_conversation, now)?;

    let (reply, waited) = match deadline {
        Some(deadline) if !req.leaving => {
            let reply = await_release(&state, &session.id, &sender.workspace_id, deadline).await;
            (reply, true)
        }
        _ => (None, false),
    };

    Ok(Json(SessionMessageResponse {
        session_id: session.id,
        message_id: message.id,
        delivered,
        reply,
        waited,
        sse_url: sse_url(&identity.project.slug),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub workspace_id: String,
    pub body: String,
    #[serde(default)]
    pub leaving: bool,
    #[serde(default)]
    pub wait_seconds: Option<i64>,
    #[serde(default)]
    pub start_conversation: bool,
}

fn require_participant<'a>(
    session: &'a ChatSession,
    workspace_id: &str,
) -> Result<&'a ChatParticipant, ApiError> {
    session
        .participants
        .iter()
        .find(|p| p.workspace_id == workspace_id)
        .ok_or_else(|| ApiError::forbidden("workspace is not a participant in this session"))
}

pub async fn send_message(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SessionMessageResponse>, ApiError> {
    identity.require_writer()?;
    validate_body(&req.body)?;
    let sender = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&sender, &identity.project.slug);

    let session = state
        .store
        .get_chat_session(identity.project_id(), &session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Chat session not found"))?;
    let participant = require_participant(&session, &sender.workspace_id)?;
    let sender_alias = participant.alias.clone();

    let now = Utc::now();
    // Sampled before the send releases any waits: delivered means someone
    // was observing when the message landed.
    let delivered = delivered_now(&state, &session.id, &sender.workspace_id, identity.project_id());
    let message = record_message(
        &state,
        &identity,
        &session,
        &sender,
        &sender_alias,
        &req.body,
        req.leaving,
    )?;

    let deadline = wait_deadline(req.wait_seconds, req.start_conversation, now)?;

    let (reply, waited) = match deadline {
        Some(deadline) if !req.leaving => {
            let reply = await_release(&state, &session.id, &sender.workspace_id, deadline).await;
            (reply, true)
        }
        _ => (None, false),
    };

    Ok(Json(SessionMessageResponse {
        session_id: session.id,
        message_id: message.id,
        delivered,
        reply,
        waited,
        sse_url: sse_url(&identity.project.slug),
    }))
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<ChatSession>,
    pub count: usize,
}

pub async fn list_sessions(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    let sessions = state
        .store
        .list_chat_sessions(identity.project_id(), Some(&workspace.workspace_id))
        .map_err(ApiError::from)?;
    Ok(Json(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

pub async fn history(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    let session = state
        .store
        .get_chat_session(identity.project_id(), &session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Chat session not found"))?;
    require_participant(&session, &workspace.workspace_id)?;

    let messages = state
        .store
        .list_chat_messages(identity.project_id(), &session_id)
        .map_err(ApiError::from)?;
    Ok(Json(HistoryResponse {
        session_id,
        messages,
    }))
}

#[derive(Debug, Serialize)]
pub struct PendingSession {
    pub session_id: String,
    pub participants: Vec<ChatParticipant>,
    pub waiting_messages: i64,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub sessions: Vec<PendingSession>,
    pub count: usize,
}

pub async fn pending(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    let pending = state
        .store
        .list_pending_chat(identity.project_id(), &workspace.workspace_id)
        .map_err(ApiError::from)?;
    let sessions: Vec<PendingSession> = pending
        .into_iter()
        .map(|(session, waiting_messages)| PendingSession {
            session_id: session.id,
            participants: session.participants,
            waiting_messages,
        })
        .collect();
    Ok(Json(PendingResponse {
        count: sessions.len(),
        sessions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExtendWaitRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub extend_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExtendWaitResponse {
    pub session_id: String,
    pub deadline: DateTime<Utc>,
}

pub async fn extend_wait(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ExtendWaitRequest>,
) -> Result<Json<ExtendWaitResponse>, ApiError> {
    identity.require_writer()?;
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;

    let seconds = req.extend_seconds.unwrap_or(DEFAULT_WAIT_SECONDS);
    if seconds <= 0 || seconds > MAX_WAIT_SECONDS {
        return Err(ApiError::bad_request(format!(
            "extend_seconds must be between 1 and {MAX_WAIT_SECONDS}"
        )));
    }
    let requested = Utc::now() + Duration::seconds(seconds);
    let deadline = state
        .ephemeral
        .waits
        .extend(&session_id, &workspace.workspace_id, requested)
        .ok_or_else(|| ApiError::not_found("No active wait for this session"))?;

    Ok(Json(ExtendWaitResponse {
        session_id,
        deadline,
    }))
}

fn require_dashboard(workspace: &Workspace) -> Result<(), ApiError> {
    if workspace.kind != WorkspaceKind::Dashboard {
        return Err(ApiError::forbidden(
            "admin chat endpoints require a dashboard workspace",
        ));
    }
    Ok(())
}

pub async fn admin_list_sessions(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    require_dashboard(&workspace)?;
    let sessions = state
        .store
        .list_chat_sessions(identity.project_id(), None)
        .map_err(ApiError::from)?;
    Ok(Json(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AdminJoinRequest {
    pub workspace_id: String,
}

pub async fn admin_join(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<AdminJoinRequest>,
) -> Result<Json<ChatSession>, ApiError> {
    identity.require_writer()?;
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    require_dashboard(&workspace)?;

    let session = state
        .store
        .add_chat_participant(
            identity.project_id(),
            &session_id,
            &ChatParticipant {
                workspace_id: workspace.workspace_id.clone(),
                alias: workspace.alias.clone(),
            },
            Utc::now(),
        )
        .map_err(ApiError::from)?;
    Ok(Json(session))
}

pub async fn admin_history(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    require_dashboard(&workspace)?;
    if state
        .store
        .get_chat_session(identity.project_id(), &session_id)
        .map_err(ApiError::from)?
        .is_none()
    {
        return Err(ApiError::not_found("Chat session not found"));
    }
    let messages = state
        .store
        .list_chat_messages(identity.project_id(), &session_id)
        .map_err(ApiError::from)?;
    Ok(Json(HistoryResponse {
        session_id,
        messages,
    }))
}
