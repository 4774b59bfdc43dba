use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::{decode_cursor, effective_limit, paginate, ApiError, Cursor};
use super::validation::{validate_body, validate_subject};
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::events::{Event, ESCALATION_CREATED, ESCALATION_RESPONDED};
use crate::types::{Escalation, EscalationStatus};

pub const DEFAULT_EXPIRY_HOURS: i64 = 72;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub workspace_id: String,
    pub subject: String,
    pub situation: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
    #[serde(default)]
    pub member_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub escalation_id: String,
    pub status: &'static str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn create(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    identity.require_writer()?;
    validate_subject(&req.subject)?;
    validate_body(&req.situation)?;
    let expires_in = req.expires_in_hours.unwrap_or(DEFAULT_EXPIRY_HOURS);
    if expires_in <= 0 || expires_in > 24 * 30 {
        return Err(ApiError::bad_request(
            "expires_in_hours must be between 1 and 720",
        ));
    }
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let now = Utc::now();
    let escalation = Escalation {
        id: Uuid::new_v4().to_string(),
        project_id: identity.project_id().to_string(),
        workspace_id: workspace.workspace_id.clone(),
        alias: workspace.alias.clone(),
        member_email: req.member_email.clone(),
        subject: req.subject.clone(),
        situation: req.situation.clone(),
        options: req.options.clone(),
        status: EscalationStatus::Pending,
        response: None,
        response_note: None,
        created_at: now,
        responded_at: None,
        expires_at: now + Duration::hours(expires_in),
    };
    state
        .store
        .create_escalation(&escalation)
        .map_err(ApiError::from)?;

    state.events.publish(
        Event::new(
            ESCALATION_CREATED,
            identity.project_id(),
            &workspace.workspace_id,
        )
        .slug(&identity.project.slug)
        .with("escalation_id", escalation.id.clone())
        .with("alias", workspace.alias.clone())
        .with("subject", escalation.subject.clone()),
    );
    if let Err(e) = state.store.append_audit(
        identity.project_id(),
        Some(&workspace.workspace_id),
        "escalation_created",
        &serde_json::json!({"escalation_id": escalation.id, "subject": escalation.subject}),
        now,
    ) {
        tracing::warn!("failed to audit escalation create: {e}");
    }

    Ok(Json(CreateResponse {
        escalation_id: escalation.id,
        status: escalation.status.as_str(),
        created_at: escalation.created_at,
        expires_at: escalation.expires_at,
    }))
}

fn redact_escalation(mut escalation: Escalation, redact: bool) -> Escalation {
    if redact {
        escalation.member_email = None;
    }
    escalation
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub escalations: Vec<Escalation>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(
            EscalationStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid status: {raw}")))?,
        ),
        None => None,
    };
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

    let escalations = state
        .store
        .list_escalations(identity.project_id(), status, limit + 1, before, Utc::now())
        .map_err(ApiError::from)?;

    let redact = identity.public_reader;
    let (page, next_cursor, has_more) = paginate(escalations, limit, |e| Cursor {
        k: e.created_at.to_rfc3339(),
        id: e.id.clone(),
    });

    Ok(Json(ListResponse {
        escalations: page
            .into_iter()
            .map(|e| redact_escalation(e, redact))
            .collect(),
        has_more,
        next_cursor,
    }))
}

pub async fn get_escalation(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Escalation>, ApiError> {
    let escalation = state
        .store
        .get_escalation(identity.project_id(), &id, Utc::now())
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Escalation not found"))?;
    Ok(Json(redact_escalation(escalation, identity.public_reader)))
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub response: String,
    #[serde(default)]
    pub response_note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub escalation_id: String,
    pub status: &'static str,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_note: Option<String>,
    pub responded_at: DateTime<Utc>,
}

pub async fn respond(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, ApiError> {
    identity.require_writer()?;
    if req.response.trim().is_empty() {
        return Err(ApiError::bad_request("response cannot be empty"));
    }

    let was_pending = state
        .store
        .get_escalation(identity.project_id(), &id, Utc::now())
        .map_err(ApiError::from)?
        .map(|e| e.status == EscalationStatus::Pending)
        .unwrap_or(false);

    let escalation = state
        .store
        .respond_escalation(
            identity.project_id(),
            &id,
            req.response.trim(),
            req.response_note.as_deref(),
            Utc::now(),
        )
        .map_err(ApiError::from)?;

    // Repeat responses are no-ops; only the transition publishes.
    if was_pending {
        state.events.publish(
            Event::new(
                ESCALATION_RESPONDED,
                identity.project_id(),
                &escalation.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("escalation_id", escalation.id.clone())
            .with("response", escalation.response.clone().unwrap_or_default()),
        );
        if let Err(e) = state.store.append_audit(
            identity.project_id(),
            Some(&escalation.workspace_id),
            "escalation_responded",
            &serde_json::json!({"escalation_id": escalation.id}),
            Utc::now(),
        ) {
            tracing::warn!("failed to audit escalation response: {e}");
        }
    }

    Ok(Json(RespondResponse {
        escalation_id: escalation.id,
        status: escalation.status.as_str(),
        response: escalation.response.unwrap_or_default(),
        response_note: escalation.response_note,
        responded_at: escalation.responded_at.unwrap_or_else(Utc::now),
    }))
}
