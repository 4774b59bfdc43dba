use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::response::ApiError;
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::policy::{get_or_bootstrap_active, policy_etag};
use crate::types::{Policy, PolicyBundle};

#[derive(Debug, Serialize)]
pub struct PolicyView {
    pub policy_id: String,
    pub project_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub bundle: PolicyBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_role: Option<SelectedRole>,
}

#[derive(Debug, Serialize)]
pub struct SelectedRole {
    pub role: String,
    pub title: String,
    pub playbook_md: String,
}

fn render(policy: Policy, role: Option<&str>, only_selected: bool) -> Result<PolicyView, ApiError> {
    let selected_role = match role {
        Some(role) => {
            let playbook = policy.bundle.roles.get(role).ok_or_else(|| {
                let available: Vec<&String> = policy.bundle.roles.keys().collect();
                ApiError::bad_request(format!(
                    "Role '{role}' not found. Available roles: {available:?}"
                ))
            })?;
            Some(SelectedRole {
                role: role.to_string(),
                title: playbook.title.clone(),
                playbook_md: playbook.playbook_md.clone(),
            })
        }
        None => None,
    };
    if only_selected && role.is_none() {
        return Err(ApiError::bad_request(
            "only_selected=true requires a role parameter",
        ));
    }

    let mut bundle = policy.bundle;
    if only_selected {
        let role = role.expect("validated above");
        bundle.roles.retain(|key, _| key == role);
    }

    Ok(PolicyView {
        policy_id: policy.policy_id,
        project_id: policy.project_id,
        version: policy.version,
        updated_at: policy.updated_at,
        bundle,
        selected_role,
    })
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub only_selected: bool,
}

pub async fn get_active(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActiveQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let policy = get_or_bootstrap_active(
        state.store.as_ref(),
        &state.policy_defaults,
        identity.project_id(),
    )
    .map_err(ApiError::from)?;

    let etag = policy_etag(&policy);
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
    {
        if if_none_match == etag {
            return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
        }
    }

    let view = render(policy, query.role.as_deref(), query.only_selected)?;
    Ok(([(header::ETAG, etag)], Json(view)).into_response())
}

pub async fn get_by_id(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PolicyView>, ApiError> {
    let policy = state
        .store
        .get_policy(identity.project_id(), &id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Policy not found or does not belong to this project"))?;
    Ok(Json(render(policy, None, false)?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub policy_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_workspace_id: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub policies: Vec<HistoryItem>,
}

pub async fn history(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    // Ensure even a fresh project shows a consistent v1 history.
    let active = get_or_bootstrap_active(
        state.store.as_ref(),
        &state.policy_defaults,
        identity.project_id(),
    )
    .map_err(ApiError::from)?;

    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let policies = state
        .store
        .list_policy_history(identity.project_id(), limit)
        .map_err(ApiError::from)?;

    Ok(Json(HistoryResponse {
        policies: policies
            .into_iter()
            .map(|p| HistoryItem {
                is_active: p.policy_id == active.policy_id,
                policy_id: p.policy_id,
                version: p.version,
                created_at: p.created_at,
                created_by_workspace_id: p.created_by_workspace_id,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub bundle: PolicyBundle,
    #[serde(default)]
    pub base_policy_id: Option<String>,
    #[serde(default)]
    pub created_by_workspace_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub policy_id: String,
    pub project_id: String,
    pub version: i64,
    pub created: bool,
}

pub async fn create(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    identity.require_writer()?;

    let created_by = match &req.created_by_workspace_id {
        Some(workspace_id) => {
            let ws = verify_workspace_access(&state, &identity, workspace_id)?;
            Some(ws.workspace_id)
        }
        None => identity.agent_id.clone(),
    };

    let (policy, created) = state
        .store
        .create_policy_version(
            identity.project_id(),
            &req.bundle,
            req.base_policy_id.as_deref(),
            created_by.as_deref(),
            Utc::now(),
        )
        .map_err(ApiError::from)?;

    if created {
        if let Err(e) = state.store.append_audit(
            identity.project_id(),
            created_by.as_deref(),
            "policy_created",
            &serde_json::json!({
                "policy_id": policy.policy_id,
                "version": policy.version,
                "base_policy_id": req.base_policy_id,
            }),
            Utc::now(),
        ) {
            tracing::warn!("failed to audit policy create: {e}");
        }
    }

    Ok(Json(CreateResponse {
        policy_id: policy.policy_id,
        project_id: policy.project_id,
        version: policy.version,
        created,
    }))
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub activated: bool,
    pub active_policy_id: String,
}

pub async fn activate(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActivateResponse>, ApiError> {
    identity.require_writer()?;
    state
        .store
        .activate_policy(identity.project_id(), &id)
        .map_err(ApiError::from)?;

    if let Err(e) = state.store.append_audit(
        identity.project_id(),
        None,
        "policy_activated",
        &serde_json::json!({"policy_id": id}),
        Utc::now(),
    ) {
        tracing::warn!("failed to audit policy activation: {e}");
    }

    Ok(Json(ActivateResponse {
        activated: true,
        active_policy_id: id,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset: bool,
    pub active_policy_id: String,
    pub version: i64,
}

/// Snapshot the current default bundle into a new version and activate it.
/// Prior versions are preserved. When an on-disk asset directory is
/// present the defaults are re-read from it first, so edited defaults take
/// effect without a restart.
pub async fn reset(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResetResponse>, ApiError> {
    identity.require_writer()?;

    let previous = state
        .store
        .get_active_policy(identity.project_id())
        .map_err(ApiError::from)?;
    let asset_dir = std::path::Path::new("assets/policy");
    let bundle = if asset_dir.is_dir() {
        state
            .policy_defaults
            .reload_from_disk(asset_dir)
            .map_err(ApiError::from)?
    } else {
        state.policy_defaults.snapshot()
    };
    let (policy, _created) = state
        .store
        .create_policy_version(
            identity.project_id(),
            &bundle,
            previous.as_ref().map(|p| p.policy_id.as_str()),
            None,
            Utc::now(),
        )
        .map_err(ApiError::from)?;
    state
        .store
        .activate_policy(identity.project_id(), &policy.policy_id)
        .map_err(ApiError::from)?;

    if let Err(e) = state.store.append_audit(
        identity.project_id(),
        None,
        "policy_reset_to_default",
        &serde_json::json!({
            "policy_id": policy.policy_id,
            "version": policy.version,
            "previous_policy_id": previous.map(|p| p.policy_id),
        }),
        Utc::now(),
    ) {
        tracing::warn!("failed to audit policy reset: {e}");
    }

    Ok(Json(ResetResponse {
        reset: true,
        active_policy_id: policy.policy_id,
        version: policy.version,
    }))
}
