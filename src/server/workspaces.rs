use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dto::WorkspaceView;
use super::response::ApiError;
use super::validation::{validate_alias, validate_human_name, validate_role};
use super::AppState;
use crate::auth::{generate_api_key, verify_workspace_access, RequireIdentity};
use crate::origin::{canonicalize_git_url, extract_repo_name, is_valid_canonical_origin};
use crate::sync::is_valid_bead_id;
use crate::types::*;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub alias: String,
    #[serde(default)]
    pub human_name: String,
    #[serde(default)]
    pub role: Option<String>,
    /// `agent` (default) requires `repo_origin`; `dashboard` forbids it.
    #[serde(default)]
    pub kind: Option<WorkspaceKind>,
    #[serde(default)]
    pub repo_origin: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub workspace_id: String,
    pub alias: String,
    pub api_key: String,
}

/// Register an additional workspace under an existing project. Unlike
/// `/v1/init` this requires authentication and never creates projects.
pub async fn register(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    identity.require_writer()?;
    validate_alias(&req.alias)?;
    validate_human_name(&req.human_name)?;
    if let Some(role) = &req.role {
        validate_role(role)?;
    }
    let kind = req.kind.unwrap_or(WorkspaceKind::Agent);
    let now = Utc::now();
    let project_id = identity.project_id().to_string();

    let repo_id = match kind {
        WorkspaceKind::Agent => {
            let origin = req
                .repo_origin
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("agent workspaces require repo_origin"))?;
            let canonical = canonicalize_git_url(origin);
            if !is_valid_canonical_origin(&canonical) {
                return Err(ApiError::bad_request("Invalid repo_origin"));
            }
            let repo = state
                .store
                .upsert_repo(&Repo {
                    id: Uuid::new_v4().to_string(),
                    project_id: project_id.clone(),
                    origin_url: origin.to_string(),
                    canonical_origin: canonical.clone(),
                    name: extract_repo_name(&canonical),
                    created_at: now,
                    deleted_at: None,
                })
                .map_err(ApiError::from)?;
            Some(repo.id)
        }
        WorkspaceKind::Dashboard => {
            if req.repo_origin.is_some() {
                return Err(ApiError::bad_request(
                    "dashboard workspaces take no repo_origin",
                ));
            }
            None
        }
    };

    let workspace_id = Uuid::new_v4().to_string();
    state
        .store
        .create_agent(&Agent {
            agent_id: workspace_id.clone(),
            project_id: project_id.clone(),
            created_at: now,
        })
        .map_err(ApiError::from)?;
    let (plaintext, key_hash) = generate_api_key();
    state
        .store
        .create_api_key(&ApiKey {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            agent_id: Some(workspace_id.clone()),
            key_hash,
            created_at: now,
        })
        .map_err(ApiError::from)?;

    let workspace = Workspace {
        workspace_id: workspace_id.clone(),
        project_id: project_id.clone(),
        repo_id,
        alias: req.alias.clone(),
        human_name: req.human_name.clone(),
        role: req.role.clone(),
        kind,
        current_branch: None,
        focus_bead_id: None,
        hostname: req.hostname.clone(),
        workspace_path: req.workspace_path.clone(),
        timezone: req.timezone.clone(),
        created_at: now,
        updated_at: now,
        last_seen_at: Some(now),
        deleted_at: None,
    };
    state
        .store
        .create_workspace(&workspace)
        .map_err(ApiError::from)?;
    state.touch_presence(&workspace, &identity.project.slug);

    Ok(Json(RegisterResponse {
        workspace_id,
        alias: req.alias,
        api_key: plaintext,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub workspaces: Vec<WorkspaceView>,
    pub count: usize,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let include_deleted = query.include_deleted && !identity.public_reader;
    let workspaces = state
        .store
        .list_workspaces(identity.project_id(), include_deleted)
        .map_err(ApiError::from)?;
    let ttl = state.config.presence_ttl_seconds;
    let views: Vec<WorkspaceView> = workspaces
        .iter()
        .map(|ws| WorkspaceView::render(ws, ttl, identity.public_reader))
        .collect();
    Ok(Json(ListResponse {
        count: views.len(),
        workspaces: views,
    }))
}

pub async fn get_workspace(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkspaceView>, ApiError> {
    let ws = state
        .store
        .get_workspace(&id)
        .map_err(ApiError::from)?
        .filter(|ws| ws.project_id == identity.project_id())
        .ok_or_else(|| ApiError::not_found("Workspace not found"))?;
    Ok(Json(WorkspaceView::render(
        &ws,
        state.config.presence_ttl_seconds,
        identity.public_reader,
    )))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub current_branch: Option<String>,
    #[serde(default)]
    pub focus_bead_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    // Immutable fields show up here only to be rejected loudly.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

pub async fn update(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<WorkspaceView>, ApiError> {
    identity.require_writer()?;
    let mut ws = verify_workspace_access(&state, &identity, &id)?;

    if req.alias.is_some() || req.project_id.is_some() || req.repo_id.is_some() || req.kind.is_some()
    {
        return Err(ApiError::precondition_failed(
            "alias, project, repo, and kind are immutable",
        ));
    }

    if let Some(human_name) = req.human_name {
        validate_human_name(&human_name)?;
        ws.human_name = human_name;
    }
    if let Some(role) = req.role {
        validate_role(&role)?;
        ws.role = Some(role);
    }
    if let Some(branch) = req.current_branch {
        ws.current_branch = Some(branch);
    }
    if let Some(focus) = req.focus_bead_id {
        if !focus.is_empty() && !is_valid_bead_id(&focus) {
            return Err(ApiError::bad_request("Invalid focus_bead_id"));
        }
        ws.focus_bead_id = (!focus.is_empty()).then_some(focus);
    }
    if let Some(hostname) = req.hostname {
        ws.hostname = Some(hostname);
    }
    if let Some(path) = req.workspace_path {
        ws.workspace_path = Some(path);
    }
    if let Some(timezone) = req.timezone {
        ws.timezone = Some(timezone);
    }
    ws.last_seen_at = Some(Utc::now());

    state.store.update_workspace(&ws).map_err(ApiError::from)?;
    state.touch_presence(&ws, &identity.project.slug);
    Ok(Json(WorkspaceView::render(
        &ws,
        state.config.presence_ttl_seconds,
        false,
    )))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub workspace_id: String,
    pub deleted: bool,
}

pub async fn soft_delete(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    identity.require_writer()?;
    let ws = verify_workspace_access(&state, &identity, &id)?;
    let deleted = state
        .store
        .soft_delete_workspace(identity.project_id(), &id, Utc::now())
        .map_err(ApiError::from)?;
    state.ephemeral.presence.clear(&[id.clone()]);
    if let Err(e) = state.store.append_audit(
        identity.project_id(),
        Some(&id),
        "workspace_deleted",
        &serde_json::json!({"alias": ws.alias}),
        Utc::now(),
    ) {
        tracing::warn!("failed to audit workspace delete: {e}");
    }
    Ok(Json(DeleteResponse {
        workspace_id: id,
        deleted,
    }))
}

pub async fn restore(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkspaceView>, ApiError> {
    identity.require_writer()?;
    // Deleted workspaces fail verify_workspace_access, so check project
    // membership directly.
    let ws = state
        .store
        .get_workspace(&id)
        .map_err(ApiError::from)?
        .filter(|ws| ws.project_id == identity.project_id())
        .ok_or_else(|| ApiError::not_found("Workspace not found"))?;
    identity.enforce_actor_binding(&ws.workspace_id)?;

    let restored = state
        .store
        .restore_workspace(identity.project_id(), &id)
        .map_err(ApiError::from)?;
    if let Err(e) = state.store.append_audit(
        identity.project_id(),
        Some(&id),
        "workspace_restored",
        &serde_json::json!({"alias": restored.alias}),
        Utc::now(),
    ) {
        tracing::warn!("failed to audit workspace restore: {e}");
    }
    Ok(Json(WorkspaceView::render(
        &restored,
        state.config.presence_ttl_seconds,
        false,
    )))
}
