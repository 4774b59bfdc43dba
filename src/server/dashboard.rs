//! Dashboard bootstrap endpoints. Same auth and redaction rules as the
//! rest of the surface; `identity` mints a dashboard-class workspace for a
//! browser session.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::ApiError;
use super::validation::{validate_alias, validate_human_name};
use super::AppState;
use crate::auth::{generate_api_key, RequireIdentity};
use crate::types::*;

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub project_id: String,
    pub project_slug: String,
    pub visibility: &'static str,
    pub presence_ttl_seconds: u64,
    pub stream_url: String,
    pub server_version: &'static str,
}

pub async fn config(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigResponse>, ApiError> {
    Ok(Json(ConfigResponse {
        project_id: identity.project_id().to_string(),
        project_slug: identity.project.slug.clone(),
        visibility: identity.project.visibility.as_str(),
        presence_ttl_seconds: state.config.presence_ttl_seconds,
        stream_url: format!(
            "/v1/status/stream?project_slug={}",
            identity.project.slug
        ),
        server_version: env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct IdentityRequest {
    pub alias: String,
    #[serde(default)]
    pub human_name: String,
}

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub workspace_id: String,
    pub alias: String,
    pub api_key: String,
}

/// Mint a dashboard-class workspace (no repo binding) for an observer
/// session.
pub async fn identity(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdentityRequest>,
) -> Result<Json<IdentityResponse>, ApiError> {
    identity.require_writer()?;
    validate_alias(&req.alias)?;
    validate_human_name(&req.human_name)?;

    let now = Utc::now();
    let project_id = identity.project_id().to_string();
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

    state
        .store
        .create_workspace(&Workspace {
            workspace_id: workspace_id.clone(),
            project_id,
            repo_id: None,
            alias: req.alias.clone(),
            human_name: req.human_name.clone(),
            role: None,
            kind: WorkspaceKind::Dashboard,
            current_branch: None,
            focus_bead_id: None,
            hostname: None,
            workspace_path: None,
            timezone: None,
            created_at: now,
            updated_at: now,
            last_seen_at: Some(now),
            deleted_at: None,
        })
        .map_err(ApiError::from)?;

    Ok(Json(IdentityResponse {
        workspace_id,
        alias: req.alias,
        api_key: plaintext,
    }))
}
