//! Atomic workspace bootstrap.
//!
//! One request ensures the project, the repo, an agent identity with a
//! plaintext key (returned exactly once), and the workspace row bound to
//! both. Alias collisions either fail with 409 or walk a deterministic
//! suggestion sequence when the caller opts in.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::ApiError;
use super::validation::{
    validate_alias, validate_human_name, validate_project_slug, validate_role,
};
use super::AppState;
use crate::auth::{generate_api_key, parse_proxy_context};
use crate::origin::{canonicalize_git_url, extract_repo_name, is_valid_canonical_origin};
use crate::types::*;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub project_slug: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub suggest_alias: bool,
    #[serde(default)]
    pub human_name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub repo_origin: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub workspace_id: String,
    pub project_id: String,
    pub project_slug: String,
    pub repo_id: String,
    pub canonical_origin: String,
    pub alias: String,
    /// Plaintext key; shown exactly once.
    pub api_key: String,
    pub created: bool,
}

const MAX_ALIAS_PROBES: usize = 50;

fn pick_alias(
    state: &AppState,
    project_id: &str,
    base: &str,
    suggest: bool,
) -> Result<Option<String>, ApiError> {
    if state
        .store
        .get_workspace_by_alias(project_id, base)
        .map_err(ApiError::from)?
        .is_none()
        && state
            .ephemeral
            .presence
            .workspace_id_by_alias(project_id, base)
            .is_none()
    {
        return Ok(Some(base.to_string()));
    }
    if !suggest {
        return Ok(None);
    }
    for n in 2..MAX_ALIAS_PROBES {
        let candidate = format!("{base}-{n}");
        if state
            .store
            .get_workspace_by_alias(project_id, &candidate)
            .map_err(ApiError::from)?
            .is_none()
        {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

pub async fn init(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    validate_project_slug(&req.project_slug)?;
    validate_human_name(&req.human_name)?;
    if let Some(role) = &req.role {
        validate_role(role)?;
    }
    let requested_alias = match &req.alias {
        Some(alias) => {
            validate_alias(alias)?;
            alias.clone()
        }
        None => "agent".to_string(),
    };

    let canonical_origin = canonicalize_git_url(&req.repo_origin);
    if !is_valid_canonical_origin(&canonical_origin) {
        return Err(ApiError::bad_request("Invalid repo_origin"));
    }

    // A verified proxy context pins the project; otherwise resolve (or
    // create) by slug.
    let proxy_ctx =
        parse_proxy_context(&headers, state.config.internal_auth_secret.as_deref())
            .map_err(ApiError::from)?;

    let now = Utc::now();
    let project = match proxy_ctx {
        Some(ctx) => state
            .store
            .get_project(&ctx.project_id)
            .map_err(ApiError::from)?
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| ApiError::not_found("Project not found"))?,
        None => match state
            .store
            .get_project_by_slug(None, &req.project_slug)
            .map_err(ApiError::from)?
        {
            Some(project) => project,
            None => {
                let project = Project {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: None,
                    slug: req.project_slug.clone(),
                    visibility: Visibility::Private,
                    active_policy_id: None,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                state.store.create_project(&project).map_err(ApiError::from)?;
                project
            }
        },
    };

    let repo = state
        .store
        .upsert_repo(&Repo {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            origin_url: req.repo_origin.clone(),
            canonical_origin: canonical_origin.clone(),
            name: extract_repo_name(&canonical_origin),
            created_at: now,
            deleted_at: None,
        })
        .map_err(ApiError::from)?;

    // Re-running init with the same alias against the same repo is
    // idempotent: the caller gets its existing workspace back (with a fresh
    // key, since the plaintext is unrecoverable).
    if let Some(existing) = state
        .store
        .get_workspace_by_alias(&project.id, &requested_alias)
        .map_err(ApiError::from)?
    {
        if existing.repo_id.as_deref() == Some(repo.id.as_str()) {
            let (plaintext, key_hash) = generate_api_key();
            state
                .store
                .create_api_key(&ApiKey {
                    id: Uuid::new_v4().to_string(),
                    project_id: project.id.clone(),
                    agent_id: Some(existing.workspace_id.clone()),
                    key_hash,
                    created_at: now,
                })
                .map_err(ApiError::from)?;
            state.touch_presence(&existing, &project.slug);
            return Ok(Json(InitResponse {
                workspace_id: existing.workspace_id,
                project_id: project.id,
                project_slug: project.slug,
                repo_id: repo.id,
                canonical_origin,
                alias: requested_alias,
                api_key: plaintext,
                created: false,
            }));
        }
    }

    let alias = pick_alias(&state, &project.id, &requested_alias, req.suggest_alias)?
        .ok_or_else(|| ApiError::conflict(format!("alias '{requested_alias}' is taken")))?;

    let workspace_id = Uuid::new_v4().to_string();
    state
        .store
        .create_agent(&Agent {
            agent_id: workspace_id.clone(),
            project_id: project.id.clone(),
            created_at: now,
        })
        .map_err(ApiError::from)?;

    let (plaintext, key_hash) = generate_api_key();
    state
        .store
        .create_api_key(&ApiKey {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            agent_id: Some(workspace_id.clone()),
            key_hash,
            created_at: now,
        })
        .map_err(ApiError::from)?;

    let workspace = Workspace {
        workspace_id: workspace_id.clone(),
        project_id: project.id.clone(),
        repo_id: Some(repo.id.clone()),
        alias: alias.clone(),
        human_name: req.human_name.clone(),
        role: req.role.clone(),
        kind: WorkspaceKind::Agent,
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
    state.store.create_workspace(&workspace).map_err(ApiError::from)?;
    state.touch_presence(&workspace, &project.slug);

    if let Err(e) = state.store.append_audit(
        &project.id,
        Some(&workspace_id),
        "workspace_registered",
        &serde_json::json!({"alias": alias, "repo": canonical_origin}),
        now,
    ) {
        tracing::warn!("failed to audit workspace registration: {e}");
    }

    Ok(Json(InitResponse {
        workspace_id,
        project_id: project.id,
        project_slug: project.slug,
        repo_id: repo.id,
        canonical_origin,
        alias,
        api_key: plaintext,
        created: true,
    }))
}
