use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::ApiError;
use super::AppState;
use crate::auth::RequireIdentity;
use crate::origin::{canonicalize_git_url, extract_repo_name, is_valid_canonical_origin};
use crate::types::Repo;

#[derive(Debug, Serialize)]
pub struct RepoListResponse {
    pub repos: Vec<Repo>,
    pub count: usize,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RepoListResponse>, ApiError> {
    let repos = state
        .store
        .list_repos(identity.project_id())
        .map_err(ApiError::from)?;
    Ok(Json(RepoListResponse {
        count: repos.len(),
        repos,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRepoRequest {
    pub origin_url: String,
}

pub async fn create(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRepoRequest>,
) -> Result<Json<Repo>, ApiError> {
    identity.require_writer()?;
    let canonical = canonicalize_git_url(&req.origin_url);
    if !is_valid_canonical_origin(&canonical) {
        return Err(ApiError::bad_request("Invalid origin_url"));
    }
    let repo = state
        .store
        .upsert_repo(&Repo {
            id: Uuid::new_v4().to_string(),
            project_id: identity.project_id().to_string(),
            origin_url: req.origin_url.clone(),
            canonical_origin: canonical.clone(),
            name: extract_repo_name(&canonical),
            created_at: Utc::now(),
            deleted_at: None,
        })
        .map_err(ApiError::from)?;
    Ok(Json(repo))
}

#[derive(Debug, Serialize)]
pub struct DeleteRepoResponse {
    pub repo_id: String,
    pub deleted: bool,
}

pub async fn delete(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteRepoResponse>, ApiError> {
    identity.require_writer()?;
    let deleted = state
        .store
        .soft_delete_repo(identity.project_id(), &id, Utc::now())
        .map_err(ApiError::from)?;
    if !deleted {
        return Err(ApiError::not_found("Repo not found"));
    }
    Ok(Json(DeleteRepoResponse {
        repo_id: id,
        deleted,
    }))
}
