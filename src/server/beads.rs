use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::response::{decode_cursor, effective_limit, paginate, ApiError, Cursor};
use super::validation::validate_bead_id;
use super::AppState;
use crate::auth::RequireIdentity;
use crate::origin::is_valid_canonical_origin;
use crate::store::IssueFilter;
use crate::sync::ready_issues;
use crate::types::Issue;

#[derive(Debug, Deserialize)]
pub struct IssuesQuery {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssuesResponse {
    pub issues: Vec<Issue>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn list_issues(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<IssuesQuery>,
) -> Result<Json<IssuesResponse>, ApiError> {
    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::bad_request("Invalid repo filter"));
        }
    }
    let limit = effective_limit(query.limit);
    let after = match &query.cursor {
        Some(raw) => Some(decode_cursor(raw)?.id),
        None => None,
    };
    let filter = IssueFilter {
        repo: query.repo.clone(),
        branch: query.branch.clone(),
        status: query.status.clone(),
        assignee: query.assignee.clone(),
        search: query.search.clone(),
    };
    let issues = state
        .store
        .list_issues(identity.project_id(), &filter, limit + 1, after.as_deref())
        .map_err(ApiError::from)?;

    let (page, next_cursor, has_more) = paginate(issues, limit, |issue| Cursor {
        k: issue.bead_id.clone(),
        id: issue.bead_id.clone(),
    });

    Ok(Json(IssuesResponse {
        issues: page,
        has_more,
        next_cursor,
    }))
}

pub async fn get_issue(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(bead_id): Path<String>,
) -> Result<Json<Issue>, ApiError> {
    validate_bead_id(&bead_id)?;
    let issue = state
        .store
        .get_issue(identity.project_id(), &bead_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Issue not found"))?;
    Ok(Json(issue))
}

#[derive(Debug, Deserialize)]
pub struct ReadyQuery {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub issues: Vec<Issue>,
    pub count: usize,
}

/// Issues that are open with a fully-resolved blocker closure. Dependency
/// cycles never surface as ready.
pub async fn ready(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReadyQuery>,
) -> Result<Json<ReadyResponse>, ApiError> {
    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::bad_request("Invalid repo filter"));
        }
    }
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    let all = state
        .store
        .list_all_issues(identity.project_id())
        .map_err(ApiError::from)?;
    let ready: Vec<Issue> = ready_issues(
        &all,
        query.repo.as_deref(),
        query.branch.as_deref(),
        limit,
    )
    .into_iter()
    .cloned()
    .collect();

    Ok(Json(ReadyResponse {
        count: ready.len(),
        issues: ready,
    }))
}
