use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::response::ApiError;
use super::validation::validate_bead_id;
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::origin::is_valid_canonical_origin;
use crate::types::Subscription;

const VALID_EVENT_TYPES: &[&str] = &["status_change", "priority_change", "assignee_change", "all"];

fn default_event_types() -> Vec<String> {
    vec!["status_change".to_string()]
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub workspace_id: String,
    pub bead_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
}

pub async fn subscribe(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<Subscription>, ApiError> {
    identity.require_writer()?;
    validate_bead_id(&req.bead_id)?;
    if let Some(repo) = &req.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::bad_request("Invalid repo"));
        }
    }
    if req.event_types.is_empty() {
        return Err(ApiError::bad_request("event_types cannot be empty"));
    }
    for event_type in &req.event_types {
        if !VALID_EVENT_TYPES.contains(&event_type.as_str()) {
            return Err(ApiError::bad_request(format!(
                "Invalid event_type: {event_type}. Valid: {VALID_EVENT_TYPES:?}"
            )));
        }
    }
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let (subscription, _created) = state
        .store
        .upsert_subscription(&Subscription {
            id: Uuid::new_v4().to_string(),
            project_id: identity.project_id().to_string(),
            workspace_id: workspace.workspace_id.clone(),
            alias: workspace.alias.clone(),
            bead_id: req.bead_id.clone(),
            repo: req.repo.clone(),
            event_types: req.event_types.clone(),
            created_at: Utc::now(),
        })
        .map_err(ApiError::from)?;

    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub subscriptions: Vec<Subscription>,
    pub count: usize,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    let subscriptions = state
        .store
        .list_subscriptions(identity.project_id(), &workspace.workspace_id)
        .map_err(ApiError::from)?;
    Ok(Json(ListResponse {
        count: subscriptions.len(),
        subscriptions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub subscription_id: String,
    pub deleted: bool,
}

pub async fn unsubscribe(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UnsubscribeQuery>,
) -> Result<Json<UnsubscribeResponse>, ApiError> {
    identity.require_writer()?;
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;

    let deleted = state
        .store
        .delete_subscription(identity.project_id(), &id, &workspace.workspace_id)
        .map_err(ApiError::from)?;
    if !deleted {
        return Err(ApiError::not_found("Subscription not found"));
    }
    Ok(Json(UnsubscribeResponse {
        subscription_id: id,
        deleted,
    }))
}
