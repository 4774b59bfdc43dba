use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::response::ApiError;
use super::validation::validate_reservation_path;
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::ephemeral::{AcquireOutcome, Reservation, DEFAULT_RESERVATION_TTL_SECONDS};
use crate::events::{Event, RESERVATION_ACQUIRED, RESERVATION_RELEASED, RESERVATION_RENEWED};

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub workspace_id: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub reserved: Vec<Reservation>,
    /// Paths already held by someone else; advisory, not an error.
    pub conflicts: Vec<Reservation>,
}

pub async fn acquire(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>, ApiError> {
    identity.require_writer()?;
    if req.paths.is_empty() {
        return Err(ApiError::bad_request("paths cannot be empty"));
    }
    for path in &req.paths {
        validate_reservation_path(path)?;
    }
    let ttl = req.ttl_seconds.unwrap_or(DEFAULT_RESERVATION_TTL_SECONDS);
    if ttl <= 0 || ttl > 3600 {
        return Err(ApiError::bad_request("ttl_seconds must be between 1 and 3600"));
    }
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let now = Utc::now();
    let mut reserved = Vec::new();
    let mut renewed = Vec::new();
    let mut conflicts = Vec::new();
    for path in &req.paths {
        let held_before = state
            .ephemeral
            .reservations
            .holder(identity.project_id(), path, now)
            .is_some_and(|r| r.workspace_id == workspace.workspace_id);
        match state.ephemeral.reservations.acquire(
            identity.project_id(),
            path,
            &workspace.workspace_id,
            &workspace.alias,
            ttl,
            req.reason.clone(),
            now,
        ) {
            AcquireOutcome::Held(reservation) => {
                if held_before {
                    renewed.push(reservation.path.clone());
                } else {
                    reserved.push(reservation.path.clone());
                }
            }
            AcquireOutcome::HeldByOther(holder) => conflicts.push(holder),
        }
    }

    if !reserved.is_empty() {
        state.events.publish(
            Event::new(
                RESERVATION_ACQUIRED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("paths", reserved.clone())
            .with("alias", workspace.alias.clone())
            .with("ttl_seconds", ttl)
            .with("reason", req.reason.clone().unwrap_or_default()),
        );
    }
    if !renewed.is_empty() {
        state.events.publish(
            Event::new(
                RESERVATION_RENEWED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("paths", renewed)
            .with("alias", workspace.alias.clone())
            .with("ttl_seconds", ttl),
        );
    }

    let live = state
        .ephemeral
        .reservations
        .list(identity.project_id(), now)
        .into_iter()
        .filter(|r| {
            r.workspace_id == workspace.workspace_id && req.paths.contains(&r.path)
        })
        .collect();
    Ok(Json(AcquireResponse {
        reserved: live,
        conflicts,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub path: String,
    pub released: bool,
}

pub async fn release(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    identity.require_writer()?;
    validate_reservation_path(&path)?;
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;

    let released =
        state
            .ephemeral
            .reservations
            .release(identity.project_id(), &path, &workspace.workspace_id);
    if released {
        state.events.publish(
            Event::new(
                RESERVATION_RELEASED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("paths", vec![path.clone()])
            .with("alias", workspace.alias.clone()),
        );
    }
    Ok(Json(ReleaseResponse { path, released }))
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub reservations: Vec<Reservation>,
    pub count: usize,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListResponse>, ApiError> {
    let reservations = state
        .ephemeral
        .reservations
        .list(identity.project_id(), Utc::now());
    Ok(Json(ListResponse {
        count: reservations.len(),
        reservations,
    }))
}
