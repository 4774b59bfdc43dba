use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dto::ClaimView;
use super::response::{decode_cursor, effective_limit, paginate, ApiError, Cursor};
use super::validation::validate_bead_id;
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::events::{Event, BEAD_CLAIMED, BEAD_UNCLAIMED};
use crate::types::Claim;

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub workspace_id: String,
    pub bead_id: String,
    #[serde(default)]
    pub apex_bead_id: Option<String>,
    /// Join existing claimants instead of failing on conflict.
    #[serde(default)]
    pub jump_in: bool,
}

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub claim: ClaimView,
    /// Other workspaces also holding the bead (non-empty only for jump-in).
    pub co_claimants: Vec<String>,
}

pub async fn acquire(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>, ApiError> {
    identity.require_writer()?;
    validate_bead_id(&req.bead_id)?;
    if let Some(apex) = &req.apex_bead_id {
        validate_bead_id(apex)?;
    }
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let existing = state
        .store
        .list_claimants(identity.project_id(), &req.bead_id)
        .map_err(ApiError::from)?;
    let others: Vec<&Claim> = existing
        .iter()
        .filter(|c| c.workspace_id != workspace.workspace_id)
        .collect();

    if !others.is_empty() && !req.jump_in {
        let aliases: Vec<String> = others.iter().map(|c| c.alias.clone()).collect();
        let claimants: Vec<serde_json::Value> = others
            .iter()
            .map(|c| serde_json::json!({"alias": c.alias}))
            .collect();
        return Err(ApiError::conflict(format!(
            "{} is claimed by {}",
            req.bead_id,
            aliases.join(", ")
        ))
        .with_fields(serde_json::json!({ "claimants": claimants })));
    }

    let claim = Claim {
        project_id: identity.project_id().to_string(),
        bead_id: req.bead_id.clone(),
        workspace_id: workspace.workspace_id.clone(),
        alias: workspace.alias.clone(),
        human_name: workspace.human_name.clone(),
        apex_bead_id: req.apex_bead_id.clone(),
        claimed_at: Utc::now(),
    };
    state.store.upsert_claim(&claim).map_err(ApiError::from)?;

    state.events.publish(
        Event::new(BEAD_CLAIMED, identity.project_id(), &workspace.workspace_id)
            .slug(&identity.project.slug)
            .with("bead_id", req.bead_id.clone())
            .with("alias", workspace.alias.clone())
            .with("jump_in", req.jump_in),
    );

    Ok(Json(AcquireResponse {
        claim: ClaimView::render(&claim, false),
        co_claimants: others.iter().map(|c| c.alias.clone()).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub bead_id: String,
    pub released: bool,
}

pub async fn release(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Path(bead_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    identity.require_writer()?;
    validate_bead_id(&bead_id)?;
    let workspace = verify_workspace_access(&state, &identity, &query.workspace_id)?;
    state.touch_presence(&workspace, &identity.project.slug);

    // Releasing a claim you don't hold is a no-op, not an error.
    let released = state
        .store
        .delete_claim(identity.project_id(), &workspace.workspace_id, &bead_id)
        .map_err(ApiError::from)?;

    if released {
        state.events.publish(
            Event::new(
                BEAD_UNCLAIMED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("bead_id", bead_id.clone())
            .with("alias", workspace.alias.clone()),
        );
    }

    Ok(Json(ReleaseResponse { bead_id, released }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub claims: Vec<ClaimView>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub async fn list(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = effective_limit(query.limit);
    let before: Option<(DateTime<Utc>, String)> = match &query.cursor {
        Some(raw) => {
            let cursor = decode_cursor(raw)?;
            let ts = DateTime::parse_from_rfc3339(&cursor.k)
                .map_err(|_| ApiError::bad_request("Invalid cursor timestamp"))?
                .with_timezone(&Utc);
            Some((ts, cursor.id))
        }
        None => None,
    };

    let claims = state
        .store
        .list_claims(
            identity.project_id(),
            query.workspace_id.as_deref(),
            limit + 1,
            before,
        )
        .map_err(ApiError::from)?;

    let redact = identity.public_reader;
    let (page, next_cursor, has_more) = paginate(claims, limit, |claim| Cursor {
        k: claim.claimed_at.to_rfc3339(),
        id: claim.bead_id.clone(),
    });

    Ok(Json(ListResponse {
        claims: page.iter().map(|c| ClaimView::render(c, redact)).collect(),
        has_more,
        next_cursor,
    }))
}
