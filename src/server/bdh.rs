//! Coordination endpoints for the tracker CLI wrapper: issue sync and
//! pre-flight command checks.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::response::ApiError;
use super::validation::validate_alias;
use super::AppState;
use crate::auth::{verify_workspace_access, RequireIdentity};
use crate::events::{Event, BEAD_STATUS_CHANGED, SYNC_COMPLETED};
use crate::jsonl;
use crate::origin::{canonicalize_git_url, is_valid_canonical_origin};
use crate::sync::{issue_from_record, ClaimSnapshotEntry};
use crate::types::Issue;

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub workspace_id: String,
    pub alias: String,
    #[serde(default)]
    pub human_name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub repo_origin: String,

    /// Full sync: complete JSONL dump of the tracker.
    #[serde(default)]
    pub issues_jsonl: Option<String>,
    /// Incremental sync: changed records plus hard deletions.
    #[serde(default)]
    pub sync_mode: Option<String>,
    #[serde(default)]
    pub changed_issues: Option<String>,
    #[serde(default)]
    pub deleted_ids: Vec<String>,

    /// Authoritative claim set for this workspace.
    #[serde(default)]
    pub claims_snapshot: Option<Vec<ClaimSnapshotEntry>>,
    /// Message ids to acknowledge as part of the sync round-trip.
    #[serde(default)]
    pub notifications_ack: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub synced: bool,
    pub issues_count: i64,
    pub received: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub status_changes: usize,
    pub notifications_queued: usize,
}

pub async fn sync(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    identity.require_writer()?;
    validate_alias(&req.alias)?;
    let mut workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    if workspace.alias != req.alias {
        return Err(ApiError::forbidden("Alias does not match workspace_id"));
    }

    let canonical_origin = canonicalize_git_url(&req.repo_origin);
    if !is_valid_canonical_origin(&canonical_origin) {
        return Err(ApiError::bad_request("Invalid repo_origin"));
    }

    let mode = req
        .sync_mode
        .as_deref()
        .unwrap_or("full")
        .trim()
        .to_ascii_lowercase();
    let payload = match mode.as_str() {
        "full" => {
            let body = req.issues_jsonl.as_deref().unwrap_or("").trim();
            if body.is_empty() {
                return Err(ApiError::bad_request("issues_jsonl is required for full sync"));
            }
            Some(body.to_string())
        }
        "incremental" => {
            let body = req.changed_issues.as_deref().unwrap_or("").trim();
            if body.is_empty()
                && req.deleted_ids.is_empty()
                && req.claims_snapshot.is_none()
            {
                return Err(ApiError::bad_request(
                    "incremental sync requires changes, deletions, or a claims snapshot",
                ));
            }
            (!body.is_empty()).then(|| body.to_string())
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "sync_mode must be 'full' or 'incremental', got '{other}'"
            )));
        }
    };

    let now = Utc::now();
    let mut issues: Vec<Issue> = Vec::new();
    if let Some(body) = payload {
        let records = jsonl::parse_jsonl(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;
        for record in &records {
            let issue = issue_from_record(identity.project_id(), record, &canonical_origin, now)
                .map_err(ApiError::bad_request)?;
            issues.push(issue);
        }
    }

    // Refresh the mutable workspace fields the client reports alongside.
    workspace.human_name = req.human_name.clone();
    if req.role.is_some() {
        workspace.role = req.role.clone();
    }
    workspace.last_seen_at = Some(now);
    state
        .store
        .update_workspace(&workspace)
        .map_err(ApiError::from)?;
    state.touch_presence(&workspace, &identity.project.slug);

    let outcome = state
        .store
        .apply_sync(
            identity.project_id(),
            &workspace,
            &issues,
            &req.deleted_ids,
            req.claims_snapshot.as_deref(),
            now,
        )
        .map_err(ApiError::from)?;

    for change in &outcome.status_changes {
        state.events.publish(
            Event::new(
                BEAD_STATUS_CHANGED,
                identity.project_id(),
                &workspace.workspace_id,
            )
            .slug(&identity.project.slug)
            .with("bead_id", change.bead_id.clone())
            .with("repo", change.repo.clone())
            .with("old_status", change.old_status.clone().unwrap_or_default())
            .with("new_status", change.new_status.clone())
            .with("alias", workspace.alias.clone()),
        );
    }
    state.events.publish(
        Event::new(
            SYNC_COMPLETED,
            identity.project_id(),
            &workspace.workspace_id,
        )
        .slug(&identity.project.slug)
        .with("repo", canonical_origin.clone())
        .with("upserts", outcome.inserted + outcome.updated)
        .with("deletes", outcome.deleted),
    );

    // Inline acks are best-effort: a bad id fails that ack, not the sync.
    for message_id in &req.notifications_ack {
        if let Err(e) =
            state
                .store
                .ack_message(identity.project_id(), message_id, &workspace.workspace_id, now)
        {
            tracing::debug!("sync ack of {message_id} skipped: {e}");
        }
    }

    let issues_count = state
        .store
        .count_issues(identity.project_id(), Some(&canonical_origin))
        .map_err(ApiError::from)?;

    Ok(Json(SyncResponse {
        synced: true,
        issues_count,
        received: outcome.received,
        upserts: outcome.inserted + outcome.updated,
        deletes: outcome.deleted,
        status_changes: outcome.status_changes.len(),
        notifications_queued: outcome.notifications_queued,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub workspace_id: String,
    pub alias: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub beads: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimantInfo {
    pub alias: String,
    pub human_name: String,
}

#[derive(Debug, Serialize)]
pub struct BeadCheck {
    pub bead_id: String,
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub claimants: Vec<ClaimantInfo>,
}

#[derive(Debug, Serialize)]
pub struct PathCheck {
    pub path: String,
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub beads: Vec<BeadCheck>,
    pub paths: Vec<PathCheck>,
    pub messages_waiting: i64,
}

fn command_verb(command: Option<&str>) -> Option<String> {
    command
        .unwrap_or("")
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Pre-flight a proposed command. Claims held by others downgrade the
/// decision: destructive verbs are rejected outright, anything else warns.
/// Reservations only ever warn.
pub async fn check(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    identity.require_writer()?;
    let workspace = verify_workspace_access(&state, &identity, &req.workspace_id)?;
    if workspace.alias != req.alias {
        return Err(ApiError::forbidden("Alias does not match workspace_id"));
    }
    state.touch_presence(&workspace, &identity.project.slug);

    let verb = command_verb(req.command.as_deref());
    let destructive = matches!(verb.as_deref(), Some("delete"));
    let now = Utc::now();

    let mut beads = Vec::with_capacity(req.beads.len());
    for bead_id in &req.beads {
        let claimants: Vec<ClaimantInfo> = state
            .store
            .list_claimants(identity.project_id(), bead_id)
            .map_err(ApiError::from)?
            .into_iter()
            .filter(|c| c.workspace_id != workspace.workspace_id)
            .map(|c| ClaimantInfo {
                alias: c.alias,
                human_name: c.human_name,
            })
            .collect();

        let decision = if claimants.is_empty() {
            "allow"
        } else if destructive {
            "reject"
        } else {
            "warn"
        };
        beads.push(BeadCheck {
            bead_id: bead_id.clone(),
            decision,
            claimants,
        });
    }

    let mut paths = Vec::with_capacity(req.paths.len());
    for path in &req.paths {
        let holder = state
            .ephemeral
            .reservations
            .holder(identity.project_id(), path, now)
            .filter(|r| r.workspace_id != workspace.workspace_id);
        paths.push(PathCheck {
            path: path.clone(),
            decision: if holder.is_some() { "warn" } else { "allow" },
            holder: holder.map(|r| r.alias),
        });
    }

    let messages_waiting = state
        .store
        .count_unread(identity.project_id(), &workspace.workspace_id)
        .map_err(ApiError::from)?;

    Ok(Json(CheckResponse {
        beads,
        paths,
        messages_waiting,
    }))
}
