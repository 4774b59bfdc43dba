//! Project status snapshot and the live event stream.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::dto::{ClaimView, WorkspaceView};
use super::response::ApiError;
use super::AppState;
use crate::auth::RequireIdentity;
use crate::ephemeral::{PresenceRecord, PresenceTier, Reservation};
use crate::events::Event;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct ConflictView {
    pub bead_id: String,
    pub claimants: Vec<ClaimView>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub project_id: String,
    pub project_slug: String,
    pub visibility: &'static str,
    pub workspaces: Vec<WorkspaceView>,
    pub claims: Vec<ClaimView>,
    pub conflicts: Vec<ConflictView>,
    pub reservations: Vec<Reservation>,
    pub issues_count: i64,
}

pub async fn snapshot(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let project_id = identity.project_id().to_string();
    let redact = identity.public_reader;
    let ttl = state.config.presence_ttl_seconds;
    let now = Utc::now();

    let workspaces = state
        .store
        .list_workspaces(&project_id, false)
        .map_err(ApiError::from)?;
    // The presence cache is fresher than the durable last_seen column when
    // a workspace touched it since its last write; overlay it.
    let live: HashMap<String, PresenceRecord> = state
        .ephemeral
        .presence
        .list_project(&project_id)
        .into_iter()
        .map(|r| (r.workspace_id.clone(), r))
        .collect();
    let claims = state
        .store
        .list_claims(&project_id, None, 200, None)
        .map_err(ApiError::from)?;
    let conflicts = state
        .store
        .list_claim_conflicts(&project_id)
        .map_err(ApiError::from)?;
    let reservations = state.ephemeral.reservations.list(&project_id, now);
    let issues_count = state
        .store
        .count_issues(&project_id, None)
        .map_err(ApiError::from)?;

    Ok(Json(StatusResponse {
        project_id,
        project_slug: identity.project.slug.clone(),
        visibility: identity.project.visibility.as_str(),
        workspaces: workspaces
            .iter()
            .map(|ws| {
                let mut view = WorkspaceView::render(ws, ttl, redact);
                if let Some(cached) = live.get(&ws.workspace_id) {
                    if view.last_seen_at.is_none_or(|db| cached.last_seen > db) {
                        view.last_seen_at = Some(cached.last_seen);
                        view.presence =
                            PresenceTier::from_last_seen(Some(cached.last_seen), ttl, now)
                                .as_str();
                    }
                    if cached.current_branch.is_some() {
                        view.current_branch = cached.current_branch.clone();
                    }
                }
                view
            })
            .collect(),
        claims: claims.iter().map(|c| ClaimView::render(c, redact)).collect(),
        conflicts: conflicts
            .into_iter()
            .map(|(bead_id, claimants)| ConflictView {
                bead_id,
                claimants: claimants
                    .iter()
                    .map(|c| ClaimView::render(c, redact))
                    .collect(),
            })
            .collect(),
        reservations,
        issues_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub human_name: Option<String>,
    /// Comma-separated event categories or full event types.
    #[serde(default)]
    pub event_types: Option<String>,
}

struct StreamFilter {
    types: Option<HashSet<String>>,
    repo: Option<String>,
    workspace_ids: Option<HashSet<String>>,
}

impl StreamFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(event.category()) && !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(repo) = &self.repo {
            let event_repo = event.fields.get("repo").and_then(|v| v.as_str());
            if event_repo != Some(repo.as_str()) {
                return false;
            }
        }
        if let Some(ids) = &self.workspace_ids {
            if !ids.contains(&event.workspace_id) {
                return false;
            }
        }
        true
    }
}

/// One JSON event per SSE data line. Heartbeats flow every 15 s. Slow
/// consumers lag past the 64-event buffer and observe a `stream.dropped`
/// marker; they are expected to re-read snapshot state.
pub async fn stream(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if let Some(slug) = &query.project_slug {
        if slug != &identity.project.slug {
            return Err(ApiError::forbidden(
                "project_slug does not match your project",
            ));
        }
    }

    let workspace_ids = match &query.human_name {
        Some(human_name) => {
            let workspaces = state
                .store
                .list_workspaces(identity.project_id(), false)
                .map_err(ApiError::from)?;
            Some(
                workspaces
                    .into_iter()
                    .filter(|ws| ws.human_name == *human_name)
                    .map(|ws| ws.workspace_id)
                    .collect::<HashSet<String>>(),
            )
        }
        None => None,
    };

    let filter = StreamFilter {
        types: query.event_types.as_deref().map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        }),
        repo: query.repo.clone(),
        workspace_ids,
    };

    let rx = state.events.subscribe(identity.project_id());
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let out = match item {
            Ok(event) if filter.matches(&event) => serde_json::to_string(&event)
                .ok()
                .map(|data| Ok(SseEvent::default().data(data))),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                // The subscriber fell behind and lost events; tell it so it
                // can re-read current state.
                let marker = serde_json::json!({
                    "type": "stream.dropped",
                    "skipped": skipped,
                });
                Some(Ok(SseEvent::default().data(marker.to_string())))
            }
        };
        futures::future::ready(out)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("keepalive"),
    ))
}
