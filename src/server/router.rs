use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::timeout::TimeoutLayer;

use super::{
    bdh, beads, chat, claims, dashboard, escalations, init, messages, policies, repos,
    reservations, status, subscriptions, workspaces,
};
use crate::config::Config;
use crate::ephemeral::{Ephemeral, PresenceRecord};
use crate::events::EventBus;
use crate::policy::PolicyDefaults;
use crate::store::Store;
use crate::types::Workspace;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub ephemeral: Ephemeral,
    pub events: Arc<EventBus>,
    pub policy_defaults: PolicyDefaults,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let presence_ttl = config.presence_ttl_seconds;
        Self {
            store,
            config,
            ephemeral: Ephemeral::new(presence_ttl),
            events: Arc::new(EventBus::new()),
            policy_defaults: PolicyDefaults::new(),
        }
    }

    /// Refresh durable `last_seen_at` and the presence cache. Called on
    /// every authenticated write that acts as a workspace.
    pub fn touch_presence(&self, ws: &Workspace, project_slug: &str) {
        let now = Utc::now();
        if let Err(e) = self
            .store
            .touch_last_seen(&ws.project_id, &ws.workspace_id, now)
        {
            tracing::warn!("failed to touch last_seen for {}: {e}", ws.workspace_id);
        }
        let canonical_origin = ws.repo_id.as_deref().and_then(|repo_id| {
            self.store
                .get_repo_by_id(&ws.project_id, repo_id)
                .ok()
                .flatten()
                .map(|r| r.canonical_origin)
        });
        self.ephemeral.presence.update(PresenceRecord {
            workspace_id: ws.workspace_id.clone(),
            project_id: ws.project_id.clone(),
            project_slug: project_slug.to_string(),
            alias: ws.alias.clone(),
            human_name: ws.human_name.clone(),
            role: ws.role.clone(),
            current_branch: ws.current_branch.clone(),
            repo_id: ws.repo_id.clone(),
            canonical_origin,
            timezone: ws.timezone.clone(),
            last_seen: now,
        });
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.health_check() {
        Ok(()) => Json(serde_json::json!({"status": "ok", "database": "ok"})).into_response(),
        Err(e) => {
            tracing::error!("health check failed: {e}");
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded", "database": "unreachable"})),
            )
                .into_response()
        }
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // Chat sends may legitimately wait minutes and the status stream is
    // long-lived, so those routes sit outside the request timeout.
    let long_lived = Router::new()
        .route("/v1/status/stream", get(status::stream))
        .route("/v1/chat/sessions", post(chat::start_session))
        .route("/v1/chat/sessions/{id}/messages", post(chat::send_message));

    let timed = Router::new()
        .route("/v1/init", post(init::init))
        .route("/v1/workspaces/register", post(workspaces::register))
        .route("/v1/workspaces", get(workspaces::list))
        .route("/v1/workspaces/{id}", get(workspaces::get_workspace))
        .route("/v1/workspaces/{id}", patch(workspaces::update))
        .route("/v1/workspaces/{id}", delete(workspaces::soft_delete))
        .route("/v1/workspaces/{id}/restore", post(workspaces::restore))
        .route("/v1/repos", get(repos::list))
        .route("/v1/repos", post(repos::create))
        .route("/v1/repos/{id}", delete(repos::delete))
        .route("/v1/bdh/sync", post(bdh::sync))
        .route("/v1/bdh/check", post(bdh::check))
        .route("/v1/beads/issues", get(beads::list_issues))
        .route("/v1/beads/issues/{bead_id}", get(beads::get_issue))
        .route("/v1/beads/ready", get(beads::ready))
        .route("/v1/claims", get(claims::list))
        .route("/v1/claims", post(claims::acquire))
        .route("/v1/claims/{bead_id}", delete(claims::release))
        .route("/v1/status", get(status::snapshot))
        .route("/v1/messages", post(messages::send))
        .route("/v1/messages/inbox", get(messages::inbox))
        .route("/v1/messages/{id}/ack", post(messages::ack))
        .route("/v1/chat/sessions", get(chat::list_sessions))
        .route("/v1/chat/sessions/{id}/messages", get(chat::history))
        .route("/v1/chat/pending", get(chat::pending))
        .route("/v1/chat/sessions/{id}/extend-wait", post(chat::extend_wait))
        .route("/v1/chat/admin/sessions", get(chat::admin_list_sessions))
        .route("/v1/chat/admin/sessions/{id}/join", post(chat::admin_join))
        .route(
            "/v1/chat/admin/sessions/{id}/messages",
            get(chat::admin_history),
        )
        .route("/v1/reservations", post(reservations::acquire))
        .route("/v1/reservations", get(reservations::list))
        .route("/v1/reservations/{*path}", delete(reservations::release))
        .route("/v1/policies/active", get(policies::get_active))
        .route("/v1/policies/history", get(policies::history))
        .route("/v1/policies/reset", post(policies::reset))
        .route("/v1/policies", post(policies::create))
        .route("/v1/policies/{id}", get(policies::get_by_id))
        .route("/v1/policies/{id}/activate", post(policies::activate))
        .route("/v1/escalations", post(escalations::create))
        .route("/v1/escalations", get(escalations::list))
        .route("/v1/escalations/{id}", get(escalations::get_escalation))
        .route("/v1/escalations/{id}/respond", post(escalations::respond))
        .route("/v1/subscriptions", post(subscriptions::subscribe))
        .route("/v1/subscriptions", get(subscriptions::list))
        .route("/v1/subscriptions/{id}", delete(subscriptions::unsubscribe))
        .route("/v1/dashboard/config", get(dashboard::config))
        .route("/v1/dashboard/identity", post(dashboard::identity))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/health", get(health))
        .merge(timed)
        .merge(long_lived)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
