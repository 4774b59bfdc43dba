//! Identity resolution for requests.
//!
//! Two modes, chosen per request: a signed proxy context injected by a
//! trusted gateway, or a bearer API key. The resolved [`AuthIdentity`]
//! carries the project scope every query must filter by.

pub mod proxy;
pub mod token;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};

use crate::server::response::ApiError;
use crate::server::AppState;
use crate::types::{Project, Visibility, Workspace};

pub use proxy::{parse_proxy_context, sign_context, PrincipalType, ProxyContext};
pub use token::{generate_api_key, hash_api_key, parse_bearer, KEY_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Bearer,
    Proxy,
}

/// The authenticated caller. `project` is the tenant scope; `agent_id` is
/// the bound workspace identity when the credential has one.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub project: Project,
    pub agent_id: Option<String>,
    pub api_key_id: Option<String>,
    pub user_id: Option<String>,
    pub mode: AuthMode,
    pub public_reader: bool,
}

impl AuthIdentity {
    pub fn project_id(&self) -> &str {
        &self.project.id
    }

    /// Reject requests where a bearer credential bound to one agent names a
    /// different workspace. Project-scoped keys (no agent binding) pass,
    /// as does proxy mode, where the gateway owns actor binding.
    pub fn enforce_actor_binding(&self, workspace_id: &str) -> Result<(), ApiError> {
        if self.mode == AuthMode::Bearer {
            if let Some(agent_id) = &self.agent_id {
                if agent_id != workspace_id {
                    return Err(ApiError::forbidden(
                        "workspace_id does not match API key identity",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Public readers get read-only access; every write refuses them.
    pub fn require_writer(&self) -> Result<(), ApiError> {
        if self.public_reader {
            return Err(ApiError::forbidden("public readers cannot write"));
        }
        Ok(())
    }
}

/// Extractor that resolves the request's identity or rejects with 401/403.
pub struct RequireIdentity(pub AuthIdentity);

impl FromRequestParts<Arc<AppState>> for RequireIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // 1) Trusted proxy context; any public headers are ignored once it
        //    verifies.
        let proxy_ctx =
            parse_proxy_context(&parts.headers, state.config.internal_auth_secret.as_deref())
                .map_err(ApiError::from)?;

        if let Some(ctx) = proxy_ctx {
            let project = load_project(state, &ctx.project_id)?;
            let public_reader = ctx.principal_type == PrincipalType::PublicReader;
            if public_reader && project.visibility != Visibility::Public {
                return Err(ApiError::forbidden("project is not public"));
            }
            return Ok(RequireIdentity(AuthIdentity {
                project,
                agent_id: (!public_reader).then(|| ctx.actor_id.clone()),
                api_key_id: (ctx.principal_type == PrincipalType::ApiKey)
                    .then(|| ctx.principal_id.clone()),
                user_id: (ctx.principal_type == PrincipalType::User)
                    .then(|| ctx.principal_id.clone()),
                mode: AuthMode::Proxy,
                public_reader,
            }));
        }

        // 2) Bearer API key.
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(ApiError::unauthenticated)?;
        let raw = parse_bearer(header).map_err(ApiError::from)?;
        let key = state
            .store
            .get_api_key_by_hash(&hash_api_key(raw))
            .map_err(ApiError::from)?
            .ok_or_else(ApiError::unauthenticated)?;

        let project = load_project(state, &key.project_id)?;
        Ok(RequireIdentity(AuthIdentity {
            project,
            agent_id: key.agent_id.clone(),
            api_key_id: Some(key.id),
            user_id: None,
            mode: AuthMode::Bearer,
            public_reader: false,
        }))
    }
}

fn load_project(state: &AppState, project_id: &str) -> Result<Project, ApiError> {
    let project = state
        .store
        .get_project(project_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;
    if project.deleted_at.is_some() {
        return Err(ApiError::not_found("Project not found"));
    }
    Ok(project)
}

/// Verify a body-named workspace: it must exist, be live, belong to the
/// caller's project, and satisfy actor binding. Existence checks run first
/// so ghost workspaces still 404 instead of 403.
pub fn verify_workspace_access(
    state: &AppState,
    identity: &AuthIdentity,
    workspace_id: &str,
) -> Result<Workspace, ApiError> {
    let ws = state
        .store
        .get_workspace(workspace_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Workspace not found"))?;
    if ws.deleted_at.is_some() {
        return Err(ApiError::not_found("Workspace was deleted"));
    }
    if ws.project_id != identity.project_id() {
        return Err(ApiError::forbidden(
            "Workspace not found or does not belong to your project",
        ));
    }
    identity.enforce_actor_binding(workspace_id)?;
    Ok(ws)
}
