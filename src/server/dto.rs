use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ephemeral::PresenceTier;
use crate::types::{Claim, Workspace};

/// Workspace as rendered to clients. Public readers see aliases but no
/// PII: human names (and any member emails) are stripped.
#[derive(Debug, Serialize)]
pub struct WorkspaceView {
    pub workspace_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_bead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub presence: &'static str,
}

impl WorkspaceView {
    pub fn render(ws: &Workspace, presence_ttl: u64, redact: bool) -> Self {
        let tier = PresenceTier::from_last_seen(ws.last_seen_at, presence_ttl, Utc::now());
        Self {
            workspace_id: ws.workspace_id.clone(),
            project_id: ws.project_id.clone(),
            repo_id: ws.repo_id.clone(),
            alias: ws.alias.clone(),
            human_name: (!redact).then(|| ws.human_name.clone()),
            role: ws.role.clone(),
            kind: ws.kind.as_str(),
            current_branch: ws.current_branch.clone(),
            focus_bead_id: ws.focus_bead_id.clone(),
            hostname: (!redact).then(|| ws.hostname.clone()).flatten(),
            workspace_path: (!redact).then(|| ws.workspace_path.clone()).flatten(),
            timezone: ws.timezone.clone(),
            created_at: ws.created_at,
            last_seen_at: ws.last_seen_at,
            deleted_at: ws.deleted_at,
            presence: tier.as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClaimView {
    pub bead_id: String,
    pub workspace_id: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apex_bead_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub project_id: String,
}

impl ClaimView {
    pub fn render(claim: &Claim, redact: bool) -> Self {
        Self {
            bead_id: claim.bead_id.clone(),
            workspace_id: claim.workspace_id.clone(),
            alias: claim.alias.clone(),
            human_name: (!redact).then(|| claim.human_name.clone()),
            apex_bead_id: claim.apex_bead_id.clone(),
            claimed_at: claim.claimed_at,
            project_id: claim.project_id.clone(),
        }
    }
}
