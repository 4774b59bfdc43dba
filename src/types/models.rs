use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "public" => Some(Visibility::Public),
            _ => None,
        }
    }
}

/// Tenant boundary. Everything else is scoped by `project_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub slug: String,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_policy_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A git repository, keyed by canonical origin within a project.
/// The project binding is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub project_id: String,
    pub origin_url: String,
    pub canonical_origin: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Agent,
    Dashboard,
}

impl WorkspaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceKind::Agent => "agent",
            WorkspaceKind::Dashboard => "dashboard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(WorkspaceKind::Agent),
            "dashboard" => Some(WorkspaceKind::Dashboard),
            _ => None,
        }
    }
}

/// An agent's identity within a project. `workspace_id` equals the agent id
/// in the auth layer. Project, repo, alias, and kind never change after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    pub alias: String,
    pub human_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub kind: WorkspaceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    /// Apex bead this workspace is focused on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_bead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Reference to a bead in a specific repo/branch. `blocked_by` and parent
/// links use this tuple so dependencies may cross repos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeadRef {
    pub repo: String,
    pub branch: String,
    pub bead_id: String,
}

/// Mirror of one issue from the client-side tracker, keyed by
/// `(project_id, bead_id)`. The client is the authority; the server stores
/// an indexed copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub project_id: String,
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub labels: Vec<String>,
    pub blocked_by: Vec<BeadRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<BeadRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A workspace's declaration that it is working on a bead. Several
/// workspaces may hold claims on the same bead when jump-in is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub project_id: String,
    pub bead_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub human_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apex_bead_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub bead_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub event_types: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "completed" => Some(OutboxStatus::Completed),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// Durable notification envelope, co-committed with the event it reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub fingerprint: String,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invariant {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body_md: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolePlaybook {
    pub title: String,
    #[serde(default)]
    pub playbook_md: String,
}

/// Versioned policy content: invariants every workspace follows, per-role
/// playbooks, and tool adapter templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default)]
    pub invariants: Vec<Invariant>,
    #[serde(default)]
    pub roles: BTreeMap<String, RolePlaybook>,
    #[serde(default)]
    pub adapters: serde_json::Map<String, serde_json::Value>,
}

impl PolicyBundle {
    /// Canonical serialisation used for idempotent-create comparison.
    /// BTreeMap keys and serde_json's preserved ordering make this stable.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub project_id: String,
    pub version: i64,
    pub bundle: PolicyBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_workspace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Responded,
    Expired,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Responded => "responded",
            EscalationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EscalationStatus::Pending),
            "responded" => Some(EscalationStatus::Responded),
            "expired" => Some(EscalationStatus::Expired),
            _ => None,
        }
    }
}

/// A request for human intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_email: Option<String>,
    pub subject: String,
    pub situation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub status: EscalationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MailPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailPriority::Low => "low",
            MailPriority::Normal => "normal",
            MailPriority::High => "high",
            MailPriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(MailPriority::Low),
            "normal" => Some(MailPriority::Normal),
            "high" => Some(MailPriority::High),
            "urgent" => Some(MailPriority::Urgent),
            _ => None,
        }
    }
}

/// Durable mail from one workspace to another, read-receipted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub from_workspace_id: String,
    pub from_alias: String,
    pub to_workspace_id: String,
    pub to_alias: String,
    pub subject: String,
    pub body: String,
    pub priority: MailPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatParticipant {
    pub workspace_id: String,
    pub alias: String,
}

/// Persistent conversation over an unordered participant set. Sessions are
/// never closed; the same participants reuse the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub project_id: String,
    pub participants: Vec<ChatParticipant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub project_id: String,
    pub from_workspace_id: String,
    pub from_alias: String,
    pub body: String,
    pub leaving: bool,
    pub created_at: DateTime<Utc>,
}

/// Auth-layer identity record. A workspace's id is its agent id; dashboard
/// principals get agent rows too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
}

/// Hashed API key. The plaintext is returned exactly once at mint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub event_type: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
