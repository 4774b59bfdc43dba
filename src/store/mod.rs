mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::sync::{ClaimSnapshotEntry, SyncOutcome};
use crate::types::*;

/// Filters for issue listing.
#[derive(Debug, Default, Clone)]
pub struct IssueFilter {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub status: Option<String>,
    pub assignee: Option<String>,
    /// Substring match over title/description.
    pub search: Option<String>,
}

/// Store defines the durable-storage interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;
    fn health_check(&self) -> Result<()>;

    // Project operations
    fn create_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: &str) -> Result<Option<Project>>;
    fn get_project_by_slug(&self, tenant_id: Option<&str>, slug: &str)
        -> Result<Option<Project>>;
    fn set_active_policy(&self, project_id: &str, policy_id: &str) -> Result<()>;

    // Repo operations
    fn upsert_repo(&self, repo: &Repo) -> Result<Repo>;
    fn get_repo_by_id(&self, project_id: &str, id: &str) -> Result<Option<Repo>>;
    fn get_repo_by_origin(&self, project_id: &str, canonical_origin: &str)
        -> Result<Option<Repo>>;
    fn list_repos(&self, project_id: &str) -> Result<Vec<Repo>>;
    fn soft_delete_repo(&self, project_id: &str, id: &str, now: DateTime<Utc>) -> Result<bool>;

    // Auth operations
    fn create_agent(&self, agent: &Agent) -> Result<()>;
    fn create_api_key(&self, key: &ApiKey) -> Result<()>;
    fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>>;

    // Workspace operations
    fn create_workspace(&self, ws: &Workspace) -> Result<()>;
    fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>>;
    fn get_workspace_by_alias(&self, project_id: &str, alias: &str) -> Result<Option<Workspace>>;
    fn list_workspaces(&self, project_id: &str, include_deleted: bool) -> Result<Vec<Workspace>>;
    /// Persists the mutable fields of `ws` (role, names, focus, branch,
    /// timezone, host, path, last_seen). Immutable bindings are guarded by a
    /// trigger and never written here.
    fn update_workspace(&self, ws: &Workspace) -> Result<()>;
    fn touch_last_seen(
        &self,
        project_id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
    fn soft_delete_workspace(
        &self,
        project_id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    fn restore_workspace(&self, project_id: &str, workspace_id: &str) -> Result<Workspace>;

    // Claim operations
    fn list_claimants(&self, project_id: &str, bead_id: &str) -> Result<Vec<Claim>>;
    fn upsert_claim(&self, claim: &Claim) -> Result<()>;
    fn delete_claim(&self, project_id: &str, workspace_id: &str, bead_id: &str) -> Result<bool>;
    fn list_claims(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
        limit: usize,
        before: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Claim>>;
    /// Beads with two or more active claimants.
    fn list_claim_conflicts(&self, project_id: &str) -> Result<Vec<(String, Vec<Claim>)>>;

    // Issue operations
    fn get_issue(&self, project_id: &str, bead_id: &str) -> Result<Option<Issue>>;
    fn list_issues(
        &self,
        project_id: &str,
        filter: &IssueFilter,
        limit: usize,
        after_bead_id: Option<&str>,
    ) -> Result<Vec<Issue>>;
    fn list_all_issues(&self, project_id: &str) -> Result<Vec<Issue>>;
    fn count_issues(&self, project_id: &str, repo: Option<&str>) -> Result<i64>;

    /// Apply one client sync in a single transaction: upsert issues, detect
    /// status transitions, hard-delete rows, reconcile the workspace's
    /// claims against the snapshot, and enqueue one outbox entry per
    /// subscriber of each status change.
    #[allow(clippy::too_many_arguments)]
    fn apply_sync(
        &self,
        project_id: &str,
        workspace: &Workspace,
        issues: &[Issue],
        deleted_ids: &[String],
        claims_snapshot: Option<&[ClaimSnapshotEntry]>,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome>;

    // Subscription operations
    fn upsert_subscription(&self, sub: &Subscription) -> Result<(Subscription, bool)>;
    fn delete_subscription(&self, project_id: &str, id: &str, workspace_id: &str) -> Result<bool>;
    fn list_subscriptions(&self, project_id: &str, workspace_id: &str) -> Result<Vec<Subscription>>;

    // Mail operations
    fn create_message(&self, message: &Message) -> Result<()>;
    fn get_message(&self, project_id: &str, id: &str) -> Result<Option<Message>>;
    fn list_inbox(
        &self,
        project_id: &str,
        workspace_id: &str,
        limit: usize,
        unread_only: bool,
        before: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Message>>;
    fn count_unread(&self, project_id: &str, workspace_id: &str) -> Result<i64>;
    /// Marks a message read. Idempotent: a second ack returns the row
    /// unchanged, preserving the first `read_at`.
    fn ack_message(
        &self,
        project_id: &str,
        id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Message>;

    // Chat operations
    fn get_or_create_chat_session(
        &self,
        project_id: &str,
        participants: &[ChatParticipant],
        now: DateTime<Utc>,
    ) -> Result<(ChatSession, bool)>;
    fn get_chat_session(&self, project_id: &str, id: &str) -> Result<Option<ChatSession>>;
    fn add_chat_participant(
        &self,
        project_id: &str,
        session_id: &str,
        participant: &ChatParticipant,
        now: DateTime<Utc>,
    ) -> Result<ChatSession>;
    fn insert_chat_message(&self, message: &ChatMessage) -> Result<()>;
    fn list_chat_messages(&self, project_id: &str, session_id: &str) -> Result<Vec<ChatMessage>>;
    fn list_chat_sessions(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
    ) -> Result<Vec<ChatSession>>;
    /// Sessions where another participant wrote after this workspace's last
    /// message, with the count of such messages.
    fn list_pending_chat(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<(ChatSession, i64)>>;

    // Escalation operations
    fn create_escalation(&self, escalation: &Escalation) -> Result<()>;
    fn get_escalation(
        &self,
        project_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Escalation>>;
    fn list_escalations(
        &self,
        project_id: &str,
        status: Option<EscalationStatus>,
        limit: usize,
        before: Option<(DateTime<Utc>, String)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Escalation>>;
    fn respond_escalation(
        &self,
        project_id: &str,
        id: &str,
        response: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Escalation>;

    // Outbox operations
    fn claim_outbox_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;
    fn complete_outbox(&self, id: &str, message_id: Option<&str>, now: DateTime<Utc>) -> Result<()>;
    fn fail_outbox(
        &self,
        id: &str,
        error: &str,
        max_attempts: i64,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    fn has_completed_fingerprint(&self, workspace_id: &str, fingerprint: &str) -> Result<bool>;

    // Policy operations
    fn get_active_policy(&self, project_id: &str) -> Result<Option<Policy>>;
    fn get_policy(&self, project_id: &str, policy_id: &str) -> Result<Option<Policy>>;
    fn list_policy_history(&self, project_id: &str, limit: usize) -> Result<Vec<Policy>>;
    /// Allocates the next version under the project write lock. Returns
    /// `(existing, false)` when the bundle equals the latest version. A
    /// supplied `base_policy_id` is a compare-and-swap on the activation
    /// pointer: it must name the active policy (else `conflict`) and the
    /// new version activates in the same transaction.
    fn create_policy_version(
        &self,
        project_id: &str,
        bundle: &PolicyBundle,
        base_policy_id: Option<&str>,
        created_by_workspace_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Policy, bool)>;
    fn activate_policy(&self, project_id: &str, policy_id: &str) -> Result<()>;

    // Audit log
    fn append_audit(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
        event_type: &str,
        details: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
