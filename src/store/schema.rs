/// Forward-only schema, applied idempotently at startup.
///
/// Three logical namespaces share one database: `auth_*` (identity and the
/// messaging plane), `server_*` (coordination domain), `beads_*` (issue
/// mirror). Every mutable table carries `project_id`.
pub const SCHEMA: &str = r#"
-- ==== auth namespace ====

CREATE TABLE IF NOT EXISTS auth_agents (
    agent_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_api_keys (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    agent_id TEXT REFERENCES auth_agents(agent_id),
    key_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_keys_project ON auth_api_keys(project_id);

CREATE TABLE IF NOT EXISTS auth_messages (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    from_workspace_id TEXT NOT NULL,
    from_alias TEXT NOT NULL,
    to_workspace_id TEXT NOT NULL,
    to_alias TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    priority TEXT NOT NULL DEFAULT 'normal',
    thread_id TEXT,
    read INTEGER NOT NULL DEFAULT 0,
    read_by TEXT,
    read_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_inbox
    ON auth_messages(project_id, to_workspace_id, created_at);

-- participants_key is the sorted workspace-id set; one persistent session
-- per participant set and project.
CREATE TABLE IF NOT EXISTS auth_chat_sessions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    participants_key TEXT NOT NULL,
    participants_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(project_id, participants_key)
);

CREATE TABLE IF NOT EXISTS auth_chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES auth_chat_sessions(id),
    project_id TEXT NOT NULL,
    from_workspace_id TEXT NOT NULL,
    from_alias TEXT NOT NULL,
    body TEXT NOT NULL,
    leaving INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_session
    ON auth_chat_messages(session_id, created_at);

-- ==== server namespace ====

CREATE TABLE IF NOT EXISTS server_projects (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    slug TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'private',
    active_policy_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Slug is unique among active projects, per tenant (globally when untenanted).
CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_slug
    ON server_projects(COALESCE(tenant_id, ''), slug) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS server_repos (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES server_projects(id),
    origin_url TEXT NOT NULL,
    canonical_origin TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT,
    UNIQUE(project_id, canonical_origin)
);

CREATE TABLE IF NOT EXISTS server_workspaces (
    workspace_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES server_projects(id),
    repo_id TEXT REFERENCES server_repos(id),
    alias TEXT NOT NULL,
    human_name TEXT NOT NULL DEFAULT '',
    role TEXT,
    kind TEXT NOT NULL DEFAULT 'agent',
    current_branch TEXT,
    focus_bead_id TEXT,
    hostname TEXT,
    workspace_path TEXT,
    timezone TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_seen_at TEXT,
    deleted_at TEXT
);

-- Aliases are unique among active workspaces; soft-deleted aliases are
-- reusable.
CREATE UNIQUE INDEX IF NOT EXISTS idx_workspaces_alias
    ON server_workspaces(project_id, alias) WHERE deleted_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_workspaces_project ON server_workspaces(project_id);

-- Bindings are immutable for a workspace's lifetime; updates that touch
-- them fail loudly rather than silently re-homing rows.
CREATE TRIGGER IF NOT EXISTS trg_workspaces_immutable
BEFORE UPDATE ON server_workspaces
FOR EACH ROW
WHEN NEW.project_id != OLD.project_id
  OR COALESCE(NEW.repo_id, '') != COALESCE(OLD.repo_id, '')
  OR NEW.alias != OLD.alias
  OR NEW.kind != OLD.kind
BEGIN
    SELECT RAISE(ABORT, 'immutable column');
END;

CREATE TRIGGER IF NOT EXISTS trg_repos_immutable
BEFORE UPDATE ON server_repos
FOR EACH ROW
WHEN NEW.project_id != OLD.project_id
BEGIN
    SELECT RAISE(ABORT, 'immutable column');
END;

CREATE TABLE IF NOT EXISTS server_bead_claims (
    project_id TEXT NOT NULL,
    bead_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    alias TEXT NOT NULL,
    human_name TEXT NOT NULL DEFAULT '',
    apex_bead_id TEXT,
    claimed_at TEXT NOT NULL,
    PRIMARY KEY (project_id, bead_id, workspace_id)
);

CREATE INDEX IF NOT EXISTS idx_claims_workspace
    ON server_bead_claims(project_id, workspace_id);

CREATE TABLE IF NOT EXISTS server_escalations (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    alias TEXT NOT NULL,
    member_email TEXT,
    subject TEXT NOT NULL,
    situation TEXT NOT NULL,
    options_json TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    response TEXT,
    response_note TEXT,
    created_at TEXT NOT NULL,
    responded_at TEXT,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_escalations_project
    ON server_escalations(project_id, created_at);

-- repo is '' for repo-agnostic subscriptions so the uniqueness constraint
-- covers both forms.
CREATE TABLE IF NOT EXISTS server_subscriptions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    alias TEXT NOT NULL,
    bead_id TEXT NOT NULL,
    repo TEXT NOT NULL DEFAULT '',
    event_types_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(project_id, workspace_id, bead_id, repo)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_bead
    ON server_subscriptions(project_id, bead_id);

CREATE TABLE IF NOT EXISTS server_notification_outbox (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    alias TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    next_attempt_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT,
    message_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_drain
    ON server_notification_outbox(status, created_at);

CREATE INDEX IF NOT EXISTS idx_outbox_fingerprint
    ON server_notification_outbox(workspace_id, fingerprint);

CREATE TABLE IF NOT EXISTS server_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    workspace_id TEXT,
    event_type TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_project ON server_audit_log(project_id, created_at);

CREATE TABLE IF NOT EXISTS server_project_policies (
    policy_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES server_projects(id),
    version INTEGER NOT NULL,
    bundle_json TEXT NOT NULL,
    created_by_workspace_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(project_id, version)
);

-- ==== beads namespace ====

CREATE TABLE IF NOT EXISTS beads_issues (
    project_id TEXT NOT NULL,
    bead_id TEXT NOT NULL,
    repo TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'open',
    priority INTEGER NOT NULL DEFAULT 2,
    issue_type TEXT,
    assignee TEXT,
    created_by TEXT,
    labels_json TEXT NOT NULL DEFAULT '[]',
    blocked_by_json TEXT NOT NULL DEFAULT '[]',
    parent_json TEXT,
    created_at TEXT,
    updated_at TEXT,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (project_id, bead_id)
);

CREATE INDEX IF NOT EXISTS idx_issues_repo ON beads_issues(project_id, repo, branch);
CREATE INDEX IF NOT EXISTS idx_issues_status ON beads_issues(project_id, status);
"#;
