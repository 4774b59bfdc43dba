use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use super::schema::SCHEMA;
use super::{IssueFilter, Store};
use crate::error::{Error, Result};
use crate::sync::{status_change_fingerprint, ClaimSnapshotEntry, StatusChange, SyncOutcome};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Guard to the underlying connection, for embedding applications that
    /// need custom SQL.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn format_opt_datetime(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(format_datetime)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn get_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(parse_datetime(&row.get::<_, String>(idx)?))
}

fn get_opt_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .map(|s| parse_datetime(&s)))
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

// Row mappers. Column order matches the SELECT lists below.

const PROJECT_COLS: &str =
    "id, tenant_id, slug, visibility, active_policy_id, created_at, updated_at, deleted_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        slug: row.get(2)?,
        visibility: Visibility::parse(&row.get::<_, String>(3)?).unwrap_or(Visibility::Private),
        active_policy_id: row.get(4)?,
        created_at: get_datetime(row, 5)?,
        updated_at: get_datetime(row, 6)?,
        deleted_at: get_opt_datetime(row, 7)?,
    })
}

const REPO_COLS: &str = "id, project_id, origin_url, canonical_origin, name, created_at, deleted_at";

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repo> {
    Ok(Repo {
        id: row.get(0)?,
        project_id: row.get(1)?,
        origin_url: row.get(2)?,
        canonical_origin: row.get(3)?,
        name: row.get(4)?,
        created_at: get_datetime(row, 5)?,
        deleted_at: get_opt_datetime(row, 6)?,
    })
}

const WORKSPACE_COLS: &str = "workspace_id, project_id, repo_id, alias, human_name, role, kind, \
     current_branch, focus_bead_id, hostname, workspace_path, timezone, created_at, updated_at, \
     last_seen_at, deleted_at";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        workspace_id: row.get(0)?,
        project_id: row.get(1)?,
        repo_id: row.get(2)?,
        alias: row.get(3)?,
        human_name: row.get(4)?,
        role: row.get(5)?,
        kind: WorkspaceKind::parse(&row.get::<_, String>(6)?).unwrap_or(WorkspaceKind::Agent),
        current_branch: row.get(7)?,
        focus_bead_id: row.get(8)?,
        hostname: row.get(9)?,
        workspace_path: row.get(10)?,
        timezone: row.get(11)?,
        created_at: get_datetime(row, 12)?,
        updated_at: get_datetime(row, 13)?,
        last_seen_at: get_opt_datetime(row, 14)?,
        deleted_at: get_opt_datetime(row, 15)?,
    })
}

const CLAIM_COLS: &str =
    "project_id, bead_id, workspace_id, alias, human_name, apex_bead_id, claimed_at";

fn claim_from_row(row: &Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        project_id: row.get(0)?,
        bead_id: row.get(1)?,
        workspace_id: row.get(2)?,
        alias: row.get(3)?,
        human_name: row.get(4)?,
        apex_bead_id: row.get(5)?,
        claimed_at: get_datetime(row, 6)?,
    })
}

const ISSUE_COLS: &str = "project_id, bead_id, repo, branch, title, description, status, \
     priority, issue_type, assignee, created_by, labels_json, blocked_by_json, parent_json, \
     created_at, updated_at";

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        project_id: row.get(0)?,
        bead_id: row.get(1)?,
        repo: row.get(2)?,
        branch: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        status: row.get(6)?,
        priority: row.get(7)?,
        issue_type: row.get(8)?,
        assignee: row.get(9)?,
        created_by: row.get(10)?,
        labels: json_or_default(&row.get::<_, String>(11)?),
        blocked_by: json_or_default(&row.get::<_, String>(12)?),
        parent: row
            .get::<_, Option<String>>(13)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: get_opt_datetime(row, 14)?,
        updated_at: get_opt_datetime(row, 15)?,
    })
}

const SUBSCRIPTION_COLS: &str =
    "id, project_id, workspace_id, alias, bead_id, repo, event_types_json, created_at";

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let repo: String = row.get(5)?;
    Ok(Subscription {
        id: row.get(0)?,
        project_id: row.get(1)?,
        workspace_id: row.get(2)?,
        alias: row.get(3)?,
        bead_id: row.get(4)?,
        repo: if repo.is_empty() { None } else { Some(repo) },
        event_types: json_or_default(&row.get::<_, String>(6)?),
        created_at: get_datetime(row, 7)?,
    })
}

const MESSAGE_COLS: &str = "id, project_id, from_workspace_id, from_alias, to_workspace_id, \
     to_alias, subject, body, priority, thread_id, read, read_by, read_at, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        project_id: row.get(1)?,
        from_workspace_id: row.get(2)?,
        from_alias: row.get(3)?,
        to_workspace_id: row.get(4)?,
        to_alias: row.get(5)?,
        subject: row.get(6)?,
        body: row.get(7)?,
        priority: MailPriority::parse(&row.get::<_, String>(8)?).unwrap_or(MailPriority::Normal),
        thread_id: row.get(9)?,
        read: row.get::<_, i64>(10)? != 0,
        read_by: row.get(11)?,
        read_at: get_opt_datetime(row, 12)?,
        created_at: get_datetime(row, 13)?,
    })
}

const CHAT_SESSION_COLS: &str = "id, project_id, participants_json, created_at, updated_at";

fn chat_session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        project_id: row.get(1)?,
        participants: json_or_default(&row.get::<_, String>(2)?),
        created_at: get_datetime(row, 3)?,
        updated_at: get_datetime(row, 4)?,
    })
}

const CHAT_MESSAGE_COLS: &str =
    "id, session_id, project_id, from_workspace_id, from_alias, body, leaving, created_at";

fn chat_message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project_id: row.get(2)?,
        from_workspace_id: row.get(3)?,
        from_alias: row.get(4)?,
        body: row.get(5)?,
        leaving: row.get::<_, i64>(6)? != 0,
        created_at: get_datetime(row, 7)?,
    })
}

const ESCALATION_COLS: &str = "id, project_id, workspace_id, alias, member_email, subject, \
     situation, options_json, status, response, response_note, created_at, responded_at, \
     expires_at";

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        workspace_id: row.get(2)?,
        alias: row.get(3)?,
        member_email: row.get(4)?,
        subject: row.get(5)?,
        situation: row.get(6)?,
        options: row
            .get::<_, Option<String>>(7)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        status: EscalationStatus::parse(&row.get::<_, String>(8)?)
            .unwrap_or(EscalationStatus::Pending),
        response: row.get(9)?,
        response_note: row.get(10)?,
        created_at: get_datetime(row, 11)?,
        responded_at: get_opt_datetime(row, 12)?,
        expires_at: get_datetime(row, 13)?,
    })
}

const OUTBOX_COLS: &str = "id, project_id, workspace_id, alias, event_type, payload_json, \
     fingerprint, attempts, last_error, status, created_at, updated_at, processed_at, message_id";

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.get(0)?,
        project_id: row.get(1)?,
        workspace_id: row.get(2)?,
        alias: row.get(3)?,
        event_type: row.get(4)?,
        payload: serde_json::from_str(&row.get::<_, String>(5)?)
            .unwrap_or(serde_json::Value::Null),
        fingerprint: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        status: OutboxStatus::parse(&row.get::<_, String>(9)?).unwrap_or(OutboxStatus::Pending),
        created_at: get_datetime(row, 10)?,
        updated_at: get_datetime(row, 11)?,
        processed_at: get_opt_datetime(row, 12)?,
        message_id: row.get(13)?,
    })
}

const POLICY_COLS: &str = "policy_id, project_id, version, bundle_json, \
     created_by_workspace_id, created_at, updated_at";

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        policy_id: row.get(0)?,
        project_id: row.get(1)?,
        version: row.get(2)?,
        bundle: json_or_default(&row.get::<_, String>(3)?),
        created_by_workspace_id: row.get(4)?,
        created_at: get_datetime(row, 5)?,
        updated_at: get_datetime(row, 6)?,
    })
}

fn participants_key(participants: &[ChatParticipant]) -> String {
    let mut ids: Vec<&str> = participants
        .iter()
        .map(|p| p.workspace_id.as_str())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}

fn subscription_matches(sub: &Subscription, event_type: &str, repo: &str) -> bool {
    if let Some(sub_repo) = &sub.repo {
        if sub_repo != repo {
            return false;
        }
    }
    sub.event_types
        .iter()
        .any(|t| t == event_type || t == "all")
}

impl SqliteStore {
    fn enqueue_status_notifications(
        tx: &Transaction<'_>,
        project_id: &str,
        actor: &Workspace,
        changes: &[StatusChange],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut queued = 0;
        for change in changes {
            let subs: Vec<Subscription> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLS} FROM server_subscriptions
                     WHERE project_id = ?1 AND bead_id = ?2"
                ))?;
                let rows = stmt.query_map(
                    params![project_id, change.bead_id],
                    subscription_from_row,
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            let fingerprint = status_change_fingerprint(change);
            let mut payload = serde_json::to_value(change)
                .map_err(|e| Error::Internal(format!("serialize status change: {e}")))?;
            if let Some(map) = payload.as_object_mut() {
                map.insert(
                    "actor_workspace_id".to_string(),
                    serde_json::Value::String(actor.workspace_id.clone()),
                );
                map.insert(
                    "actor_alias".to_string(),
                    serde_json::Value::String(actor.alias.clone()),
                );
            }

            for sub in subs {
                if !subscription_matches(&sub, "status_change", &change.repo) {
                    continue;
                }
                // The syncing workspace caused the transition; don't notify it
                // about its own change.
                if sub.workspace_id == actor.workspace_id {
                    continue;
                }
                tx.execute(
                    "INSERT INTO server_notification_outbox
                         (id, project_id, workspace_id, alias, event_type, payload_json,
                          fingerprint, attempts, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'status_change', ?5, ?6, 0, 'pending', ?7, ?7)",
                    params![
                        Uuid::new_v4().to_string(),
                        project_id,
                        sub.workspace_id,
                        sub.alias,
                        payload.to_string(),
                        fingerprint,
                        format_datetime(&now),
                    ],
                )?;
                queued += 1;
            }
        }
        Ok(queued)
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // Project operations

    fn create_project(&self, project: &Project) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO server_projects
                     (id, tenant_id, slug, visibility, active_policy_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project.id,
                    project.tenant_id,
                    project.slug,
                    project.visibility.as_str(),
                    project.active_policy_id,
                    format_datetime(&project.created_at),
                    format_datetime(&project.updated_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::Conflict(format!("project slug '{}' is taken", project.slug))
                }
                other => Error::from(other),
            })?;
        Ok(())
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn()
            .query_row(
                &format!("SELECT {PROJECT_COLS} FROM server_projects WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_project_by_slug(
        &self,
        tenant_id: Option<&str>,
        slug: &str,
    ) -> Result<Option<Project>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {PROJECT_COLS} FROM server_projects
                     WHERE COALESCE(tenant_id, '') = COALESCE(?1, '') AND slug = ?2
                       AND deleted_at IS NULL"
                ),
                params![tenant_id, slug],
                project_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn set_active_policy(&self, project_id: &str, policy_id: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE server_projects SET active_policy_id = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![project_id, policy_id, format_datetime(&Utc::now())],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    // Repo operations

    fn upsert_repo(&self, repo: &Repo) -> Result<Repo> {
        let conn = self.conn();
        // Re-registering a soft-deleted repo revives it; the project binding
        // never changes.
        conn.execute(
            "INSERT INTO server_repos
                 (id, project_id, origin_url, canonical_origin, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (project_id, canonical_origin)
             DO UPDATE SET origin_url = excluded.origin_url, deleted_at = NULL",
            params![
                repo.id,
                repo.project_id,
                repo.origin_url,
                repo.canonical_origin,
                repo.name,
                format_datetime(&repo.created_at),
            ],
        )?;
        conn.query_row(
            &format!(
                "SELECT {REPO_COLS} FROM server_repos
                 WHERE project_id = ?1 AND canonical_origin = ?2"
            ),
            params![repo.project_id, repo.canonical_origin],
            repo_from_row,
        )
        .map_err(Error::from)
    }

    fn get_repo_by_id(&self, project_id: &str, id: &str) -> Result<Option<Repo>> {
        self.conn()
            .query_row(
                &format!("SELECT {REPO_COLS} FROM server_repos WHERE id = ?1 AND project_id = ?2"),
                params![id, project_id],
                repo_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_repo_by_origin(
        &self,
        project_id: &str,
        canonical_origin: &str,
    ) -> Result<Option<Repo>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {REPO_COLS} FROM server_repos
                     WHERE project_id = ?1 AND canonical_origin = ?2 AND deleted_at IS NULL"
                ),
                params![project_id, canonical_origin],
                repo_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_repos(&self, project_id: &str) -> Result<Vec<Repo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPO_COLS} FROM server_repos
             WHERE project_id = ?1 AND deleted_at IS NULL ORDER BY canonical_origin"
        ))?;
        let rows = stmt.query_map(params![project_id], repo_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn soft_delete_repo(&self, project_id: &str, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE server_repos SET deleted_at = ?3
             WHERE id = ?1 AND project_id = ?2 AND deleted_at IS NULL",
            params![id, project_id, format_datetime(&now)],
        )?;
        Ok(rows > 0)
    }

    // Auth operations

    fn create_agent(&self, agent: &Agent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO auth_agents (agent_id, project_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (agent_id) DO NOTHING",
            params![
                agent.agent_id,
                agent.project_id,
                format_datetime(&agent.created_at)
            ],
        )?;
        Ok(())
    }

    fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO auth_api_keys (id, project_id, agent_id, key_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.id,
                key.project_id,
                key.agent_id,
                key.key_hash,
                format_datetime(&key.created_at)
            ],
        )?;
        Ok(())
    }

    fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        self.conn()
            .query_row(
                "SELECT id, project_id, agent_id, key_hash, created_at
                 FROM auth_api_keys WHERE key_hash = ?1",
                params![key_hash],
                |row| {
                    Ok(ApiKey {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        key_hash: row.get(3)?,
                        created_at: get_datetime(row, 4)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    // Workspace operations

    fn create_workspace(&self, ws: &Workspace) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO server_workspaces
                     (workspace_id, project_id, repo_id, alias, human_name, role, kind,
                      current_branch, focus_bead_id, hostname, workspace_path, timezone,
                      created_at, updated_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    ws.workspace_id,
                    ws.project_id,
                    ws.repo_id,
                    ws.alias,
                    ws.human_name,
                    ws.role,
                    ws.kind.as_str(),
                    ws.current_branch,
                    ws.focus_bead_id,
                    ws.hostname,
                    ws.workspace_path,
                    ws.timezone,
                    format_datetime(&ws.created_at),
                    format_datetime(&ws.updated_at),
                    format_opt_datetime(&ws.last_seen_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::Conflict(format!("alias '{}' is taken", ws.alias))
                }
                other => Error::from(other),
            })?;
        Ok(())
    }

    fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        self.conn()
            .query_row(
                &format!("SELECT {WORKSPACE_COLS} FROM server_workspaces WHERE workspace_id = ?1"),
                params![workspace_id],
                workspace_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_workspace_by_alias(&self, project_id: &str, alias: &str) -> Result<Option<Workspace>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {WORKSPACE_COLS} FROM server_workspaces
                     WHERE project_id = ?1 AND alias = ?2 AND deleted_at IS NULL"
                ),
                params![project_id, alias],
                workspace_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_workspaces(&self, project_id: &str, include_deleted: bool) -> Result<Vec<Workspace>> {
        let conn = self.conn();
        let sql = if include_deleted {
            format!(
                "SELECT {WORKSPACE_COLS} FROM server_workspaces
                 WHERE project_id = ?1 ORDER BY created_at, workspace_id"
            )
        } else {
            format!(
                "SELECT {WORKSPACE_COLS} FROM server_workspaces
                 WHERE project_id = ?1 AND deleted_at IS NULL ORDER BY created_at, workspace_id"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], workspace_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_workspace(&self, ws: &Workspace) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE server_workspaces
             SET human_name = ?2, role = ?3, current_branch = ?4, focus_bead_id = ?5,
                 hostname = ?6, workspace_path = ?7, timezone = ?8, last_seen_at = ?9,
                 updated_at = ?10
             WHERE workspace_id = ?1",
            params![
                ws.workspace_id,
                ws.human_name,
                ws.role,
                ws.current_branch,
                ws.focus_bead_id,
                ws.hostname,
                ws.workspace_path,
                ws.timezone,
                format_opt_datetime(&ws.last_seen_at),
                format_datetime(&Utc::now()),
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn touch_last_seen(
        &self,
        project_id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE server_workspaces SET last_seen_at = ?3
             WHERE workspace_id = ?1 AND project_id = ?2 AND deleted_at IS NULL",
            params![workspace_id, project_id, format_datetime(&now)],
        )?;
        Ok(())
    }

    fn soft_delete_workspace(
        &self,
        project_id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE server_workspaces SET deleted_at = ?3, updated_at = ?3
             WHERE workspace_id = ?1 AND project_id = ?2 AND deleted_at IS NULL",
            params![workspace_id, project_id, format_datetime(&now)],
        )?;
        Ok(rows > 0)
    }

    fn restore_workspace(&self, project_id: &str, workspace_id: &str) -> Result<Workspace> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let ws = tx
            .query_row(
                &format!(
                    "SELECT {WORKSPACE_COLS} FROM server_workspaces
                     WHERE workspace_id = ?1 AND project_id = ?2"
                ),
                params![workspace_id, project_id],
                workspace_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        if ws.deleted_at.is_none() {
            tx.commit()?;
            return Ok(ws);
        }

        // The alias may have been reused while this workspace was deleted;
        // restore keeps the original bindings, so the alias must be free.
        let taken: Option<String> = tx
            .query_row(
                "SELECT workspace_id FROM server_workspaces
                 WHERE project_id = ?1 AND alias = ?2 AND deleted_at IS NULL
                   AND workspace_id != ?3",
                params![project_id, ws.alias, workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::Conflict(format!(
                "alias '{}' is taken by another workspace",
                ws.alias
            )));
        }

        tx.execute(
            "UPDATE server_workspaces SET deleted_at = NULL, updated_at = ?3
             WHERE workspace_id = ?1 AND project_id = ?2",
            params![workspace_id, project_id, format_datetime(&Utc::now())],
        )?;
        let restored = tx.query_row(
            &format!("SELECT {WORKSPACE_COLS} FROM server_workspaces WHERE workspace_id = ?1"),
            params![workspace_id],
            workspace_from_row,
        )?;
        tx.commit()?;
        Ok(restored)
    }

    // Claim operations

    fn list_claimants(&self, project_id: &str, bead_id: &str) -> Result<Vec<Claim>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLS} FROM server_bead_claims
             WHERE project_id = ?1 AND bead_id = ?2 ORDER BY claimed_at"
        ))?;
        let rows = stmt.query_map(params![project_id, bead_id], claim_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn upsert_claim(&self, claim: &Claim) -> Result<()> {
        self.conn().execute(
            "INSERT INTO server_bead_claims
                 (project_id, bead_id, workspace_id, alias, human_name, apex_bead_id, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (project_id, bead_id, workspace_id)
             DO UPDATE SET alias = excluded.alias, human_name = excluded.human_name,
                           apex_bead_id = excluded.apex_bead_id",
            params![
                claim.project_id,
                claim.bead_id,
                claim.workspace_id,
                claim.alias,
                claim.human_name,
                claim.apex_bead_id,
                format_datetime(&claim.claimed_at),
            ],
        )?;
        Ok(())
    }

    fn delete_claim(&self, project_id: &str, workspace_id: &str, bead_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM server_bead_claims
             WHERE project_id = ?1 AND workspace_id = ?2 AND bead_id = ?3",
            params![project_id, workspace_id, bead_id],
        )?;
        Ok(rows > 0)
    }

    fn list_claims(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
        limit: usize,
        before: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Claim>> {
        let conn = self.conn();
        let mut sql = format!(
            "SELECT {CLAIM_COLS} FROM server_bead_claims WHERE project_id = ?1"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project_id.to_string())];
        if let Some(ws) = workspace_id {
            args.push(Box::new(ws.to_string()));
            sql.push_str(&format!(" AND workspace_id = ?{}", args.len()));
        }
        if let Some((ts, bead_id)) = before {
            args.push(Box::new(format_datetime(&ts)));
            let ts_idx = args.len();
            args.push(Box::new(bead_id));
            sql.push_str(&format!(
                " AND (claimed_at < ?{ts_idx} OR (claimed_at = ?{ts_idx} AND bead_id > ?{}))",
                args.len()
            ));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY claimed_at DESC, bead_id LIMIT ?{}",
            args.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|v| v.as_ref())), claim_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_claim_conflicts(&self, project_id: &str) -> Result<Vec<(String, Vec<Claim>)>> {
        let conn = self.conn();
        let bead_ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT bead_id FROM server_bead_claims
                 WHERE project_id = ?1 GROUP BY bead_id HAVING COUNT(*) > 1 ORDER BY bead_id",
            )?;
            let rows = stmt.query_map(params![project_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut conflicts = Vec::with_capacity(bead_ids.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLS} FROM server_bead_claims
             WHERE project_id = ?1 AND bead_id = ?2 ORDER BY claimed_at"
        ))?;
        for bead_id in bead_ids {
            let rows = stmt.query_map(params![project_id, bead_id], claim_from_row)?;
            let claims = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            conflicts.push((bead_id, claims));
        }
        Ok(conflicts)
    }

    // Issue operations

    fn get_issue(&self, project_id: &str, bead_id: &str) -> Result<Option<Issue>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {ISSUE_COLS} FROM beads_issues
                     WHERE project_id = ?1 AND bead_id = ?2"
                ),
                params![project_id, bead_id],
                issue_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_issues(
        &self,
        project_id: &str,
        filter: &IssueFilter,
        limit: usize,
        after_bead_id: Option<&str>,
    ) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let mut sql = format!("SELECT {ISSUE_COLS} FROM beads_issues WHERE project_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project_id.to_string())];

        let mut push = |sql: &mut String, clause: &str, value: String| {
            args.push(Box::new(value));
            sql.push_str(&clause.replace("{}", &args.len().to_string()));
        };
        if let Some(repo) = &filter.repo {
            push(&mut sql, " AND repo = ?{}", repo.clone());
        }
        if let Some(branch) = &filter.branch {
            push(&mut sql, " AND branch = ?{}", branch.clone());
        }
        if let Some(status) = &filter.status {
            push(&mut sql, " AND status = ?{}", status.clone());
        }
        if let Some(assignee) = &filter.assignee {
            push(&mut sql, " AND assignee = ?{}", assignee.clone());
        }
        if let Some(search) = &filter.search {
            let escaped = search.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            let pattern = format!("%{escaped}%");
            args.push(Box::new(pattern.clone()));
            let title_idx = args.len();
            args.push(Box::new(pattern));
            sql.push_str(&format!(
                " AND (title LIKE ?{title_idx} ESCAPE '\\' OR description LIKE ?{} ESCAPE '\\')",
                args.len()
            ));
        }
        if let Some(cursor) = after_bead_id {
            args.push(Box::new(cursor.to_string()));
            sql.push_str(&format!(" AND bead_id > ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY bead_id LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|v| v.as_ref())), issue_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_all_issues(&self, project_id: &str) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ISSUE_COLS} FROM beads_issues WHERE project_id = ?1 ORDER BY bead_id"
        ))?;
        let rows = stmt.query_map(params![project_id], issue_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn count_issues(&self, project_id: &str, repo: Option<&str>) -> Result<i64> {
        let conn = self.conn();
        let count = match repo {
            Some(repo) => conn.query_row(
                "SELECT COUNT(*) FROM beads_issues WHERE project_id = ?1 AND repo = ?2",
                params![project_id, repo],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM beads_issues WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    fn apply_sync(
        &self,
        project_id: &str,
        workspace: &Workspace,
        issues: &[Issue],
        deleted_ids: &[String],
        claims_snapshot: Option<&[ClaimSnapshotEntry]>,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut outcome = SyncOutcome {
            received: issues.len(),
            ..SyncOutcome::default()
        };

        for issue in issues {
            let previous: Option<(String, String)> = tx
                .query_row(
                    "SELECT status, title FROM beads_issues
                     WHERE project_id = ?1 AND bead_id = ?2",
                    params![project_id, issue.bead_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO beads_issues
                     (project_id, bead_id, repo, branch, title, description, status, priority,
                      issue_type, assignee, created_by, labels_json, blocked_by_json,
                      parent_json, created_at, updated_at, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT (project_id, bead_id) DO UPDATE SET
                     repo = excluded.repo, branch = excluded.branch, title = excluded.title,
                     description = excluded.description, status = excluded.status,
                     priority = excluded.priority, issue_type = excluded.issue_type,
                     assignee = excluded.assignee, created_by = excluded.created_by,
                     labels_json = excluded.labels_json, blocked_by_json = excluded.blocked_by_json,
                     parent_json = excluded.parent_json, created_at = excluded.created_at,
                     updated_at = excluded.updated_at, synced_at = excluded.synced_at",
                params![
                    project_id,
                    issue.bead_id,
                    issue.repo,
                    issue.branch,
                    issue.title,
                    issue.description,
                    issue.status,
                    issue.priority,
                    issue.issue_type,
                    issue.assignee,
                    issue.created_by,
                    serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".to_string()),
                    serde_json::to_string(&issue.blocked_by).unwrap_or_else(|_| "[]".to_string()),
                    issue
                        .parent
                        .as_ref()
                        .and_then(|p| serde_json::to_string(p).ok()),
                    format_opt_datetime(&issue.created_at),
                    format_opt_datetime(&issue.updated_at),
                    format_datetime(&now),
                ],
            )?;

            match previous {
                None => outcome.inserted += 1,
                Some((old_status, _)) => {
                    outcome.updated += 1;
                    if old_status != issue.status {
                        outcome.status_changes.push(StatusChange {
                            bead_id: issue.bead_id.clone(),
                            repo: issue.repo.clone(),
                            old_status: Some(old_status),
                            new_status: issue.status.clone(),
                            title: Some(issue.title.clone()),
                            changed_at: now,
                        });
                    }
                }
            }
        }

        // The client is the authority: deletions are hard deletes, and any
        // claims this workspace held on deleted beads go with them.
        for bead_id in deleted_ids {
            let rows = tx.execute(
                "DELETE FROM beads_issues WHERE project_id = ?1 AND bead_id = ?2",
                params![project_id, bead_id],
            )?;
            outcome.deleted += rows;
            tx.execute(
                "DELETE FROM server_bead_claims
                 WHERE project_id = ?1 AND workspace_id = ?2 AND bead_id = ?3",
                params![project_id, workspace.workspace_id, bead_id],
            )?;
        }

        if let Some(snapshot) = claims_snapshot {
            let snapshot_ids: HashSet<&str> =
                snapshot.iter().map(|c| c.bead_id.as_str()).collect();
            let current: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT bead_id FROM server_bead_claims
                     WHERE project_id = ?1 AND workspace_id = ?2",
                )?;
                let rows =
                    stmt.query_map(params![project_id, workspace.workspace_id], |row| {
                        row.get(0)
                    })?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            for bead_id in &current {
                if !snapshot_ids.contains(bead_id.as_str()) {
                    tx.execute(
                        "DELETE FROM server_bead_claims
                         WHERE project_id = ?1 AND workspace_id = ?2 AND bead_id = ?3",
                        params![project_id, workspace.workspace_id, bead_id],
                    )?;
                }
            }
            let current_ids: HashSet<&str> = current.iter().map(String::as_str).collect();
            for entry in snapshot {
                if !current_ids.contains(entry.bead_id.as_str()) {
                    tx.execute(
                        "INSERT INTO server_bead_claims
                             (project_id, bead_id, workspace_id, alias, human_name,
                              apex_bead_id, claimed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT (project_id, bead_id, workspace_id) DO NOTHING",
                        params![
                            project_id,
                            entry.bead_id,
                            workspace.workspace_id,
                            workspace.alias,
                            workspace.human_name,
                            entry.apex_bead_id,
                            format_datetime(&now),
                        ],
                    )?;
                }
            }
        }

        outcome.notifications_queued = Self::enqueue_status_notifications(
            &tx,
            project_id,
            workspace,
            &outcome.status_changes,
            now,
        )?;

        tx.execute(
            "INSERT INTO server_audit_log
                 (project_id, workspace_id, event_type, details_json, created_at)
             VALUES (?1, ?2, 'bdh_sync', ?3, ?4)",
            params![
                project_id,
                workspace.workspace_id,
                serde_json::json!({
                    "received": outcome.received,
                    "inserted": outcome.inserted,
                    "updated": outcome.updated,
                    "deleted": outcome.deleted,
                    "status_changes": outcome.status_changes.len(),
                    "notifications_queued": outcome.notifications_queued,
                })
                .to_string(),
                format_datetime(&now),
            ],
        )?;

        tx.commit()?;
        Ok(outcome)
    }

    // Subscription operations

    fn upsert_subscription(&self, sub: &Subscription) -> Result<(Subscription, bool)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let repo = sub.repo.clone().unwrap_or_default();

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM server_subscriptions
                 WHERE project_id = ?1 AND workspace_id = ?2 AND bead_id = ?3 AND repo = ?4",
                params![sub.project_id, sub.workspace_id, sub.bead_id, repo],
                |row| row.get(0),
            )
            .optional()?;

        let event_types =
            serde_json::to_string(&sub.event_types).unwrap_or_else(|_| "[]".to_string());
        let (id, created) = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE server_subscriptions SET event_types_json = ?2 WHERE id = ?1",
                    params![id, event_types],
                )?;
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO server_subscriptions
                         (id, project_id, workspace_id, alias, bead_id, repo,
                          event_types_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        sub.id,
                        sub.project_id,
                        sub.workspace_id,
                        sub.alias,
                        sub.bead_id,
                        repo,
                        event_types,
                        format_datetime(&sub.created_at),
                    ],
                )?;
                (sub.id.clone(), true)
            }
        };

        let stored = tx.query_row(
            &format!("SELECT {SUBSCRIPTION_COLS} FROM server_subscriptions WHERE id = ?1"),
            params![id],
            subscription_from_row,
        )?;
        tx.commit()?;
        Ok((stored, created))
    }

    fn delete_subscription(&self, project_id: &str, id: &str, workspace_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM server_subscriptions
             WHERE id = ?1 AND project_id = ?2 AND workspace_id = ?3",
            params![id, project_id, workspace_id],
        )?;
        Ok(rows > 0)
    }

    fn list_subscriptions(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<Subscription>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLS} FROM server_subscriptions
             WHERE project_id = ?1 AND workspace_id = ?2 ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![project_id, workspace_id], subscription_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Mail operations

    fn create_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO auth_messages
                 (id, project_id, from_workspace_id, from_alias, to_workspace_id, to_alias,
                  subject, body, priority, thread_id, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                message.id,
                message.project_id,
                message.from_workspace_id,
                message.from_alias,
                message.to_workspace_id,
                message.to_alias,
                message.subject,
                message.body,
                message.priority.as_str(),
                message.thread_id,
                format_datetime(&message.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_message(&self, project_id: &str, id: &str) -> Result<Option<Message>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM auth_messages WHERE id = ?1 AND project_id = ?2"
                ),
                params![id, project_id],
                message_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_inbox(
        &self,
        project_id: &str,
        workspace_id: &str,
        limit: usize,
        unread_only: bool,
        before: Option<(DateTime<Utc>, String)>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut sql = format!(
            "SELECT {MESSAGE_COLS} FROM auth_messages
             WHERE project_id = ?1 AND to_workspace_id = ?2"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(project_id.to_string()),
            Box::new(workspace_id.to_string()),
        ];
        if unread_only {
            sql.push_str(" AND read = 0");
        }
        if let Some((ts, id)) = before {
            args.push(Box::new(format_datetime(&ts)));
            let ts_idx = args.len();
            args.push(Box::new(id));
            sql.push_str(&format!(
                " AND (created_at < ?{ts_idx} OR (created_at = ?{ts_idx} AND id > ?{}))",
                args.len()
            ));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id LIMIT ?{}",
            args.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|v| v.as_ref())), message_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn count_unread(&self, project_id: &str, workspace_id: &str) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM auth_messages
                 WHERE project_id = ?1 AND to_workspace_id = ?2 AND read = 0",
                params![project_id, workspace_id],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn ack_message(
        &self,
        project_id: &str,
        id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let message = tx
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM auth_messages WHERE id = ?1 AND project_id = ?2"
                ),
                params![id, project_id],
                message_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        if message.to_workspace_id != workspace_id {
            return Err(Error::Forbidden(
                "only the recipient may acknowledge a message".to_string(),
            ));
        }
        if message.read {
            tx.commit()?;
            return Ok(message);
        }

        tx.execute(
            "UPDATE auth_messages SET read = 1, read_by = ?2, read_at = ?3 WHERE id = ?1",
            params![id, workspace_id, format_datetime(&now)],
        )?;
        let updated = tx.query_row(
            &format!("SELECT {MESSAGE_COLS} FROM auth_messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )?;
        tx.commit()?;
        Ok(updated)
    }

    // Chat operations

    fn get_or_create_chat_session(
        &self,
        project_id: &str,
        participants: &[ChatParticipant],
        now: DateTime<Utc>,
    ) -> Result<(ChatSession, bool)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = participants_key(participants);

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {CHAT_SESSION_COLS} FROM auth_chat_sessions
                     WHERE project_id = ?1 AND participants_key = ?2"
                ),
                params![project_id, key],
                chat_session_from_row,
            )
            .optional()?;

        if let Some(session) = existing {
            tx.commit()?;
            return Ok((session, false));
        }

        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            participants: participants.to_vec(),
            created_at: now,
            updated_at: now,
        };
        tx.execute(
            "INSERT INTO auth_chat_sessions
                 (id, project_id, participants_key, participants_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.project_id,
                key,
                serde_json::to_string(&session.participants)
                    .unwrap_or_else(|_| "[]".to_string()),
                format_datetime(&now),
                format_datetime(&now),
            ],
        )?;
        tx.commit()?;
        Ok((session, true))
    }

    fn get_chat_session(&self, project_id: &str, id: &str) -> Result<Option<ChatSession>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {CHAT_SESSION_COLS} FROM auth_chat_sessions
                     WHERE id = ?1 AND project_id = ?2"
                ),
                params![id, project_id],
                chat_session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn add_chat_participant(
        &self,
        project_id: &str,
        session_id: &str,
        participant: &ChatParticipant,
        now: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut session = tx
            .query_row(
                &format!(
                    "SELECT {CHAT_SESSION_COLS} FROM auth_chat_sessions
                     WHERE id = ?1 AND project_id = ?2"
                ),
                params![session_id, project_id],
                chat_session_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        // Joining is idempotent. The founding participants_key is left
        // untouched so the original pair keeps resolving to this session.
        if !session
            .participants
            .iter()
            .any(|p| p.workspace_id == participant.workspace_id)
        {
            session.participants.push(participant.clone());
            session.updated_at = now;
            tx.execute(
                "UPDATE auth_chat_sessions SET participants_json = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![
                    session_id,
                    serde_json::to_string(&session.participants)
                        .unwrap_or_else(|_| "[]".to_string()),
                    format_datetime(&now),
                ],
            )?;
        }
        tx.commit()?;
        Ok(session)
    }

    fn insert_chat_message(&self, message: &ChatMessage) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO auth_chat_messages
                 (id, session_id, project_id, from_workspace_id, from_alias, body, leaving,
                  created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.session_id,
                message.project_id,
                message.from_workspace_id,
                message.from_alias,
                message.body,
                message.leaving as i64,
                format_datetime(&message.created_at),
            ],
        )?;
        tx.execute(
            "UPDATE auth_chat_sessions SET updated_at = ?2 WHERE id = ?1",
            params![message.session_id, format_datetime(&message.created_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_chat_messages(&self, project_id: &str, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAT_MESSAGE_COLS} FROM auth_chat_messages
             WHERE session_id = ?1 AND project_id = ?2 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![session_id, project_id], chat_message_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_chat_sessions(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
    ) -> Result<Vec<ChatSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAT_SESSION_COLS} FROM auth_chat_sessions
             WHERE project_id = ?1 ORDER BY updated_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![project_id], chat_session_from_row)?;
        let sessions = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(match workspace_id {
            Some(ws) => sessions
                .into_iter()
                .filter(|s| s.participants.iter().any(|p| p.workspace_id == ws))
                .collect(),
            None => sessions,
        })
    }

    fn list_pending_chat(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<(ChatSession, i64)>> {
        let sessions = self.list_chat_sessions(project_id, Some(workspace_id))?;
        let conn = self.conn();
        let mut pending = Vec::new();
        for session in sessions {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM auth_chat_messages m
                 WHERE m.session_id = ?1 AND m.from_workspace_id != ?2
                   AND m.created_at > COALESCE(
                       (SELECT MAX(created_at) FROM auth_chat_messages
                        WHERE session_id = ?1 AND from_workspace_id = ?2), '')",
                params![session.id, workspace_id],
                |row| row.get(0),
            )?;
            if count > 0 {
                pending.push((session, count));
            }
        }
        Ok(pending)
    }

    // Escalation operations

    fn create_escalation(&self, escalation: &Escalation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO server_escalations
                 (id, project_id, workspace_id, alias, member_email, subject, situation,
                  options_json, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                escalation.id,
                escalation.project_id,
                escalation.workspace_id,
                escalation.alias,
                escalation.member_email,
                escalation.subject,
                escalation.situation,
                escalation
                    .options
                    .as_ref()
                    .and_then(|o| serde_json::to_string(o).ok()),
                escalation.status.as_str(),
                format_datetime(&escalation.created_at),
                format_datetime(&escalation.expires_at),
            ],
        )?;
        Ok(())
    }

    fn get_escalation(
        &self,
        project_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Escalation>> {
        // Expiry is applied lazily: pending rows past their deadline flip to
        // expired on read.
        self.conn().execute(
            "UPDATE server_escalations SET status = 'expired'
             WHERE id = ?1 AND project_id = ?2 AND status = 'pending' AND expires_at < ?3",
            params![id, project_id, format_datetime(&now)],
        )?;
        self.conn()
            .query_row(
                &format!(
                    "SELECT {ESCALATION_COLS} FROM server_escalations
                     WHERE id = ?1 AND project_id = ?2"
                ),
                params![id, project_id],
                escalation_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_escalations(
        &self,
        project_id: &str,
        status: Option<EscalationStatus>,
        limit: usize,
        before: Option<(DateTime<Utc>, String)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Escalation>> {
        self.conn().execute(
            "UPDATE server_escalations SET status = 'expired'
             WHERE project_id = ?1 AND status = 'pending' AND expires_at < ?2",
            params![project_id, format_datetime(&now)],
        )?;

        let conn = self.conn();
        let mut sql = format!(
            "SELECT {ESCALATION_COLS} FROM server_escalations WHERE project_id = ?1"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project_id.to_string())];
        if let Some(status) = status {
            args.push(Box::new(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some((ts, id)) = before {
            args.push(Box::new(format_datetime(&ts)));
            let ts_idx = args.len();
            args.push(Box::new(id));
            sql.push_str(&format!(
                " AND (created_at < ?{ts_idx} OR (created_at = ?{ts_idx} AND id > ?{}))",
                args.len()
            ));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id LIMIT ?{}",
            args.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows =
            stmt.query_map(rusqlite::params_from_iter(args.iter().map(|v| v.as_ref())), escalation_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn respond_escalation(
        &self,
        project_id: &str,
        id: &str,
        response: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Escalation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let escalation = tx
            .query_row(
                &format!(
                    "SELECT {ESCALATION_COLS} FROM server_escalations
                     WHERE id = ?1 AND project_id = ?2"
                ),
                params![id, project_id],
                escalation_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        let effective_status =
            if escalation.status == EscalationStatus::Pending && escalation.expires_at < now {
                EscalationStatus::Expired
            } else {
                escalation.status
            };

        match effective_status {
            EscalationStatus::Expired => {
                tx.execute(
                    "UPDATE server_escalations SET status = 'expired' WHERE id = ?1",
                    params![id],
                )?;
                tx.commit()?;
                Err(Error::Conflict("escalation has expired".to_string()))
            }
            EscalationStatus::Responded => {
                // Idempotent at the boundary: repeating the same response is
                // a no-op; a different one is a conflict.
                if escalation.response.as_deref() == Some(response) {
                    tx.commit()?;
                    Ok(escalation)
                } else {
                    Err(Error::Conflict(
                        "escalation already responded with a different response".to_string(),
                    ))
                }
            }
            EscalationStatus::Pending => {
                tx.execute(
                    "UPDATE server_escalations
                     SET status = 'responded', response = ?2, response_note = ?3,
                         responded_at = ?4
                     WHERE id = ?1",
                    params![id, response, note, format_datetime(&now)],
                )?;
                let updated = tx.query_row(
                    &format!("SELECT {ESCALATION_COLS} FROM server_escalations WHERE id = ?1"),
                    params![id],
                    escalation_from_row,
                )?;
                tx.commit()?;
                Ok(updated)
            }
        }
    }

    // Outbox operations

    fn claim_outbox_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM server_notification_outbox
                 WHERE status = 'pending'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY created_at, id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![format_datetime(&now), limit as i64], |row| {
                row.get(0)
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE server_notification_outbox SET status = 'processing', updated_at = ?2
                 WHERE id = ?1",
                params![id, format_datetime(&now)],
            )?;
            let entry = tx.query_row(
                &format!("SELECT {OUTBOX_COLS} FROM server_notification_outbox WHERE id = ?1"),
                params![id],
                outbox_from_row,
            )?;
            entries.push(entry);
        }
        tx.commit()?;
        Ok(entries)
    }

    fn complete_outbox(&self, id: &str, message_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE server_notification_outbox
             SET status = 'completed', message_id = ?2, processed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, message_id, format_datetime(&now)],
        )?;
        Ok(())
    }

    fn fail_outbox(
        &self,
        id: &str,
        error: &str,
        max_attempts: i64,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE server_notification_outbox
             SET attempts = attempts + 1,
                 last_error = ?2,
                 status = CASE WHEN attempts + 1 >= ?3 THEN 'failed' ELSE 'pending' END,
                 next_attempt_at = ?4,
                 updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                error,
                max_attempts,
                format_datetime(&retry_at),
                format_datetime(&now)
            ],
        )?;
        Ok(())
    }

    fn has_completed_fingerprint(&self, workspace_id: &str, fingerprint: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM server_notification_outbox
             WHERE workspace_id = ?1 AND fingerprint = ?2 AND status = 'completed'",
            params![workspace_id, fingerprint],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Policy operations

    fn get_active_policy(&self, project_id: &str) -> Result<Option<Policy>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT pp.policy_id, pp.project_id, pp.version, pp.bundle_json,
                            pp.created_by_workspace_id, pp.created_at, pp.updated_at
                     FROM server_projects p
                     JOIN server_project_policies pp ON pp.policy_id = p.active_policy_id
                     WHERE p.id = ?1 AND p.deleted_at IS NULL"
                ),
                params![project_id],
                policy_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_policy(&self, project_id: &str, policy_id: &str) -> Result<Option<Policy>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {POLICY_COLS} FROM server_project_policies
                     WHERE policy_id = ?1 AND project_id = ?2"
                ),
                params![policy_id, project_id],
                policy_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_policy_history(&self, project_id: &str, limit: usize) -> Result<Vec<Policy>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POLICY_COLS} FROM server_project_policies
             WHERE project_id = ?1 ORDER BY version DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![project_id, limit as i64], policy_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn create_policy_version(
        &self,
        project_id: &str,
        bundle: &PolicyBundle,
        base_policy_id: Option<&str>,
        created_by_workspace_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Policy, bool)> {
        let mut conn = self.conn();
        // An immediate transaction takes the write lock up front; version
        // allocation races serialise here the way the original serialised on
        // a project row lock.
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let active_policy_id: Option<String> = tx
            .query_row(
                "SELECT active_policy_id FROM server_projects
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        let latest: Option<Policy> = tx
            .query_row(
                &format!(
                    "SELECT {POLICY_COLS} FROM server_project_policies
                     WHERE project_id = ?1 ORDER BY version DESC LIMIT 1"
                ),
                params![project_id],
                policy_from_row,
            )
            .optional()?;

        // Re-posting the latest bundle is idempotent, checked before the
        // base comparison so a retried create never turns into a conflict.
        if let Some(latest) = &latest {
            if latest.bundle.canonical_json() == bundle.canonical_json() {
                let existing = latest.clone();
                tx.commit()?;
                return Ok((existing, false));
            }
        }

        if let Some(base) = base_policy_id {
            if active_policy_id.as_deref() != Some(base) {
                return Err(Error::Conflict(
                    "base_policy_id does not match the active policy".to_string(),
                ));
            }
        }

        let version = latest.map(|p| p.version).unwrap_or(0) + 1;
        let policy = Policy {
            policy_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            version,
            bundle: bundle.clone(),
            created_by_workspace_id: created_by_workspace_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        tx.execute(
            "INSERT INTO server_project_policies
                 (policy_id, project_id, version, bundle_json, created_by_workspace_id,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                policy.policy_id,
                policy.project_id,
                policy.version,
                bundle.canonical_json(),
                policy.created_by_workspace_id,
                format_datetime(&now),
                format_datetime(&now),
            ],
        )?;

        // A base_policy_id is a compare-and-swap on the activation pointer:
        // the caller replaces the version it named, so the new version
        // activates in the same transaction. Base-less creates just append.
        if base_policy_id.is_some() {
            tx.execute(
                "UPDATE server_projects SET active_policy_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![project_id, policy.policy_id, format_datetime(&now)],
            )?;
        }
        tx.commit()?;
        Ok((policy, true))
    }

    fn activate_policy(&self, project_id: &str, policy_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let owner: Option<String> = tx
            .query_row(
                "SELECT project_id FROM server_project_policies WHERE policy_id = ?1",
                params![policy_id],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => return Err(Error::NotFound),
            Some(owner) if owner != project_id => {
                return Err(Error::Validation(
                    "policy does not belong to this project".to_string(),
                ));
            }
            Some(_) => {}
        }
        let rows = tx.execute(
            "UPDATE server_projects SET active_policy_id = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![project_id, policy_id, format_datetime(&Utc::now())],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    // Audit log

    fn append_audit(
        &self,
        project_id: &str,
        workspace_id: Option<&str>,
        event_type: &str,
        details: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO server_audit_log
                 (project_id, workspace_id, event_type, details_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                workspace_id,
                event_type,
                details.to_string(),
                format_datetime(&now)
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Visibility;

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    fn project(store: &SqliteStore, slug: &str) -> Project {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            tenant_id: None,
            slug: slug.to_string(),
            visibility: Visibility::Private,
            active_policy_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.create_project(&project).unwrap();
        project
    }

    fn workspace(store: &SqliteStore, project_id: &str, alias: &str) -> Workspace {
        let now = Utc::now();
        let ws = Workspace {
            workspace_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            repo_id: None,
            alias: alias.to_string(),
            human_name: alias.to_uppercase(),
            role: None,
            kind: WorkspaceKind::Agent,
            current_branch: None,
            focus_bead_id: None,
            hostname: None,
            workspace_path: None,
            timezone: None,
            created_at: now,
            updated_at: now,
            last_seen_at: Some(now),
            deleted_at: None,
        };
        store.create_workspace(&ws).unwrap();
        ws
    }

    #[test]
    fn duplicate_active_alias_conflicts() {
        let store = store();
        let p = project(&store, "demo");
        workspace(&store, &p.id, "alice");
        let now = Utc::now();
        let dup = Workspace {
            workspace_id: Uuid::new_v4().to_string(),
            project_id: p.id.clone(),
            repo_id: None,
            alias: "alice".to_string(),
            human_name: String::new(),
            role: None,
            kind: WorkspaceKind::Agent,
            current_branch: None,
            focus_bead_id: None,
            hostname: None,
            workspace_path: None,
            timezone: None,
            created_at: now,
            updated_at: now,
            last_seen_at: None,
            deleted_at: None,
        };
        assert!(matches!(
            store.create_workspace(&dup),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn soft_deleted_alias_is_reusable_and_restore_conflicts() {
        let store = store();
        let p = project(&store, "demo");
        let first = workspace(&store, &p.id, "alice");
        assert!(store
            .soft_delete_workspace(&p.id, &first.workspace_id, Utc::now())
            .unwrap());

        // Alias freed by the soft delete.
        let second = workspace(&store, &p.id, "alice");

        // Restoring the original now collides with the reuse.
        assert!(matches!(
            store.restore_workspace(&p.id, &first.workspace_id),
            Err(Error::Conflict(_))
        ));

        assert!(store
            .soft_delete_workspace(&p.id, &second.workspace_id, Utc::now())
            .unwrap());
        let restored = store.restore_workspace(&p.id, &first.workspace_id).unwrap();
        assert!(restored.deleted_at.is_none());
    }

    #[test]
    fn immutable_binding_trigger_fires() {
        let store = store();
        let p = project(&store, "demo");
        let ws = workspace(&store, &p.id, "alice");
        let result = store.conn().execute(
            "UPDATE server_workspaces SET alias = 'bob' WHERE workspace_id = ?1",
            params![ws.workspace_id],
        );
        assert!(result.is_err());
    }

    #[test]
    fn policy_versions_are_contiguous_and_idempotent() {
        let store = store();
        let p = project(&store, "demo");
        let bundle = PolicyBundle::default();
        let now = Utc::now();

        let (v1, created) = store
            .create_policy_version(&p.id, &bundle, None, None, now)
            .unwrap();
        assert!(created);
        assert_eq!(v1.version, 1);
        store.activate_policy(&p.id, &v1.policy_id).unwrap();

        // Same bundle again: no new version.
        let (same, created) = store
            .create_policy_version(&p.id, &bundle, Some(&v1.policy_id), None, now)
            .unwrap();
        assert!(!created);
        assert_eq!(same.policy_id, v1.policy_id);

        let mut changed = PolicyBundle::default();
        changed.invariants.push(Invariant {
            id: "inv-1".to_string(),
            title: "t".to_string(),
            body_md: "b".to_string(),
        });
        let (v2, created) = store
            .create_policy_version(&p.id, &changed, Some(&v1.policy_id), None, now)
            .unwrap();
        assert!(created);
        assert_eq!(v2.version, 2);
        // Creating against a base swings the activation pointer with it.
        assert_eq!(
            store.get_active_policy(&p.id).unwrap().unwrap().policy_id,
            v2.policy_id
        );

        // A racer still holding the old base loses.
        let mut racer = PolicyBundle::default();
        racer.invariants.push(Invariant {
            id: "inv-2".to_string(),
            title: "r".to_string(),
            body_md: "r".to_string(),
        });
        let stale = store.create_policy_version(&p.id, &racer, Some(&v1.policy_id), None, now);
        assert!(matches!(stale, Err(Error::Conflict(_))));
    }

    #[test]
    fn sync_detects_status_changes_and_queues_notifications() {
        let store = store();
        let p = project(&store, "demo");
        let alice = workspace(&store, &p.id, "alice");
        let charlie = workspace(&store, &p.id, "charlie");
        let now = Utc::now();

        store
            .upsert_subscription(&Subscription {
                id: Uuid::new_v4().to_string(),
                project_id: p.id.clone(),
                workspace_id: charlie.workspace_id.clone(),
                alias: charlie.alias.clone(),
                bead_id: "bd-42".to_string(),
                repo: None,
                event_types: vec!["status_change".to_string()],
                created_at: now,
            })
            .unwrap();

        let mut issue = Issue {
            project_id: p.id.clone(),
            bead_id: "bd-42".to_string(),
            repo: "github.com/acme/widgets".to_string(),
            branch: "main".to_string(),
            title: "widget".to_string(),
            description: String::new(),
            status: "open".to_string(),
            priority: 2,
            issue_type: None,
            assignee: None,
            created_by: None,
            labels: vec![],
            blocked_by: vec![],
            parent: None,
            created_at: None,
            updated_at: None,
        };

        let outcome = store
            .apply_sync(&p.id, &alice, &[issue.clone()], &[], None, now)
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.status_changes.len(), 0);
        assert_eq!(outcome.notifications_queued, 0);

        issue.status = "in_progress".to_string();
        let outcome = store
            .apply_sync(&p.id, &alice, &[issue], &[], None, now)
            .unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.status_changes.len(), 1);
        assert_eq!(outcome.notifications_queued, 1);

        let batch = store.claim_outbox_batch(10, now).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].workspace_id, charlie.workspace_id);
        assert_eq!(batch[0].status, OutboxStatus::Processing);
    }

    #[test]
    fn claims_snapshot_reconciles() {
        let store = store();
        let p = project(&store, "demo");
        let alice = workspace(&store, &p.id, "alice");
        let now = Utc::now();

        let snapshot = vec![
            ClaimSnapshotEntry {
                bead_id: "bd-1".to_string(),
                apex_bead_id: None,
            },
            ClaimSnapshotEntry {
                bead_id: "bd-2".to_string(),
                apex_bead_id: None,
            },
        ];
        store
            .apply_sync(&p.id, &alice, &[], &[], Some(&snapshot), now)
            .unwrap();
        assert_eq!(
            store
                .list_claims(&p.id, Some(&alice.workspace_id), 10, None)
                .unwrap()
                .len(),
            2
        );

        let snapshot = vec![ClaimSnapshotEntry {
            bead_id: "bd-2".to_string(),
            apex_bead_id: None,
        }];
        store
            .apply_sync(&p.id, &alice, &[], &[], Some(&snapshot), now)
            .unwrap();
        let claims = store
            .list_claims(&p.id, Some(&alice.workspace_id), 10, None)
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].bead_id, "bd-2");
    }

    #[test]
    fn ack_is_idempotent() {
        let store = store();
        let p = project(&store, "demo");
        let alice = workspace(&store, &p.id, "alice");
        let bob = workspace(&store, &p.id, "bob");
        let now = Utc::now();

        let message = Message {
            id: Uuid::new_v4().to_string(),
            project_id: p.id.clone(),
            from_workspace_id: alice.workspace_id.clone(),
            from_alias: alice.alias.clone(),
            to_workspace_id: bob.workspace_id.clone(),
            to_alias: bob.alias.clone(),
            subject: "hi".to_string(),
            body: "hello".to_string(),
            priority: MailPriority::Normal,
            thread_id: None,
            read: false,
            read_by: None,
            read_at: None,
            created_at: now,
        };
        store.create_message(&message).unwrap();

        let first = store
            .ack_message(&p.id, &message.id, &bob.workspace_id, now)
            .unwrap();
        assert!(first.read);
        let later = now + chrono::Duration::seconds(30);
        let second = store
            .ack_message(&p.id, &message.id, &bob.workspace_id, later)
            .unwrap();
        assert_eq!(second.read_at, first.read_at);

        assert!(matches!(
            store.ack_message(&p.id, &message.id, &alice.workspace_id, now),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn chat_sessions_are_reused_per_participant_set() {
        let store = store();
        let p = project(&store, "demo");
        let alice = workspace(&store, &p.id, "alice");
        let bob = workspace(&store, &p.id, "bob");
        let now = Utc::now();

        let participants = vec![
            ChatParticipant {
                workspace_id: alice.workspace_id.clone(),
                alias: alice.alias.clone(),
            },
            ChatParticipant {
                workspace_id: bob.workspace_id.clone(),
                alias: bob.alias.clone(),
            },
        ];
        let (s1, created) = store
            .get_or_create_chat_session(&p.id, &participants, now)
            .unwrap();
        assert!(created);

        // Same pair in the other order resolves to the same session.
        let reversed: Vec<ChatParticipant> = participants.iter().rev().cloned().collect();
        let (s2, created) = store
            .get_or_create_chat_session(&p.id, &reversed, now)
            .unwrap();
        assert!(!created);
        assert_eq!(s1.id, s2.id);
    }

    #[test]
    fn outbox_failure_backoff_and_terminal_state() {
        let store = store();
        let p = project(&store, "demo");
        let now = Utc::now();
        store
            .conn()
            .execute(
                "INSERT INTO server_notification_outbox
                     (id, project_id, workspace_id, alias, event_type, payload_json,
                      fingerprint, status, created_at, updated_at)
                 VALUES ('n1', ?1, 'w1', 'alice', 'status_change', '{}', 'fp', 'pending', ?2, ?2)",
                params![p.id, format_datetime(&now)],
            )
            .unwrap();

        let batch = store.claim_outbox_batch(5, now).unwrap();
        assert_eq!(batch.len(), 1);

        // Failure reschedules in the future, so an immediate drain sees
        // nothing.
        store
            .fail_outbox("n1", "boom", 5, now + chrono::Duration::seconds(60), now)
            .unwrap();
        assert!(store.claim_outbox_batch(5, now).unwrap().is_empty());

        // Exhaust attempts.
        for _ in 0..4 {
            let later = now + chrono::Duration::seconds(3600);
            let batch = store.claim_outbox_batch(5, later).unwrap();
            if batch.is_empty() {
                break;
            }
            store.fail_outbox("n1", "boom", 5, later, later).unwrap();
        }
        let status: String = store
            .conn()
            .query_row(
                "SELECT status FROM server_notification_outbox WHERE id = 'n1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[test]
    fn escalation_respond_is_idempotent_and_expires() {
        let store = store();
        let p = project(&store, "demo");
        let ws = workspace(&store, &p.id, "alice");
        let now = Utc::now();

        let escalation = Escalation {
            id: Uuid::new_v4().to_string(),
            project_id: p.id.clone(),
            workspace_id: ws.workspace_id.clone(),
            alias: ws.alias.clone(),
            member_email: None,
            subject: "stuck".to_string(),
            situation: "need a decision".to_string(),
            options: Some(vec!["a".to_string(), "b".to_string()]),
            status: EscalationStatus::Pending,
            response: None,
            response_note: None,
            created_at: now,
            responded_at: None,
            expires_at: now + chrono::Duration::hours(72),
        };
        store.create_escalation(&escalation).unwrap();

        let responded = store
            .respond_escalation(&p.id, &escalation.id, "a", None, now)
            .unwrap();
        assert_eq!(responded.status, EscalationStatus::Responded);

        let again = store
            .respond_escalation(&p.id, &escalation.id, "a", None, now)
            .unwrap();
        assert_eq!(again.responded_at, responded.responded_at);

        assert!(matches!(
            store.respond_escalation(&p.id, &escalation.id, "b", None, now),
            Err(Error::Conflict(_))
        ));
    }
}
