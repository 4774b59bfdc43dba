//! Notification dispatcher.
//!
//! Background worker draining the outbox: claim a batch, render each entry
//! into a mail, deliver through the messaging plane, and record the result.
//! Delivery is at-least-once; the rendered body carries the event
//! fingerprint so recipients can dedupe retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{Event, EventBus, MESSAGE_DELIVERED};
use crate::store::Store;
use crate::types::{MailPriority, Message, OutboxEntry};

pub const BATCH_SIZE: usize = 20;
pub const MAX_ATTEMPTS: i64 = 5;
pub const BACKOFF_BASE_SECONDS: i64 = 1;
pub const BACKOFF_CAP_SECONDS: i64 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential backoff: `min(base * 2^attempts, cap)`.
pub fn backoff_seconds(attempts: i64) -> i64 {
    let exp = attempts.clamp(0, 30) as u32;
    (BACKOFF_BASE_SECONDS << exp).min(BACKOFF_CAP_SECONDS)
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Render an outbox entry into mail subject and body. The fingerprint
/// trailer is the recipient's dedupe handle.
pub fn render_notification(entry: &OutboxEntry) -> (String, String) {
    let bead_id = payload_str(&entry.payload, "bead_id");
    let old_status = payload_str(&entry.payload, "old_status");
    let new_status = payload_str(&entry.payload, "new_status");
    let repo = payload_str(&entry.payload, "repo");
    let title = payload_str(&entry.payload, "title");
    let actor = payload_str(&entry.payload, "actor_alias");

    let subject = format!("bead {bead_id}: {old_status} -> {new_status}");
    let mut body = format!("Bead {bead_id} changed status: {old_status} -> {new_status}.\n");
    if !title.is_empty() {
        body.push_str(&format!("Title: {title}\n"));
    }
    if !repo.is_empty() {
        body.push_str(&format!("Repo: {repo}\n"));
    }
    if !actor.is_empty() {
        body.push_str(&format!("Changed by: {actor}\n"));
    }
    body.push_str(&format!("\n---\nfingerprint: {}\n", entry.fingerprint));
    (subject, body)
}

fn deliver(store: &dyn Store, events: &EventBus, entry: &OutboxEntry) -> Result<String> {
    let (subject, body) = render_notification(entry);
    let from_workspace_id = entry
        .payload
        .get("actor_workspace_id")
        .and_then(Value::as_str)
        .unwrap_or(&entry.workspace_id)
        .to_string();
    let from_alias = {
        let alias = payload_str(&entry.payload, "actor_alias");
        if alias.is_empty() { "beadhub" } else { alias }.to_string()
    };

    let message = Message {
        id: Uuid::new_v4().to_string(),
        project_id: entry.project_id.clone(),
        from_workspace_id,
        from_alias: from_alias.clone(),
        to_workspace_id: entry.workspace_id.clone(),
        to_alias: entry.alias.clone(),
        subject: subject.clone(),
        body,
        priority: MailPriority::Normal,
        thread_id: None,
        read: false,
        read_by: None,
        read_at: None,
        created_at: Utc::now(),
    };
    store.create_message(&message)?;

    events.publish(
        Event::new(MESSAGE_DELIVERED, &entry.project_id, &entry.workspace_id)
            .with("message_id", message.id.clone())
            .with("from_alias", from_alias)
            .with("to_alias", entry.alias.clone())
            .with("subject", subject)
            .with("priority", "normal"),
    );
    Ok(message.id)
}

/// Drain one batch. Returns the number of entries that reached a terminal
/// state this pass.
pub fn run_once(store: &dyn Store, events: &EventBus) -> Result<usize> {
    let now = Utc::now();
    let batch = store.claim_outbox_batch(BATCH_SIZE, now)?;
    let mut processed = 0;

    for entry in batch {
        // A completed delivery with the same fingerprint to the same
        // recipient means this entry is a retry duplicate.
        if store.has_completed_fingerprint(&entry.workspace_id, &entry.fingerprint)? {
            store.complete_outbox(&entry.id, None, Utc::now())?;
            processed += 1;
            continue;
        }

        match deliver(store, events, &entry) {
            Ok(message_id) => {
                store.complete_outbox(&entry.id, Some(&message_id), Utc::now())?;
                processed += 1;
            }
            Err(e) => {
                let retry_at =
                    Utc::now() + chrono::Duration::seconds(backoff_seconds(entry.attempts));
                tracing::warn!(
                    entry_id = %entry.id,
                    attempts = entry.attempts,
                    error = %e,
                    "notification delivery failed"
                );
                store.fail_outbox(&entry.id, &e.to_string(), MAX_ATTEMPTS, retry_at, Utc::now())?;
                if entry.attempts + 1 >= MAX_ATTEMPTS {
                    processed += 1;
                }
            }
        }
    }
    Ok(processed)
}

/// Spawn the dispatcher loop. It polls the outbox, finishing its current
/// batch before honouring shutdown.
pub fn spawn(
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let drained = {
                let store = store.clone();
                let events = events.clone();
                tokio::task::spawn_blocking(move || run_once(store.as_ref(), events.as_ref()))
                    .await
                    .unwrap_or_else(|e| {
                        tracing::error!("dispatcher task panicked: {e}");
                        Ok(0)
                    })
            };
            let idle = match drained {
                Ok(0) => true,
                // Keep draining while there is work.
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!("outbox drain failed: {e}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::info!("notification dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::*;
    use chrono::Utc;

    fn seed_entry(store: &SqliteStore, project_id: &str, recipient: &Workspace, fp: &str) {
        let payload = serde_json::json!({
            "bead_id": "bd-42",
            "repo": "github.com/acme/widgets",
            "old_status": "open",
            "new_status": "in_progress",
            "title": "widget",
            "actor_workspace_id": "actor-ws",
            "actor_alias": "alice",
        });
        // Direct insert keeps the test independent of the sync engine.
        let now = Utc::now();
        let conn_sql = "INSERT INTO server_notification_outbox
                (id, project_id, workspace_id, alias, event_type, payload_json, fingerprint,
                 status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'status_change', ?5, ?6, 'pending', ?7, ?7)";
        store
            .connection()
            .execute(
                conn_sql,
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    project_id,
                    recipient.workspace_id,
                    recipient.alias,
                    payload.to_string(),
                    fp,
                    now.to_rfc3339(),
                ],
            )
            .unwrap();
    }

    fn fixtures() -> (SqliteStore, String, Workspace) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let now = Utc::now();
        let project_id = uuid::Uuid::new_v4().to_string();
        store
            .create_project(&Project {
                id: project_id.clone(),
                tenant_id: None,
                slug: "demo".to_string(),
                visibility: Visibility::Private,
                active_policy_id: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
            .unwrap();
        let ws = Workspace {
            workspace_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            repo_id: None,
            alias: "charlie".to_string(),
            human_name: "Charlie".to_string(),
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
        store.create_workspace(&ws).unwrap();
        (store, project_id, ws)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_seconds(0), 1);
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(3), 8);
        assert_eq!(backoff_seconds(10), BACKOFF_CAP_SECONDS);
    }

    #[test]
    fn render_includes_transition_and_fingerprint() {
        let entry = OutboxEntry {
            id: "n1".to_string(),
            project_id: "p".to_string(),
            workspace_id: "w".to_string(),
            alias: "charlie".to_string(),
            event_type: "status_change".to_string(),
            payload: serde_json::json!({
                "bead_id": "bd-42",
                "old_status": "open",
                "new_status": "in_progress",
            }),
            fingerprint: "fp-1".to_string(),
            attempts: 0,
            last_error: None,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            processed_at: None,
            message_id: None,
        };
        let (subject, body) = render_notification(&entry);
        assert_eq!(subject, "bead bd-42: open -> in_progress");
        assert!(body.contains("bd-42"));
        assert!(body.contains("fingerprint: fp-1"));
    }

    #[test]
    fn run_once_delivers_mail_and_completes() {
        let (store, project_id, charlie) = fixtures();
        let events = EventBus::new();
        seed_entry(&store, &project_id, &charlie, "fp-1");

        let processed = run_once(&store, &events).unwrap();
        assert_eq!(processed, 1);

        let inbox = store
            .list_inbox(&project_id, &charlie.workspace_id, 10, true, None)
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].body.contains("open -> in_progress"));
        assert!(store
            .has_completed_fingerprint(&charlie.workspace_id, "fp-1")
            .unwrap());
    }

    #[test]
    fn duplicate_fingerprint_short_circuits() {
        let (store, project_id, charlie) = fixtures();
        let events = EventBus::new();
        seed_entry(&store, &project_id, &charlie, "fp-1");
        assert_eq!(run_once(&store, &events).unwrap(), 1);

        // A retry duplicate of the same event completes without a second
        // mail.
        seed_entry(&store, &project_id, &charlie, "fp-1");
        assert_eq!(run_once(&store, &events).unwrap(), 1);
        let inbox = store
            .list_inbox(&project_id, &charlie.workspace_id, 10, false, None)
            .unwrap();
        assert_eq!(inbox.len(), 1);
    }
}
