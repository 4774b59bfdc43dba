use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// One workspace's cached presence. The durable `last_seen_at` column is
/// authoritative; this cache exists for O(1) project-wide status listings.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub workspace_id: String,
    pub project_id: String,
    pub project_slug: String,
    pub alias: String,
    pub human_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceTier {
    Active,
    Idle,
    Offline,
}

impl PresenceTier {
    /// Seen within the TTL is active, within twice the TTL idle, otherwise
    /// offline.
    pub fn from_last_seen(
        last_seen: Option<DateTime<Utc>>,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let Some(last_seen) = last_seen else {
            return PresenceTier::Offline;
        };
        let age = now - last_seen;
        if age <= Duration::seconds(ttl_seconds as i64) {
            PresenceTier::Active
        } else if age <= Duration::seconds(2 * ttl_seconds as i64) {
            PresenceTier::Idle
        } else {
            PresenceTier::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceTier::Active => "active",
            PresenceTier::Idle => "idle",
            PresenceTier::Offline => "offline",
        }
    }
}

#[derive(Default)]
struct PresenceInner {
    records: HashMap<String, PresenceRecord>,
    // Secondary indexes for O(1) listings and alias collision checks.
    by_project: HashMap<String, Vec<String>>,
    by_alias: HashMap<(String, String), String>,
}

pub struct PresenceStore {
    ttl_seconds: u64,
    inner: RwLock<PresenceInner>,
}

impl PresenceStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            inner: RwLock::new(PresenceInner::default()),
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Upsert a workspace's presence; refreshed on every authenticated
    /// write.
    pub fn update(&self, record: PresenceRecord) {
        let mut inner = self.inner.write().expect("presence lock");
        let project_key = record.project_id.clone();
        let ws_id = record.workspace_id.clone();

        let stale_alias = inner
            .records
            .get(&ws_id)
            .filter(|previous| previous.alias != record.alias)
            .map(|previous| (previous.project_id.clone(), previous.alias.clone()));
        if let Some(stale) = stale_alias {
            inner.by_alias.remove(&stale);
        }

        inner
            .by_alias
            .insert((project_key.clone(), record.alias.clone()), ws_id.clone());
        let ids = inner.by_project.entry(project_key).or_default();
        if !ids.contains(&ws_id) {
            ids.push(ws_id.clone());
        }
        inner.records.insert(ws_id, record);
    }

    pub fn get(&self, workspace_id: &str) -> Option<PresenceRecord> {
        let now = Utc::now();
        let inner = self.inner.read().expect("presence lock");
        inner
            .records
            .get(workspace_id)
            .filter(|r| !self.is_evictable(r, now))
            .cloned()
    }

    /// All live presence records for a project; expired entries are lazily
    /// evicted on the way out.
    pub fn list_project(&self, project_id: &str) -> Vec<PresenceRecord> {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("presence lock");
        let Some(ids) = inner.by_project.get(project_id).cloned() else {
            return Vec::new();
        };

        let mut live = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match inner.records.get(&id) {
                Some(record) if !self.is_evictable(record, now) => live.push(record.clone()),
                _ => stale.push(id),
            }
        }
        if !stale.is_empty() {
            for id in &stale {
                if let Some(record) = inner.records.remove(id) {
                    inner
                        .by_alias
                        .remove(&(record.project_id.clone(), record.alias));
                }
            }
            if let Some(ids) = inner.by_project.get_mut(project_id) {
                ids.retain(|id| !stale.contains(id));
            }
        }
        live
    }

    /// O(1) alias collision probe; the workspaces table stays authoritative.
    pub fn workspace_id_by_alias(&self, project_id: &str, alias: &str) -> Option<String> {
        let now = Utc::now();
        let inner = self.inner.read().expect("presence lock");
        let ws_id = inner
            .by_alias
            .get(&(project_id.to_string(), alias.to_string()))?;
        inner
            .records
            .get(ws_id)
            .filter(|r| !self.is_evictable(r, now))
            .map(|r| r.workspace_id.clone())
    }

    /// Drop presence for the given workspaces (used on soft-delete).
    pub fn clear(&self, workspace_ids: &[String]) {
        let mut inner = self.inner.write().expect("presence lock");
        for id in workspace_ids {
            if let Some(record) = inner.records.remove(id) {
                inner
                    .by_alias
                    .remove(&(record.project_id.clone(), record.alias.clone()));
                if let Some(ids) = inner.by_project.get_mut(&record.project_id) {
                    ids.retain(|existing| existing != id);
                }
            }
        }
    }

    // Entries linger for 2x TTL so the idle tier can still be served from
    // cache; past that they are garbage.
    fn is_evictable(&self, record: &PresenceRecord, now: DateTime<Utc>) -> bool {
        now - record.last_seen > Duration::seconds(2 * self.ttl_seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ws: &str, project: &str, alias: &str, last_seen: DateTime<Utc>) -> PresenceRecord {
        PresenceRecord {
            workspace_id: ws.to_string(),
            project_id: project.to_string(),
            project_slug: format!("{project}-slug"),
            alias: alias.to_string(),
            human_name: String::new(),
            role: None,
            current_branch: None,
            repo_id: None,
            canonical_origin: None,
            timezone: None,
            last_seen,
        }
    }

    #[test]
    fn tiers_follow_ttl_boundaries() {
        let now = Utc::now();
        let ttl = 1800;
        assert_eq!(
            PresenceTier::from_last_seen(Some(now - Duration::seconds(60)), ttl, now),
            PresenceTier::Active
        );
        assert_eq!(
            PresenceTier::from_last_seen(Some(now - Duration::seconds(2000)), ttl, now),
            PresenceTier::Idle
        );
        assert_eq!(
            PresenceTier::from_last_seen(Some(now - Duration::seconds(4000)), ttl, now),
            PresenceTier::Offline
        );
        assert_eq!(
            PresenceTier::from_last_seen(None, ttl, now),
            PresenceTier::Offline
        );
    }

    #[test]
    fn project_listing_and_alias_index() {
        let store = PresenceStore::new(1800);
        let now = Utc::now();
        store.update(record("w1", "p1", "alice", now));
        store.update(record("w2", "p1", "bob", now));
        store.update(record("w3", "p2", "alice", now));

        assert_eq!(store.list_project("p1").len(), 2);
        assert_eq!(
            store.workspace_id_by_alias("p1", "alice").as_deref(),
            Some("w1")
        );
        assert_eq!(
            store.workspace_id_by_alias("p2", "alice").as_deref(),
            Some("w3")
        );
        assert!(store.workspace_id_by_alias("p1", "carol").is_none());
    }

    #[test]
    fn expired_entries_are_evicted_lazily() {
        let store = PresenceStore::new(10);
        let stale = Utc::now() - Duration::seconds(60);
        store.update(record("w1", "p1", "alice", stale));

        assert!(store.get("w1").is_none());
        assert!(store.list_project("p1").is_empty());
        assert!(store.workspace_id_by_alias("p1", "alice").is_none());
    }

    #[test]
    fn clear_removes_all_indexes() {
        let store = PresenceStore::new(1800);
        store.update(record("w1", "p1", "alice", Utc::now()));
        store.clear(&["w1".to_string()]);
        assert!(store.get("w1").is_none());
        assert!(store.list_project("p1").is_empty());
    }
}
