use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const DEFAULT_RESERVATION_TTL_SECONDS: i64 = 300;

/// Advisory file lock, scoped per project. Expires automatically; edits by
/// the holder renew it.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub project_id: String,
    pub path: String,
    pub workspace_id: String,
    pub alias: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub enum AcquireOutcome {
    /// Fresh or renewed reservation held by the caller.
    Held(Reservation),
    /// Another workspace holds an unexpired reservation.
    HeldByOther(Reservation),
}

pub struct ReservationStore {
    inner: RwLock<HashMap<String, HashMap<String, Reservation>>>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire or renew. Reacquiring your own path is idempotent and
    /// refreshes the expiry.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        &self,
        project_id: &str,
        path: &str,
        workspace_id: &str,
        alias: &str,
        ttl_seconds: i64,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let mut inner = self.inner.write().expect("reservation lock");
        let paths = inner.entry(project_id.to_string()).or_default();

        if let Some(existing) = paths.get(path) {
            if existing.workspace_id != workspace_id && existing.expires_at > now {
                return AcquireOutcome::HeldByOther(existing.clone());
            }
        }

        let renewed_from = paths
            .get(path)
            .filter(|r| r.workspace_id == workspace_id)
            .map(|r| r.acquired_at);
        let reservation = Reservation {
            project_id: project_id.to_string(),
            path: path.to_string(),
            workspace_id: workspace_id.to_string(),
            alias: alias.to_string(),
            acquired_at: renewed_from.unwrap_or(now),
            expires_at: now + Duration::seconds(ttl_seconds),
            reason,
        };
        paths.insert(path.to_string(), reservation.clone());
        AcquireOutcome::Held(reservation)
    }

    /// Release the caller's reservation. Releasing a path you don't hold is
    /// a no-op.
    pub fn release(&self, project_id: &str, path: &str, workspace_id: &str) -> bool {
        let mut inner = self.inner.write().expect("reservation lock");
        let Some(paths) = inner.get_mut(project_id) else {
            return false;
        };
        match paths.get(path) {
            Some(existing) if existing.workspace_id == workspace_id => {
                paths.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Live reservations for a project; expired entries are purged on the
    /// way out.
    pub fn list(&self, project_id: &str, now: DateTime<Utc>) -> Vec<Reservation> {
        let mut inner = self.inner.write().expect("reservation lock");
        let Some(paths) = inner.get_mut(project_id) else {
            return Vec::new();
        };
        paths.retain(|_, r| r.expires_at > now);
        let mut live: Vec<Reservation> = paths.values().cloned().collect();
        live.sort_by(|a, b| a.path.cmp(&b.path));
        live
    }

    /// Current unexpired holder of a path, if any.
    pub fn holder(&self, project_id: &str, path: &str, now: DateTime<Utc>) -> Option<Reservation> {
        let inner = self.inner.read().expect("reservation lock");
        inner
            .get(project_id)?
            .get(path)
            .filter(|r| r.expires_at > now)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reacquire_renews_expiry_and_keeps_acquired_at() {
        let store = ReservationStore::new();
        let now = Utc::now();
        let AcquireOutcome::Held(first) =
            store.acquire("p1", "src/x.py", "w1", "alice", 300, None, now)
        else {
            panic!("expected held");
        };

        let later = now + Duration::seconds(100);
        let AcquireOutcome::Held(renewed) =
            store.acquire("p1", "src/x.py", "w1", "alice", 300, None, later)
        else {
            panic!("expected held");
        };
        assert_eq!(renewed.acquired_at, first.acquired_at);
        assert!(renewed.expires_at > first.expires_at);
    }

    #[test]
    fn other_holder_is_reported_until_expiry() {
        let store = ReservationStore::new();
        let now = Utc::now();
        store.acquire("p1", "src/x.py", "w1", "alice", 300, None, now);

        match store.acquire("p1", "src/x.py", "w2", "bob", 300, None, now) {
            AcquireOutcome::HeldByOther(holder) => assert_eq!(holder.alias, "alice"),
            AcquireOutcome::Held(_) => panic!("should conflict"),
        }

        // Past expiry the path is free again.
        let after = now + Duration::seconds(301);
        match store.acquire("p1", "src/x.py", "w2", "bob", 300, None, after) {
            AcquireOutcome::Held(r) => assert_eq!(r.workspace_id, "w2"),
            AcquireOutcome::HeldByOther(_) => panic!("expired reservation should not hold"),
        }
    }

    #[test]
    fn release_is_holder_scoped() {
        let store = ReservationStore::new();
        let now = Utc::now();
        store.acquire("p1", "src/x.py", "w1", "alice", 300, None, now);

        assert!(!store.release("p1", "src/x.py", "w2"));
        assert!(store.release("p1", "src/x.py", "w1"));
        assert!(!store.release("p1", "src/x.py", "w1"));
    }

    #[test]
    fn list_purges_expired() {
        let store = ReservationStore::new();
        let now = Utc::now();
        store.acquire("p1", "a.rs", "w1", "alice", 300, None, now);
        store.acquire("p1", "b.rs", "w1", "alice", 10, None, now);

        let later = now + Duration::seconds(60);
        let live = store.list("p1", later);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].path, "a.rs");
        assert!(store.holder("p1", "b.rs", later).is_none());
    }
}
