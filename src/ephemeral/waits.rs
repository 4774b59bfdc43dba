//! Chat send-and-wait signals.
//!
//! A waiting sender registers a one-shot slot keyed by `(session, waiter)`.
//! The slot is released exactly once: by a qualifying message from another
//! participant, by a peer leave, or by its deadline. Dropping the guard
//! (client disconnect included) tears the slot down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

pub const DEFAULT_WAIT_SECONDS: i64 = 60;
pub const CONVERSATION_WAIT_SECONDS: i64 = 300;
pub const MAX_WAIT_SECONDS: i64 = 600;

/// What released a wait.
#[derive(Debug, Clone, Serialize)]
pub struct WaitRelease {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub from_alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub leaving: bool,
}

struct WaitSlot {
    tx: oneshot::Sender<WaitRelease>,
    deadline: Arc<Mutex<DateTime<Utc>>>,
    started: DateTime<Utc>,
}

type WaitKey = (String, String);

#[derive(Default)]
pub struct ChatWaits {
    slots: Mutex<HashMap<WaitKey, WaitSlot>>,
}

/// RAII registration handle; dropping it (normal return or cancellation)
/// removes the slot so later writers cannot signal a dead wait.
pub struct WaitGuard {
    key: WaitKey,
    waits: Arc<ChatWaits>,
    pub deadline: Arc<Mutex<DateTime<Utc>>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.waits
            .slots
            .lock()
            .expect("wait lock")
            .remove(&self.key);
    }
}

impl ChatWaits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait. A workspace re-registering in the same session
    /// replaces its previous slot (the old receiver resolves as closed).
    pub fn register(
        self: &Arc<Self>,
        session_id: &str,
        workspace_id: &str,
        deadline: DateTime<Utc>,
    ) -> (oneshot::Receiver<WaitRelease>, WaitGuard) {
        let (tx, rx) = oneshot::channel();
        let deadline = Arc::new(Mutex::new(deadline));
        let key = (session_id.to_string(), workspace_id.to_string());
        self.slots.lock().expect("wait lock").insert(
            key.clone(),
            WaitSlot {
                tx,
                deadline: deadline.clone(),
                started: Utc::now(),
            },
        );
        (
            rx,
            WaitGuard {
                key,
                waits: self.clone(),
                deadline,
            },
        )
    }

    /// Release every wait in the session except the sender's own. Returns
    /// how many waiters were signalled.
    pub fn signal(&self, session_id: &str, sender_workspace_id: &str, release: WaitRelease) -> usize {
        let mut slots = self.slots.lock().expect("wait lock");
        let keys: Vec<WaitKey> = slots
            .keys()
            .filter(|(session, waiter)| session == session_id && waiter != sender_workspace_id)
            .cloned()
            .collect();
        let mut signalled = 0;
        for key in keys {
            if let Some(slot) = slots.remove(&key) {
                if slot.tx.send(release.clone()).is_ok() {
                    signalled += 1;
                }
            }
        }
        signalled
    }

    /// Push a waiter's deadline out. The hard cap is `MAX_WAIT_SECONDS`
    /// from when the wait was registered; a deadline never moves earlier.
    /// Returns the effective deadline, or None when no wait is registered.
    pub fn extend(
        &self,
        session_id: &str,
        workspace_id: &str,
        requested: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let slots = self.slots.lock().expect("wait lock");
        let slot = slots.get(&(session_id.to_string(), workspace_id.to_string()))?;
        let cap = slot.started + chrono::Duration::seconds(MAX_WAIT_SECONDS);
        let effective = requested.min(cap);
        let mut deadline = slot.deadline.lock().expect("wait deadline lock");
        if effective > *deadline {
            *deadline = effective;
        }
        Some(*deadline)
    }

    /// Whether any participant other than `exclude` is currently waiting on
    /// the session. Feeds the `delivered` flag.
    pub fn has_waiter(&self, session_id: &str, exclude_workspace_id: &str) -> bool {
        self.slots
            .lock()
            .expect("wait lock")
            .keys()
            .any(|(session, waiter)| session == session_id && waiter != exclude_workspace_id)
    }
}
