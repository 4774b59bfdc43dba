//! Domain event fan-out.
//!
//! Every mutation publishes an [`Event`] on its project's broadcast channel.
//! Live status streams subscribe per project and filter server-side. A slow
//! subscriber lags once its 64-event buffer fills; the stream surfaces that
//! as a drop marker rather than blocking publishers.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lagging drops the oldest.
pub const CHANNEL_CAPACITY: usize = 64;

pub const BEAD_CLAIMED: &str = "bead.claimed";
pub const BEAD_UNCLAIMED: &str = "bead.unclaimed";
pub const BEAD_STATUS_CHANGED: &str = "bead.status_changed";
pub const MESSAGE_DELIVERED: &str = "message.delivered";
pub const MESSAGE_ACKNOWLEDGED: &str = "message.acknowledged";
pub const CHAT_MESSAGE_SENT: &str = "chat.message_sent";
pub const ESCALATION_CREATED: &str = "escalation.created";
pub const ESCALATION_RESPONDED: &str = "escalation.responded";
pub const RESERVATION_ACQUIRED: &str = "reservation.acquired";
pub const RESERVATION_RELEASED: &str = "reservation.released";
pub const RESERVATION_RENEWED: &str = "reservation.renewed";
pub const SYNC_COMPLETED: &str = "sync.completed";

/// Common envelope: `{type, project, workspace, timestamp, ...fields}`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    pub workspace_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Event {
    pub fn new(event_type: &str, project_id: &str, workspace_id: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            project_id: project_id.to_string(),
            project_slug: None,
            workspace_id: workspace_id.to_string(),
            timestamp: Utc::now(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn slug(mut self, project_slug: &str) -> Self {
        self.project_slug = Some(project_slug.to_string());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// `message.delivered` -> `message`; used by category filters.
    pub fn category(&self) -> &str {
        self.event_type
            .split('.')
            .next()
            .unwrap_or(&self.event_type)
    }
}

/// Per-project broadcast channels. Publishing to a project with no
/// subscribers is a no-op; channels are created on first use and live for
/// the process lifetime.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, project_id: &str) -> broadcast::Sender<Event> {
        if let Some(tx) = self.channels.read().expect("event bus lock").get(project_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().expect("event bus lock");
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, event: Event) {
        let tx = self.sender(&event.project_id);
        match tx.send(event) {
            Ok(receivers) => {
                tracing::debug!(receivers, "published event");
            }
            Err(_) => {
                // No receivers on this project's channel.
            }
        }
    }

    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<Event> {
        self.sender(project_id).subscribe()
    }

    /// Whether anyone is live-streaming this project right now.
    pub fn has_subscribers(&self, project_id: &str) -> bool {
        self.channels
            .read()
            .expect("event bus lock")
            .get(project_id)
            .map(|tx| tx.receiver_count() > 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_receivers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Event::new(BEAD_CLAIMED, "p1", "w1"));
    }

    #[tokio::test]
    async fn subscribers_see_only_their_project() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("p1");
        bus.publish(Event::new(BEAD_CLAIMED, "p2", "w1"));
        bus.publish(Event::new(BEAD_CLAIMED, "p1", "w1").with("bead_id", "bd-1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.project_id, "p1");
        assert_eq!(event.fields["bead_id"], "bd-1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn category_splits_on_dot() {
        let event = Event::new(MESSAGE_DELIVERED, "p", "w");
        assert_eq!(event.category(), "message");
    }

    #[test]
    fn envelope_serialises_flat() {
        let event = Event::new(BEAD_STATUS_CHANGED, "p", "w").with("old_status", "open");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], BEAD_STATUS_CHANGED);
        assert_eq!(json["old_status"], "open");
    }
}
