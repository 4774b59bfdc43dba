//! In-process ephemeral state: presence, file reservations, chat waits.
//!
//! Everything here is wipeable: presence rebuilds from `last_seen_at`
//! timestamps in the durable store, reservations simply expire, and chat
//! waits belong to in-flight requests. Inbox wake-ups ride the event bus
//! (`message.delivered` on the project channel) rather than a separate
//! signal.

mod presence;
mod reservations;
mod waits;

use std::sync::Arc;

pub use presence::{PresenceRecord, PresenceStore, PresenceTier};
pub use reservations::{AcquireOutcome, Reservation, ReservationStore, DEFAULT_RESERVATION_TTL_SECONDS};
pub use waits::{
    ChatWaits, WaitGuard, WaitRelease, CONVERSATION_WAIT_SECONDS, DEFAULT_WAIT_SECONDS,
    MAX_WAIT_SECONDS,
};

/// The ephemeral plane, shared across handlers and background tasks.
pub struct Ephemeral {
    pub presence: PresenceStore,
    pub reservations: ReservationStore,
    pub waits: Arc<ChatWaits>,
}

impl Ephemeral {
    pub fn new(presence_ttl_seconds: u64) -> Self {
        Self {
            presence: PresenceStore::new(presence_ttl_seconds),
            reservations: ReservationStore::new(),
            waits: Arc::new(ChatWaits::new()),
        }
    }
}
