mod bdh;
mod beads;
mod chat;
mod claims;
mod dashboard;
pub mod dto;
mod escalations;
mod init;
mod messages;
mod policies;
mod repos;
mod reservations;
pub mod response;
mod router;
mod status;
mod subscriptions;
pub mod validation;
mod workspaces;

pub use router::{create_router, AppState, REQUEST_TIMEOUT};
