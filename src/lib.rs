//! # BeadHub
//!
//! Coordination server for teams of autonomous coding agents: workspaces,
//! bead claims, file reservations, mail and chat, live status streaming,
//! and versioned project policies. Usable as a standalone binary or as a
//! library.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use beadhub::config::Config;
//! use beadhub::server::{create_router, AppState};
//! use beadhub::store::{SqliteStore, Store};
//!
//! let store = SqliteStore::new("./data/beadhub.db").unwrap();
//! store.initialize().unwrap();
//! let config = Config::from_env(Default::default()).unwrap();
//! let router = create_router(Arc::new(AppState::new(Arc::new(store), config)));
//! // Serve with axum...
//! ```

pub mod auth;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod events;
pub mod jsonl;
pub mod notify;
pub mod origin;
pub mod policy;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;
