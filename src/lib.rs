//! ytq: a personal download queue driving yt-dlp.
//!
//! The manager process (`ytq run`) owns the [`store::QueueStore`], runs the
//! sequential [`worker::QueueWorker`] and drains the mailbox file through the
//! [`sync::Synchronizer`]. The API process (`ytq api run`) only validates
//! submissions and posts them to that mailbox.

use std::path::PathBuf;
use std::sync::Arc;

// --- Modules ---
pub mod agent;
pub mod config;
pub mod console;
pub mod control;
pub mod error;
pub mod handlers;
pub mod models;
pub mod progress;
pub mod store;
pub mod sync;
pub mod worker;

/// Shared state of the API listener.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<control::Intake>,
    pub mailbox: sync::Mailbox,
    /// The manager's queue snapshot, read for listings only.
    pub snapshot: PathBuf,
}
